//! Multi-worker publish/subscribe fan-out
//!
//! # Architecture
//!
//! ```text
//!                        +--> worker 0 --+
//! publish --> Stream ----+--> worker 1 --+--> Dispatcher --> handlers (type ∪ "*")
//!                        +--> worker N --+
//! ```
//!
//! Workers share one inbound [`Stream`]. Events taken by the same worker are
//! dispatched in order; across workers the order is unspecified, so callers
//! that need per-key ordering should use an [`Actor`](crate::Actor) instead.

use std::{
  sync::Arc,
  time::{Duration, Instant},
};

use parking_lot::RwLock;
use parley_core::{BusConfig, Event};
use streams::{Stream, StreamError};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{Instrument, debug, info, info_span, warn};

use crate::{
  dispatcher::{DispatchError, Dispatcher, EventHandler, SubscriptionId, event_handler},
  telemetry::{BusMetrics, BusTracer, NoOpMetrics, NoOpTracer},
};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum BusError {
  #[error("event bus already stopped")]
  Stopped,
  #[error("event bus not started")]
  NotStarted,
  #[error("subscription not found: {0}")]
  SubscriptionNotFound(SubscriptionId),
  #[error("invalid event type")]
  InvalidEventType,
  #[error("event publish timeout")]
  PublishTimeout,
  #[error("event bus shutdown timed out after {0:?}")]
  ShutdownTimeout(Duration),
  #[error("failed to publish event: {0}")]
  Publish(StreamError),
  #[error("worker {worker} error receiving event: {source}")]
  Receive { worker: usize, source: StreamError },
  #[error(transparent)]
  Dispatch(#[from] DispatchError),
}

pub type BusErrorCallback = Arc<dyn Fn(&BusError) + Send + Sync>;

// ============================================================================
// Options
// ============================================================================

pub struct BusOptions<T> {
  pub buffer_size: usize,
  pub worker_count: usize,
  pub on_error: Option<BusErrorCallback>,
  pub metrics: Arc<dyn BusMetrics>,
  pub tracer: Arc<dyn BusTracer<T>>,
}

impl<T> Default for BusOptions<T> {
  fn default() -> Self {
    Self::from(&BusConfig::default())
  }
}

impl<T> From<&BusConfig> for BusOptions<T> {
  fn from(config: &BusConfig) -> Self {
    Self {
      buffer_size: config.buffer_size,
      worker_count: config.worker_count,
      on_error: None,
      metrics: Arc::new(NoOpMetrics),
      tracer: Arc::new(NoOpTracer),
    }
  }
}

impl<T> BusOptions<T> {
  pub fn with_buffer_size(mut self, size: usize) -> Self {
    self.buffer_size = size;
    self
  }

  pub fn with_worker_count(mut self, count: usize) -> Self {
    self.worker_count = count;
    self
  }

  pub fn with_error_handler(mut self, on_error: impl Fn(&BusError) + Send + Sync + 'static) -> Self {
    self.on_error = Some(Arc::new(on_error));
    self
  }

  pub fn with_metrics(mut self, metrics: Arc<dyn BusMetrics>) -> Self {
    self.metrics = metrics;
    self
  }

  pub fn with_tracer(mut self, tracer: Arc<dyn BusTracer<T>>) -> Self {
    self.tracer = tracer;
    self
  }
}

// ============================================================================
// Event Bus
// ============================================================================

enum Lifecycle<T> {
  NotStarted,
  Running { cancel: CancellationToken, stream: Stream<T> },
  Stopped,
}

/// Handle to an event bus. Cheap to clone.
pub struct EventBus<T> {
  inner: Arc<BusInner<T>>,
}

struct BusInner<T> {
  dispatcher: Dispatcher<T>,
  lifecycle: RwLock<Lifecycle<T>>,
  tracker: TaskTracker,
  buffer_size: usize,
  worker_count: usize,
  on_error: BusErrorCallback,
  metrics: Arc<dyn BusMetrics>,
  tracer: Arc<dyn BusTracer<T>>,
}

impl<T> Clone for EventBus<T> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<T: Event + Clone> EventBus<T> {
  pub fn new(options: BusOptions<T>) -> Self {
    let on_error: BusErrorCallback = match options.on_error {
      Some(on_error) => on_error,
      None => Arc::new(|err: &BusError| warn!(error = %err, "EventBus error")),
    };

    Self {
      inner: Arc::new(BusInner {
        dispatcher: Dispatcher::new(Arc::clone(&options.tracer)),
        lifecycle: RwLock::new(Lifecycle::NotStarted),
        tracker: TaskTracker::new(),
        buffer_size: options.buffer_size,
        worker_count: options.worker_count.max(1),
        on_error,
        metrics: options.metrics,
        tracer: options.tracer,
      }),
    }
  }

  /// Create the inbound stream under `parent` and spawn the workers.
  /// No-op when already running.
  pub fn start(&self, parent: &CancellationToken) -> Result<(), BusError> {
    let mut lifecycle = self.inner.lifecycle.write();
    match &*lifecycle {
      Lifecycle::Running { .. } => return Ok(()),
      Lifecycle::Stopped => return Err(BusError::Stopped),
      Lifecycle::NotStarted => {}
    }

    let cancel = parent.child_token();
    let stream = Stream::new(&cancel, self.inner.buffer_size);

    for worker in 0..self.inner.worker_count {
      let inner = Arc::clone(&self.inner);
      self
        .inner
        .tracker
        .spawn(inner.worker(worker, cancel.clone(), stream.clone()));
    }
    // Closing the tracker only marks it; `wait` returns once the workers exit
    self.inner.tracker.close();

    *lifecycle = Lifecycle::Running { cancel, stream };
    info!(workers = self.inner.worker_count, buffer = self.inner.buffer_size, "EventBus started");
    Ok(())
  }

  /// Stop accepting events, let the workers drain the buffer and wait for
  /// them up to `timeout`. On expiry the workers are cancelled and
  /// `ShutdownTimeout` is returned; a dispatch already in progress is not
  /// interrupted.
  pub async fn stop(&self, timeout: Duration) -> Result<(), BusError> {
    let previous = std::mem::replace(&mut *self.inner.lifecycle.write(), Lifecycle::Stopped);
    let Lifecycle::Running { cancel, stream } = previous else {
      return Ok(());
    };

    stream.close_send();

    let result = match tokio::time::timeout(timeout, self.inner.tracker.wait()).await {
      Ok(()) => {
        info!("EventBus stopped");
        Ok(())
      }
      Err(_) => {
        warn!(timeout_ms = timeout.as_millis() as u64, "EventBus shutdown timed out");
        Err(BusError::ShutdownTimeout(timeout))
      }
    };
    cancel.cancel();
    result
  }

  /// Wait for every worker to exit. Returns immediately if never started.
  pub async fn wait(&self) {
    if matches!(&*self.inner.lifecycle.read(), Lifecycle::NotStarted) {
      return;
    }
    self.inner.tracker.wait().await;
  }

  pub fn is_running(&self) -> bool {
    match &*self.inner.lifecycle.read() {
      Lifecycle::Running { cancel, .. } => !cancel.is_cancelled(),
      _ => false,
    }
  }

  // ==========================================================================
  // Publishing
  // ==========================================================================

  pub async fn publish(&self, event: T) -> Result<(), BusError> {
    let stream = self.stream()?;

    self.inner.tracer.event_queued(&event);
    self.inner.metrics.event_published(event.event_type());

    stream.send(event.clone()).await.map_err(|e| match e {
      StreamError::ChannelClosed | StreamError::ContextAlreadyDone => BusError::Stopped,
      e => BusError::Publish(e),
    })?;

    self.inner.tracer.event_published(&event);
    Ok(())
  }

  /// Race `publish` against `timeout`.
  ///
  /// The publish runs on its own task and is not withdrawn on timeout, so an
  /// event reported as `PublishTimeout` may still be dispatched.
  pub async fn publish_with_timeout(&self, event: T, timeout: Duration) -> Result<(), BusError> {
    self.stream()?;

    let bus = self.clone();
    let attempt = tokio::spawn(async move { bus.publish(event).await });

    match tokio::time::timeout(timeout, attempt).await {
      Ok(Ok(result)) => result,
      Ok(Err(_)) => Err(BusError::Stopped),
      Err(_) => Err(BusError::PublishTimeout),
    }
  }

  // ==========================================================================
  // Subscriptions
  // ==========================================================================

  /// Subscribe to `event_type`, or to every event with `"*"`.
  pub fn subscribe<F, Fut>(&self, event_type: &str, f: F) -> Result<SubscriptionId, BusError>
  where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
  {
    self.subscribe_boxed(event_type, event_handler(f))
  }

  pub fn subscribe_boxed(&self, event_type: &str, handler: EventHandler<T>) -> Result<SubscriptionId, BusError> {
    if event_type.is_empty() {
      return Err(BusError::InvalidEventType);
    }

    let id = self.inner.dispatcher.register(event_type, handler);
    debug!(event_type, subscription = %id, "Subscribed");
    Ok(id)
  }

  pub fn unsubscribe(&self, id: &SubscriptionId) -> Result<(), BusError> {
    self.inner.dispatcher.unregister(id)
  }

  fn stream(&self) -> Result<Stream<T>, BusError> {
    match &*self.inner.lifecycle.read() {
      Lifecycle::NotStarted => Err(BusError::NotStarted),
      Lifecycle::Stopped => Err(BusError::Stopped),
      Lifecycle::Running { stream, .. } => Ok(stream.clone()),
    }
  }
}

impl<T: Event + Clone> BusInner<T> {
  async fn worker(self: Arc<Self>, worker: usize, cancel: CancellationToken, stream: Stream<T>) {
    debug!(worker, "EventBus worker started");

    loop {
      let next = tokio::select! {
        biased;

        _ = cancel.cancelled() => break,
        next = stream.recv() => next,
      };

      let event = match next {
        Ok(Some(event)) => event,
        Ok(None) | Err(StreamError::ContextAlreadyDone) => break,
        Err(source) => {
          (self.on_error)(&BusError::Receive { worker, source });
          break;
        }
      };

      let span = info_span!(
        "dispatch",
        worker,
        event_id = %event.id(),
        event_type = %event.event_type()
      );
      self.dispatch(event).instrument(span).await;
    }

    debug!(worker, "EventBus worker exited");
  }

  async fn dispatch(&self, event: T) {
    self.tracer.dispatch_started(&event);
    let started = Instant::now();

    let result = self.dispatcher.dispatch(&event).await;
    let duration = started.elapsed();

    self.tracer.dispatch_finished(&event, duration, result.as_ref().err());
    self.metrics.event_processed(event.event_type(), duration);

    if let Err(err) = result {
      self.metrics.event_error(event.event_type(), &err);
      (self.on_error)(&BusError::Dispatch(err));
    }
  }
}
