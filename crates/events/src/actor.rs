//! Sequential message processor with typed handlers
//!
//! An [`Actor`] owns an inbox and an outbox [`Stream`] and a single worker
//! task. Messages are routed to the handler registered for their
//! `event_type` and are processed strictly one at a time, in arrival order.
//!
//! # Lifecycle
//!
//! ```text
//! NotStarted --start--> Running --stop--> Stopped
//!      |                                     ^
//!      +----------------stop-----------------+
//! ```
//!
//! `stop` cancels the actor scope (which tears down both streams) and waits
//! up to the grace period for the in-flight handler to return. A handler that
//! outlives the grace period keeps running detached.

use std::{any::Any, fmt, future::Future, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use dashmap::{DashMap, mapref::entry::Entry};
use futures::{FutureExt, future::BoxFuture};
use parking_lot::RwLock;
use parley_core::{ActorConfig, Event};
use streams::{Stream, StreamError};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, warn};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ActorError {
  #[error("actor already stopped")]
  Stopped,
  #[error("actor not started")]
  NotStarted,
  #[error("event handler not found: {0}")]
  HandlerNotFound(String),
  #[error("duplicate event handler: type {0}")]
  DuplicateHandler(String),
  #[error("actor busy, inbox full")]
  Busy,
  #[error("actor busy, outbox full")]
  OutboxBusy,
  #[error("actor operation timeout")]
  Timeout,
  #[error("handler for {event_type} failed: {source}")]
  Handler {
    event_type: String,
    #[source]
    source: anyhow::Error,
  },
  #[error("panic in event handler for {event_type}: {message}")]
  HandlerPanicked { event_type: String, message: String },
  #[error("error receiving event: {0}")]
  Receive(StreamError),
}

impl ActorError {
  fn from_send(err: StreamError) -> Self {
    match err {
      StreamError::Full => ActorError::Busy,
      _ => ActorError::Stopped,
    }
  }
}

// ============================================================================
// Handler Types
// ============================================================================

/// A registered message handler.
pub type Handler<T> = Arc<dyn Fn(ActorContext<T>, T) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Wraps a handler. Middleware is applied once, at registration time; the
/// first middleware in the list is the outermost layer.
pub type Middleware<T> = Arc<dyn Fn(Handler<T>) -> Handler<T> + Send + Sync>;

/// Receives every error the worker cannot return to a caller.
pub type ErrorCallback = Arc<dyn Fn(&ActorError) + Send + Sync>;

/// Box a closure into a [`Handler`].
pub fn handler<T, F, Fut>(f: F) -> Handler<T>
where
  T: 'static,
  F: Fn(ActorContext<T>, T) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
  Arc::new(move |ctx: ActorContext<T>, msg: T| f(ctx, msg).boxed())
}

/// Passed to every handler invocation.
pub struct ActorContext<T> {
  actor: Actor<T>,
  cancel: CancellationToken,
}

impl<T> Clone for ActorContext<T> {
  fn clone(&self) -> Self {
    Self {
      actor: self.actor.clone(),
      cancel: self.cancel.clone(),
    }
  }
}

impl<T: Event> ActorContext<T> {
  pub fn actor(&self) -> &Actor<T> {
    &self.actor
  }

  /// The actor scope; cancelled when the actor stops
  pub fn cancellation_token(&self) -> &CancellationToken {
    &self.cancel
  }

  pub async fn publish(&self, msg: T) -> Result<(), ActorError> {
    self.actor.publish_to_outbox(msg).await
  }
}

// ============================================================================
// Options
// ============================================================================

pub struct ActorOptions<T> {
  pub inbox_capacity: usize,
  pub outbox_capacity: usize,
  pub grace_period: Duration,
  pub on_error: Option<ErrorCallback>,
  pub middleware: Vec<Middleware<T>>,
  /// Caller-owned inbox. The actor never closes it; it ends with its own scope.
  pub inbox: Option<Stream<T>>,
  /// Caller-owned outbox, same ownership rule as `inbox`
  pub outbox: Option<Stream<T>>,
}

impl<T> Default for ActorOptions<T> {
  fn default() -> Self {
    Self::from(&ActorConfig::default())
  }
}

impl<T> From<&ActorConfig> for ActorOptions<T> {
  fn from(config: &ActorConfig) -> Self {
    Self {
      inbox_capacity: config.inbox_capacity,
      outbox_capacity: config.outbox_capacity,
      grace_period: Duration::from_millis(config.grace_period_ms),
      on_error: None,
      middleware: Vec::new(),
      inbox: None,
      outbox: None,
    }
  }
}

impl<T> ActorOptions<T> {
  pub fn with_inbox_capacity(mut self, capacity: usize) -> Self {
    self.inbox_capacity = capacity;
    self
  }

  pub fn with_outbox_capacity(mut self, capacity: usize) -> Self {
    self.outbox_capacity = capacity;
    self
  }

  pub fn with_grace_period(mut self, period: Duration) -> Self {
    self.grace_period = period;
    self
  }

  pub fn with_error_handler(mut self, on_error: impl Fn(&ActorError) + Send + Sync + 'static) -> Self {
    self.on_error = Some(Arc::new(on_error));
    self
  }

  pub fn with_middleware(mut self, middleware: impl Fn(Handler<T>) -> Handler<T> + Send + Sync + 'static) -> Self {
    self.middleware.push(Arc::new(middleware));
    self
  }

  pub fn with_inbox(mut self, inbox: Stream<T>) -> Self {
    self.inbox = Some(inbox);
    self
  }

  pub fn with_outbox(mut self, outbox: Stream<T>) -> Self {
    self.outbox = Some(outbox);
    self
  }
}

// ============================================================================
// Actor
// ============================================================================

/// Observable lifecycle of an actor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorState {
  NotStarted,
  Running,
  Stopped,
}

enum Lifecycle<T> {
  NotStarted,
  Running {
    cancel: CancellationToken,
    inbox: Stream<T>,
    outbox: Stream<T>,
    worker: tokio::task::Id,
  },
  Stopped,
}

/// Handle to an actor. Cheap to clone; all clones address the same actor.
pub struct Actor<T> {
  inner: Arc<ActorInner<T>>,
}

struct ActorInner<T> {
  id: String,
  handlers: DashMap<String, Handler<T>>,
  middleware: Vec<Middleware<T>>,
  lifecycle: RwLock<Lifecycle<T>>,
  tracker: TaskTracker,
  on_error: ErrorCallback,
  grace_period: Duration,
  inbox_capacity: usize,
  outbox_capacity: usize,
  custom_inbox: Option<Stream<T>>,
  custom_outbox: Option<Stream<T>>,
}

impl<T> Clone for Actor<T> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<T: Event> fmt::Debug for Actor<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Actor")
      .field("id", &self.inner.id)
      .field("state", &self.state())
      .field("handlers", &self.inner.handlers.len())
      .finish()
  }
}

impl<T: Event> Actor<T> {
  pub fn new(id: impl Into<String>, options: ActorOptions<T>) -> Self {
    let id = id.into();
    let on_error: ErrorCallback = match options.on_error {
      Some(on_error) => on_error,
      None => {
        let actor_id = id.clone();
        Arc::new(move |err: &ActorError| warn!(actor_id = %actor_id, error = %err, "Actor error"))
      }
    };

    Self {
      inner: Arc::new(ActorInner {
        id,
        handlers: DashMap::new(),
        middleware: options.middleware,
        lifecycle: RwLock::new(Lifecycle::NotStarted),
        tracker: TaskTracker::new(),
        on_error,
        grace_period: options.grace_period,
        inbox_capacity: options.inbox_capacity,
        outbox_capacity: options.outbox_capacity,
        custom_inbox: options.inbox,
        custom_outbox: options.outbox,
      }),
    }
  }

  pub fn id(&self) -> &str {
    &self.inner.id
  }

  pub fn state(&self) -> ActorState {
    match &*self.inner.lifecycle.read() {
      Lifecycle::NotStarted => ActorState::NotStarted,
      Lifecycle::Running { cancel, .. } if cancel.is_cancelled() => ActorState::Stopped,
      Lifecycle::Running { .. } => ActorState::Running,
      Lifecycle::Stopped => ActorState::Stopped,
    }
  }

  /// True once `stop` was called or the parent scope was cancelled
  pub fn is_stopped(&self) -> bool {
    self.state() == ActorState::Stopped
  }

  /// Register the handler for `event_type`. Each type takes one handler.
  pub fn register_handler<F, Fut>(&self, event_type: impl Into<String>, f: F) -> Result<(), ActorError>
  where
    F: Fn(ActorContext<T>, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
  {
    self.register_boxed(event_type, handler(f))
  }

  /// Register an already boxed handler
  pub fn register_boxed(&self, event_type: impl Into<String>, handler: Handler<T>) -> Result<(), ActorError> {
    let event_type = event_type.into();

    match self.inner.handlers.entry(event_type) {
      Entry::Occupied(entry) => Err(ActorError::DuplicateHandler(entry.key().clone())),
      Entry::Vacant(entry) => {
        let wrapped = self
          .inner
          .middleware
          .iter()
          .rev()
          .fold(handler, |next, middleware| middleware(next));
        entry.insert(wrapped);
        Ok(())
      }
    }
  }

  /// Start the worker under `parent`. No-op when already running.
  pub fn start(&self, parent: &CancellationToken) -> Result<(), ActorError> {
    {
      let mut lifecycle = self.inner.lifecycle.write();
      match &*lifecycle {
        Lifecycle::Running { .. } => return Ok(()),
        Lifecycle::Stopped => return Err(ActorError::Stopped),
        Lifecycle::NotStarted => {}
      }

      let cancel = parent.child_token();
      let inbox = match &self.inner.custom_inbox {
        Some(inbox) => inbox.clone(),
        None => Stream::new(&cancel, self.inner.inbox_capacity),
      };
      let outbox = match &self.inner.custom_outbox {
        Some(outbox) => outbox.clone(),
        None => Stream::new(&cancel, self.inner.outbox_capacity),
      };

      let worker = self.inner.tracker.spawn(self.clone().run(cancel.clone(), inbox.clone())).id();
      *lifecycle = Lifecycle::Running { cancel, inbox, outbox, worker };
    }

    info!(actor_id = %self.inner.id, "Actor started");
    Ok(())
  }

  /// Stop the actor and wait up to the grace period for the worker to exit.
  ///
  /// Called from inside a handler, `stop` cancels the actor and returns
  /// without waiting: the worker cannot exit before the handler does.
  pub async fn stop(&self) {
    let previous = std::mem::replace(&mut *self.inner.lifecycle.write(), Lifecycle::Stopped);
    let Lifecycle::Running { cancel, worker, .. } = previous else {
      return;
    };

    cancel.cancel();
    self.inner.tracker.close();

    if tokio::task::try_id() == Some(worker) {
      debug!(actor_id = %self.inner.id, "Actor stopped from its own handler");
      return;
    }

    if tokio::time::timeout(self.inner.grace_period, self.inner.tracker.wait())
      .await
      .is_err()
    {
      warn!(
        actor_id = %self.inner.id,
        grace_period_ms = self.inner.grace_period.as_millis() as u64,
        "Actor shutdown timed out, in-flight handler left running"
      );
    } else {
      info!(actor_id = %self.inner.id, "Actor stopped");
    }
  }

  // ==========================================================================
  // Inbox
  // ==========================================================================

  /// Enqueue a message, waiting for inbox room.
  pub async fn send(&self, msg: T) -> Result<(), ActorError> {
    let inbox = self.inbox()?;
    inbox.send(msg).await.map_err(|_| ActorError::Stopped)
  }

  /// Enqueue without waiting; `Busy` when the inbox is full.
  pub fn try_send(&self, msg: T) -> Result<(), ActorError> {
    self.inbox()?.try_send(msg).map_err(ActorError::from_send)
  }

  /// Race `send` against `timeout`.
  ///
  /// The enqueue runs on its own task and is not withdrawn when the timeout
  /// fires: a message reported as `Timeout` may still be delivered later.
  pub async fn send_with_timeout(&self, msg: T, timeout: Duration) -> Result<(), ActorError> {
    let inbox = self.inbox()?;
    let attempt = tokio::spawn(async move { inbox.send(msg).await });

    match tokio::time::timeout(timeout, attempt).await {
      Ok(Ok(result)) => result.map_err(|_| ActorError::Stopped),
      Ok(Err(_)) => Err(ActorError::Stopped),
      Err(_) => {
        debug!(actor_id = %self.inner.id, "Send timed out, delivery continues in background");
        Err(ActorError::Timeout)
      }
    }
  }

  // ==========================================================================
  // Outbox
  // ==========================================================================

  pub async fn publish_to_outbox(&self, msg: T) -> Result<(), ActorError> {
    let outbox = self.outbox()?;
    outbox.send(msg).await.map_err(|_| ActorError::Stopped)
  }

  /// Publish without waiting; `OutboxBusy` when the outbox is full.
  pub fn try_publish_to_outbox(&self, msg: T) -> Result<(), ActorError> {
    self.outbox()?.try_send(msg).map_err(|e| match e {
      StreamError::Full => ActorError::OutboxBusy,
      _ => ActorError::Stopped,
    })
  }

  /// Wait for the next outbox message. `Stopped` once the outbox has ended.
  pub async fn receive_from_outbox(&self) -> Result<T, ActorError> {
    let outbox = self.outbox()?;
    match outbox.recv().await {
      Ok(Some(msg)) => Ok(msg),
      Ok(None) => Err(ActorError::Stopped),
      Err(StreamError::ContextAlreadyDone) => Err(ActorError::Stopped),
      Err(e) => Err(ActorError::Receive(e)),
    }
  }

  /// Like [`receive_from_outbox`](Self::receive_from_outbox) but gives up
  /// after `timeout`. A message is never consumed by an abandoned attempt.
  pub async fn receive_from_outbox_with_timeout(&self, timeout: Duration) -> Result<T, ActorError> {
    tokio::time::timeout(timeout, self.receive_from_outbox())
      .await
      .map_err(|_| ActorError::Timeout)?
  }

  fn inbox(&self) -> Result<Stream<T>, ActorError> {
    self.running(|inbox, _| inbox.clone())
  }

  fn outbox(&self) -> Result<Stream<T>, ActorError> {
    self.running(|_, outbox| outbox.clone())
  }

  fn running<R>(&self, f: impl FnOnce(&Stream<T>, &Stream<T>) -> R) -> Result<R, ActorError> {
    match &*self.inner.lifecycle.read() {
      Lifecycle::NotStarted => Err(ActorError::NotStarted),
      Lifecycle::Stopped => Err(ActorError::Stopped),
      Lifecycle::Running { cancel, .. } if cancel.is_cancelled() => Err(ActorError::Stopped),
      Lifecycle::Running { inbox, outbox, .. } => Ok(f(inbox, outbox)),
    }
  }

  // ==========================================================================
  // Worker
  // ==========================================================================

  async fn run(self, cancel: CancellationToken, inbox: Stream<T>) {
    debug!(actor_id = %self.inner.id, "Actor worker started");

    loop {
      let next = tokio::select! {
        biased;

        _ = cancel.cancelled() => break,
        next = inbox.recv() => next,
      };

      match next {
        Ok(Some(msg)) => self.process(&cancel, msg).await,
        Ok(None) => break,
        Err(StreamError::ContextAlreadyDone) => break,
        Err(e) => {
          self.report(ActorError::Receive(e));
          break;
        }
      }
    }

    debug!(actor_id = %self.inner.id, "Actor worker exited");
  }

  async fn process(&self, cancel: &CancellationToken, msg: T) {
    let event_type = msg.event_type().to_string();
    let handler = self.inner.handlers.get(&event_type).map(|h| Arc::clone(h.value()));

    let Some(handler) = handler else {
      self.report(ActorError::HandlerNotFound(event_type));
      return;
    };

    let ctx = ActorContext {
      actor: self.clone(),
      cancel: cancel.clone(),
    };

    // The call itself runs inside the guarded future so a panic while
    // building the handler future is caught too
    let outcome = AssertUnwindSafe(async move { handler(ctx, msg).await })
      .catch_unwind()
      .await;

    match outcome {
      Ok(Ok(())) => {}
      Ok(Err(source)) => self.report(ActorError::Handler { event_type, source }),
      Err(payload) => self.report(ActorError::HandlerPanicked {
        event_type,
        message: panic_message(payload.as_ref()),
      }),
    }
  }

  fn report(&self, err: ActorError) {
    (self.inner.on_error)(&err);
  }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
  if let Some(s) = payload.downcast_ref::<&str>() {
    (*s).to_string()
  } else if let Some(s) = payload.downcast_ref::<String>() {
    s.clone()
  } else {
    "unknown panic".to_string()
  }
}
