//! Metrics and tracing hooks for the event bus
//!
//! Both sinks default to no-ops. [`LoggingTracer`] writes every lifecycle
//! step through `tracing`; [`CountingMetrics`] keeps in-process counters.

use std::{
  sync::atomic::{AtomicU64, Ordering},
  time::Duration,
};

use parley_core::Event;
use tracing::debug;

use crate::dispatcher::{DispatchError, SubscriptionId};

// ============================================================================
// Metrics
// ============================================================================

pub trait BusMetrics: Send + Sync {
  fn event_published(&self, _event_type: &str) {}

  fn event_processed(&self, _event_type: &str, _duration: Duration) {}

  fn event_error(&self, _event_type: &str, _error: &DispatchError) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpMetrics;

impl BusMetrics for NoOpMetrics {}

/// Atomic counters, readable at any time through [`snapshot`](Self::snapshot)
#[derive(Debug, Default)]
pub struct CountingMetrics {
  published: AtomicU64,
  processed: AtomicU64,
  errors: AtomicU64,
  busy_nanos: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
  pub published: u64,
  pub processed: u64,
  pub errors: u64,
  pub busy: Duration,
}

impl CountingMetrics {
  pub fn snapshot(&self) -> MetricsSnapshot {
    MetricsSnapshot {
      published: self.published.load(Ordering::Relaxed),
      processed: self.processed.load(Ordering::Relaxed),
      errors: self.errors.load(Ordering::Relaxed),
      busy: Duration::from_nanos(self.busy_nanos.load(Ordering::Relaxed)),
    }
  }
}

impl BusMetrics for CountingMetrics {
  fn event_published(&self, _event_type: &str) {
    self.published.fetch_add(1, Ordering::Relaxed);
  }

  fn event_processed(&self, _event_type: &str, duration: Duration) {
    self.processed.fetch_add(1, Ordering::Relaxed);
    self
      .busy_nanos
      .fetch_add(duration.as_nanos().min(u64::MAX as u128) as u64, Ordering::Relaxed);
  }

  fn event_error(&self, _event_type: &str, _error: &DispatchError) {
    self.errors.fetch_add(1, Ordering::Relaxed);
  }
}

// ============================================================================
// Tracer
// ============================================================================

/// Lifecycle hooks invoked around publishing and dispatch.
///
/// Every dispatch already runs inside a `tracing` span carrying the event id
/// and type, so implementations only need to record the step itself.
pub trait BusTracer<T>: Send + Sync {
  fn event_queued(&self, _event: &T) {}

  fn event_published(&self, _event: &T) {}

  fn dispatch_started(&self, _event: &T) {}

  fn handler_started(&self, _event: &T, _subscription: &SubscriptionId) {}

  fn handler_finished(
    &self,
    _event: &T,
    _subscription: &SubscriptionId,
    _duration: Duration,
    _error: Option<&anyhow::Error>,
  ) {
  }

  fn dispatch_finished(&self, _event: &T, _duration: Duration, _error: Option<&DispatchError>) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpTracer;

impl<T> BusTracer<T> for NoOpTracer {}

#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingTracer;

impl<T: Event> BusTracer<T> for LoggingTracer {
  fn event_queued(&self, event: &T) {
    debug!(event_id = %event.id(), event_type = %event.event_type(), "Event queued");
  }

  fn event_published(&self, event: &T) {
    debug!(event_id = %event.id(), event_type = %event.event_type(), "Event published");
  }

  fn dispatch_started(&self, event: &T) {
    debug!(event_id = %event.id(), event_type = %event.event_type(), "Dispatch started");
  }

  fn handler_started(&self, event: &T, subscription: &SubscriptionId) {
    debug!(event_id = %event.id(), subscription = %subscription, "Handler started");
  }

  fn handler_finished(
    &self,
    event: &T,
    subscription: &SubscriptionId,
    duration: Duration,
    error: Option<&anyhow::Error>,
  ) {
    match error {
      Some(e) => debug!(
        event_id = %event.id(),
        subscription = %subscription,
        duration_ms = duration.as_millis() as u64,
        error = %e,
        "Handler failed"
      ),
      None => debug!(
        event_id = %event.id(),
        subscription = %subscription,
        duration_ms = duration.as_millis() as u64,
        "Handler finished"
      ),
    }
  }

  fn dispatch_finished(&self, event: &T, duration: Duration, error: Option<&DispatchError>) {
    match error {
      Some(e) => debug!(
        event_id = %event.id(),
        event_type = %event.event_type(),
        duration_ms = duration.as_millis() as u64,
        error = %e,
        "Dispatch finished with errors"
      ),
      None => debug!(
        event_id = %event.id(),
        event_type = %event.event_type(),
        duration_ms = duration.as_millis() as u64,
        "Dispatch finished"
      ),
    }
  }
}
