//! Subscription table and handler invocation for the event bus

use std::{collections::HashMap, fmt, future::Future, panic::AssertUnwindSafe, sync::Arc, time::Instant};

use futures::{FutureExt, future::BoxFuture};
use parking_lot::RwLock;
use parley_core::{Event, WILDCARD_EVENT_TYPE};

use crate::{actor::panic_message, bus::BusError, telemetry::BusTracer};

/// An event bus subscriber.
pub type EventHandler<T> = Arc<dyn Fn(T) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Box a closure into an [`EventHandler`].
pub fn event_handler<T, F, Fut>(f: F) -> EventHandler<T>
where
  T: 'static,
  F: Fn(T) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
  Arc::new(move |event: T| f(event).boxed())
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionId(String);

impl SubscriptionId {
  fn generate() -> Self {
    Self(uuid::Uuid::new_v4().to_string())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for SubscriptionId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug)]
pub struct HandlerFailure {
  pub subscription: SubscriptionId,
  pub error: anyhow::Error,
}

/// Every handler failure observed while dispatching one event
#[derive(Debug, thiserror::Error)]
#[error("dispatch errors for {event_type}: [{}]", join_failures(.failures))]
pub struct DispatchError {
  pub event_type: String,
  pub failures: Vec<HandlerFailure>,
}

fn join_failures(failures: &[HandlerFailure]) -> String {
  failures
    .iter()
    .map(|f| format!("{}: {:#}", f.subscription, f.error))
    .collect::<Vec<_>>()
    .join("; ")
}

// ============================================================================
// Dispatcher
// ============================================================================

type Subscribers<T> = Vec<(SubscriptionId, EventHandler<T>)>;

pub struct Dispatcher<T> {
  handlers: RwLock<HashMap<String, Subscribers<T>>>,
  tracer: Arc<dyn BusTracer<T>>,
}

impl<T: Event + Clone> Dispatcher<T> {
  pub fn new(tracer: Arc<dyn BusTracer<T>>) -> Self {
    Self {
      handlers: RwLock::new(HashMap::new()),
      tracer,
    }
  }

  pub fn register(&self, event_type: &str, handler: EventHandler<T>) -> SubscriptionId {
    let id = SubscriptionId::generate();
    self
      .handlers
      .write()
      .entry(event_type.to_string())
      .or_default()
      .push((id.clone(), handler));
    id
  }

  pub fn unregister(&self, id: &SubscriptionId) -> Result<(), BusError> {
    let mut handlers = self.handlers.write();

    let found = handlers
      .iter_mut()
      .find_map(|(event_type, subs)| {
        let pos = subs.iter().position(|(sub, _)| sub == id)?;
        subs.remove(pos);
        Some((event_type.clone(), subs.is_empty()))
      });

    match found {
      Some((event_type, true)) => {
        handlers.remove(&event_type);
        Ok(())
      }
      Some(_) => Ok(()),
      None => Err(BusError::SubscriptionNotFound(id.clone())),
    }
  }

  /// Number of subscriptions that would receive an event of `event_type`
  pub fn handler_count(&self, event_type: &str) -> usize {
    let handlers = self.handlers.read();
    let exact = handlers.get(event_type).map_or(0, Vec::len);
    let wildcard = if event_type == WILDCARD_EVENT_TYPE {
      0
    } else {
      handlers.get(WILDCARD_EVENT_TYPE).map_or(0, Vec::len)
    };
    exact + wildcard
  }

  /// Invoke every matching handler in registration order, exact-type
  /// subscribers first, then wildcard subscribers. A failing or panicking
  /// handler does not stop the rest.
  pub async fn dispatch(&self, event: &T) -> Result<(), DispatchError> {
    let event_type = event.event_type();
    let snapshot: Subscribers<T> = {
      let handlers = self.handlers.read();
      let exact = handlers.get(event_type).into_iter().flatten();
      let wildcard = if event_type == WILDCARD_EVENT_TYPE {
        None
      } else {
        handlers.get(WILDCARD_EVENT_TYPE)
      };
      exact.chain(wildcard.into_iter().flatten()).cloned().collect()
    };

    let mut failures = Vec::new();

    for (subscription, handler) in snapshot {
      self.tracer.handler_started(event, &subscription);
      let started = Instant::now();

      let owned = event.clone();
      let outcome = AssertUnwindSafe(async move { handler(owned).await })
        .catch_unwind()
        .await;
      let result = match outcome {
        Ok(result) => result,
        Err(payload) => Err(anyhow::anyhow!("panic in event handler: {}", panic_message(payload.as_ref()))),
      };

      self
        .tracer
        .handler_finished(event, &subscription, started.elapsed(), result.as_ref().err());

      if let Err(error) = result {
        failures.push(HandlerFailure { subscription, error });
      }
    }

    if failures.is_empty() {
      Ok(())
    } else {
      Err(DispatchError {
        event_type: event_type.to_string(),
        failures,
      })
    }
  }
}
