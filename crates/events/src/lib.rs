//! Actor and publish/subscribe runtime built on [`streams::Stream`].
//!
//! - [`Actor`]: sequential message processor with a type-keyed handler table,
//!   middleware and an inbox/outbox pair
//! - [`EventBus`]: multi-worker fan-out keyed by event type, with `"*"`
//!   wildcard subscriptions
//! - [`Dispatcher`]: the subscription table and invocation logic behind the bus

pub mod actor;
pub mod bus;
pub mod dispatcher;
pub mod telemetry;


pub use actor::{
  Actor, ActorContext, ActorError, ActorOptions, ActorState, ErrorCallback, Handler, Middleware, handler,
};
pub use bus::{BusError, BusErrorCallback, BusOptions, EventBus};
pub use dispatcher::{DispatchError, Dispatcher, EventHandler, HandlerFailure, SubscriptionId, event_handler};
pub use parley_core::{Event, WILDCARD_EVENT_TYPE};
pub use telemetry::{BusMetrics, BusTracer, CountingMetrics, LoggingTracer, MetricsSnapshot, NoOpMetrics, NoOpTracer};
