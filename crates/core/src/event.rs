//! The event capability shared by actors, the event bus and the chat runner.

/// Subscription key that matches every event type.
pub const WILDCARD_EVENT_TYPE: &str = "*";

/// Anything routable by type.
///
/// `event_type` is the discriminator used for handler lookup; it should be
/// stable for the lifetime of the value.
pub trait Event: Send + Sync + 'static {
  fn id(&self) -> &str;

  fn event_type(&self) -> &str;
}
