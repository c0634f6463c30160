//! Chat actor
//!
//! An [`Actor`] over [`ChatEvent`] with two handlers:
//!
//! - `message.send` starts a response on the [`ChatRunner`] and spawns a
//!   relay that persists lifecycle events and forwards them to the outbox.
//!   The handler returns as soon as the response is started, so the actor
//!   stays free to take interrupts while the response streams.
//! - `agent_message.interrupt` forwards a control signal to the runner.
//!
//! Failures that concern the client are published to the outbox as `error`
//! events; persistence failures are only logged.

use std::sync::Arc;

use events::{Actor, ActorContext, ActorError, ActorOptions};
use parley_core::Event;
use streams::StreamError;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::{
  context::ControlSignal,
  messages::{AgentMessage, ChatEvent, ChatEventKind, EVENT_INTERRUPT, EVENT_SEND_MESSAGE, SendMessage},
  runner::{ChatRunner, Invocation},
  store::{MessageStore, StoreError},
};

pub struct ChatActor {
  actor: Actor<ChatEvent>,
  runner: ChatRunner,
  store: Arc<dyn MessageStore>,
}

impl ChatActor {
  pub fn new(
    id: impl Into<String>,
    options: ActorOptions<ChatEvent>,
    runner: ChatRunner,
    store: Arc<dyn MessageStore>,
  ) -> Result<Self, ActorError> {
    let chat = Self {
      actor: Actor::new(id, options),
      runner,
      store,
    };
    chat.register_handlers()?;
    Ok(chat)
  }

  fn register_handlers(&self) -> Result<(), ActorError> {
    let runner = self.runner.clone();
    let store = Arc::clone(&self.store);
    self
      .actor
      .register_handler(EVENT_SEND_MESSAGE, move |ctx, event: ChatEvent| {
        let runner = runner.clone();
        let store = Arc::clone(&store);
        async move { handle_send_message(ctx, event, runner, store).await }
      })?;

    let runner = self.runner.clone();
    self
      .actor
      .register_handler(EVENT_INTERRUPT, move |ctx, event: ChatEvent| {
        let runner = runner.clone();
        async move { handle_interrupt(ctx, event, runner).await }
      })?;

    Ok(())
  }

  pub fn actor(&self) -> &Actor<ChatEvent> {
    &self.actor
  }

  pub fn runner(&self) -> &ChatRunner {
    &self.runner
  }

  pub fn start(&self, parent: &CancellationToken) -> Result<(), ActorError> {
    self.actor.start(parent)
  }

  pub async fn stop(&self) {
    self.actor.stop().await
  }

  pub async fn send_message(&self, request: SendMessage) -> Result<(), ActorError> {
    self.actor.send(ChatEvent::new(ChatEventKind::SendMessage(request))).await
  }

  pub async fn interrupt(&self, response_id: impl Into<String>) -> Result<(), ActorError> {
    let kind = ChatEventKind::Interrupt {
      response_id: response_id.into(),
    };
    self.actor.send(ChatEvent::new(kind)).await
  }

  /// Next event from the outbox
  pub async fn receive(&self) -> Result<ChatEvent, ActorError> {
    self.actor.receive_from_outbox().await
  }
}

// ============================================================================
// Handlers
// ============================================================================

async fn handle_send_message(
  ctx: ActorContext<ChatEvent>,
  event: ChatEvent,
  runner: ChatRunner,
  store: Arc<dyn MessageStore>,
) -> anyhow::Result<()> {
  let event_type = event.kind.event_type();
  let ChatEventKind::SendMessage(request) = event.kind else {
    anyhow::bail!("expected {EVENT_SEND_MESSAGE}, got {event_type}");
  };

  let response_id = request
    .response_id
    .filter(|id| !id.is_empty())
    .unwrap_or_else(|| uuid::Uuid::now_v7().to_string());
  let mut response = AgentMessage::new(response_id, request.message_id);
  response.tools = request.tools;

  if let Err(e) = store.save_agent_message(&response).await {
    warn!(response_id = %response.id, error = %e, "Failed to persist new agent message");
  }

  let invocation = match runner.invoke(ctx.cancellation_token(), response, request.input) {
    Ok(invocation) => invocation,
    Err(e) => {
      warn!(error = %e, "Failed to start response");
      publish_error(&ctx, "ai_respond_failed", e.to_string()).await?;
      return Ok(());
    }
  };

  let span = info_span!("chat_relay", response_id = %invocation.response_id);
  tokio::spawn(relay(ctx, invocation, store).instrument(span));
  Ok(())
}

async fn handle_interrupt(ctx: ActorContext<ChatEvent>, event: ChatEvent, runner: ChatRunner) -> anyhow::Result<()> {
  let ChatEventKind::Interrupt { response_id } = &event.kind else {
    anyhow::bail!("expected {EVENT_INTERRUPT}, got {}", event.event_type());
  };

  info!(response_id = %response_id, "Interrupt requested");
  if let Err(e) = runner.ctrl(response_id, ControlSignal::Interrupt) {
    publish_error(&ctx, "interrupt_failed", e.to_string()).await?;
  }
  Ok(())
}

async fn publish_error(ctx: &ActorContext<ChatEvent>, code: &str, message: String) -> Result<(), ActorError> {
  let event = ChatEvent::new(ChatEventKind::Error {
    code: Some(code.to_string()),
    message,
  });
  ctx.publish(event).await
}

// ============================================================================
// Relay
// ============================================================================

/// Forward one response's events to the actor outbox until the terminal event.
async fn relay(ctx: ActorContext<ChatEvent>, invocation: Invocation, store: Arc<dyn MessageStore>) {
  debug!("Relaying response events");

  loop {
    let event = match invocation.events.recv().await {
      Ok(Some(event)) => event,
      Ok(None) => break,
      Err(StreamError::ContextAlreadyDone) => {
        debug!("Response stream torn down");
        break;
      }
      Err(e) => {
        warn!(error = %e, "Response stream failed");
        break;
      }
    };

    if let Err(e) = persist(store.as_ref(), &invocation.response_id, &event).await {
      warn!(event_type = event.event_type(), error = %e, "Failed to persist chat event");
    }

    if let Err(e) = ctx.publish(event).await {
      warn!(error = %e, "Outbox closed, abandoning response");
      invocation.cancel();
      return;
    }
  }

  debug!("Response relay finished");
}

async fn persist(store: &dyn MessageStore, response_id: &str, event: &ChatEvent) -> Result<(), StoreError> {
  if let Some(message) = event.agent_message() {
    return store.save_agent_message(message).await;
  }

  match &event.kind {
    ChatEventKind::OutputItemAdded { output_index, item } | ChatEventKind::OutputItemDone { output_index, item } => {
      store.save_output_item(response_id, *output_index, item).await
    }
    _ => Ok(()),
  }
}
