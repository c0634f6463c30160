//! Streaming response state machine
//!
//! # Architecture
//!
//! ```text
//!   invoke ──► registry[response_id] = control tx
//!      │
//!      └─► generation task
//!            created, in_progress
//!            open provider stream (bounded by invoke timeout)
//!            loop, first ready wins:
//!              control signal  ──► incomplete (user)
//!              caller cancel   ──► incomplete (system)
//!              next chunk      ──► deltas | finish reason
//!            remove registry entry, close event stream
//! ```
//!
//! Every response emits exactly one terminal event (`completed`, `failed`
//! or `incomplete`), unless its event stream was torn down from above.

use std::{sync::Arc, time::Duration};

use dashmap::{DashMap, mapref::entry::Entry};
use llm::{
  ChatRequest, FINISH_LENGTH, FINISH_STOP, FINISH_TOOL_CALLS, LlmProvider, LlmResultChunk, PromptMessage,
};
use parley_core::RunnerSettings;
use streams::{Stream, StreamError};
use tokio::{sync::mpsc, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::{
  context::{ChatInvokeContext, ControlSignal},
  messages::{
    AgentMessage, ChatEvent, IncompleteDetails, IncompleteReason, InputItem, InterruptType, ResponseError,
    ResponseErrorCode,
  },
  transform::to_prompt_messages,
};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
  #[error("response id is required")]
  MissingResponseId,
  #[error("response {0} is already generating")]
  AlreadyRunning(String),
  #[error("response not found: {0}")]
  ResponseNotFound(String),
  #[error("control channel unavailable for response {0}")]
  ControlUnavailable(String),
  #[error("provider {0} is not available")]
  ProviderUnavailable(String),
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct RunnerConfig {
  /// Upper bound on one provider call, from open to the last chunk
  pub invoke_timeout: Duration,
  /// Capacity of each response's event stream
  pub event_buffer: usize,
  /// Capacity of each response's control channel
  pub control_capacity: usize,
  pub model: String,
  pub temperature: f64,
  /// Prepended to every prompt when set
  pub system_prompt: Option<String>,
}

impl Default for RunnerConfig {
  fn default() -> Self {
    Self::from(&RunnerSettings::default())
  }
}

impl From<&RunnerSettings> for RunnerConfig {
  fn from(settings: &RunnerSettings) -> Self {
    Self {
      invoke_timeout: Duration::from_secs(settings.invoke_timeout_secs),
      event_buffer: settings.event_buffer,
      control_capacity: settings.control_capacity,
      model: "default".to_string(),
      temperature: 0.7,
      system_prompt: None,
    }
  }
}

impl RunnerConfig {
  pub fn with_model(mut self, model: impl Into<String>) -> Self {
    self.model = model.into();
    self
  }

  pub fn with_invoke_timeout(mut self, timeout: Duration) -> Self {
    self.invoke_timeout = timeout;
    self
  }

  pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
    self.system_prompt = Some(prompt.into());
    self
  }
}

// ============================================================================
// Runner
// ============================================================================

/// Handle to a response being generated
pub struct Invocation {
  pub response_id: String,
  /// Lifecycle events, ending after the terminal event
  pub events: Stream<ChatEvent>,
  cancel: CancellationToken,
}

impl Invocation {
  /// Give up on the response. Generation ends `incomplete` with a system
  /// interrupt marker.
  pub fn cancel(&self) {
    self.cancel.cancel();
  }

  pub fn cancellation_token(&self) -> &CancellationToken {
    &self.cancel
  }
}

struct ResponseHandle {
  control: mpsc::Sender<ControlSignal>,
}

/// Orchestrates streaming responses. Cheap to clone.
#[derive(Clone)]
pub struct ChatRunner {
  inner: Arc<RunnerInner>,
}

struct RunnerInner {
  provider: Box<dyn LlmProvider>,
  config: RunnerConfig,
  running: DashMap<String, ResponseHandle>,
}

/// Removes the registry entry when generation ends, however it ends
struct Registration {
  inner: Arc<RunnerInner>,
  response_id: String,
}

impl Drop for Registration {
  fn drop(&mut self) {
    self.inner.running.remove(&self.response_id);
    debug!(response_id = %self.response_id, "Response unregistered");
  }
}

impl ChatRunner {
  pub fn new(provider: impl LlmProvider + 'static, config: RunnerConfig) -> Self {
    Self::with_boxed(Box::new(provider), config)
  }

  pub fn with_boxed(provider: Box<dyn LlmProvider>, config: RunnerConfig) -> Self {
    Self {
      inner: Arc::new(RunnerInner {
        provider,
        config,
        running: DashMap::new(),
      }),
    }
  }

  pub fn config(&self) -> &RunnerConfig {
    &self.inner.config
  }

  pub fn provider_name(&self) -> &str {
    self.inner.provider.name()
  }

  pub fn is_running(&self, response_id: &str) -> bool {
    self.inner.running.contains_key(response_id)
  }

  pub fn active_count(&self) -> usize {
    self.inner.running.len()
  }

  /// Start generating `response` and return its event stream.
  ///
  /// The event stream lives under `parent`; cancelling `parent` tears it
  /// down without a terminal event. Use [`Invocation::cancel`] to stop a
  /// single response and still receive its `incomplete` event.
  pub fn invoke(
    &self,
    parent: &CancellationToken,
    response: AgentMessage,
    input: Vec<InputItem>,
  ) -> Result<Invocation, RunnerError> {
    let response_id = response.id.clone();
    if response_id.is_empty() {
      return Err(RunnerError::MissingResponseId);
    }
    if !self.inner.provider.is_available() {
      warn!(response_id = %response_id, provider = self.provider_name(), "Provider unavailable");
      return Err(RunnerError::ProviderUnavailable(self.provider_name().to_string()));
    }

    let (control_tx, control_rx) = mpsc::channel(self.inner.config.control_capacity.max(1));
    match self.inner.running.entry(response_id.clone()) {
      Entry::Occupied(_) => return Err(RunnerError::AlreadyRunning(response_id)),
      Entry::Vacant(entry) => {
        entry.insert(ResponseHandle { control: control_tx });
      }
    }
    let registration = Registration {
      inner: Arc::clone(&self.inner),
      response_id: response_id.clone(),
    };

    let cancel = parent.child_token();
    let events = Stream::new(parent, self.inner.config.event_buffer);
    let mut ctx = ChatInvokeContext::new(response, input, cancel.clone(), control_rx, events.clone());

    let inner = Arc::clone(&self.inner);
    let span = info_span!("chat_response", response_id = %response_id);
    tokio::spawn(
      async move {
        if let Err(e) = inner.generate(&mut ctx).await {
          debug!(error = %e, "Event stream closed before the response finished");
        }
        drop(registration);
        ctx.close();
      }
      .instrument(span),
    );

    info!(response_id = %response_id, provider = self.inner.provider.name(), "Response started");
    Ok(Invocation {
      response_id,
      events,
      cancel,
    })
  }

  /// Deliver `signal` to a running response without waiting.
  ///
  /// Fails with `ResponseNotFound` if the response is not generating and
  /// with `ControlUnavailable` if its control channel is full or gone.
  pub fn ctrl(&self, response_id: &str, signal: ControlSignal) -> Result<(), RunnerError> {
    let Some(handle) = self.inner.running.get(response_id) else {
      warn!(response_id, ?signal, "Control signal for unknown response");
      return Err(RunnerError::ResponseNotFound(response_id.to_string()));
    };

    match handle.control.try_send(signal) {
      Ok(()) => {
        info!(response_id, ?signal, "Control signal delivered");
        Ok(())
      }
      Err(e) => {
        warn!(response_id, ?signal, error = %e, "Control signal dropped");
        Err(RunnerError::ControlUnavailable(response_id.to_string()))
      }
    }
  }
}

impl RunnerInner {
  async fn generate(&self, ctx: &mut ChatInvokeContext) -> Result<(), StreamError> {
    ctx.send_created().await?;
    ctx.send_in_progress().await?;

    let request = self.build_request(ctx);
    let deadline = Instant::now() + self.config.invoke_timeout;
    let call = ctx.cancel.child_token();

    debug!(model = %request.model, messages = request.messages.len(), "Opening provider stream");
    let opened = tokio::time::timeout_at(deadline, self.provider.chat_stream(&call, request)).await;
    let chunks = match opened {
      Ok(Ok(chunks)) => chunks,
      Ok(Err(e)) => {
        warn!(error = %e, "Provider failed to open stream");
        return ctx
          .fail(ResponseErrorCode::ServerError, format!("LLM request failed: {e}"))
          .await;
      }
      Err(_) => {
        warn!("Provider did not open stream before the deadline");
        return ctx.fail(ResponseErrorCode::ServerError, "LLM request timed out").await;
      }
    };

    let result = self.drive(ctx, &chunks, deadline).await;
    // Release the provider whatever the outcome
    call.cancel();
    result
  }

  async fn drive(
    &self,
    ctx: &mut ChatInvokeContext,
    chunks: &Stream<LlmResultChunk>,
    deadline: Instant,
  ) -> Result<(), StreamError> {
    loop {
      tokio::select! {
        Some(signal) = ctx.control.recv() => match signal {
          ControlSignal::Interrupt => {
            info!("Interrupted by user");
            return ctx.interrupt(InterruptType::User, None, None).await;
          }
        },
        _ = ctx.cancel.cancelled() => return caller_cancelled(ctx).await,
        next = tokio::time::timeout_at(deadline, chunks.recv()) => match next {
          Ok(Ok(Some(chunk))) => {
            if self.process_chunk(ctx, chunk).await? {
              return Ok(());
            }
          }
          // The provider stream lives under the caller's scope and can end first
          Ok(_) if ctx.cancel.is_cancelled() => return caller_cancelled(ctx).await,
          Ok(Ok(None)) => {
            return server_interrupt(ctx, ResponseErrorCode::ServerError, "stream ended before a finish reason", None).await;
          }
          Ok(Err(e)) => {
            warn!(error = %e, "Provider stream failed");
            let message = format!("error receiving stream data: {e}");
            return server_interrupt(ctx, ResponseErrorCode::ServerError, message, None).await;
          }
          Err(_) => {
            warn!(timeout_secs = self.config.invoke_timeout.as_secs(), "Provider stream timed out");
            return server_interrupt(ctx, ResponseErrorCode::ServerError, "LLM request timed out", None).await;
          }
        },
      }
    }
  }

  /// Returns `true` once the chunk ended the response.
  async fn process_chunk(&self, ctx: &mut ChatInvokeContext, chunk: LlmResultChunk) -> Result<bool, StreamError> {
    let message = &chunk.delta.message;

    if !message.content.is_empty() {
      ctx.append_text(&message.content).await?;
    }
    for call in &message.tool_calls {
      ctx.apply_tool_call(call).await?;
    }
    if let Some(usage) = &chunk.delta.usage {
      ctx.set_usage(usage);
    }

    let Some(reason) = chunk.finish_reason() else {
      return Ok(false);
    };
    debug!(finish_reason = reason, "Provider finished");

    match reason {
      FINISH_STOP | FINISH_TOOL_CALLS => {
        ctx.finalize_all().await?;
        ctx.complete().await?;
      }
      FINISH_LENGTH => {
        server_interrupt(
          ctx,
          ResponseErrorCode::LlmRequestLength,
          "LLM request exceeded the length limit",
          Some(IncompleteReason::MaxOutputTokens),
        )
        .await?;
      }
      "content_filter" => {
        server_interrupt(
          ctx,
          ResponseErrorCode::ServerError,
          "LLM output was filtered",
          Some(IncompleteReason::ContentFilter),
        )
        .await?;
      }
      other => {
        let message = format!("LLM request terminated: {other}");
        server_interrupt(ctx, ResponseErrorCode::ServerError, message, None).await?;
      }
    }
    Ok(true)
  }

  fn build_request(&self, ctx: &ChatInvokeContext) -> ChatRequest {
    let mut messages = Vec::new();
    if let Some(prompt) = &self.config.system_prompt {
      messages.push(PromptMessage::system(prompt.clone()));
    }
    messages.extend(to_prompt_messages(&ctx.input));

    let mut parameters = serde_json::Map::new();
    parameters.insert("temperature".to_string(), serde_json::json!(self.config.temperature));

    ChatRequest {
      model: self.config.model.clone(),
      messages,
      tools: ctx.response.tools.clone(),
      parameters,
      stop: Vec::new(),
    }
  }
}

async fn caller_cancelled(ctx: &mut ChatInvokeContext) -> Result<(), StreamError> {
  info!("Caller cancelled the response");
  ctx.interrupt(InterruptType::System, None, None).await
}

async fn server_interrupt(
  ctx: &mut ChatInvokeContext,
  code: ResponseErrorCode,
  message: impl Into<String>,
  reason: Option<IncompleteReason>,
) -> Result<(), StreamError> {
  let error = ResponseError {
    code,
    message: message.into(),
  };
  ctx
    .interrupt(
      InterruptType::System,
      Some(error),
      reason.map(|reason| IncompleteDetails { reason }),
    )
    .await
}
