//! Per-response generation state
//!
//! A [`ChatInvokeContext`] is owned by exactly one generation task. It holds
//! the accumulating [`AgentMessage`], the cursor into the output item and
//! text part currently receiving deltas, and the event stream every
//! lifecycle event is emitted on.

use std::collections::HashMap;

use llm::{ToolCallDelta, Usage};
use streams::{Stream, StreamError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::messages::{
  AgentMessage, AgentMessageStatus, ChatEvent, ChatEventKind, FunctionToolCall, IncompleteDetails, InputItem,
  InterruptType, ItemStatus, OutputContent, OutputItem, OutputMessage, ResponseError, ResponseErrorCode,
  ResponseUsage,
};

/// Out-of-band signals addressed to a running response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
  Interrupt,
}

/// Where the next text delta lands
#[derive(Debug, Default, Clone, Copy)]
struct Cursor {
  output_index: Option<usize>,
  content_index: Option<usize>,
}

pub struct ChatInvokeContext {
  pub(crate) response: AgentMessage,
  pub(crate) input: Vec<InputItem>,
  pub(crate) cancel: CancellationToken,
  pub(crate) control: mpsc::Receiver<ControlSignal>,
  events: Stream<ChatEvent>,
  cursor: Cursor,
  /// Provider tool-call index -> output index
  tool_items: HashMap<usize, usize>,
  terminated: bool,
}

impl ChatInvokeContext {
  pub(crate) fn new(
    response: AgentMessage,
    input: Vec<InputItem>,
    cancel: CancellationToken,
    control: mpsc::Receiver<ControlSignal>,
    events: Stream<ChatEvent>,
  ) -> Self {
    Self {
      response,
      input,
      cancel,
      control,
      events,
      cursor: Cursor::default(),
      tool_items: HashMap::new(),
      terminated: false,
    }
  }

  pub fn response(&self) -> &AgentMessage {
    &self.response
  }

  pub fn response_id(&self) -> &str {
    &self.response.id
  }

  pub fn is_terminated(&self) -> bool {
    self.terminated
  }

  /// Close the event stream once generation is over
  pub(crate) fn close(&self) {
    self.events.close_send();
  }

  async fn emit(&self, kind: ChatEventKind) -> Result<(), StreamError> {
    let event = ChatEvent::new(kind);
    trace!(
      response_id = %self.response.id,
      event_id = %event.event_id,
      event_type = event.kind.event_type(),
      "Emitting chat event"
    );
    self.events.send(event).await
  }

  // ==========================================================================
  // Opening
  // ==========================================================================

  pub(crate) async fn send_created(&self) -> Result<(), StreamError> {
    self
      .emit(ChatEventKind::Created {
        agent_message: self.response.clone(),
      })
      .await
  }

  pub(crate) async fn send_in_progress(&self) -> Result<(), StreamError> {
    self
      .emit(ChatEventKind::InProgress {
        agent_message: self.response.clone(),
      })
      .await
  }

  // ==========================================================================
  // Deltas
  // ==========================================================================

  /// Append a text delta, opening the output message and text part on first use.
  pub(crate) async fn append_text(&mut self, delta: &str) -> Result<(), StreamError> {
    let output_index = self.ensure_output_message().await?;
    let content_index = self.ensure_text_part(output_index).await?;

    let item_id = match &mut self.response.output[output_index] {
      OutputItem::Message(message) => {
        match &mut message.content[content_index] {
          OutputContent::OutputText { text } => text.push_str(delta),
        }
        message.id.clone()
      }
      OutputItem::FunctionCall(call) => call.id.clone(),
    };

    self
      .emit(ChatEventKind::TextDelta {
        item_id,
        output_index,
        content_index,
        delta: delta.to_string(),
      })
      .await
  }

  async fn ensure_output_message(&mut self) -> Result<usize, StreamError> {
    if let Some(index) = self.cursor.output_index {
      return Ok(index);
    }

    let item = OutputItem::Message(OutputMessage {
      id: uuid::Uuid::now_v7().to_string(),
      role: llm::PromptRole::Assistant,
      content: Vec::new(),
      status: ItemStatus::InProgress,
    });
    self.response.output.push(item.clone());
    let output_index = self.response.output.len() - 1;
    self.cursor.output_index = Some(output_index);

    self.emit(ChatEventKind::OutputItemAdded { output_index, item }).await?;
    Ok(output_index)
  }

  async fn ensure_text_part(&mut self, output_index: usize) -> Result<usize, StreamError> {
    if let Some(index) = self.cursor.content_index {
      return Ok(index);
    }

    let part = OutputContent::OutputText { text: String::new() };
    let (item_id, content_index) = match &mut self.response.output[output_index] {
      OutputItem::Message(message) => {
        message.content.push(part.clone());
        (message.id.clone(), message.content.len() - 1)
      }
      OutputItem::FunctionCall(call) => (call.id.clone(), 0),
    };
    self.cursor.content_index = Some(content_index);

    self
      .emit(ChatEventKind::ContentPartAdded {
        item_id,
        output_index,
        content_index,
        part,
      })
      .await?;
    Ok(content_index)
  }

  /// Apply one streamed tool-call fragment.
  pub(crate) async fn apply_tool_call(&mut self, delta: &ToolCallDelta) -> Result<(), StreamError> {
    let output_index = match self.tool_items.get(&delta.index) {
      Some(index) => *index,
      None => {
        let id = uuid::Uuid::now_v7().to_string();
        let item = OutputItem::FunctionCall(FunctionToolCall {
          call_id: delta.id.clone().unwrap_or_else(|| format!("call_{id}")),
          id,
          name: delta.name.clone().unwrap_or_default(),
          arguments: String::new(),
          status: ItemStatus::InProgress,
        });
        self.response.output.push(item.clone());
        let output_index = self.response.output.len() - 1;
        self.tool_items.insert(delta.index, output_index);

        self.emit(ChatEventKind::OutputItemAdded { output_index, item }).await?;
        output_index
      }
    };

    if delta.arguments.is_empty() {
      return Ok(());
    }

    let item_id = match &mut self.response.output[output_index] {
      OutputItem::FunctionCall(call) => {
        call.arguments.push_str(&delta.arguments);
        call.id.clone()
      }
      OutputItem::Message(message) => message.id.clone(),
    };

    self
      .emit(ChatEventKind::FunctionCallArgumentsDelta {
        item_id,
        output_index,
        delta: delta.arguments.clone(),
      })
      .await
  }

  pub(crate) fn set_usage(&mut self, usage: &Usage) {
    self.response.usage = Some(ResponseUsage::from(usage));
  }

  // ==========================================================================
  // Finalization
  // ==========================================================================

  /// Close every open part and item in output order, building `alt_text`.
  pub(crate) async fn finalize_all(&mut self) -> Result<(), StreamError> {
    for output_index in 0..self.response.output.len() {
      let mut pending = Vec::new();

      match &mut self.response.output[output_index] {
        OutputItem::Message(message) => {
          for (content_index, part) in message.content.iter().enumerate() {
            let text = part.text().to_string();
            self.response.alt_text.push_str(&text);
            pending.push(ChatEventKind::TextDone {
              item_id: message.id.clone(),
              output_index,
              content_index,
              text,
            });
            pending.push(ChatEventKind::ContentPartDone {
              item_id: message.id.clone(),
              output_index,
              content_index,
              part: part.clone(),
            });
          }
          message.status = ItemStatus::Completed;
        }
        OutputItem::FunctionCall(call) => {
          pending.push(ChatEventKind::FunctionCallArgumentsDone {
            item_id: call.id.clone(),
            output_index,
            arguments: call.arguments.clone(),
          });
          call.status = ItemStatus::Completed;
        }
      }

      pending.push(ChatEventKind::OutputItemDone {
        output_index,
        item: self.response.output[output_index].clone(),
      });

      for kind in pending {
        self.emit(kind).await?;
      }
    }

    self.cursor = Cursor::default();
    Ok(())
  }

  // ==========================================================================
  // Terminal Events
  // ==========================================================================

  /// Returns false when a terminal event was already emitted
  fn begin_terminal(&mut self, status: AgentMessageStatus) -> bool {
    if self.terminated {
      warn!(
        response_id = %self.response.id,
        ?status,
        "Terminal event already emitted, ignoring"
      );
      return false;
    }
    self.terminated = true;
    self.response.status = status;
    self.response.touch();
    true
  }

  pub(crate) async fn complete(&mut self) -> Result<(), StreamError> {
    if !self.begin_terminal(AgentMessageStatus::Completed) {
      return Ok(());
    }
    self
      .emit(ChatEventKind::Completed {
        agent_message: self.response.clone(),
      })
      .await
  }

  pub(crate) async fn fail(&mut self, code: ResponseErrorCode, message: impl Into<String>) -> Result<(), StreamError> {
    if !self.begin_terminal(AgentMessageStatus::Failed) {
      return Ok(());
    }
    self.response.error = Some(ResponseError {
      code,
      message: message.into(),
    });
    self
      .emit(ChatEventKind::Failed {
        agent_message: self.response.clone(),
      })
      .await
  }

  /// End as `incomplete`. `error` is set for provider-side interruptions.
  pub(crate) async fn interrupt(
    &mut self,
    interrupt_type: InterruptType,
    error: Option<ResponseError>,
    details: Option<IncompleteDetails>,
  ) -> Result<(), StreamError> {
    if !self.begin_terminal(AgentMessageStatus::Incomplete) {
      return Ok(());
    }
    self.response.interrupt_type = interrupt_type;
    self.response.error = error;
    self.response.incomplete_details = details;
    self
      .emit(ChatEventKind::Incomplete {
        agent_message: self.response.clone(),
      })
      .await
  }
}
