//! Chat event model
//!
//! Every message that crosses the chat actor, inbound requests and the
//! outbound `agent_message.*` lifecycle feed alike, is a [`ChatEvent`]. The
//! wire discriminator is the `type` field, which is also the actor routing
//! key returned by [`Event::event_type`].

use chrono::Utc;
use llm::{PromptMessageTool, PromptRole, Usage};
use parley_core::Event;
use serde::{Deserialize, Serialize};

// ============================================================================
// Event Type Strings
// ============================================================================

pub const EVENT_SEND_MESSAGE: &str = "message.send";
pub const EVENT_INTERRUPT: &str = "agent_message.interrupt";
pub const EVENT_CREATED: &str = "agent_message.created";
pub const EVENT_IN_PROGRESS: &str = "agent_message.in_progress";
pub const EVENT_OUTPUT_ITEM_ADDED: &str = "agent_message.output_item.added";
pub const EVENT_CONTENT_PART_ADDED: &str = "agent_message.content_part.added";
pub const EVENT_TEXT_DELTA: &str = "agent_message.output_text.delta";
pub const EVENT_TEXT_DONE: &str = "agent_message.output_text.done";
pub const EVENT_CONTENT_PART_DONE: &str = "agent_message.content_part.done";
pub const EVENT_OUTPUT_ITEM_DONE: &str = "agent_message.output_item.done";
pub const EVENT_FUNCTION_CALL_ARGUMENTS_DELTA: &str = "agent_message.function_call_arguments.delta";
pub const EVENT_FUNCTION_CALL_ARGUMENTS_DONE: &str = "agent_message.function_call_arguments.done";
pub const EVENT_COMPLETED: &str = "agent_message.completed";
pub const EVENT_FAILED: &str = "agent_message.failed";
pub const EVENT_INCOMPLETE: &str = "agent_message.incomplete";
pub const EVENT_ERROR: &str = "error";

// ============================================================================
// Chat Events
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatEvent {
  pub event_id: String,
  /// Unix milliseconds
  pub created_at: i64,
  #[serde(flatten)]
  pub kind: ChatEventKind,
}

impl ChatEvent {
  /// Wrap `kind` with a fresh time-ordered id
  pub fn new(kind: ChatEventKind) -> Self {
    Self {
      event_id: uuid::Uuid::now_v7().to_string(),
      created_at: Utc::now().timestamp_millis(),
      kind,
    }
  }

  /// The agent message snapshot carried by lifecycle events
  pub fn agent_message(&self) -> Option<&AgentMessage> {
    match &self.kind {
      ChatEventKind::Created { agent_message }
      | ChatEventKind::InProgress { agent_message }
      | ChatEventKind::Completed { agent_message }
      | ChatEventKind::Failed { agent_message }
      | ChatEventKind::Incomplete { agent_message } => Some(agent_message),
      _ => None,
    }
  }

  pub fn is_terminal(&self) -> bool {
    matches!(
      self.kind,
      ChatEventKind::Completed { .. } | ChatEventKind::Failed { .. } | ChatEventKind::Incomplete { .. }
    )
  }
}

impl Event for ChatEvent {
  fn id(&self) -> &str {
    &self.event_id
  }

  fn event_type(&self) -> &str {
    self.kind.event_type()
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChatEventKind {
  // Inbound
  #[serde(rename = "message.send")]
  SendMessage(SendMessage),
  #[serde(rename = "agent_message.interrupt")]
  Interrupt { response_id: String },

  // Outbound lifecycle
  #[serde(rename = "agent_message.created")]
  Created { agent_message: AgentMessage },
  #[serde(rename = "agent_message.in_progress")]
  InProgress { agent_message: AgentMessage },
  #[serde(rename = "agent_message.output_item.added")]
  OutputItemAdded { output_index: usize, item: OutputItem },
  #[serde(rename = "agent_message.content_part.added")]
  ContentPartAdded {
    item_id: String,
    output_index: usize,
    content_index: usize,
    part: OutputContent,
  },
  #[serde(rename = "agent_message.output_text.delta")]
  TextDelta {
    item_id: String,
    output_index: usize,
    content_index: usize,
    delta: String,
  },
  #[serde(rename = "agent_message.output_text.done")]
  TextDone {
    item_id: String,
    output_index: usize,
    content_index: usize,
    text: String,
  },
  #[serde(rename = "agent_message.content_part.done")]
  ContentPartDone {
    item_id: String,
    output_index: usize,
    content_index: usize,
    part: OutputContent,
  },
  #[serde(rename = "agent_message.output_item.done")]
  OutputItemDone { output_index: usize, item: OutputItem },
  #[serde(rename = "agent_message.function_call_arguments.delta")]
  FunctionCallArgumentsDelta {
    item_id: String,
    output_index: usize,
    delta: String,
  },
  #[serde(rename = "agent_message.function_call_arguments.done")]
  FunctionCallArgumentsDone {
    item_id: String,
    output_index: usize,
    arguments: String,
  },
  #[serde(rename = "agent_message.completed")]
  Completed { agent_message: AgentMessage },
  #[serde(rename = "agent_message.failed")]
  Failed { agent_message: AgentMessage },
  #[serde(rename = "agent_message.incomplete")]
  Incomplete { agent_message: AgentMessage },
  #[serde(rename = "error")]
  Error {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    code: Option<String>,
    message: String,
  },
}

impl ChatEventKind {
  pub fn event_type(&self) -> &'static str {
    match self {
      ChatEventKind::SendMessage(_) => EVENT_SEND_MESSAGE,
      ChatEventKind::Interrupt { .. } => EVENT_INTERRUPT,
      ChatEventKind::Created { .. } => EVENT_CREATED,
      ChatEventKind::InProgress { .. } => EVENT_IN_PROGRESS,
      ChatEventKind::OutputItemAdded { .. } => EVENT_OUTPUT_ITEM_ADDED,
      ChatEventKind::ContentPartAdded { .. } => EVENT_CONTENT_PART_ADDED,
      ChatEventKind::TextDelta { .. } => EVENT_TEXT_DELTA,
      ChatEventKind::TextDone { .. } => EVENT_TEXT_DONE,
      ChatEventKind::ContentPartDone { .. } => EVENT_CONTENT_PART_DONE,
      ChatEventKind::OutputItemDone { .. } => EVENT_OUTPUT_ITEM_DONE,
      ChatEventKind::FunctionCallArgumentsDelta { .. } => EVENT_FUNCTION_CALL_ARGUMENTS_DELTA,
      ChatEventKind::FunctionCallArgumentsDone { .. } => EVENT_FUNCTION_CALL_ARGUMENTS_DONE,
      ChatEventKind::Completed { .. } => EVENT_COMPLETED,
      ChatEventKind::Failed { .. } => EVENT_FAILED,
      ChatEventKind::Incomplete { .. } => EVENT_INCOMPLETE,
      ChatEventKind::Error { .. } => EVENT_ERROR,
    }
  }
}

/// A user turn asking for an assistant response
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SendMessage {
  /// Id of the stored user message this turn answers
  #[serde(default)]
  pub message_id: String,
  /// Reuse a caller-chosen response id instead of generating one
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub response_id: Option<String>,
  pub input: Vec<InputItem>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub tools: Vec<PromptMessageTool>,
}

// ============================================================================
// Input Items
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputContent {
  InputText { text: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputItem {
  Message { role: PromptRole, content: Vec<InputContent> },
  FunctionCall { call_id: String, name: String, arguments: String },
  FunctionCallOutput { call_id: String, output: String },
}

impl InputItem {
  pub fn user_text(text: impl Into<String>) -> Self {
    InputItem::Message {
      role: PromptRole::User,
      content: vec![InputContent::InputText { text: text.into() }],
    }
  }
}

// ============================================================================
// Agent Message
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentMessageStatus {
  #[default]
  InProgress,
  Completed,
  Failed,
  Incomplete,
}

/// Who stopped an incomplete response
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptType {
  #[default]
  None,
  User,
  System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncompleteReason {
  MaxOutputTokens,
  ContentFilter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncompleteDetails {
  pub reason: IncompleteReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseErrorCode {
  ServerError,
  LlmRequestLength,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseError {
  pub code: ResponseErrorCode,
  pub message: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseUsage {
  pub input_tokens: u64,
  pub output_tokens: u64,
  pub total_tokens: u64,
}

impl From<&Usage> for ResponseUsage {
  fn from(usage: &Usage) -> Self {
    Self {
      input_tokens: usage.prompt_tokens,
      output_tokens: usage.completion_tokens,
      total_tokens: usage.total_tokens,
    }
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
  #[default]
  InProgress,
  Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputContent {
  OutputText { text: String },
}

impl OutputContent {
  pub fn text(&self) -> &str {
    match self {
      OutputContent::OutputText { text } => text,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputMessage {
  pub id: String,
  pub role: PromptRole,
  pub content: Vec<OutputContent>,
  pub status: ItemStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionToolCall {
  pub id: String,
  pub call_id: String,
  pub name: String,
  #[serde(default)]
  pub arguments: String,
  pub status: ItemStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputItem {
  Message(OutputMessage),
  FunctionCall(FunctionToolCall),
}

impl OutputItem {
  pub fn id(&self) -> &str {
    match self {
      OutputItem::Message(message) => &message.id,
      OutputItem::FunctionCall(call) => &call.id,
    }
  }
}

/// The assistant response as it accumulates during generation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentMessage {
  pub id: String,
  /// The user message this response answers
  #[serde(default)]
  pub message_id: String,
  pub status: AgentMessageStatus,
  #[serde(default)]
  pub output: Vec<OutputItem>,
  /// Plain-text rendering of every text part
  #[serde(default)]
  pub alt_text: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub usage: Option<ResponseUsage>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<ResponseError>,
  #[serde(default)]
  pub interrupt_type: InterruptType,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub incomplete_details: Option<IncompleteDetails>,
  #[serde(default)]
  pub tools: Vec<PromptMessageTool>,
  pub created_at: i64,
  pub updated_at: i64,
}

impl AgentMessage {
  pub fn new(id: impl Into<String>, message_id: impl Into<String>) -> Self {
    let now = Utc::now().timestamp_millis();
    Self {
      id: id.into(),
      message_id: message_id.into(),
      created_at: now,
      updated_at: now,
      ..Default::default()
    }
  }

  pub fn touch(&mut self) {
    self.updated_at = Utc::now().timestamp_millis();
  }
}
