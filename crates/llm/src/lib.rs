//! Provider-neutral LLM types and the streaming provider seam.
//!
//! Vendor adapters implement [`LlmProvider`]; the chat runner only ever sees
//! [`LlmResultChunk`]s arriving on a [`streams::Stream`].

use serde::{Deserialize, Serialize};

mod provider;
mod scripted;

pub use provider::{LlmProvider, Result};
pub use scripted::{ScriptStep, ScriptedProvider};

/// Finish reasons with special handling downstream
pub const FINISH_STOP: &str = "stop";
pub const FINISH_TOOL_CALLS: &str = "tool_calls";
pub const FINISH_LENGTH: &str = "length";

// ============================================================================
// Prompt Messages
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptRole {
  #[serde(alias = "developer")]
  System,
  User,
  Assistant,
  Tool,
}

impl PromptRole {
  pub fn as_str(&self) -> &'static str {
    match self {
      PromptRole::System => "system",
      PromptRole::User => "user",
      PromptRole::Assistant => "assistant",
      PromptRole::Tool => "tool",
    }
  }
}

impl std::fmt::Display for PromptRole {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.as_str())
  }
}

impl std::str::FromStr for PromptRole {
  type Err = LlmError;

  fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
    match s {
      "system" | "developer" => Ok(PromptRole::System),
      "user" => Ok(PromptRole::User),
      "assistant" => Ok(PromptRole::Assistant),
      "tool" => Ok(PromptRole::Tool),
      other => Err(LlmError::InvalidRole(other.to_string())),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallFunction {
  pub name: String,
  pub arguments: String,
}

/// A complete tool call carried on an assistant prompt message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
  pub id: String,
  #[serde(rename = "type")]
  pub kind: String,
  pub function: ToolCallFunction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptMessage {
  pub role: PromptRole,
  #[serde(default)]
  pub content: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub tool_calls: Vec<ToolCall>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub tool_call_id: Option<String>,
}

impl PromptMessage {
  pub fn new(role: PromptRole, content: impl Into<String>) -> Self {
    Self {
      role,
      content: content.into(),
      name: None,
      tool_calls: Vec::new(),
      tool_call_id: None,
    }
  }

  pub fn system(content: impl Into<String>) -> Self {
    Self::new(PromptRole::System, content)
  }

  pub fn user(content: impl Into<String>) -> Self {
    Self::new(PromptRole::User, content)
  }

  pub fn assistant(content: impl Into<String>) -> Self {
    Self::new(PromptRole::Assistant, content)
  }

  /// Result of a tool invocation, answering `call_id`
  pub fn tool(call_id: impl Into<String>, content: impl Into<String>) -> Self {
    Self {
      tool_call_id: Some(call_id.into()),
      ..Self::new(PromptRole::Tool, content)
    }
  }

  pub fn is_empty(&self) -> bool {
    self.content.is_empty() && self.tool_calls.is_empty()
  }
}

/// A tool the model may call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptMessageTool {
  pub name: String,
  pub description: String,
  #[serde(default)]
  pub parameters: serde_json::Value,
}

/// Everything a provider needs to open one streaming call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
  pub model: String,
  pub messages: Vec<PromptMessage>,
  #[serde(default)]
  pub tools: Vec<PromptMessageTool>,
  #[serde(default)]
  pub parameters: serde_json::Map<String, serde_json::Value>,
  #[serde(default)]
  pub stop: Vec<String>,
}

// ============================================================================
// Result Chunks
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
  pub prompt_tokens: u64,
  pub completion_tokens: u64,
  pub total_tokens: u64,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub total_price: Option<f64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub currency: Option<String>,
}

impl Usage {
  pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
    Self {
      prompt_tokens,
      completion_tokens,
      total_tokens: prompt_tokens + completion_tokens,
      ..Default::default()
    }
  }
}

/// A fragment of a streamed tool call. `id` and `name` arrive on the first
/// fragment of a call; `arguments` is appended across fragments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallDelta {
  pub index: usize,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub id: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  #[serde(default)]
  pub arguments: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssistantDelta {
  #[serde(default)]
  pub content: String,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub tool_calls: Vec<ToolCallDelta>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmResultChunkDelta {
  pub index: u64,
  pub message: AssistantDelta,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub finish_reason: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmResultChunk {
  pub model: String,
  pub delta: LlmResultChunkDelta,
}

impl LlmResultChunk {
  /// A plain text delta
  pub fn text(model: impl Into<String>, index: u64, content: impl Into<String>) -> Self {
    Self {
      model: model.into(),
      delta: LlmResultChunkDelta {
        index,
        message: AssistantDelta {
          content: content.into(),
          tool_calls: Vec::new(),
        },
        ..Default::default()
      },
    }
  }

  /// A tool call fragment
  pub fn tool_call(model: impl Into<String>, index: u64, call: ToolCallDelta) -> Self {
    Self {
      model: model.into(),
      delta: LlmResultChunkDelta {
        index,
        message: AssistantDelta {
          content: String::new(),
          tool_calls: vec![call],
        },
        ..Default::default()
      },
    }
  }

  /// The closing chunk carrying the finish reason and usage
  pub fn finish(model: impl Into<String>, index: u64, reason: impl Into<String>, usage: Option<Usage>) -> Self {
    Self {
      model: model.into(),
      delta: LlmResultChunkDelta {
        index,
        message: AssistantDelta::default(),
        finish_reason: Some(reason.into()),
        usage,
      },
    }
  }

  /// Finish reason, treating an empty string as absent
  pub fn finish_reason(&self) -> Option<&str> {
    self.delta.finish_reason.as_deref().filter(|r| !r.is_empty())
  }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors that can occur while talking to an LLM provider
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
  #[error("Provider {0} is not available")]
  Unavailable(String),
  #[error("Request failed: {0}")]
  Request(String),
  #[error("Request cancelled")]
  Cancelled,
  #[error("Invalid prompt role: {0}")]
  InvalidRole(String),
  #[error("Failed to parse JSON: {0}")]
  ParseError(#[from] serde_json::Error),
  #[error(transparent)]
  Stream(#[from] streams::StreamError),
}
