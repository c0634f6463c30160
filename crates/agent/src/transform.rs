//! Input items to provider-neutral prompt messages

use llm::{PromptMessage, PromptRole, ToolCall, ToolCallFunction};

use crate::messages::{InputContent, InputItem};

/// Convert a turn's input items into prompt messages.
///
/// Text parts of one message are joined with newlines and empty messages are
/// dropped. Consecutive function calls collapse into a single assistant
/// message carrying every call, the shape providers expect before the
/// matching tool results.
pub fn to_prompt_messages(items: &[InputItem]) -> Vec<PromptMessage> {
  let mut messages: Vec<PromptMessage> = Vec::with_capacity(items.len());

  for item in items {
    match item {
      InputItem::Message { role, content } => {
        let text = content
          .iter()
          .map(|part| match part {
            InputContent::InputText { text } => text.as_str(),
          })
          .filter(|text| !text.is_empty())
          .collect::<Vec<_>>()
          .join("\n");

        if !text.is_empty() {
          messages.push(PromptMessage::new(*role, text));
        }
      }
      InputItem::FunctionCall { call_id, name, arguments } => {
        let call = ToolCall {
          id: call_id.clone(),
          kind: "function".to_string(),
          function: ToolCallFunction {
            name: name.clone(),
            arguments: arguments.clone(),
          },
        };

        match messages.last_mut() {
          Some(last) if last.role == PromptRole::Assistant && !last.tool_calls.is_empty() => {
            last.tool_calls.push(call);
          }
          _ => {
            let mut message = PromptMessage::assistant("");
            message.tool_calls.push(call);
            messages.push(message);
          }
        }
      }
      InputItem::FunctionCallOutput { call_id, output } => {
        messages.push(PromptMessage::tool(call_id.clone(), output.clone()));
      }
    }
  }

  messages
}
