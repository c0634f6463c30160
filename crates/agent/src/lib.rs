//! Streaming chat responses on top of the actor framework.
//!
//! [`ChatRunner`] turns a provider chunk stream into ordered
//! `agent_message.*` lifecycle events; [`ChatActor`] exposes it as an actor
//! mailbox.

pub mod chat_actor;
pub mod context;
pub mod messages;
pub mod runner;
pub mod store;
pub mod transform;

#[cfg(test)]
mod __tests__;

pub use chat_actor::ChatActor;
pub use context::{ChatInvokeContext, ControlSignal};
pub use messages::{
  AgentMessage, AgentMessageStatus, ChatEvent, ChatEventKind, FunctionToolCall, IncompleteDetails, IncompleteReason,
  InputContent, InputItem, InterruptType, ItemStatus, OutputContent, OutputItem, OutputMessage, ResponseError,
  ResponseErrorCode, ResponseUsage, SendMessage,
};
pub use runner::{ChatRunner, Invocation, RunnerConfig, RunnerError};
pub use store::{InMemoryMessageStore, MessageStore, StoreError};
pub use transform::to_prompt_messages;
