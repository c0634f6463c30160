//! Persistence seam for agent messages
//!
//! The chat actor writes lifecycle snapshots and output items through a
//! [`MessageStore`]. Store failures are logged by the caller and never stop
//! generation.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::messages::{AgentMessage, OutputItem};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
  #[error("agent message not found: {0}")]
  NotFound(String),
  #[error("storage backend error: {0}")]
  Backend(String),
}

#[async_trait]
pub trait MessageStore: Send + Sync {
  /// Insert or replace the agent message snapshot
  async fn save_agent_message(&self, message: &AgentMessage) -> Result<(), StoreError>;

  /// Insert or replace the output item at `position`
  async fn save_output_item(&self, agent_message_id: &str, position: usize, item: &OutputItem)
  -> Result<(), StoreError>;
}

/// Process-local store, used by the demo and tests
#[derive(Default)]
pub struct InMemoryMessageStore {
  messages: DashMap<String, AgentMessage>,
  items: DashMap<String, Vec<Option<OutputItem>>>,
}

impl InMemoryMessageStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn agent_message(&self, id: &str) -> Option<AgentMessage> {
    self.messages.get(id).map(|m| m.clone())
  }

  /// Stored output items in position order
  pub fn output_items(&self, agent_message_id: &str) -> Vec<OutputItem> {
    self
      .items
      .get(agent_message_id)
      .map(|items| items.iter().flatten().cloned().collect())
      .unwrap_or_default()
  }

  pub fn len(&self) -> usize {
    self.messages.len()
  }

  pub fn is_empty(&self) -> bool {
    self.messages.is_empty()
  }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
  async fn save_agent_message(&self, message: &AgentMessage) -> Result<(), StoreError> {
    self.messages.insert(message.id.clone(), message.clone());
    Ok(())
  }

  async fn save_output_item(
    &self,
    agent_message_id: &str,
    position: usize,
    item: &OutputItem,
  ) -> Result<(), StoreError> {
    if !self.messages.contains_key(agent_message_id) {
      return Err(StoreError::NotFound(agent_message_id.to_string()));
    }

    let mut items = self.items.entry(agent_message_id.to_string()).or_default();
    if items.len() <= position {
      items.resize(position + 1, None);
    }
    items[position] = Some(item.clone());
    Ok(())
  }
}
