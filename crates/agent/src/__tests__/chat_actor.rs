//! Chat actor relay, interrupt and persistence tests.

#[cfg(test)]
mod tests {
  use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
  };

  use async_trait::async_trait;
  use events::ActorOptions;
  use llm::{ScriptStep, ScriptedProvider};
  use pretty_assertions::assert_eq;
  use tokio_util::sync::CancellationToken;

  use crate::{
    __tests__::helpers::*,
    chat_actor::ChatActor,
    messages::*,
    store::{InMemoryMessageStore, MessageStore, StoreError},
  };

  fn request(response_id: &str) -> SendMessage {
    SendMessage {
      message_id: format!("msg-{response_id}"),
      response_id: Some(response_id.to_string()),
      input: hello_input(),
      tools: Vec::new(),
    }
  }

  fn started(provider: ScriptedProvider, store: Arc<dyn MessageStore>) -> (ChatActor, CancellationToken) {
    let root = CancellationToken::new();
    let chat = ChatActor::new("chat-actor", ActorOptions::default(), runner(provider), store).unwrap();
    chat.start(&root).unwrap();
    (chat, root)
  }

  /// Rejects every write
  struct BrokenStore {
    attempts: AtomicUsize,
  }

  #[async_trait]
  impl MessageStore for BrokenStore {
    async fn save_agent_message(&self, _message: &AgentMessage) -> Result<(), StoreError> {
      self.attempts.fetch_add(1, Ordering::SeqCst);
      Err(StoreError::Backend("disk full".into()))
    }

    async fn save_output_item(&self, _id: &str, _position: usize, _item: &OutputItem) -> Result<(), StoreError> {
      self.attempts.fetch_add(1, Ordering::SeqCst);
      Err(StoreError::Backend("disk full".into()))
    }
  }

  #[tokio::test]
  async fn test_send_message_relays_lifecycle_and_persists() {
    let store = Arc::new(InMemoryMessageStore::new());
    let (chat, _root) = started(ScriptedProvider::from_text(MODEL, &["Hi", " there"]), store.clone());

    chat.send_message(request("r1")).await.unwrap();
    let events = receive_until(&chat, ChatEvent::is_terminal).await;

    assert_eq!(events.first().map(|e| e.kind.event_type()), Some(EVENT_CREATED));
    assert_eq!(events.last().map(|e| e.kind.event_type()), Some(EVENT_COMPLETED));
    assert_eq!(terminal_count(&events), 1);

    let stored = store.agent_message("r1").expect("agent message stored");
    assert_eq!(stored.status, AgentMessageStatus::Completed);
    assert_eq!(stored.alt_text, "Hi there");
    assert_eq!(stored.message_id, "msg-r1");

    let items = store.output_items("r1");
    assert_eq!(items.len(), 1);
    match &items[0] {
      OutputItem::Message(message) => assert_eq!(message.status, ItemStatus::Completed),
      other => panic!("unexpected item: {other:?}"),
    }
  }

  #[tokio::test]
  async fn test_generated_response_id_when_absent() {
    let store = Arc::new(InMemoryMessageStore::new());
    let (chat, _root) = started(ScriptedProvider::from_text(MODEL, &["ok"]), store.clone());

    let mut req = request("ignored");
    req.response_id = None;
    chat.send_message(req).await.unwrap();

    let events = receive_until(&chat, ChatEvent::is_terminal).await;
    let id = events[0].agent_message().map(|m| m.id.clone()).unwrap();
    assert!(!id.is_empty());
    assert!(store.agent_message(&id).is_some());
  }

  #[tokio::test]
  async fn test_interrupt_through_actor_ends_incomplete() {
    let store = Arc::new(InMemoryMessageStore::new());
    let (chat, _root) = started(
      ScriptedProvider::new("scripted", vec![text(0, "thinking"), ScriptStep::Hang]),
      store.clone(),
    );

    chat.send_message(request("r2")).await.unwrap();
    let mut events = receive_until(&chat, |e| e.kind.event_type() == EVENT_TEXT_DELTA).await;

    chat.interrupt("r2").await.unwrap();
    events.extend(receive_until(&chat, ChatEvent::is_terminal).await);

    assert_eq!(terminal_count(&events), 1);
    let message = events.last().and_then(|e| e.agent_message()).unwrap();
    assert_eq!(message.status, AgentMessageStatus::Incomplete);
    assert_eq!(message.interrupt_type, InterruptType::User);

    assert_eq!(
      store.agent_message("r2").map(|m| m.status),
      Some(AgentMessageStatus::Incomplete)
    );
  }

  #[tokio::test]
  async fn test_interrupt_unknown_response_publishes_error() {
    let (chat, _root) = started(
      ScriptedProvider::from_text(MODEL, &["x"]),
      Arc::new(InMemoryMessageStore::new()),
    );

    chat.interrupt("missing").await.unwrap();
    let events = receive_until(&chat, |e| e.kind.event_type() == EVENT_ERROR).await;

    let ChatEventKind::Error { code, message } = &events[0].kind else {
      panic!("expected error event, got {:?}", events[0].kind);
    };
    assert_eq!(code.as_deref(), Some("interrupt_failed"));
    assert!(message.contains("missing"), "{message}");
  }

  #[tokio::test]
  async fn test_duplicate_response_publishes_error() {
    let (chat, _root) = started(
      ScriptedProvider::new("scripted", vec![ScriptStep::Hang]),
      Arc::new(InMemoryMessageStore::new()),
    );

    chat.send_message(request("r-dup")).await.unwrap();
    chat.send_message(request("r-dup")).await.unwrap();

    let events = receive_until(&chat, |e| e.kind.event_type() == EVENT_ERROR).await;
    let ChatEventKind::Error { code, .. } = &events.last().unwrap().kind else {
      unreachable!();
    };
    assert_eq!(code.as_deref(), Some("ai_respond_failed"));
    assert!(chat.runner().is_running("r-dup"));

    chat.interrupt("r-dup").await.unwrap();
    receive_until(&chat, ChatEvent::is_terminal).await;
  }

  #[tokio::test]
  async fn test_store_failures_do_not_stop_the_response() {
    let store = Arc::new(BrokenStore {
      attempts: AtomicUsize::new(0),
    });
    let (chat, _root) = started(ScriptedProvider::from_text(MODEL, &["still here"]), store.clone());

    chat.send_message(request("r3")).await.unwrap();
    let events = receive_until(&chat, ChatEvent::is_terminal).await;

    assert_eq!(events.last().map(|e| e.kind.event_type()), Some(EVENT_COMPLETED));
    assert!(store.attempts.load(Ordering::SeqCst) > 1);
  }

  #[tokio::test]
  async fn test_stop_ends_streaming_response() {
    let (chat, _root) = started(
      ScriptedProvider::new("scripted", vec![text(0, "forever"), ScriptStep::Hang]),
      Arc::new(InMemoryMessageStore::new()),
    );

    chat.send_message(request("r4")).await.unwrap();
    receive_until(&chat, |e| e.kind.event_type() == EVENT_TEXT_DELTA).await;

    chat.stop().await;

    assert!(chat.actor().is_stopped());
    assert!(wait_for(std::time::Duration::from_secs(2), || !chat.runner().is_running("r4")).await);
  }
}
