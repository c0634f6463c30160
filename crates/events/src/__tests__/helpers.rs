//! Shared fixtures for actor and bus tests.

use std::{
  sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
  },
  time::Duration,
};

use parking_lot::Mutex;
use parley_core::Event;

use crate::actor::{Actor, ActorError, ActorOptions};

static NEXT_ID: AtomicUsize = AtomicUsize::new(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestEvent {
  pub id: String,
  pub kind: String,
  pub content: String,
}

impl TestEvent {
  pub fn new(kind: &str) -> Self {
    Self::with_content(kind, "")
  }

  pub fn with_content(kind: &str, content: &str) -> Self {
    Self {
      id: format!("evt-{}", NEXT_ID.fetch_add(1, Ordering::Relaxed)),
      kind: kind.to_string(),
      content: content.to_string(),
    }
  }
}

impl Event for TestEvent {
  fn id(&self) -> &str {
    &self.id
  }

  fn event_type(&self) -> &str {
    &self.kind
  }
}

/// Collects every error an actor reports through its callback.
#[derive(Clone, Default)]
pub struct ErrorLog(Arc<Mutex<Vec<String>>>);

impl ErrorLog {
  pub fn record(&self, err: &ActorError) {
    self.0.lock().push(err.to_string());
  }

  pub fn entries(&self) -> Vec<String> {
    self.0.lock().clone()
  }
}

/// An actor that counts greetings and answers each one on its outbox.
pub struct CounterActor {
  pub actor: Actor<TestEvent>,
  pub count: Arc<AtomicUsize>,
}

impl CounterActor {
  pub fn new(options: ActorOptions<TestEvent>) -> Self {
    let actor = Actor::new("counter-actor", options);
    let count = Arc::new(AtomicUsize::new(0));

    let counter = count.clone();
    actor
      .register_handler("greeting", move |ctx, msg: TestEvent| {
        let counter = counter.clone();
        async move {
          let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
          let mut response = TestEvent::with_content("greeting-response", &format!("greeting #{n}: {}", msg.content));
          response.id = format!("response-{}", msg.id);
          ctx.publish(response).await?;
          Ok(())
        }
      })
      .expect("register greeting");

    let counter = count.clone();
    actor
      .register_handler("reset", move |ctx, msg: TestEvent| {
        let counter = counter.clone();
        async move {
          counter.store(0, Ordering::SeqCst);
          let mut response = TestEvent::new("reset-response");
          response.id = format!("response-{}", msg.id);
          ctx.publish(response).await?;
          Ok(())
        }
      })
      .expect("register reset");

    Self { actor, count }
  }

  pub fn count(&self) -> usize {
    self.count.load(Ordering::SeqCst)
  }
}

/// Poll `check` until it returns true or `timeout` elapses.
pub async fn wait_for<F>(timeout: Duration, mut check: F) -> bool
where
  F: FnMut() -> bool,
{
  let start = std::time::Instant::now();
  let poll_interval = Duration::from_millis(10);

  while start.elapsed() < timeout {
    if check() {
      return true;
    }
    tokio::time::sleep(poll_interval).await;
  }

  check()
}
