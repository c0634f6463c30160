//! Actor lifecycle, ordering and fault isolation tests.

#[cfg(test)]
mod tests {
  use std::{
    sync::{
      Arc,
      atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
  };

  use parking_lot::Mutex;
  use pretty_assertions::assert_eq;
  use streams::Stream;
  use tokio_util::sync::CancellationToken;

  use crate::{
    __tests__::helpers::{CounterActor, ErrorLog, TestEvent, wait_for},
    actor::{Actor, ActorError, ActorOptions, ActorState, Handler},
  };

  // ==========================================================================
  // Basic Functionality
  // ==========================================================================

  #[tokio::test]
  async fn test_greeting_round_trip() {
    let counter = CounterActor::new(
      ActorOptions::default()
        .with_inbox_capacity(10)
        .with_outbox_capacity(20)
        .with_grace_period(Duration::from_secs(3)),
    );
    let root = CancellationToken::new();
    counter.actor.start(&root).unwrap();

    counter
      .actor
      .send(TestEvent {
        id: "msg-1".into(),
        kind: "greeting".into(),
        content: "hello".into(),
      })
      .await
      .unwrap();

    let response = counter.actor.receive_from_outbox().await.unwrap();
    assert_eq!(response.kind, "greeting-response");
    assert_eq!(response.id, "response-msg-1");
    assert_eq!(response.content, "greeting #1: hello");
    assert_eq!(counter.count(), 1);

    counter.actor.send(TestEvent::new("reset")).await.unwrap();
    let response = counter.actor.receive_from_outbox().await.unwrap();
    assert_eq!(response.kind, "reset-response");
    assert_eq!(counter.count(), 0);

    counter.actor.stop().await;
    assert!(counter.actor.is_stopped());
  }

  #[tokio::test]
  async fn test_concurrent_greetings_all_processed() {
    let counter = CounterActor::new(ActorOptions::default().with_inbox_capacity(10));
    let root = CancellationToken::new();
    counter.actor.start(&root).unwrap();

    let senders: Vec<_> = (0..100)
      .map(|i| {
        let actor = counter.actor.clone();
        tokio::spawn(async move {
          actor
            .send(TestEvent::with_content("greeting", &format!("hello {i}")))
            .await
        })
      })
      .collect();

    let mut responses = 0;
    while responses < 100 {
      let response = counter
        .actor
        .receive_from_outbox_with_timeout(Duration::from_secs(5))
        .await
        .unwrap();
      assert_eq!(response.kind, "greeting-response");
      responses += 1;
    }

    for sender in senders {
      sender.await.unwrap().unwrap();
    }
    assert_eq!(counter.count(), 100);
    assert!(matches!(
      counter
        .actor
        .receive_from_outbox_with_timeout(Duration::from_millis(50))
        .await,
      Err(ActorError::Timeout)
    ));

    counter.actor.stop().await;
  }

  #[tokio::test]
  async fn test_messages_processed_in_arrival_order() {
    let actor = Actor::new("ordered", ActorOptions::default().with_inbox_capacity(4));
    let seen = Arc::new(Mutex::new(Vec::new()));

    let log = seen.clone();
    actor
      .register_handler("item", move |_ctx, msg: TestEvent| {
        let log = log.clone();
        async move {
          // Yield so a concurrent handler would interleave if one existed
          tokio::task::yield_now().await;
          log.lock().push(msg.content);
          Ok(())
        }
      })
      .unwrap();

    let root = CancellationToken::new();
    actor.start(&root).unwrap();

    let expected: Vec<String> = (0..50).map(|i| i.to_string()).collect();
    for content in &expected {
      actor.send(TestEvent::with_content("item", content)).await.unwrap();
    }

    assert!(wait_for(Duration::from_secs(5), || seen.lock().len() == 50).await);
    assert_eq!(*seen.lock(), expected);
    actor.stop().await;
  }

  // ==========================================================================
  // Lifecycle
  // ==========================================================================

  #[tokio::test]
  async fn test_send_outside_running_window() {
    let actor: Actor<TestEvent> = Actor::new("lifecycle", ActorOptions::default());
    assert_eq!(actor.state(), ActorState::NotStarted);
    assert!(matches!(actor.send(TestEvent::new("x")).await, Err(ActorError::NotStarted)));
    assert!(matches!(actor.receive_from_outbox().await, Err(ActorError::NotStarted)));

    let root = CancellationToken::new();
    actor.start(&root).unwrap();
    // Second start is a no-op
    actor.start(&root).unwrap();
    assert_eq!(actor.state(), ActorState::Running);

    actor.stop().await;
    actor.stop().await;
    assert_eq!(actor.state(), ActorState::Stopped);
    assert!(matches!(actor.send(TestEvent::new("x")).await, Err(ActorError::Stopped)));
    assert!(matches!(
      actor.publish_to_outbox(TestEvent::new("x")).await,
      Err(ActorError::Stopped)
    ));
    assert!(matches!(actor.start(&root), Err(ActorError::Stopped)));
  }

  #[tokio::test]
  async fn test_parent_cancel_stops_actor() {
    let actor: Actor<TestEvent> = Actor::new("child", ActorOptions::default());
    let root = CancellationToken::new();
    actor.start(&root).unwrap();

    root.cancel();

    assert!(actor.is_stopped());
    assert!(matches!(actor.send(TestEvent::new("x")).await, Err(ActorError::Stopped)));
  }

  #[tokio::test]
  async fn test_stop_returns_after_grace_period() {
    let actor = Actor::new("slow", ActorOptions::default().with_grace_period(Duration::from_millis(50)));
    let started = Arc::new(AtomicUsize::new(0));

    let flag = started.clone();
    actor
      .register_handler("slow", move |_ctx, _msg: TestEvent| {
        let flag = flag.clone();
        async move {
          flag.store(1, Ordering::SeqCst);
          tokio::time::sleep(Duration::from_secs(30)).await;
          Ok(())
        }
      })
      .unwrap();

    let root = CancellationToken::new();
    actor.start(&root).unwrap();
    actor.send(TestEvent::new("slow")).await.unwrap();
    assert!(wait_for(Duration::from_secs(2), || started.load(Ordering::SeqCst) == 1).await);

    let begin = std::time::Instant::now();
    actor.stop().await;
    assert!(begin.elapsed() < Duration::from_secs(5));
    assert!(actor.is_stopped());
  }

  #[tokio::test]
  async fn test_stop_from_own_handler_returns_immediately() {
    let actor = Actor::new("self-stop", ActorOptions::default().with_grace_period(Duration::from_secs(5)));
    let stop_took = Arc::new(Mutex::new(None));

    let took = stop_took.clone();
    actor
      .register_handler("quit", move |ctx, _msg: TestEvent| {
        let took = took.clone();
        async move {
          let begin = std::time::Instant::now();
          ctx.actor().stop().await;
          *took.lock() = Some(begin.elapsed());
          Ok(())
        }
      })
      .unwrap();

    let root = CancellationToken::new();
    actor.start(&root).unwrap();
    actor.send(TestEvent::new("quit")).await.unwrap();

    assert!(wait_for(Duration::from_secs(2), || stop_took.lock().is_some()).await);
    let elapsed = stop_took.lock().expect("handler recorded stop time");
    assert!(elapsed < Duration::from_secs(1), "stop waited {elapsed:?}");
    assert!(actor.is_stopped());

    // An outside caller after the fact is a no-op
    actor.stop().await;
    assert_eq!(actor.state(), ActorState::Stopped);
  }

  // ==========================================================================
  // Errors And Fault Isolation
  // ==========================================================================

  #[tokio::test]
  async fn test_unknown_type_reported_once_and_dropped() {
    let errors = ErrorLog::default();
    let log = errors.clone();
    let counter = CounterActor::new(ActorOptions::default().with_error_handler(move |e| log.record(e)));

    let root = CancellationToken::new();
    counter.actor.start(&root).unwrap();

    counter.actor.send(TestEvent::new("unknown")).await.unwrap();
    counter.actor.send(TestEvent::new("greeting")).await.unwrap();

    // The greeting is processed after the unknown message, so the outbox
    // holds only its response
    let response = counter.actor.receive_from_outbox().await.unwrap();
    assert_eq!(response.kind, "greeting-response");
    assert_eq!(errors.entries(), vec!["event handler not found: unknown".to_string()]);

    counter.actor.stop().await;
  }

  #[tokio::test]
  async fn test_duplicate_handler_rejected() {
    let counter = CounterActor::new(ActorOptions::default());
    let err = counter
      .actor
      .register_handler("greeting", |_ctx, _msg: TestEvent| async { Ok(()) })
      .unwrap_err();
    assert!(matches!(err, ActorError::DuplicateHandler(t) if t == "greeting"));
  }

  #[tokio::test]
  async fn test_panicking_handler_does_not_kill_worker() {
    let errors = ErrorLog::default();
    let log = errors.clone();
    let actor = Actor::new("panicky", ActorOptions::default().with_error_handler(move |e| log.record(e)));

    actor
      .register_handler("boom", |_ctx, _msg: TestEvent| async { panic!("kaboom") })
      .unwrap();
    actor
      .register_handler("echo", |ctx, msg: TestEvent| async move {
        ctx.publish(msg).await?;
        Ok(())
      })
      .unwrap();

    let root = CancellationToken::new();
    actor.start(&root).unwrap();

    actor.send(TestEvent::new("boom")).await.unwrap();
    actor.send(TestEvent::with_content("echo", "still alive")).await.unwrap();

    let echoed = actor.receive_from_outbox().await.unwrap();
    assert_eq!(echoed.content, "still alive");
    let entries = errors.entries();
    assert_eq!(entries.len(), 1);
    assert!(entries[0].contains("kaboom"), "{entries:?}");

    actor.stop().await;
  }

  #[tokio::test]
  async fn test_handler_error_reaches_callback() {
    let errors = ErrorLog::default();
    let log = errors.clone();
    let actor = Actor::new("failing", ActorOptions::default().with_error_handler(move |e| log.record(e)));
    actor
      .register_handler("fail", |_ctx, _msg: TestEvent| async { Err(anyhow::anyhow!("nope")) })
      .unwrap();

    let root = CancellationToken::new();
    actor.start(&root).unwrap();
    actor.send(TestEvent::new("fail")).await.unwrap();

    assert!(wait_for(Duration::from_secs(2), || !errors.entries().is_empty()).await);
    assert_eq!(errors.entries(), vec!["handler for fail failed: nope".to_string()]);
    actor.stop().await;
  }

  // ==========================================================================
  // Middleware
  // ==========================================================================

  #[tokio::test]
  async fn test_middleware_wraps_in_registration_order() {
    let trace = Arc::new(Mutex::new(Vec::new()));

    let layer = |name: &'static str, trace: Arc<Mutex<Vec<String>>>| {
      move |next: Handler<TestEvent>| -> Handler<TestEvent> {
        let trace = trace.clone();
        crate::actor::handler(move |ctx, msg: TestEvent| {
          let next = next.clone();
          let trace = trace.clone();
          async move {
            trace.lock().push(format!("{name}:before"));
            let result = next(ctx, msg).await;
            trace.lock().push(format!("{name}:after"));
            result
          }
        })
      }
    };

    let options = ActorOptions::default()
      .with_middleware(layer("outer", trace.clone()))
      .with_middleware(layer("inner", trace.clone()));
    let actor = Actor::new("layered", options);

    let inner_trace = trace.clone();
    actor
      .register_handler("work", move |_ctx, _msg: TestEvent| {
        let trace = inner_trace.clone();
        async move {
          trace.lock().push("handler".to_string());
          Ok(())
        }
      })
      .unwrap();

    let root = CancellationToken::new();
    actor.start(&root).unwrap();
    actor.send(TestEvent::new("work")).await.unwrap();

    assert!(wait_for(Duration::from_secs(2), || trace.lock().len() == 5).await);
    assert_eq!(
      *trace.lock(),
      vec!["outer:before", "inner:before", "handler", "inner:after", "outer:after"]
    );
    actor.stop().await;
  }

  // ==========================================================================
  // Capacity And Custom Streams
  // ==========================================================================

  #[tokio::test]
  async fn test_try_send_reports_busy() {
    let actor = Actor::new("busy", ActorOptions::default().with_inbox_capacity(1));
    let release = CancellationToken::new();

    let gate = release.clone();
    actor
      .register_handler("block", move |_ctx, _msg: TestEvent| {
        let gate = gate.clone();
        async move {
          gate.cancelled().await;
          Ok(())
        }
      })
      .unwrap();

    let root = CancellationToken::new();
    actor.start(&root).unwrap();

    // First message occupies the worker, second fills the inbox
    actor.send(TestEvent::new("block")).await.unwrap();
    assert!(
      wait_for(Duration::from_secs(2), || actor.try_send(TestEvent::new("block")).is_ok()).await
    );
    assert!(matches!(actor.try_send(TestEvent::new("block")), Err(ActorError::Busy)));
    assert!(matches!(
      actor
        .send_with_timeout(TestEvent::new("block"), Duration::from_millis(20))
        .await,
      Err(ActorError::Timeout)
    ));

    release.cancel();
    actor.stop().await;
  }

  #[tokio::test]
  async fn test_try_publish_reports_outbox_busy() {
    let actor: Actor<TestEvent> = Actor::new("outbox", ActorOptions::default().with_outbox_capacity(1));
    let root = CancellationToken::new();
    actor.start(&root).unwrap();

    actor.try_publish_to_outbox(TestEvent::new("a")).unwrap();
    assert!(matches!(
      actor.try_publish_to_outbox(TestEvent::new("b")),
      Err(ActorError::OutboxBusy)
    ));
    actor.stop().await;
  }

  #[tokio::test]
  async fn test_custom_streams_survive_stop() {
    let owner = CancellationToken::new();
    let inbox = Stream::new(&owner, 8);
    let outbox = Stream::new(&owner, 8);

    let actor = Actor::new(
      "custom",
      ActorOptions::default().with_inbox(inbox.clone()).with_outbox(outbox.clone()),
    );
    actor
      .register_handler("echo", |ctx, msg: TestEvent| async move {
        ctx.publish(msg).await?;
        Ok(())
      })
      .unwrap();

    let root = CancellationToken::new();
    actor.start(&root).unwrap();

    inbox.send(TestEvent::with_content("echo", "via custom inbox")).await.unwrap();
    let echoed = outbox.recv().await.unwrap().unwrap();
    assert_eq!(echoed.content, "via custom inbox");

    actor.stop().await;

    // The caller still owns both streams
    assert!(!inbox.is_closed());
    assert!(!outbox.is_closed());
    owner.cancel();
    assert!(inbox.is_closed());
  }
}
