//! Event bus fan-out, lifecycle and shutdown tests.

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
  use tokio_util::sync::CancellationToken;

  use crate::{
    __tests__::helpers::{TestEvent, wait_for},
    bus::{BusError, BusOptions, EventBus},
    telemetry::{CountingMetrics, LoggingTracer},
  };

  fn counting_handler(
    counter: &Arc<AtomicUsize>,
  ) -> impl Fn(TestEvent) -> futures::future::Ready<anyhow::Result<()>> + Send + Sync + 'static {
    let counter = counter.clone();
    move |_event| {
      counter.fetch_add(1, Ordering::SeqCst);
      futures::future::ready(Ok(()))
    }
  }

  fn started_bus(options: BusOptions<TestEvent>) -> (EventBus<TestEvent>, CancellationToken) {
    let root = CancellationToken::new();
    let bus = EventBus::new(options);
    bus.start(&root).unwrap();
    (bus, root)
  }

  // ==========================================================================
  // Delivery
  // ==========================================================================

  #[tokio::test]
  async fn test_basic_publish_subscribe() {
    let (bus, _root) = started_bus(BusOptions::default());
    let received = Arc::new(Mutex::new(Vec::new()));

    let log = received.clone();
    bus
      .subscribe("greeting", move |event: TestEvent| {
        let log = log.clone();
        async move {
          log.lock().push(event.content);
          Ok(())
        }
      })
      .unwrap();

    bus
      .publish(TestEvent::with_content("greeting", "hello bus"))
      .await
      .unwrap();

    assert!(wait_for(Duration::from_secs(2), || received.lock().len() == 1).await);
    assert_eq!(*received.lock(), vec!["hello bus".to_string()]);
    bus.stop(Duration::from_secs(1)).await.unwrap();
  }

  #[tokio::test]
  async fn test_exact_and_wildcard_each_called_once() {
    let (bus, _root) = started_bus(BusOptions::default());
    let first = Arc::new(AtomicUsize::new(0));
    let second = Arc::new(AtomicUsize::new(0));
    let wildcard = Arc::new(AtomicUsize::new(0));

    bus.subscribe("A", counting_handler(&first)).unwrap();
    bus.subscribe("A", counting_handler(&second)).unwrap();
    bus.subscribe("*", counting_handler(&wildcard)).unwrap();

    bus.publish(TestEvent::new("A")).await.unwrap();
    bus.stop(Duration::from_secs(1)).await.unwrap();

    assert_eq!(first.load(Ordering::SeqCst), 1);
    assert_eq!(second.load(Ordering::SeqCst), 1);
    assert_eq!(wildcard.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_multiple_event_types_routed_separately() {
    let (bus, _root) = started_bus(BusOptions::default());
    let a = Arc::new(AtomicUsize::new(0));
    let b = Arc::new(AtomicUsize::new(0));
    let all = Arc::new(AtomicUsize::new(0));

    bus.subscribe("A", counting_handler(&a)).unwrap();
    bus.subscribe("B", counting_handler(&b)).unwrap();
    bus.subscribe("*", counting_handler(&all)).unwrap();

    for _ in 0..3 {
      bus.publish(TestEvent::new("A")).await.unwrap();
    }
    for _ in 0..2 {
      bus.publish(TestEvent::new("B")).await.unwrap();
    }
    bus.publish(TestEvent::new("C")).await.unwrap();
    bus.stop(Duration::from_secs(1)).await.unwrap();

    assert_eq!(a.load(Ordering::SeqCst), 3);
    assert_eq!(b.load(Ordering::SeqCst), 2);
    assert_eq!(all.load(Ordering::SeqCst), 6);
  }

  #[tokio::test]
  async fn test_concurrent_publish_all_delivered() {
    let metrics = Arc::new(CountingMetrics::default());
    let (bus, _root) = started_bus(
      BusOptions::default()
        .with_buffer_size(16)
        .with_worker_count(4)
        .with_metrics(metrics.clone())
        .with_tracer(Arc::new(LoggingTracer)),
    );
    let delivered = Arc::new(AtomicUsize::new(0));
    bus.subscribe("tick", counting_handler(&delivered)).unwrap();

    let publishers: Vec<_> = (0..10)
      .map(|_| {
        let bus = bus.clone();
        tokio::spawn(async move {
          for _ in 0..20 {
            bus.publish(TestEvent::new("tick")).await?;
          }
          Ok::<_, BusError>(())
        })
      })
      .collect();
    for publisher in publishers {
      publisher.await.unwrap().unwrap();
    }

    bus.stop(Duration::from_secs(2)).await.unwrap();

    assert_eq!(delivered.load(Ordering::SeqCst), 200);
    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.published, 200);
    assert_eq!(snapshot.processed, 200);
    assert_eq!(snapshot.errors, 0);
  }

  #[tokio::test]
  async fn test_unsubscribe_stops_delivery() {
    let (bus, _root) = started_bus(BusOptions::default().with_worker_count(1));
    let counter = Arc::new(AtomicUsize::new(0));
    let id = bus.subscribe("A", counting_handler(&counter)).unwrap();

    bus.publish(TestEvent::new("A")).await.unwrap();
    assert!(wait_for(Duration::from_secs(2), || counter.load(Ordering::SeqCst) == 1).await);

    bus.unsubscribe(&id).unwrap();
    bus.publish(TestEvent::new("A")).await.unwrap();
    bus.stop(Duration::from_secs(1)).await.unwrap();

    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert!(matches!(bus.unsubscribe(&id), Err(BusError::SubscriptionNotFound(_))));
  }

  // ==========================================================================
  // Errors
  // ==========================================================================

  #[tokio::test]
  async fn test_handler_errors_reported_and_siblings_run() {
    let reported = Arc::new(Mutex::new(Vec::new()));
    let log = reported.clone();
    let metrics = Arc::new(CountingMetrics::default());
    let (bus, _root) = started_bus(
      BusOptions::default()
        .with_metrics(metrics.clone())
        .with_error_handler(move |e| log.lock().push(e.to_string())),
    );

    let ran = Arc::new(AtomicUsize::new(0));
    bus
      .subscribe("A", |_event: TestEvent| async { Err(anyhow::anyhow!("handler one broke")) })
      .unwrap();
    bus.subscribe("A", counting_handler(&ran)).unwrap();

    bus.publish(TestEvent::new("A")).await.unwrap();
    bus.stop(Duration::from_secs(1)).await.unwrap();

    assert_eq!(ran.load(Ordering::SeqCst), 1);
    let reported = reported.lock();
    assert_eq!(reported.len(), 1);
    assert!(reported[0].contains("handler one broke"), "{reported:?}");
    assert_eq!(metrics.snapshot().errors, 1);
  }

  #[tokio::test]
  async fn test_empty_event_type_rejected() {
    let bus: EventBus<TestEvent> = EventBus::new(BusOptions::default());
    let counter = Arc::new(AtomicUsize::new(0));
    assert!(matches!(
      bus.subscribe("", counting_handler(&counter)),
      Err(BusError::InvalidEventType)
    ));
  }

  // ==========================================================================
  // Lifecycle
  // ==========================================================================

  #[tokio::test]
  async fn test_publish_outside_running_window() {
    let bus: EventBus<TestEvent> = EventBus::new(BusOptions::default());
    assert!(matches!(bus.publish(TestEvent::new("A")).await, Err(BusError::NotStarted)));
    assert!(!bus.is_running());
    // Never started: wait returns at once
    bus.wait().await;

    let root = CancellationToken::new();
    bus.start(&root).unwrap();
    bus.start(&root).unwrap();
    assert!(bus.is_running());

    bus.stop(Duration::from_secs(1)).await.unwrap();
    bus.stop(Duration::from_secs(1)).await.unwrap();
    assert!(!bus.is_running());
    assert!(matches!(bus.publish(TestEvent::new("A")).await, Err(BusError::Stopped)));
    assert!(matches!(
      bus
        .publish_with_timeout(TestEvent::new("A"), Duration::from_millis(10))
        .await,
      Err(BusError::Stopped)
    ));
    assert!(matches!(bus.start(&root), Err(BusError::Stopped)));
  }

  #[tokio::test]
  async fn test_stop_drains_buffered_events() {
    let (bus, _root) = started_bus(BusOptions::default().with_worker_count(1));
    let counter = Arc::new(AtomicUsize::new(0));

    let slow = counter.clone();
    bus
      .subscribe("A", move |_event: TestEvent| {
        let slow = slow.clone();
        async move {
          tokio::time::sleep(Duration::from_millis(5)).await;
          slow.fetch_add(1, Ordering::SeqCst);
          Ok(())
        }
      })
      .unwrap();

    for _ in 0..10 {
      bus.publish(TestEvent::new("A")).await.unwrap();
    }
    bus.stop(Duration::from_secs(2)).await.unwrap();

    assert_eq!(counter.load(Ordering::SeqCst), 10);
  }

  #[tokio::test]
  async fn test_stop_times_out_on_stuck_handler() {
    let (bus, _root) = started_bus(BusOptions::default().with_worker_count(1));
    let entered = Arc::new(AtomicUsize::new(0));

    let flag = entered.clone();
    bus
      .subscribe("stuck", move |_event: TestEvent| {
        let flag = flag.clone();
        async move {
          flag.store(1, Ordering::SeqCst);
          tokio::time::sleep(Duration::from_secs(30)).await;
          Ok(())
        }
      })
      .unwrap();

    bus.publish(TestEvent::new("stuck")).await.unwrap();
    assert!(wait_for(Duration::from_secs(2), || entered.load(Ordering::SeqCst) == 1).await);

    let result = bus.stop(Duration::from_millis(50)).await;
    assert!(matches!(result, Err(BusError::ShutdownTimeout(_))));
    assert!(!bus.is_running());
  }

  #[tokio::test]
  async fn test_parent_cancel_ends_workers() {
    let (bus, root) = started_bus(BusOptions::default().with_worker_count(3));

    root.cancel();

    tokio::time::timeout(Duration::from_secs(2), bus.wait())
      .await
      .expect("workers exit after parent cancel");
    assert!(!bus.is_running());
  }
}
