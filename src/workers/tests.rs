//! Worker loop tests against the scripted mock bus.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::watch;
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

use super::*;
use crate::bus::{MockBus, MockMessage, MockStep};
use crate::config::ConsumerSettings;
use crate::subjects::{Domain, SubjectSpace};

const CONSUMER: &str = "entity-processor";

/// Handler whose outcome is decided by the message subject.
struct ScriptedHandler;

impl MessageHandler for ScriptedHandler {
    fn handle(&self, message: InboundMessage) -> BoxFuture<'static, Result<(), HandlerError>> {
        Box::pin(async move {
            if message.subject.ends_with(".fail") {
                Err(HandlerError::Failed("scripted failure".into()))
            } else if message.subject.ends_with(".panic") {
                panic!("scripted panic");
            } else if message.subject.ends_with(".malformed") {
                Err(HandlerError::Malformed("not json".into()))
            } else {
                Ok(())
            }
        })
    }
}

/// Handler that requests cancellation while handling its first message.
struct CancellingHandler {
    cancel: watch::Sender<bool>,
}

impl MessageHandler for CancellingHandler {
    fn handle(&self, _message: InboundMessage) -> BoxFuture<'static, Result<(), HandlerError>> {
        self.cancel.send_replace(true);
        Box::pin(async { Ok(()) })
    }
}

/// Counts ERROR-level events.
#[derive(Clone, Default)]
struct ErrorCounter(Arc<AtomicUsize>);

impl ErrorCounter {
    fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

impl<S: tracing::Subscriber> Layer<S> for ErrorCounter {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() == tracing::Level::ERROR {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Install a thread-local subscriber counting errors. Tests run on the
/// current-thread runtime, so spawned workers report to it too.
fn count_errors() -> (ErrorCounter, tracing::subscriber::DefaultGuard) {
    let counter = ErrorCounter::default();
    let subscriber = tracing_subscriber::registry().with(counter.clone());
    let guard = tracing::subscriber::set_default(subscriber);
    (counter, guard)
}

fn settings() -> WorkerConfig {
    WorkerConfig {
        batch_size: 10,
        fetch_wait_ms: 20,
        backoff_min_ms: 5,
        backoff_max_ms: 20,
    }
}

fn worker(bus: &MockBus, handler: Arc<dyn MessageHandler>) -> Worker<MockBus> {
    Worker::new(
        "EntityWorker",
        ConsumerDefinition::for_domain(
            Domain::Entities,
            &SubjectSpace::default(),
            &ConsumerSettings::default(),
        ),
        Arc::new(bus.clone()),
        handler,
        settings(),
    )
}

fn batch(subjects: &[&str]) -> MockStep {
    MockStep::Batch(
        subjects
            .iter()
            .map(|s| MockMessage::new(*s, "{}"))
            .collect(),
    )
}

/// Run the worker until the script is consumed, then cancel it.
async fn run_script(bus: &MockBus, handler: Arc<dyn MessageHandler>) -> Worker<MockBus> {
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let mut worker = worker(bus, handler);

    let task = tokio::spawn(async move {
        let result = worker.start(cancel_rx).await;
        (worker, result)
    });

    tokio::time::sleep(Duration::from_millis(150)).await;
    cancel_tx.send_replace(true);

    let (worker, result) = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("worker did not stop")
        .unwrap();
    assert!(matches!(result, Err(WorkerError::Cancelled)));
    worker
}

#[tokio::test]
async fn test_failure_in_batch_does_not_block_others() {
    let bus = MockBus::new();
    bus.push(
        CONSUMER,
        batch(&["entities.org1.a", "entities.org1.fail", "entities.org1.c"]),
    )
    .await;

    run_script(&bus, Arc::new(ScriptedHandler)).await;

    assert_eq!(bus.acked().await, vec!["entities.org1.a", "entities.org1.c"]);
    assert_eq!(bus.naked().await, vec!["entities.org1.fail"]);
}

#[tokio::test]
async fn test_handler_panic_is_contained() {
    let bus = MockBus::new();
    bus.push(
        CONSUMER,
        batch(&["entities.org1.panic", "entities.org1.ok"]),
    )
    .await;

    run_script(&bus, Arc::new(ScriptedHandler)).await;

    assert_eq!(bus.acked().await, vec!["entities.org1.ok"]);
    assert_eq!(bus.naked().await, vec!["entities.org1.panic"]);
}

#[tokio::test]
async fn test_malformed_payload_is_acknowledged() {
    let bus = MockBus::new();
    bus.push(CONSUMER, batch(&["entities.org1.malformed"])).await;

    run_script(&bus, Arc::new(ScriptedHandler)).await;

    assert_eq!(bus.acked().await, vec!["entities.org1.malformed"]);
    assert!(bus.naked().await.is_empty());
}

#[tokio::test]
async fn test_timeouts_keep_looping() {
    let (errors, _guard) = count_errors();
    let bus = MockBus::new();
    for _ in 0..3 {
        bus.push(CONSUMER, MockStep::Timeout).await;
    }
    bus.push(CONSUMER, batch(&["entities.org1.late"])).await;

    run_script(&bus, Arc::new(ScriptedHandler)).await;

    assert!(bus.fetch_count(CONSUMER).await >= 4);
    assert_eq!(bus.acked().await, vec!["entities.org1.late"]);
    assert_eq!(errors.count(), 0);
}

#[tokio::test]
async fn test_fetch_errors_are_retried() {
    let (errors, _guard) = count_errors();
    let bus = MockBus::new();
    bus.push(CONSUMER, MockStep::Broker("stream offline".into())).await;
    bus.push(CONSUMER, MockStep::Transient("disconnected".into())).await;
    bus.push(CONSUMER, batch(&["entities.org1.after"])).await;

    run_script(&bus, Arc::new(ScriptedHandler)).await;

    assert_eq!(bus.acked().await, vec!["entities.org1.after"]);
    // Only the broker rejection is an error; the disconnect is a warning.
    assert_eq!(errors.count(), 1);
}

#[tokio::test]
async fn test_ack_failures_do_not_stop_the_loop() {
    let bus = MockBus::new();
    bus.set_fail_acks(true).await;
    bus.push(CONSUMER, batch(&["entities.org1.a"])).await;
    bus.push(CONSUMER, batch(&["entities.org1.b"])).await;

    run_script(&bus, Arc::new(ScriptedHandler)).await;

    assert!(bus.fetch_count(CONSUMER).await >= 3);
    assert!(bus.acked().await.is_empty());
}

#[tokio::test]
async fn test_cancel_observed_within_fetch_interval() {
    let bus = MockBus::new();
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let mut worker = worker(&bus, Arc::new(ScriptedHandler));
    let mut states = worker.watch_state();

    let task = tokio::spawn(async move {
        let result = worker.start(cancel_rx).await;
        (worker, result)
    });

    states
        .wait_for(|s| *s == WorkerState::Running)
        .await
        .unwrap();
    cancel_tx.send_replace(true);

    // Idle fetch waits 20ms; allow generous slack.
    let (worker, result) = tokio::time::timeout(Duration::from_millis(500), task)
        .await
        .expect("cancellation not observed")
        .unwrap();
    assert!(matches!(result, Err(WorkerError::Cancelled)));
    assert_eq!(worker.state(), WorkerState::Stopped);
}

#[tokio::test]
async fn test_cancel_mid_batch_leaves_rest_unacknowledged() {
    let bus = MockBus::new();
    bus.push(
        CONSUMER,
        batch(&["entities.org1.a", "entities.org1.b", "entities.org1.c"]),
    )
    .await;

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let handler = Arc::new(CancellingHandler {
        cancel: cancel_tx.clone(),
    });
    let mut worker = worker(&bus, handler);

    let result = tokio::time::timeout(Duration::from_secs(1), worker.start(cancel_rx))
        .await
        .unwrap();

    assert!(matches!(result, Err(WorkerError::Cancelled)));
    assert_eq!(bus.acked().await, vec!["entities.org1.a"]);
    assert!(bus.naked().await.is_empty());
    drop(cancel_tx);
}

#[tokio::test]
async fn test_bind_failure() {
    let bus = MockBus::new();
    bus.set_fail_bind(true).await;
    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let mut worker = worker(&bus, Arc::new(ScriptedHandler));

    let result = worker.start(cancel_rx).await;
    assert!(matches!(result, Err(WorkerError::Bind { .. })));
    assert_eq!(worker.state(), WorkerState::Stopped);
}

#[tokio::test]
async fn test_start_twice_rejected() {
    let bus = MockBus::new();
    let mut worker = run_script(&bus, Arc::new(ScriptedHandler)).await;

    let (_cancel_tx, cancel_rx) = watch::channel(false);
    assert!(matches!(
        worker.start(cancel_rx).await,
        Err(WorkerError::AlreadyStarted(_))
    ));
}

#[tokio::test]
async fn test_stop_drains_source() {
    let bus = MockBus::new();
    let mut worker = run_script(&bus, Arc::new(ScriptedHandler)).await;

    worker.stop().await.unwrap();
    assert_eq!(bus.drained().await, vec![CONSUMER]);

    // Second stop is a no-op.
    worker.stop().await.unwrap();
    assert_eq!(bus.drained().await.len(), 1);
}

#[test]
fn test_state_display() {
    assert_eq!(WorkerState::Running.to_string(), "running");
    assert_eq!(WorkerState::Stopped.to_string(), "stopped");
}
