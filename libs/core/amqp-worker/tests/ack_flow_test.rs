//! Acknowledgment flow tests
//!
//! These run the whole worker against the in-memory broker:
//! - the executor hands every task off (202-style) and the test plays the
//!   remote side, resolving correlation IDs the way the callback would
//! - tokio's paused clock drives reconnect backoff and the stale sweep

use amqp_worker::*;
use std::sync::Arc;
use std::time::Duration;
use test_utils::assertions::{assert_all_unique, assert_some};
use test_utils::wait_until;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(60);
const QUEUE: &str = "scan.requests";

struct Fixture {
    broker: InMemoryBroker,
    worker: Arc<AmqpWorker>,
    tasks: mpsc::UnboundedReceiver<Task>,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<Result<(), WorkerError>>,
}

impl Fixture {
    async fn start(config: WorkerConfig) -> Self {
        Self::start_with(InMemoryBroker::new(), config).await
    }

    async fn start_with(broker: InMemoryBroker, config: WorkerConfig) -> Self {
        let (tx, tasks) = mpsc::unbounded_channel();
        let executor = FnExecutor::new("remote", move |task: Task| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(task);
                Submission::Deferred
            }
        });

        let worker = Arc::new(
            AmqpWorker::new(Arc::new(broker.clone()), Arc::new(executor), config).unwrap(),
        );
        let (shutdown, rx) = watch::channel(false);
        let handle = {
            let worker = Arc::clone(&worker);
            tokio::spawn(async move { worker.run(rx).await })
        };

        Self {
            broker,
            worker,
            tasks,
            shutdown,
            handle,
        }
    }

    async fn next_task(&mut self) -> Task {
        let task = tokio::time::timeout(WAIT, self.tasks.recv()).await;
        assert_some(task.ok().flatten(), "expected a task")
    }

    async fn resolve(&self, task: &Task, outcome: Outcome) -> Resolution {
        self.worker
            .resolver()
            .resolve(&task.correlation_id, outcome)
            .await
    }

    async fn stop(self) -> InMemoryBroker {
        self.shutdown.send(true).unwrap();
        self.handle.await.unwrap().unwrap();
        self.broker
    }
}

fn config() -> WorkerConfig {
    WorkerConfig::new(vec![
        ConsumerConfig::new(QUEUE).with_drain_grace(Duration::from_secs(1)),
    ])
}

#[tokio::test(start_paused = true)]
async fn test_success_acks_once_on_receiving_channel() {
    let mut fx = Fixture::start(config()).await;
    fx.broker.enqueue(QUEUE, b"scan 10.0.0.1".to_vec());

    let task = fx.next_task().await;
    let record = assert_some(
        fx.worker.registry().lookup(&task.correlation_id),
        "registered before execution",
    );
    assert_eq!(record.generation, 1);
    assert_eq!(record.queue, QUEUE);

    assert_eq!(fx.resolve(&task, Outcome::Success).await, Resolution::Acked);
    assert_eq!(fx.broker.acked(), vec![b"scan 10.0.0.1".to_vec()]);
    assert!(fx.worker.registry().lookup(&task.correlation_id).is_none());

    fx.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_outcome_after_reconnect_is_dropped() {
    let mut fx = Fixture::start(config()).await;
    fx.broker.enqueue(QUEUE, b"job".to_vec());
    let before = fx.next_task().await;

    fx.broker.disconnect();
    assert!(wait_until(WAIT, || fx.worker.pool().valid_generation() == Some(2)).await);
    let calls = fx.broker.settle_count();

    assert_eq!(
        fx.resolve(&before, Outcome::Success).await,
        Resolution::StaleGeneration
    );
    assert_eq!(fx.broker.settle_count(), calls);
    assert!(fx.worker.registry().lookup(&before.correlation_id).is_none());

    // The broker redelivers on its own, on the new generation
    let after = fx.next_task().await;
    assert_eq!(after.payload, b"job".to_vec());
    assert!(after.is_redelivery());
    assert_ne!(after.correlation_id, before.correlation_id);
    assert_eq!(
        fx.worker
            .registry()
            .lookup(&after.correlation_id)
            .map(|r| r.generation),
        Some(2)
    );
    assert_eq!(fx.resolve(&after, Outcome::Success).await, Resolution::Acked);

    fx.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_unresolved_delivery_is_swept_and_requeued() {
    let interval = Duration::from_secs(60);
    let stale_after = Duration::from_secs(30);
    let config = config().with_monitor(MonitorConfig::new(interval, stale_after));
    let mut fx = Fixture::start(config).await;
    fx.broker.enqueue(QUEUE, b"forgotten".to_vec());

    let task = fx.next_task().await;
    let received = tokio::time::Instant::now();

    assert!(wait_until(WAIT * 2, || !fx.broker.nacked().is_empty()).await);
    assert!(received.elapsed() <= stale_after + interval);
    assert_eq!(fx.broker.nacked(), vec![(b"forgotten".to_vec(), true)]);
    assert!(fx.worker.registry().lookup(&task.correlation_id).is_none());

    // A callback arriving after the sweep changes nothing
    assert_eq!(fx.resolve(&task, Outcome::Success).await, Resolution::Unknown);
    assert!(fx.broker.acked().is_empty());

    let retry = fx.next_task().await;
    assert_eq!(retry.redelivery_count, 1);

    fx.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_unknown_correlation_id_is_a_no_op() {
    let fx = Fixture::start(config()).await;
    assert!(wait_until(WAIT, || fx.worker.pool().is_live()).await);

    let resolution = fx
        .worker
        .resolver()
        .resolve(&CorrelationId::from("unknown-id"), Outcome::Success)
        .await;
    assert_eq!(resolution, Resolution::Unknown);
    assert!(fx.broker.calls().is_empty());

    fx.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_second_resolve_sends_nothing() {
    let mut fx = Fixture::start(config()).await;
    fx.broker.enqueue(QUEUE, b"once".to_vec());
    let task = fx.next_task().await;

    assert_eq!(fx.resolve(&task, Outcome::Success).await, Resolution::Acked);
    assert_eq!(fx.resolve(&task, Outcome::Success).await, Resolution::Unknown);
    assert_eq!(
        fx.resolve(&task, Outcome::PermanentFailure).await,
        Resolution::Unknown
    );
    assert_eq!(fx.broker.settle_count(), 1);

    fx.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_retryable_requeues_and_permanent_dead_letters() {
    let mut fx = Fixture::start(config()).await;
    fx.broker.enqueue(QUEUE, b"flaky".to_vec());

    let first = fx.next_task().await;
    assert_eq!(first.redelivery_count, 0);
    assert_eq!(
        fx.resolve(&first, Outcome::RetryableFailure).await,
        Resolution::Requeued
    );

    let second = fx.next_task().await;
    assert_eq!(second.redelivery_count, 1);
    assert_eq!(
        fx.resolve(&second, Outcome::PermanentFailure).await,
        Resolution::DeadLettered
    );

    assert_eq!(fx.broker.dead_letters(QUEUE), vec![b"flaky".to_vec()]);
    assert_eq!(fx.broker.queue_depth(QUEUE), 0);

    fx.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_broker_down_at_boot_recovers_within_backoff_cap() {
    let broker = InMemoryBroker::new();
    broker.set_available(false);
    broker.enqueue(QUEUE, b"early".to_vec());
    let mut fx = Fixture::start_with(broker, config()).await;

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(!fx.worker.pool().is_live());
    assert!(fx.broker.connect_attempts() > 1);

    fx.broker.set_available(true);
    let recovered = tokio::time::Instant::now();
    let task = fx.next_task().await;
    assert!(recovered.elapsed() <= PoolConfig::default().backoff.max);
    assert_eq!(task.payload, b"early".to_vec());

    fx.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_correlation_ids_are_unique() {
    let mut fx = Fixture::start(config()).await;
    for i in 0..25u8 {
        fx.broker.enqueue(QUEUE, vec![i]);
    }

    let mut ids = Vec::new();
    for _ in 0..25 {
        let task = fx.next_task().await;
        ids.push(task.correlation_id.clone());
        fx.resolve(&task, Outcome::Success).await;
    }
    assert_all_unique(&ids, "correlation ids");
    assert_eq!(fx.broker.acked().len(), 25);

    fx.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_requeues_unresolved_work() {
    let mut fx = Fixture::start(config()).await;
    fx.broker.enqueue(QUEUE, b"a".to_vec());
    fx.broker.enqueue(QUEUE, b"b".to_vec());
    fx.next_task().await;
    fx.next_task().await;

    let broker = fx.stop().await;
    let mut requeued: Vec<_> = broker.nacked().into_iter().map(|(p, _)| p).collect();
    requeued.sort();
    assert_eq!(requeued, vec![b"a".to_vec(), b"b".to_vec()]);
    assert!(broker.nacked().iter().all(|(_, requeue)| *requeue));
    assert_eq!(broker.queue_depth(QUEUE), 2);
    assert_eq!(broker.open_connections(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_redelivery_cap_dead_letters_without_executing() {
    let config = WorkerConfig::new(vec![
        ConsumerConfig::new(QUEUE)
            .with_max_redeliveries(Some(1))
            .with_drain_grace(Duration::from_secs(1)),
    ]);
    let mut fx = Fixture::start(config).await;
    fx.broker.enqueue(QUEUE, b"poison".to_vec());

    for _ in 0..2 {
        let task = fx.next_task().await;
        fx.resolve(&task, Outcome::RetryableFailure).await;
    }

    assert!(wait_until(WAIT, || fx.broker.dead_letters(QUEUE).len() == 1).await);
    assert!(fx.tasks.try_recv().is_err());

    fx.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_publisher_feeds_consumer() {
    let mut fx = Fixture::start(config()).await;
    assert!(wait_until(WAIT, || fx.worker.pool().is_live()).await);

    fx.worker
        .publisher()
        .publish_json("", QUEUE, &serde_json::json!({"target": "10.0.0.9"}))
        .await
        .unwrap();

    let task = fx.next_task().await;
    let body: serde_json::Value = serde_json::from_slice(&task.payload).unwrap();
    assert_eq!(body["target"], "10.0.0.9");
    fx.resolve(&task, Outcome::Success).await;

    fx.stop().await;
}
