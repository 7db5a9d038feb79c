//! Queue consumer
//!
//! One consumer per queue. Every delivery is registered before it reaches
//! the executor, so the registry always knows about work in progress.
//!
//! ```text
//! Stopped ──> Starting ──> Running ──> Draining ──> Stopped
//!                ^            │
//!                └────────────┘  stream ended / stream error / new generation
//! ```

use crate::config::ConsumerConfig;
use crate::delivery::{IncomingDelivery, Outcome, Task};
use crate::error::WorkerError;
use crate::executor::{Submission, TaskExecutor};
use crate::metrics::{self, QueueMetrics};
use crate::pool::{AcquireMode, ChannelLease, ChannelPool};
use crate::registry::NewDelivery;
use crate::resolver::AckResolver;
use crate::transport::DeliveryStream;
use chrono::Utc;
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use strum::{AsRefStr, Display};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

const RETRY_DELAY: Duration = Duration::from_secs(1);
const DRAIN_POLL: Duration = Duration::from_millis(100);

/// Lifecycle of a queue consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[derive(Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ConsumerState {
    Stopped,
    /// Acquiring a channel, `basic.qos`, `basic.consume`
    Starting,
    /// Receiving deliveries
    Running,
    /// Subscription cancelled, waiting for in-flight work
    Draining,
}

/// Consumes one queue and feeds the executor.
pub struct QueueConsumer {
    config: ConsumerConfig,
    pool: ChannelPool,
    resolver: AckResolver,
    executor: Arc<dyn TaskExecutor>,
    semaphore: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    state_tx: watch::Sender<ConsumerState>,
    metrics: QueueMetrics,
}

impl QueueConsumer {
    pub fn new(
        config: ConsumerConfig,
        pool: ChannelPool,
        resolver: AckResolver,
        executor: Arc<dyn TaskExecutor>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConsumerState::Stopped);
        Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_tasks)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            metrics: QueueMetrics::new(&config.queue),
            config,
            pool,
            resolver,
            executor,
            state_tx,
        }
    }

    pub fn queue(&self) -> &str {
        &self.config.queue
    }

    pub fn state(&self) -> ConsumerState {
        *self.state_tx.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn subscribe_state(&self) -> watch::Receiver<ConsumerState> {
        self.state_tx.subscribe()
    }

    /// Consume until shutdown is signalled (or the sender is dropped), then drain.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            queue = %self.config.queue,
            consumer_tag = %self.config.consumer_tag,
            executor = self.executor.name(),
            prefetch = self.config.prefetch,
            max_concurrent_tasks = self.config.max_concurrent_tasks,
            "Starting queue consumer"
        );

        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut generation_rx = self.pool.subscribe_generation();

        'consume: loop {
            if *shutdown.borrow() {
                self.drain(None, &mut tasks).await;
                break;
            }
            self.set_state(ConsumerState::Starting);

            let subscription = tokio::select! {
                result = self.subscribe() => result,
                _ = shutdown_requested(&mut shutdown) => {
                    self.drain(None, &mut tasks).await;
                    break 'consume;
                }
            };

            let (lease, mut stream) = match subscription {
                Ok(subscription) => subscription,
                Err(WorkerError::Shutdown) => {
                    self.drain(None, &mut tasks).await;
                    break;
                }
                Err(WorkerError::AcquireTimeout(timeout)) => {
                    debug!(queue = %self.config.queue, ?timeout, "No channel yet, still waiting");
                    continue;
                }
                Err(e) => {
                    warn!(queue = %self.config.queue, error = %e, "Failed to subscribe, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(RETRY_DELAY) => continue,
                        _ = shutdown_requested(&mut shutdown) => {
                            self.drain(None, &mut tasks).await;
                            break 'consume;
                        }
                    }
                }
            };

            let generation = lease.generation();
            generation_rx.borrow_and_update();
            self.set_state(ConsumerState::Running);
            self.metrics.subscribed(generation);
            info!(
                queue = %self.config.queue,
                generation,
                channel_id = lease.channel_id(),
                "Consumer subscribed"
            );

            loop {
                tokio::select! {
                    _ = shutdown_requested(&mut shutdown) => {
                        self.drain(Some(lease), &mut tasks).await;
                        break 'consume;
                    }
                    changed = generation_rx.changed() => {
                        if changed.is_err() || *generation_rx.borrow() != generation {
                            info!(
                                queue = %self.config.queue,
                                old_generation = generation,
                                "Pool generation changed, resubscribing"
                            );
                            break;
                        }
                    }
                    item = stream.next() => match item {
                        Some(Ok(delivery)) => self.dispatch(&lease, delivery, &mut tasks),
                        Some(Err(e)) => {
                            warn!(queue = %self.config.queue, generation, error = %e, "Consumer stream failed");
                            self.pool.report_failure(generation, "consumer stream failed");
                            break;
                        }
                        None => {
                            info!(queue = %self.config.queue, generation, "Consumer stream ended");
                            self.pool.report_failure(generation, "consumer stream ended");
                            break;
                        }
                    },
                    Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                        log_join_error(joined);
                    }
                }
            }
        }

        self.set_state(ConsumerState::Stopped);
        info!(queue = %self.config.queue, "Queue consumer stopped");
    }

    async fn subscribe(&self) -> Result<(ChannelLease, DeliveryStream), WorkerError> {
        let lease = self.pool.acquire(AcquireMode::Wait).await?;
        let channel = Arc::clone(lease.channel());

        let setup = async {
            channel.qos(self.config.prefetch).await?;
            channel
                .consume(&self.config.queue, &self.config.consumer_tag)
                .await
        };

        match setup.await {
            Ok(stream) => Ok((lease, stream)),
            Err(e) => {
                if e.is_connection_error() {
                    self.pool
                        .report_failure(lease.generation(), "consumer setup failed");
                }
                Err(e)
            }
        }
    }

    /// Register a delivery and hand it to the executor.
    fn dispatch(&self, lease: &ChannelLease, delivery: IncomingDelivery, tasks: &mut JoinSet<()>) {
        let registry = self.resolver.registry();
        let redelivery_count = delivery.redelivery_count();
        let correlation_id = registry.register(NewDelivery {
            queue: self.config.queue.clone(),
            delivery_tag: delivery.delivery_tag,
            generation: lease.generation(),
            channel_id: lease.channel_id(),
            redelivery_count,
        });
        self.metrics.delivery_received(delivery.redelivered);
        metrics::open_deliveries(registry.open_count());
        debug!(
            queue = %self.config.queue,
            correlation_id = %correlation_id,
            delivery_tag = delivery.delivery_tag,
            redelivery_count,
            "Delivery registered"
        );

        let resolver = self.resolver.clone();

        if let Some(max) = self.config.max_redeliveries
            && redelivery_count > max
        {
            warn!(
                queue = %self.config.queue,
                correlation_id = %correlation_id,
                redelivery_count,
                max_redeliveries = max,
                "Redelivery limit exceeded, dead-lettering"
            );
            tasks.spawn(async move {
                resolver
                    .resolve(&correlation_id, Outcome::PermanentFailure)
                    .await;
            });
            return;
        }

        let task = Task {
            correlation_id,
            queue: self.config.queue.clone(),
            payload: delivery.payload,
            redelivery_count,
            received_at: Utc::now(),
        };
        let executor = Arc::clone(&self.executor);
        let semaphore = Arc::clone(&self.semaphore);
        let in_flight = Arc::clone(&self.in_flight);
        let queue_metrics = self.metrics.clone();

        tasks.spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return;
            };
            queue_metrics.in_flight(in_flight.fetch_add(1, Ordering::SeqCst) + 1);

            let correlation_id = task.correlation_id.clone();
            let submission = executor.submit(task).await;
            queue_metrics.in_flight(in_flight.fetch_sub(1, Ordering::SeqCst) - 1);

            match submission {
                Submission::Completed(outcome) => {
                    let resolution = resolver.resolve(&correlation_id, outcome).await;
                    debug!(correlation_id = %correlation_id, %outcome, %resolution, "Task completed");
                }
                Submission::Deferred => {
                    debug!(correlation_id = %correlation_id, "Task handed off, awaiting completion callback");
                }
            }
        });
    }

    /// Cancel the subscription and wait for this queue's work, up to the grace period.
    async fn drain(&self, lease: Option<ChannelLease>, tasks: &mut JoinSet<()>) {
        self.set_state(ConsumerState::Draining);
        let registry = Arc::clone(self.resolver.registry());
        let queue = self.config.queue.as_str();
        info!(
            queue,
            in_flight = tasks.len(),
            open = registry.open_count_for_queue(queue),
            grace_secs = self.config.drain_grace.as_secs(),
            "Draining consumer"
        );

        if let Some(lease) = &lease
            && let Err(e) = lease.channel().cancel(&self.config.consumer_tag).await
        {
            debug!(queue, error = %e, "Cancel failed, channel already gone");
        }

        let drained = tokio::time::timeout(self.config.drain_grace, async {
            while let Some(joined) = tasks.join_next().await {
                log_join_error(joined);
            }
            while registry.open_count_for_queue(queue) > 0 {
                tokio::time::sleep(DRAIN_POLL).await;
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                queue,
                in_flight = tasks.len(),
                open = registry.open_count_for_queue(queue),
                "Drain grace period elapsed, abandoning remaining work"
            );
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
    }

    fn set_state(&self, state: ConsumerState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(queue = %self.config.queue, from = %previous, to = %state, "Consumer state changed");
        }
    }
}

/// Resolves once shutdown is requested or the sender is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

fn log_join_error(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined
        && e.is_panic()
    {
        error!(error = %e, "Task submission panicked");
    }
}
