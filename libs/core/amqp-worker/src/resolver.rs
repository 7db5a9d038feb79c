//! Acknowledgment resolver
//!
//! Turns an [`Outcome`] for a correlation ID into exactly one broker call.
//! The registry entry is claimed first, so concurrent or repeated resolves
//! for the same ID can never both reach the broker.

use crate::delivery::{CorrelationId, Outcome};
use crate::metrics;
use crate::pool::ChannelPool;
use crate::registry::{DeliveryRecord, DeliveryRegistry};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use strum::{AsRefStr, Display};
use tracing::{debug, info, warn};

/// What happened to a resolve request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[derive(Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// `basic.ack` sent
    Acked,
    /// `basic.nack(requeue = true)` sent
    Requeued,
    /// `basic.nack(requeue = false)` sent
    DeadLettered,
    /// The delivery's channel is gone; the broker redelivers it on its own
    StaleGeneration,
    /// Already resolved, swept, or never known
    Unknown,
    /// The broker call failed or timed out; the pool reconnects
    AckFailed,
}

impl Resolution {
    fn from_outcome(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Success => Resolution::Acked,
            Outcome::RetryableFailure => Resolution::Requeued,
            Outcome::PermanentFailure => Resolution::DeadLettered,
        }
    }

    /// Whether the broker received the ACK/NACK.
    pub fn reached_broker(&self) -> bool {
        matches!(
            self,
            Resolution::Acked | Resolution::Requeued | Resolution::DeadLettered
        )
    }
}

/// Issues ACK/NACK for registered deliveries.
#[derive(Clone)]
pub struct AckResolver {
    registry: Arc<DeliveryRegistry>,
    pool: ChannelPool,
    ack_timeout: Duration,
}

impl AckResolver {
    pub fn new(registry: Arc<DeliveryRegistry>, pool: ChannelPool, ack_timeout: Duration) -> Self {
        Self {
            registry,
            pool,
            ack_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<DeliveryRegistry> {
        &self.registry
    }

    pub fn pool(&self) -> &ChannelPool {
        &self.pool
    }

    /// Resolve a delivery. Idempotent: later calls for the same ID return `Unknown`.
    pub async fn resolve(&self, id: &CorrelationId, outcome: Outcome) -> Resolution {
        let Some(record) = self.registry.deregister(id) else {
            debug!(correlation_id = %id, %outcome, "Resolve for unknown correlation ID");
            metrics::resolution(Resolution::Unknown.as_ref());
            return Resolution::Unknown;
        };
        metrics::open_deliveries(self.registry.open_count());

        let resolution = self.settle(&record, outcome).await;
        metrics::resolution(resolution.as_ref());
        resolution
    }

    /// NACK with requeue every open delivery (used at the end of shutdown).
    pub async fn requeue_all_open(&self) -> Vec<(CorrelationId, Resolution)> {
        let ids = self.registry.open_ids();
        if !ids.is_empty() {
            info!(count = ids.len(), "Requeueing open deliveries");
        }

        let mut resolutions = Vec::with_capacity(ids.len());
        for id in ids {
            let resolution = self.resolve(&id, Outcome::RetryableFailure).await;
            resolutions.push((id, resolution));
        }
        resolutions
    }

    async fn settle(&self, record: &DeliveryRecord, outcome: Outcome) -> Resolution {
        let Some(channel) = self.pool.channel_for(record.generation, record.channel_id) else {
            info!(
                correlation_id = %record.correlation_id,
                generation = record.generation,
                current_generation = self.pool.current_generation(),
                %outcome,
                "Skipping acknowledgment for stale generation"
            );
            return Resolution::StaleGeneration;
        };

        let tag = record.delivery_tag;
        let call = async {
            match outcome.nack_requeue() {
                None => channel.ack(tag).await,
                Some(requeue) => channel.nack(tag, requeue).await,
            }
        };

        let failure = match tokio::time::timeout(self.ack_timeout, call).await {
            Ok(Ok(())) => {
                debug!(
                    correlation_id = %record.correlation_id,
                    delivery_tag = tag,
                    %outcome,
                    "Delivery resolved"
                );
                return Resolution::from_outcome(outcome);
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("timed out after {:?}", self.ack_timeout),
        };

        warn!(
            correlation_id = %record.correlation_id,
            delivery_tag = tag,
            generation = record.generation,
            %outcome,
            error = %failure,
            "Acknowledgment call failed"
        );
        self.pool.report_failure(record.generation, "acknowledgment failed");
        Resolution::AckFailed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::memory::InMemoryBroker;
    use crate::pool::{AcquireMode, ChannelLease};
    use crate::registry::NewDelivery;
    use crate::transport::test_support::{StaticConnector, StuckChannel};
    use crate::transport::DeliveryStream;
    use futures::StreamExt;

    struct Harness {
        broker: InMemoryBroker,
        pool: ChannelPool,
        registry: Arc<DeliveryRegistry>,
        resolver: AckResolver,
        lease: ChannelLease,
        stream: DeliveryStream,
    }

    impl Harness {
        async fn new() -> Self {
            let broker = InMemoryBroker::new();
            let pool = ChannelPool::new(Arc::new(broker.clone()), PoolConfig::new(1, 2));
            pool.start();
            pool.wait_for_generation(1).await.unwrap();

            let lease = pool.acquire(AcquireMode::Wait).await.unwrap();
            let stream = lease.channel().consume("q", "test").await.unwrap();
            let registry = Arc::new(DeliveryRegistry::new());
            let resolver = AckResolver::new(
                Arc::clone(&registry),
                pool.clone(),
                Duration::from_secs(5),
            );

            Self {
                broker,
                pool,
                registry,
                resolver,
                lease,
                stream,
            }
        }

        async fn receive(&mut self, payload: &[u8]) -> CorrelationId {
            self.broker.enqueue("q", payload.to_vec());
            let delivery = self.stream.next().await.unwrap().unwrap();
            self.registry.register(NewDelivery {
                queue: "q".to_string(),
                delivery_tag: delivery.delivery_tag,
                generation: self.lease.generation(),
                channel_id: self.lease.channel_id(),
                redelivery_count: delivery.redelivery_count(),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_acks() {
        let mut h = Harness::new().await;
        let id = h.receive(b"job").await;

        assert_eq!(h.resolver.resolve(&id, Outcome::Success).await, Resolution::Acked);
        assert_eq!(h.broker.acked(), vec![b"job".to_vec()]);
        assert!(h.registry.lookup(&id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_failure_requeues() {
        let mut h = Harness::new().await;
        let id = h.receive(b"job").await;

        assert_eq!(
            h.resolver.resolve(&id, Outcome::RetryableFailure).await,
            Resolution::Requeued
        );
        assert_eq!(h.broker.nacked(), vec![(b"job".to_vec(), true)]);

        // Broker redelivers with the redelivered flag set
        let again = h.stream.next().await.unwrap().unwrap();
        assert!(again.redelivered);
        assert_eq!(again.payload, b"job");
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_dead_letters() {
        let mut h = Harness::new().await;
        let id = h.receive(b"poison").await;

        assert_eq!(
            h.resolver.resolve(&id, Outcome::PermanentFailure).await,
            Resolution::DeadLettered
        );
        assert_eq!(h.broker.dead_letters("q"), vec![b"poison".to_vec()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_is_idempotent() {
        let mut h = Harness::new().await;
        let id = h.receive(b"job").await;

        assert_eq!(h.resolver.resolve(&id, Outcome::Success).await, Resolution::Acked);
        assert_eq!(
            h.resolver.resolve(&id, Outcome::RetryableFailure).await,
            Resolution::Unknown
        );
        assert_eq!(h.broker.settle_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_resolves_reach_broker_once() {
        let mut h = Harness::new().await;
        let id = h.receive(b"job").await;

        let (a, b) = tokio::join!(
            h.resolver.resolve(&id, Outcome::Success),
            h.resolver.resolve(&id, Outcome::RetryableFailure)
        );
        assert_eq!(
            [a, b].iter().filter(|r| r.reached_broker()).count(),
            1
        );
        assert!([a, b].contains(&Resolution::Unknown));
        assert_eq!(h.broker.settle_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_id() {
        let h = Harness::new().await;
        let id = CorrelationId::from("deadbeef-1-42");

        assert_eq!(h.resolver.resolve(&id, Outcome::Success).await, Resolution::Unknown);
        assert_eq!(h.broker.settle_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_generation_skips_broker() {
        let mut h = Harness::new().await;
        let id = h.receive(b"job").await;

        h.pool.report_failure(1, "connection reset");
        h.pool.wait_for_generation(2).await.unwrap();

        assert_eq!(
            h.resolver.resolve(&id, Outcome::Success).await,
            Resolution::StaleGeneration
        );
        assert_eq!(h.broker.settle_count(), 0);
        assert!(h.registry.lookup(&id).is_none());
        // The closed channel handed the message back to the queue
        assert_eq!(h.broker.queue_depth("q"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_ack_invalidates_generation() {
        let mut h = Harness::new().await;
        let id = h.receive(b"job").await;
        h.broker.set_fail_acks(true);

        assert_eq!(
            h.resolver.resolve(&id, Outcome::Success).await,
            Resolution::AckFailed
        );
        assert!(h.registry.lookup(&id).is_none());
        assert_eq!(h.pool.valid_generation(), None);

        h.broker.set_fail_acks(false);
        assert_eq!(h.pool.wait_for_generation(2).await.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requeue_all_open() {
        let mut h = Harness::new().await;
        let a = h.receive(b"a").await;
        let b = h.receive(b"b").await;

        let resolutions = h.resolver.requeue_all_open().await;
        assert_eq!(resolutions.len(), 2);
        assert!(resolutions.contains(&(a, Resolution::Requeued)));
        assert!(resolutions.contains(&(b, Resolution::Requeued)));
        assert_eq!(h.registry.open_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_timeout() {
        let pool = ChannelPool::new(
            Arc::new(StaticConnector::new(Arc::new(StuckChannel))),
            PoolConfig::new(1, 2),
        );
        pool.start();
        pool.wait_for_generation(1).await.unwrap();

        let registry = Arc::new(DeliveryRegistry::new());
        let resolver = AckResolver::new(Arc::clone(&registry), pool.clone(), Duration::from_secs(2));
        let id = registry.register(NewDelivery {
            queue: "q".to_string(),
            delivery_tag: 1,
            generation: 1,
            channel_id: 0,
            redelivery_count: 0,
        });

        let started = tokio::time::Instant::now();
        assert_eq!(resolver.resolve(&id, Outcome::Success).await, Resolution::AckFailed);
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert!(registry.lookup(&id).is_none());
    }
}
