//! Worker supervisor
//!
//! Wires the pool, registry, resolver, one consumer per queue and the health
//! monitor together and tears them down in order:
//!
//! 1. consumers drain (grace period)
//! 2. monitor stops
//! 3. remaining open deliveries are requeued
//! 4. pool shuts down
//!
//! ```rust,ignore
//! let worker = AmqpWorker::new(
//!     Arc::new(LapinConnector::new(amqp_url)),
//!     Arc::new(HttpExecutor::new(target_url, timeout)?),
//!     WorkerConfig::new(vec![ConsumerConfig::new("scan.requests")]),
//! )?;
//! let (shutdown_tx, shutdown_rx) = watch::channel(false);
//! worker.run(shutdown_rx).await?;
//! ```

use crate::config::WorkerConfig;
use crate::consumer::{ConsumerState, QueueConsumer};
use crate::error::WorkerError;
use crate::executor::TaskExecutor;
use crate::monitor::HealthMonitor;
use crate::pool::ChannelPool;
use crate::publisher::Publisher;
use crate::registry::DeliveryRegistry;
use crate::resolver::AckResolver;
use crate::transport::Connector;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info};

/// Runs every configured consumer plus the health monitor.
///
/// The pool must have more channels than there are queues: each consumer
/// keeps one leased while subscribed and publishing needs a free one.
pub struct AmqpWorker {
    config: WorkerConfig,
    connector_name: String,
    pool: ChannelPool,
    resolver: AckResolver,
    executor: Arc<dyn TaskExecutor>,
    consumers: Vec<Arc<QueueConsumer>>,
    monitor: Arc<HealthMonitor>,
}

impl AmqpWorker {
    pub fn new(
        connector: Arc<dyn Connector>,
        executor: Arc<dyn TaskExecutor>,
        config: WorkerConfig,
    ) -> Result<Self, WorkerError> {
        Self::with_registry(connector, executor, config, Arc::new(DeliveryRegistry::new()))
    }

    /// Use a caller-provided registry (fixed instance prefix in tests).
    pub fn with_registry(
        connector: Arc<dyn Connector>,
        executor: Arc<dyn TaskExecutor>,
        config: WorkerConfig,
        registry: Arc<DeliveryRegistry>,
    ) -> Result<Self, WorkerError> {
        validate(&config)?;

        let connector_name = connector.name().to_string();
        let pool = ChannelPool::new(connector, config.pool.clone());
        let resolver = AckResolver::new(registry, pool.clone(), config.ack_timeout);
        let consumers = config
            .consumers
            .iter()
            .map(|consumer| {
                Arc::new(QueueConsumer::new(
                    consumer.clone(),
                    pool.clone(),
                    resolver.clone(),
                    Arc::clone(&executor),
                ))
            })
            .collect();
        let monitor = Arc::new(HealthMonitor::new(
            pool.clone(),
            resolver.clone(),
            config.monitor.clone(),
        ));

        Ok(Self {
            config,
            connector_name,
            pool,
            resolver,
            executor,
            consumers,
            monitor,
        })
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn pool(&self) -> &ChannelPool {
        &self.pool
    }

    pub fn registry(&self) -> &Arc<DeliveryRegistry> {
        self.resolver.registry()
    }

    /// Resolver for completion callbacks.
    pub fn resolver(&self) -> &AckResolver {
        &self.resolver
    }

    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    /// Publisher sharing this worker's pool.
    pub fn publisher(&self) -> Publisher {
        Publisher::new(self.pool.clone())
    }

    /// Current state of each consumer, in configuration order.
    pub fn consumer_states(&self) -> Vec<(String, ConsumerState)> {
        self.consumers
            .iter()
            .map(|c| (c.queue().to_string(), c.state()))
            .collect()
    }

    /// Run until `shutdown` turns true (or its sender is dropped).
    ///
    /// A worker runs once; calling `run` after it stopped returns
    /// [`WorkerError::Shutdown`].
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<(), WorkerError> {
        if self.pool.is_shutdown() {
            return Err(WorkerError::Shutdown);
        }

        info!(
            connector = %self.connector_name,
            executor = self.executor.name(),
            queues = ?self.config.consumers.iter().map(|c| c.queue.as_str()).collect::<Vec<_>>(),
            connections = self.config.pool.connections,
            channels_per_connection = self.config.pool.channels_per_connection,
            monitor_interval_secs = self.config.monitor.interval.as_secs(),
            "Starting AMQP worker"
        );

        self.pool.start();

        let (monitor_stop_tx, monitor_stop_rx) = watch::channel(false);
        let monitor = {
            let monitor = Arc::clone(&self.monitor);
            tokio::spawn(async move { monitor.run(monitor_stop_rx).await })
        };

        let mut consumers = JoinSet::new();
        for consumer in &self.consumers {
            let consumer = Arc::clone(consumer);
            let shutdown = shutdown.clone();
            consumers.spawn(async move { consumer.run(shutdown).await });
        }

        // Consumers only return once shutdown was requested and they drained
        while let Some(joined) = consumers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Consumer task failed");
            }
        }
        info!("All consumers stopped");

        monitor_stop_tx.send_replace(true);
        if let Err(e) = monitor.await {
            error!(error = %e, "Health monitor task failed");
        }

        let requeued = self.resolver.requeue_all_open().await;
        if !requeued.is_empty() {
            info!(count = requeued.len(), "Requeued deliveries still open at shutdown");
        }

        self.pool.shutdown().await;
        info!("AMQP worker stopped");
        Ok(())
    }
}

fn validate(config: &WorkerConfig) -> Result<(), WorkerError> {
    if config.consumers.is_empty() {
        return Err(WorkerError::Config("at least one queue is required".to_string()));
    }

    // Each consumer holds a channel for its whole subscription; keep one for publishing
    let channels = config.pool.total_channels();
    if config.consumers.len() >= channels {
        return Err(WorkerError::Config(format!(
            "{} queues need more than {channels} pool channels; add connections or channels per connection",
            config.consumers.len()
        )));
    }

    let mut seen = HashSet::new();
    for consumer in &config.consumers {
        if consumer.queue.is_empty() {
            return Err(WorkerError::Config("queue name must not be empty".to_string()));
        }
        if !seen.insert(consumer.queue.as_str()) {
            return Err(WorkerError::Config(format!(
                "queue '{}' is configured more than once",
                consumer.queue
            )));
        }
    }
    Ok(())
}
