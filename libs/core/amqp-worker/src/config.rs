//! Worker configuration
//!
//! Plain structs with `with_*` builders. Environment loading lives in
//! `core_config::AmqpConfig` and the application crates.

use crate::resilience::Backoff;
use std::time::Duration;
use uuid::Uuid;

/// Lower and upper bound for channels per connection.
pub const MIN_CHANNELS_PER_CONNECTION: usize = 2;
pub const MAX_CHANNELS_PER_CONNECTION: usize = 10;

/// Configuration for the connection/channel pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of broker connections (at least 1)
    pub connections: usize,

    /// Channels per connection, clamped into 2..=10
    pub channels_per_connection: usize,

    /// How long `acquire` waits for a channel or a reconnect
    pub acquire_timeout: Duration,

    /// Reconnect delays
    pub backoff: Backoff,
}

impl PoolConfig {
    pub fn new(connections: usize, channels_per_connection: usize) -> Self {
        Self::default()
            .with_connections(connections)
            .with_channels_per_connection(channels_per_connection)
    }

    /// Set the number of connections
    pub fn with_connections(mut self, connections: usize) -> Self {
        self.connections = connections.max(1);
        self
    }

    /// Set channels per connection (clamped into the supported range)
    pub fn with_channels_per_connection(mut self, channels: usize) -> Self {
        self.channels_per_connection =
            channels.clamp(MIN_CHANNELS_PER_CONNECTION, MAX_CHANNELS_PER_CONNECTION);
        self
    }

    /// Set the acquire timeout
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Set the reconnect backoff
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Total channel slots per generation
    pub fn total_channels(&self) -> usize {
        self.connections * self.channels_per_connection
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connections: 1,
            channels_per_connection: 4,
            acquire_timeout: Duration::from_secs(5),
            backoff: Backoff::default(),
        }
    }
}

/// Configuration for one queue consumer
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Queue to consume from
    pub queue: String,

    /// Consumer tag sent with `basic.consume`
    pub consumer_tag: String,

    /// `basic.qos` prefetch count
    pub prefetch: u16,

    /// Maximum executor submissions in flight
    pub max_concurrent_tasks: usize,

    /// How long draining waits for open deliveries of this queue
    pub drain_grace: Duration,

    /// Dead-letter deliveries redelivered more often than this (unset = requeue forever)
    pub max_redeliveries: Option<u32>,
}

impl ConsumerConfig {
    pub fn new(queue: impl Into<String>) -> Self {
        let queue = queue.into();
        Self {
            consumer_tag: format!("worker-{}-{}", Uuid::new_v4(), queue),
            queue,
            prefetch: 10,
            max_concurrent_tasks: 10,
            drain_grace: Duration::from_secs(30),
            max_redeliveries: None,
        }
    }

    /// Set the consumer tag
    pub fn with_consumer_tag(mut self, tag: impl Into<String>) -> Self {
        self.consumer_tag = tag.into();
        self
    }

    /// Set the prefetch count
    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }

    /// Set the maximum concurrent tasks
    pub fn with_max_concurrent_tasks(mut self, count: usize) -> Self {
        self.max_concurrent_tasks = count.max(1);
        self
    }

    /// Set the drain grace period
    pub fn with_drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }

    /// Set the redelivery cap
    pub fn with_max_redeliveries(mut self, max: Option<u32>) -> Self {
        self.max_redeliveries = max;
        self
    }
}

/// Configuration for the health monitor
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Time between ticks
    pub interval: Duration,

    /// Deliveries open longer than this are force-requeued
    pub stale_after: Duration,
}

impl MonitorConfig {
    pub fn new(interval: Duration, stale_after: Duration) -> Self {
        Self {
            interval,
            stale_after,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30 * 60),
            stale_after: Duration::from_secs(25 * 60),
        }
    }
}

/// Configuration for the whole worker
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// One consumer per queue
    pub consumers: Vec<ConsumerConfig>,

    /// Pool settings
    pub pool: PoolConfig,

    /// Monitor settings
    pub monitor: MonitorConfig,

    /// Upper bound for a single ACK/NACK call
    pub ack_timeout: Duration,
}

impl WorkerConfig {
    pub fn new(consumers: Vec<ConsumerConfig>) -> Self {
        Self {
            consumers,
            pool: PoolConfig::default(),
            monitor: MonitorConfig::default(),
            ack_timeout: Duration::from_secs(10),
        }
    }

    /// Add a consumer
    pub fn with_consumer(mut self, consumer: ConsumerConfig) -> Self {
        self.consumers.push(consumer);
        self
    }

    /// Set the pool config
    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Set the monitor config
    pub fn with_monitor(mut self, monitor: MonitorConfig) -> Self {
        self.monitor = monitor;
        self
    }

    /// Set the ACK timeout
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }
}
