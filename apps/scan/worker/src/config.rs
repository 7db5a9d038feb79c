//! Scan worker configuration
//!
//! Everything comes from the environment. Broker settings live in
//! [`AmqpConfig`], the admin listener in [`ServerConfig`].

use amqp_worker::{
    Backoff, CircuitBreakerConfig, ConsumerConfig, MonitorConfig, PoolConfig, WorkerConfig,
};
use core_config::amqp::AmqpConfig;
use core_config::server::ServerConfig;
use core_config::{ConfigError, FromEnv, env_or_default, env_parse, env_parse_optional, env_required};
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct ScanWorkerConfig {
    pub amqp: AmqpConfig,
    pub server: ServerConfig,
    /// Queues to consume, one consumer each
    pub queues: Vec<String>,
    /// Scanner endpoint receiving each task as a POST
    pub target_url: String,
    pub target_timeout: Duration,
    /// Consecutive target failures before tasks are held back; `None` disables
    pub circuit_breaker_threshold: Option<u32>,
    pub max_concurrent_tasks: usize,
    pub monitor_interval: Duration,
    pub stale_after: Duration,
    pub drain_grace: Duration,
    pub ack_timeout: Duration,
    pub max_redeliveries: Option<u32>,
}

impl ScanWorkerConfig {
    /// Library configuration for [`amqp_worker::AmqpWorker`].
    pub fn worker_config(&self) -> WorkerConfig {
        let consumers = self
            .queues
            .iter()
            .map(|queue| {
                ConsumerConfig::new(queue.as_str())
                    .with_prefetch(self.amqp.prefetch)
                    .with_max_concurrent_tasks(self.max_concurrent_tasks)
                    .with_drain_grace(self.drain_grace)
                    .with_max_redeliveries(self.max_redeliveries)
            })
            .collect();

        let pool = PoolConfig::new(self.amqp.connections, self.amqp.channels_per_connection)
            .with_backoff(Backoff::new(self.amqp.reconnect_initial, self.amqp.reconnect_max));

        WorkerConfig::new(consumers)
            .with_pool(pool)
            .with_monitor(MonitorConfig::new(self.monitor_interval, self.stale_after))
            .with_ack_timeout(self.ack_timeout)
    }

    pub fn circuit_breaker(&self) -> Option<CircuitBreakerConfig> {
        self.circuit_breaker_threshold
            .map(|threshold| CircuitBreakerConfig::default().with_failure_threshold(threshold))
    }
}

impl FromEnv for ScanWorkerConfig {
    /// - SCAN_QUEUES: comma-separated, defaults to "scan.requests"; must be
    ///   fewer than the pool's channels
    /// - SCAN_TARGET_URL: required
    /// - SCAN_TARGET_TIMEOUT_MS: defaults to 30000
    /// - SCAN_CIRCUIT_BREAKER_THRESHOLD: unset disables the breaker
    /// - SCAN_MAX_CONCURRENT_TASKS: defaults to 10
    /// - MONITOR_INTERVAL_SECS: defaults to 1800
    /// - STALE_AFTER_SECS: defaults to 1500
    /// - DRAIN_GRACE_SECS: defaults to 30
    /// - ACK_TIMEOUT_SECS: defaults to 10
    /// - MAX_REDELIVERIES: unset means unlimited
    fn from_env() -> Result<Self, ConfigError> {
        let queues: Vec<String> = env_or_default("SCAN_QUEUES", "scan.requests")
            .split(',')
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .map(String::from)
            .collect();
        if queues.is_empty() {
            return Err(ConfigError::ParseError {
                key: "SCAN_QUEUES".to_string(),
                details: "at least one queue is required".to_string(),
            });
        }

        let max_concurrent_tasks = env_parse("SCAN_MAX_CONCURRENT_TASKS", 10usize)?;
        if max_concurrent_tasks == 0 {
            return Err(ConfigError::ParseError {
                key: "SCAN_MAX_CONCURRENT_TASKS".to_string(),
                details: "must be at least 1".to_string(),
            });
        }

        // Each consumer holds a channel for its whole subscription; keep one for publishing
        let amqp = AmqpConfig::from_env()?;
        let channels = PoolConfig::new(amqp.connections, amqp.channels_per_connection).total_channels();
        if queues.len() >= channels {
            return Err(ConfigError::ParseError {
                key: "SCAN_QUEUES".to_string(),
                details: format!(
                    "{} queues need more than {channels} pool channels; raise AMQP_CONNECTIONS or AMQP_CHANNELS_PER_CONNECTION",
                    queues.len()
                ),
            });
        }

        Ok(Self {
            amqp,
            server: ServerConfig::from_env()?,
            queues,
            target_url: env_required("SCAN_TARGET_URL")?,
            target_timeout: Duration::from_millis(env_parse("SCAN_TARGET_TIMEOUT_MS", 30_000)?),
            circuit_breaker_threshold: env_parse_optional("SCAN_CIRCUIT_BREAKER_THRESHOLD")?,
            max_concurrent_tasks,
            monitor_interval: Duration::from_secs(env_parse("MONITOR_INTERVAL_SECS", 1800)?),
            stale_after: Duration::from_secs(env_parse("STALE_AFTER_SECS", 1500)?),
            drain_grace: Duration::from_secs(env_parse("DRAIN_GRACE_SECS", 30)?),
            ack_timeout: Duration::from_secs(env_parse("ACK_TIMEOUT_SECS", 10)?),
            max_redeliveries: env_parse_optional("MAX_REDELIVERIES")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VARS: [&str; 15] = [
        "AMQP_URL",
        "AMQP_CONNECTIONS",
        "AMQP_CHANNELS_PER_CONNECTION",
        "RABBITMQ_URL",
        "SCAN_QUEUES",
        "SCAN_TARGET_URL",
        "SCAN_TARGET_TIMEOUT_MS",
        "SCAN_CIRCUIT_BREAKER_THRESHOLD",
        "SCAN_MAX_CONCURRENT_TASKS",
        "MONITOR_INTERVAL_SECS",
        "STALE_AFTER_SECS",
        "DRAIN_GRACE_SECS",
        "ACK_TIMEOUT_SECS",
        "MAX_REDELIVERIES",
        "PORT",
    ];

    fn with_env<F: FnOnce()>(vars: &[(&str, &str)], f: F) {
        let all: Vec<(&str, Option<&str>)> = VARS
            .iter()
            .map(|key| (*key, vars.iter().find(|(k, _)| k == key).map(|(_, v)| *v)))
            .collect();
        temp_env::with_vars(all, f);
    }

    const REQUIRED: [(&str, &str); 2] = [
        ("AMQP_URL", "amqp://localhost:5672/%2f"),
        ("SCAN_TARGET_URL", "http://scanner:8080/tasks"),
    ];

    #[test]
    fn test_defaults() {
        with_env(&REQUIRED, || {
            let config = ScanWorkerConfig::from_env().unwrap();
            assert_eq!(config.queues, vec!["scan.requests".to_string()]);
            assert_eq!(config.target_timeout, Duration::from_secs(30));
            assert_eq!(config.monitor_interval, Duration::from_secs(30 * 60));
            assert_eq!(config.stale_after, Duration::from_secs(25 * 60));
            assert_eq!(config.max_redeliveries, None);
            assert!(config.circuit_breaker().is_none());
        });
    }

    #[test]
    fn test_queue_list_and_overrides() {
        let mut vars = REQUIRED.to_vec();
        vars.extend([
            ("SCAN_QUEUES", "scan.requests, scan.priority ,,"),
            ("MAX_REDELIVERIES", "5"),
            ("DRAIN_GRACE_SECS", "60"),
            ("SCAN_CIRCUIT_BREAKER_THRESHOLD", "3"),
        ]);
        with_env(&vars, || {
            let config = ScanWorkerConfig::from_env().unwrap();
            assert_eq!(config.queues, vec!["scan.requests", "scan.priority"]);
            assert_eq!(config.max_redeliveries, Some(5));
            assert_eq!(config.circuit_breaker().unwrap().failure_threshold, 3);

            let worker = config.worker_config();
            assert_eq!(worker.consumers.len(), 2);
            assert!(worker.consumers.iter().all(|c| c.drain_grace == Duration::from_secs(60)));
            assert!(worker.consumers.iter().all(|c| c.max_redeliveries == Some(5)));
        });
    }

    #[test]
    fn test_missing_target_url() {
        with_env(&REQUIRED[..1], || {
            let err = ScanWorkerConfig::from_env().unwrap_err();
            assert!(err.to_string().contains("SCAN_TARGET_URL"));
        });
    }

    #[test]
    fn test_empty_queue_list_rejected() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("SCAN_QUEUES", " , "));
        with_env(&vars, || {
            let err = ScanWorkerConfig::from_env().unwrap_err();
            assert!(err.to_string().contains("SCAN_QUEUES"));
        });
    }

    #[test]
    fn test_more_queues_than_pool_channels_rejected() {
        let mut vars = REQUIRED.to_vec();
        vars.extend([
            ("SCAN_QUEUES", "a,b,c,d"),
            ("AMQP_CONNECTIONS", "1"),
            ("AMQP_CHANNELS_PER_CONNECTION", "4"),
        ]);
        with_env(&vars, || {
            let err = ScanWorkerConfig::from_env().unwrap_err();
            assert!(err.to_string().contains("SCAN_QUEUES"));
            assert!(err.to_string().contains("4 pool channels"));
        });

        vars.retain(|(k, _)| *k != "AMQP_CONNECTIONS");
        vars.push(("AMQP_CONNECTIONS", "2"));
        with_env(&vars, || {
            let config = ScanWorkerConfig::from_env().unwrap();
            assert_eq!(config.worker_config().consumers.len(), 4);
        });
    }

    #[test]
    fn test_worker_config_maps_pool_settings() {
        let mut vars = REQUIRED.to_vec();
        vars.extend([("SCAN_MAX_CONCURRENT_TASKS", "4"), ("ACK_TIMEOUT_SECS", "3")]);
        with_env(&vars, || {
            let worker = ScanWorkerConfig::from_env().unwrap().worker_config();
            assert_eq!(worker.pool.connections, 1);
            assert_eq!(worker.pool.channels_per_connection, 4);
            assert_eq!(worker.pool.backoff.max, Duration::from_secs(30));
            assert_eq!(worker.ack_timeout, Duration::from_secs(3));
            assert_eq!(worker.consumers[0].max_concurrent_tasks, 4);
            assert_eq!(worker.consumers[0].prefetch, 10);
        });
    }
}
