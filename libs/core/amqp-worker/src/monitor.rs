//! Health monitor
//!
//! Runs on a fixed interval. Each tick checks pool liveness (forcing a
//! reconnect when it fails), then force-requeues deliveries that have been
//! open longer than the staleness threshold.

use crate::config::MonitorConfig;
use crate::delivery::{CorrelationId, Outcome};
use crate::metrics;
use crate::pool::ChannelPool;
use crate::resolver::{AckResolver, Resolution};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Result of one monitor tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonitorReport {
    /// Pool liveness before any recovery
    pub live: bool,
    /// Whether a reconnect was forced
    pub reconnect_forced: bool,
    /// Deliveries found stale, oldest first
    pub swept: Vec<CorrelationId>,
    /// Resolution of each swept delivery
    pub resolutions: Vec<(CorrelationId, Resolution)>,
}

/// Periodic liveness check and stale delivery sweep.
pub struct HealthMonitor {
    pool: ChannelPool,
    resolver: AckResolver,
    config: MonitorConfig,
}

impl HealthMonitor {
    pub fn new(pool: ChannelPool, resolver: AckResolver, config: MonitorConfig) -> Self {
        Self {
            pool,
            resolver,
            config,
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Run one check.
    pub async fn tick(&self) -> MonitorReport {
        let live = self.pool.is_live();
        let reconnect_forced = !live && !self.pool.is_shutdown();
        if reconnect_forced {
            warn!(
                generation = self.pool.current_generation(),
                "Pool liveness check failed, forcing reconnect"
            );
            self.pool.force_reconnect();
        }

        let swept = self.resolver.registry().sweep_stale(self.config.stale_after);
        let mut resolutions = Vec::with_capacity(swept.len());
        for id in &swept {
            if let Some(record) = self.resolver.registry().lookup(id) {
                warn!(
                    correlation_id = %id,
                    queue = %record.queue,
                    age_secs = record.age().as_secs(),
                    max_age_secs = self.config.stale_after.as_secs(),
                    "StaleDeliveryTimeout: requeueing delivery"
                );
            }
            let resolution = self.resolver.resolve(id, Outcome::RetryableFailure).await;
            resolutions.push((id.clone(), resolution));
        }

        if !swept.is_empty() {
            metrics::deliveries_swept(swept.len());
        }
        debug!(live, swept = swept.len(), "Health monitor tick");

        MonitorReport {
            live,
            reconnect_forced,
            swept,
            resolutions,
        }
    }

    /// Tick every `interval` until shutdown. The first tick happens one
    /// interval after start.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            stale_after_secs = self.config.stale_after.as_secs(),
            "Health monitor started"
        );

        let start = tokio::time::Instant::now() + self.config.interval;
        let mut ticker = tokio::time::interval_at(start, self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Health monitor stopped");
    }
}
