//! Prometheus metrics for the worker
//!
//! Provides observability into deliveries, resolutions and the pool.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use tracing::info;

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Initialize Prometheus metrics
///
/// Call this once at startup. Subsequent calls are no-ops.
pub fn init_metrics() -> Result<(), BuildError> {
    PROMETHEUS_HANDLE.get_or_try_init(|| {
        let handle = PrometheusBuilder::new().install_recorder()?;
        info!("Prometheus metrics initialized");
        Ok::<_, BuildError>(handle)
    })?;
    Ok(())
}

/// Get the Prometheus handle for rendering metrics
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Render metrics in Prometheus format
pub fn render_metrics() -> String {
    prometheus_handle().map(|h| h.render()).unwrap_or_default()
}

/// Per-queue metrics helper
#[derive(Debug, Clone)]
pub struct QueueMetrics {
    queue: String,
}

impl QueueMetrics {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
        }
    }

    /// Record a delivery being received and registered
    pub fn delivery_received(&self, redelivered: bool) {
        counter!(
            "amqp_worker_deliveries_received_total",
            "queue" => self.queue.clone(),
            "redelivered" => redelivered.to_string()
        )
        .increment(1);
    }

    /// Update the in-flight submissions gauge
    pub fn in_flight(&self, count: usize) {
        gauge!(
            "amqp_worker_in_flight_tasks",
            "queue" => self.queue.clone()
        )
        .set(count as f64);
    }

    /// Record the consumer (re)subscribing
    pub fn subscribed(&self, generation: u64) {
        counter!(
            "amqp_worker_subscriptions_total",
            "queue" => self.queue.clone()
        )
        .increment(1);
        gauge!(
            "amqp_worker_consumer_generation",
            "queue" => self.queue.clone()
        )
        .set(generation as f64);
    }
}

/// Record a resolution (`acked`, `requeued`, `dead_lettered`, ...)
pub fn resolution(kind: &str) {
    counter!(
        "amqp_worker_resolutions_total",
        "resolution" => kind.to_string()
    )
    .increment(1);
}

/// Record deliveries force-resolved by the health monitor
pub fn deliveries_swept(count: usize) {
    counter!("amqp_worker_deliveries_swept_total").increment(count as u64);
}

/// Update the open deliveries gauge
pub fn open_deliveries(count: usize) {
    gauge!("amqp_worker_open_deliveries").set(count as f64);
}

/// Record a pool reconnect and the new generation
pub fn reconnected(generation: u64) {
    counter!("amqp_worker_reconnects_total").increment(1);
    gauge!("amqp_worker_pool_generation").set(generation as f64);
}

/// Record a failed reconnect attempt
pub fn reconnect_failed() {
    counter!("amqp_worker_reconnect_failures_total").increment(1);
}
