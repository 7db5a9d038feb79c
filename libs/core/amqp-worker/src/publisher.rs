//! Publisher for enqueuing tasks
//!
//! Publishing never waits for a reconnect: while the pool is down the call
//! fails with [`WorkerError::PoolUnavailable`] and the caller decides.
//!
//! ```rust,ignore
//! let publisher = Publisher::new(worker.pool().clone());
//! publisher.publish_json("", "scan.requests", &request).await?;
//! ```

use crate::error::WorkerError;
use crate::pool::{AcquireMode, ChannelPool};
use serde::Serialize;
use tracing::{debug, warn};

/// Publishes persistent messages over the shared pool.
#[derive(Clone)]
pub struct Publisher {
    pool: ChannelPool,
}

impl Publisher {
    pub fn new(pool: ChannelPool) -> Self {
        Self { pool }
    }

    /// Publish raw bytes and wait for the broker's confirm.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<(), WorkerError> {
        let lease = self.pool.acquire(AcquireMode::FailFast).await?;

        match lease.channel().publish(exchange, routing_key, payload).await {
            Ok(()) => {
                debug!(
                    exchange,
                    routing_key,
                    bytes = payload.len(),
                    generation = lease.generation(),
                    "Published message"
                );
                Ok(())
            }
            Err(e) => {
                warn!(exchange, routing_key, error = %e, "Publish failed");
                if e.is_connection_error() {
                    self.pool.report_failure(lease.generation(), "publish failed");
                }
                Err(e)
            }
        }
    }

    /// Serialize `message` as JSON and publish it.
    pub async fn publish_json<T: Serialize>(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &T,
    ) -> Result<(), WorkerError> {
        let payload = serde_json::to_vec(message)?;
        self.publish(exchange, routing_key, &payload).await
    }

    /// Publish a batch in order, stopping at the first failure.
    ///
    /// Returns how many messages were published.
    pub async fn publish_batch<T: Serialize>(
        &self,
        exchange: &str,
        routing_key: &str,
        messages: &[T],
    ) -> Result<usize, WorkerError> {
        for (published, message) in messages.iter().enumerate() {
            if let Err(e) = self.publish_json(exchange, routing_key, message).await {
                debug!(published, total = messages.len(), "Batch publish stopped early");
                return Err(e);
            }
        }
        Ok(messages.len())
    }
}
