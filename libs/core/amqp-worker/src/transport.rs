//! Broker transport seam
//!
//! The pool, consumer, resolver and publisher only talk to these traits.
//! [`LapinConnector`](crate::LapinConnector) speaks AMQP 0-9-1 to a real
//! broker; [`InMemoryBroker`](crate::InMemoryBroker) runs in-process.

use crate::delivery::IncomingDelivery;
use crate::error::WorkerError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;

/// Stream of deliveries for one `basic.consume` subscription.
///
/// The stream ends (or yields an error) when the channel or connection dies.
pub type DeliveryStream = BoxStream<'static, Result<IncomingDelivery, WorkerError>>;

/// Opens broker connections.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Establish a new connection.
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, WorkerError>;

    /// Name for logging
    fn name(&self) -> &str;
}

/// One broker connection.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Open a new channel on this connection.
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, WorkerError>;

    /// Whether the connection is still usable.
    fn is_connected(&self) -> bool;

    /// Close the connection and every channel on it.
    async fn close(&self) -> Result<(), WorkerError>;
}

/// One channel (logical sub-connection).
///
/// Delivery tags are scoped to the channel: an ACK must go out on the same
/// channel that received the delivery.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// `basic.qos(prefetch_count)`
    async fn qos(&self, prefetch: u16) -> Result<(), WorkerError>;

    /// `basic.consume` with manual acknowledgment.
    async fn consume(&self, queue: &str, consumer_tag: &str)
    -> Result<DeliveryStream, WorkerError>;

    /// `basic.cancel`
    async fn cancel(&self, consumer_tag: &str) -> Result<(), WorkerError>;

    /// `basic.ack`
    async fn ack(&self, delivery_tag: u64) -> Result<(), WorkerError>;

    /// `basic.nack` for a single delivery.
    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), WorkerError>;

    /// `basic.publish` of a persistent message, waiting for the broker's confirm.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<(), WorkerError>;

    /// Whether the channel is still usable.
    fn is_open(&self) -> bool;

    /// Close the channel.
    async fn close(&self) -> Result<(), WorkerError>;
}
