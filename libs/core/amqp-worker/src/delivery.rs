//! Delivery types shared by the transports, the registry and executors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use strum::{AsRefStr, Display, EnumString};

/// Header that carries the correlation ID when work crosses a process boundary.
///
/// The remote side must echo it back unchanged in its completion callback.
pub const CORRELATION_HEADER: &str = "X-RabbitMQ-Delivery-Tag";

/// Broker header with the number of previous delivery attempts (quorum queues).
pub const DELIVERY_COUNT_HEADER: &str = "x-delivery-count";

/// Opaque token identifying one outstanding delivery.
///
/// Whoever holds it can resolve exactly one delivery, once. The textual form
/// is `{instance}-{generation}-{sequence}`, but callers must treat it as
/// opaque.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub(crate) fn new(instance: &str, generation: u64, sequence: u64) -> Self {
        Self(format!("{instance}-{generation}-{sequence}"))
    }

    /// Borrow the token as a string (e.g. for an HTTP header value).
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl AsRef<str> for CorrelationId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Result of processing one delivery.
///
/// Each variant maps to exactly one broker primitive:
/// - `Success` -> `basic.ack`
/// - `RetryableFailure` -> `basic.nack(requeue = true)`
/// - `PermanentFailure` -> `basic.nack(requeue = false)` (dropped or dead-lettered)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, AsRefStr, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    RetryableFailure,
    PermanentFailure,
}

impl Outcome {
    /// `None` for an ACK, otherwise the `requeue` flag of the NACK.
    pub fn nack_requeue(&self) -> Option<bool> {
        match self {
            Outcome::Success => None,
            Outcome::RetryableFailure => Some(true),
            Outcome::PermanentFailure => Some(false),
        }
    }
}

/// A message as handed over by a broker transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingDelivery {
    /// Per-channel sequence number assigned by the broker
    pub delivery_tag: u64,

    /// AMQP `redelivered` flag
    pub redelivered: bool,

    /// Value of the `x-delivery-count` header, when the broker sets it
    pub delivery_count: Option<u32>,

    /// Opaque message body
    pub payload: Vec<u8>,
}

impl IncomingDelivery {
    pub fn new(delivery_tag: u64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            delivery_tag,
            redelivered: false,
            delivery_count: None,
            payload: payload.into(),
        }
    }

    pub fn with_redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    pub fn with_delivery_count(mut self, count: u32) -> Self {
        self.delivery_count = Some(count);
        self
    }

    /// Broker-reported redelivery count.
    ///
    /// Prefers the exact `x-delivery-count` header; classic queues only
    /// report the `redelivered` flag, which counts as one.
    pub fn redelivery_count(&self) -> u32 {
        match self.delivery_count {
            Some(count) => count,
            None if self.redelivered => 1,
            None => 0,
        }
    }
}

/// A unit of work handed to a [`TaskExecutor`](crate::TaskExecutor).
#[derive(Debug, Clone)]
pub struct Task {
    /// Token to pass back to the resolver (or echo in the callback header)
    pub correlation_id: CorrelationId,

    /// Queue the delivery came from
    pub queue: String,

    /// Opaque message body
    pub payload: Vec<u8>,

    /// Broker-reported redelivery count
    pub redelivery_count: u32,

    /// When the consumer received the delivery
    pub received_at: DateTime<Utc>,
}

impl Task {
    /// Check if this is a redelivery
    pub fn is_redelivery(&self) -> bool {
        self.redelivery_count > 0
    }

    /// How long ago the delivery was received
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.received_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correlation_id_format() {
        let id = CorrelationId::new("a1b2c3d4", 3, 17);
        assert_eq!(id.as_str(), "a1b2c3d4-3-17");
        assert_eq!(id.to_string(), "a1b2c3d4-3-17");
        assert_eq!(CorrelationId::from("a1b2c3d4-3-17"), id);
    }

    #[test]
    fn test_correlation_id_serializes_as_string() {
        let id = CorrelationId::new("ff00ff00", 1, 1);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"ff00ff00-1-1\"");
    }

    #[test]
    fn test_outcome_names() {
        assert_eq!(Outcome::Success.to_string(), "success");
        assert_eq!(Outcome::RetryableFailure.as_ref(), "retryable_failure");
        let parsed: Outcome = "permanent_failure".parse().unwrap();
        assert_eq!(parsed, Outcome::PermanentFailure);

        let from_json: Outcome = serde_json::from_str("\"retryable_failure\"").unwrap();
        assert_eq!(from_json, Outcome::RetryableFailure);
    }

    #[test]
    fn test_outcome_broker_primitive() {
        assert_eq!(Outcome::Success.nack_requeue(), None);
        assert_eq!(Outcome::RetryableFailure.nack_requeue(), Some(true));
        assert_eq!(Outcome::PermanentFailure.nack_requeue(), Some(false));
    }

    #[test]
    fn test_redelivery_count() {
        let fresh = IncomingDelivery::new(1, b"scan".to_vec());
        assert_eq!(fresh.redelivery_count(), 0);

        let redelivered = IncomingDelivery::new(2, b"scan".to_vec()).with_redelivered(true);
        assert_eq!(redelivered.redelivery_count(), 1);

        // The header wins over the flag
        let counted = IncomingDelivery::new(3, b"scan".to_vec())
            .with_redelivered(true)
            .with_delivery_count(4);
        assert_eq!(counted.redelivery_count(), 4);
    }

    #[test]
    fn test_task_redelivery() {
        let task = Task {
            correlation_id: CorrelationId::from("x-1-1"),
            queue: "scans".to_string(),
            payload: vec![],
            redelivery_count: 2,
            received_at: Utc::now(),
        };
        assert!(task.is_redelivery());
        assert!(task.age().num_milliseconds() < 1000);
    }
}
