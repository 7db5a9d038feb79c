//! Worker error types
//!
//! Broker trouble is recovered inside the crate (the pool reconnects with
//! backoff), so most of these only ever reach a log line. Conditions that are
//! expected under at-least-once delivery, such as an acknowledgment for a
//! stale generation or an unknown correlation ID, are not errors at all and
//! are reported as a [`Resolution`](crate::Resolution) instead.

use std::time::Duration;
use thiserror::Error;

/// Errors raised by the pool, the transports and the executors.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Connection or channel could not be established
    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// Fail-fast acquire while the pool has no valid generation
    #[error("Channel pool unavailable (last generation {generation})")]
    PoolUnavailable { generation: u64 },

    /// No channel became free within the acquire timeout
    #[error("Timed out after {0:?} waiting for a pooled channel")]
    AcquireTimeout(Duration),

    /// A channel-level operation failed (qos, consume, publish, cancel)
    #[error("Channel error: {0}")]
    Channel(String),

    /// The ACK/NACK call itself failed
    #[error("ACK/NACK for delivery tag {delivery_tag} failed: {message}")]
    AckCallFailed { delivery_tag: u64, message: String },

    /// Executor setup or transport failure
    #[error("Executor error: {0}")]
    Executor(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Error reported by the AMQP client
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    /// The pool or worker is shutting down
    #[error("Shutdown requested")]
    Shutdown,
}

impl WorkerError {
    /// Whether this error means the current channel or connection is unusable.
    ///
    /// The pool invalidates its generation for these.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            WorkerError::BrokerUnavailable(_)
                | WorkerError::Channel(_)
                | WorkerError::AckCallFailed { .. }
                | WorkerError::Amqp(_)
        )
    }

    /// Whether waiting and trying again can succeed.
    pub fn is_transient(&self) -> bool {
        self.is_connection_error()
            || matches!(
                self,
                WorkerError::PoolUnavailable { .. } | WorkerError::AcquireTimeout(_)
            )
    }
}

impl From<serde_json::Error> for WorkerError {
    fn from(err: serde_json::Error) -> Self {
        WorkerError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_errors() {
        assert!(WorkerError::BrokerUnavailable("refused".into()).is_connection_error());
        assert!(WorkerError::Channel("closed".into()).is_connection_error());
        assert!(
            WorkerError::AckCallFailed {
                delivery_tag: 7,
                message: "channel closed".into()
            }
            .is_connection_error()
        );
        assert!(!WorkerError::PoolUnavailable { generation: 1 }.is_connection_error());
        assert!(!WorkerError::Config("bad".into()).is_connection_error());
    }

    #[test]
    fn test_transient_errors() {
        assert!(WorkerError::PoolUnavailable { generation: 3 }.is_transient());
        assert!(WorkerError::AcquireTimeout(Duration::from_secs(5)).is_transient());
        assert!(!WorkerError::Shutdown.is_transient());
        assert!(!WorkerError::Serialization("eof".into()).is_transient());
    }

    #[test]
    fn test_error_display() {
        let err = WorkerError::AckCallFailed {
            delivery_tag: 42,
            message: "channel closed".into(),
        };
        assert_eq!(
            err.to_string(),
            "ACK/NACK for delivery tag 42 failed: channel closed"
        );

        let err = WorkerError::PoolUnavailable { generation: 2 };
        assert!(err.to_string().contains("generation 2"));
    }

    #[test]
    fn test_from_serde_error() {
        let parse: Result<serde_json::Value, _> = serde_json::from_str("{");
        let err: WorkerError = parse.unwrap_err().into();
        assert!(matches!(err, WorkerError::Serialization(_)));
    }
}
