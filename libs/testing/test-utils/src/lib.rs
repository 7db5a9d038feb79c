//! Shared test utilities for worker testing
//!
//! This crate provides reusable test infrastructure:
//! - `TestRabbitMq`: RabbitMQ container with automatic cleanup (feature: "rabbitmq")
//! - `wait_until`: Poll a condition, works with tokio's paused clock (always available)
//! - `TestDataBuilder`: Deterministic test data generation (always available)
//! - `assertions`: Custom assertion helpers (always available)
//!
//! # Features
//!
//! - `rabbitmq` (default): Enables RabbitMQ test infrastructure
//!
//! # Usage
//!
//! ## Waiting on background tasks
//!
//! ```rust,ignore
//! use test_utils::wait_until;
//!
//! #[tokio::test(start_paused = true)]
//! async fn my_consumer_test() {
//!     // ... spawn a consumer ...
//!     assert!(wait_until(Duration::from_secs(30), || broker.acked().len() == 3).await);
//! }
//! ```
//!
//! ## RabbitMQ Testing
//!
//! ```rust,ignore
//! use test_utils::TestRabbitMq;
//!
//! #[tokio::test]
//! #[ignore = "requires Docker"]
//! async fn my_rabbitmq_test() {
//!     let rabbit = TestRabbitMq::new().await;
//!     rabbit.declare_queue("scan.requests").await;
//!     let connector = LapinConnector::new(rabbit.url());
//! }
//! ```

use std::time::Duration;
use uuid::Uuid;

#[cfg(feature = "rabbitmq")]
mod rabbitmq;

#[cfg(feature = "rabbitmq")]
pub use rabbitmq::TestRabbitMq;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Poll `condition` until it holds or `timeout` elapses.
///
/// Sleeps on tokio's clock, so under `start_paused = true` the timeout is
/// virtual and background tasks get to run between polls.
/// Returns whether the condition was met.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Builder for test data with deterministic randomization
///
/// This ensures tests are reproducible by using seeded random data.
pub struct TestDataBuilder {
    seed: u64,
}

impl TestDataBuilder {
    /// Create a new builder with a seed (for deterministic tests)
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Create from test name (generates seed from test name hash)
    ///
    /// This is the recommended way to create a builder for consistent test data.
    ///
    /// # Example
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::from_test_name("test_redelivery_cap");
    /// ```
    pub fn from_test_name(name: &str) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self::new(hasher.finish())
    }

    /// Generate a deterministic ID for testing
    pub fn id(&self) -> Uuid {
        // Use seed to generate deterministic UUID
        let bytes = self.seed.to_le_bytes();
        let mut uuid_bytes = [0u8; 16];
        uuid_bytes[..8].copy_from_slice(&bytes);
        uuid_bytes[8..16].copy_from_slice(&bytes);
        Uuid::from_bytes(uuid_bytes)
    }

    /// Generate a unique name for testing
    ///
    /// # Arguments
    ///
    /// * `prefix` - What is being named (e.g., "queue", "consumer")
    /// * `suffix` - A unique identifier within the test (e.g., "main", "retry")
    ///
    /// # Example
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::from_test_name("my_test");
    /// let queue = builder.name("queue", "main");
    /// // Returns: "test-queue-12345-main"
    /// ```
    pub fn name(&self, prefix: &str, suffix: &str) -> String {
        format!("test-{}-{}-{}", prefix, self.seed, suffix)
    }
}

/// Test assertion helpers
pub mod assertions {
    /// Assert that every item is distinct
    pub fn assert_all_unique<T: std::hash::Hash + Eq + std::fmt::Debug>(items: &[T], context: &str) {
        let mut seen = std::collections::HashSet::new();
        for item in items {
            assert!(seen.insert(item), "{}: duplicate item {:?}", context, item);
        }
    }

    /// Assert that an optional value is Some
    pub fn assert_some<T>(value: Option<T>, context: &str) -> T {
        value.unwrap_or_else(|| panic!("{}: expected Some, got None", context))
    }
}
