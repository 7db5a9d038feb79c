//! Delivery tag registry
//!
//! In-process table of open (not yet acknowledged) deliveries keyed by
//! [`CorrelationId`]. Every mutation happens under one mutex, and
//! [`DeliveryRegistry::deregister`] hands back the removed record so exactly
//! one caller can claim an entry.

use crate::delivery::CorrelationId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Metadata captured by the consumer when a delivery arrives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDelivery {
    pub queue: String,
    pub delivery_tag: u64,
    pub generation: u64,
    pub channel_id: usize,
    pub redelivery_count: u32,
}

/// One open delivery.
#[derive(Debug, Clone)]
pub struct DeliveryRecord {
    pub correlation_id: CorrelationId,
    pub queue: String,

    /// Broker tag, only meaningful on `channel_id` of `generation`
    pub delivery_tag: u64,
    pub generation: u64,
    pub channel_id: usize,
    pub redelivery_count: u32,

    /// Monotonic receipt time used for staleness
    pub received_at: Instant,

    /// Wall-clock receipt time for reporting
    pub received_at_utc: DateTime<Utc>,
}

impl DeliveryRecord {
    /// How long the delivery has been open
    pub fn age(&self) -> Duration {
        self.received_at.elapsed()
    }
}

/// Serializable view of an open delivery for the admin endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct DeliverySnapshot {
    pub correlation_id: CorrelationId,
    pub queue: String,
    pub delivery_tag: u64,
    pub generation: u64,
    pub channel_id: usize,
    pub redelivery_count: u32,
    pub received_at: DateTime<Utc>,
    pub age_ms: u64,
}

impl From<&DeliveryRecord> for DeliverySnapshot {
    fn from(record: &DeliveryRecord) -> Self {
        Self {
            correlation_id: record.correlation_id.clone(),
            queue: record.queue.clone(),
            delivery_tag: record.delivery_tag,
            generation: record.generation,
            channel_id: record.channel_id,
            redelivery_count: record.redelivery_count,
            received_at: record.received_at_utc,
            age_ms: record.age().as_millis() as u64,
        }
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    next_sequence: u64,
    open: HashMap<CorrelationId, DeliveryRecord>,
}

/// Table of open deliveries.
#[derive(Debug)]
pub struct DeliveryRegistry {
    instance: String,
    state: Mutex<RegistryState>,
}

impl DeliveryRegistry {
    /// Create a registry with a random per-process instance prefix.
    pub fn new() -> Self {
        let mut instance = Uuid::new_v4().simple().to_string();
        instance.truncate(8);
        Self::with_instance(instance)
    }

    /// Create a registry with a fixed instance prefix.
    pub fn with_instance(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Instance prefix embedded in every correlation ID
    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Record a new open delivery and allocate its correlation ID.
    ///
    /// Sequences are never reused, so IDs stay unique even though broker
    /// delivery tags restart at 1 on every channel.
    pub fn register(&self, delivery: NewDelivery) -> CorrelationId {
        let mut state = self.lock();
        state.next_sequence += 1;
        let id = CorrelationId::new(&self.instance, delivery.generation, state.next_sequence);

        let record = DeliveryRecord {
            correlation_id: id.clone(),
            queue: delivery.queue,
            delivery_tag: delivery.delivery_tag,
            generation: delivery.generation,
            channel_id: delivery.channel_id,
            redelivery_count: delivery.redelivery_count,
            received_at: Instant::now(),
            received_at_utc: Utc::now(),
        };
        state.open.insert(id.clone(), record);
        id
    }

    /// Look up an open delivery.
    pub fn lookup(&self, id: &CorrelationId) -> Option<DeliveryRecord> {
        self.lock().open.get(id).cloned()
    }

    /// Remove an open delivery and return it. Only one caller gets `Some`.
    pub fn deregister(&self, id: &CorrelationId) -> Option<DeliveryRecord> {
        self.lock().open.remove(id)
    }

    /// IDs of deliveries open for at least `max_age`, oldest first.
    ///
    /// Entries are not removed; callers resolve them.
    pub fn sweep_stale(&self, max_age: Duration) -> Vec<CorrelationId> {
        let now = Instant::now();
        let state = self.lock();

        let mut stale: Vec<_> = state
            .open
            .values()
            .filter(|record| now.saturating_duration_since(record.received_at) >= max_age)
            .map(|record| (record.received_at, record.correlation_id.clone()))
            .collect();
        stale.sort();

        stale.into_iter().map(|(_, id)| id).collect()
    }

    pub fn open_count(&self) -> usize {
        self.lock().open.len()
    }

    pub fn open_count_for_queue(&self, queue: &str) -> usize {
        self.lock()
            .open
            .values()
            .filter(|record| record.queue == queue)
            .count()
    }

    pub fn open_ids(&self) -> Vec<CorrelationId> {
        let mut ids: Vec<_> = self.lock().open.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Snapshot of all open deliveries, oldest first.
    pub fn snapshot(&self) -> Vec<DeliverySnapshot> {
        let state = self.lock();
        let mut records: Vec<_> = state.open.values().collect();
        records.sort_by_key(|record| record.received_at);
        records.into_iter().map(DeliverySnapshot::from).collect()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for DeliveryRegistry {
    fn default() -> Self {
        Self::new()
    }
}
