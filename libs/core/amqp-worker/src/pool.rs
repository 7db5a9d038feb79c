//! Connection/channel pool
//!
//! Owns every broker connection and channel. Each successful (re)connect
//! allocates a new generation; deliveries from an older generation can no
//! longer be acknowledged because their channel is gone.
//!
//! ```text
//!  report_failure(gen) ──> invalidate ──> close old ──> backoff ──> connect
//!                                                          ^           │
//!                                                          └── error ──┤
//!                                                                      v
//!                                              generation + 1, wake waiters
//! ```

use crate::config::PoolConfig;
use crate::error::WorkerError;
use crate::metrics;
use crate::transport::{BrokerChannel, BrokerConnection, Connector};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{Notify, watch};
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, warn};

/// How `acquire` behaves while the pool has no valid generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireMode {
    /// Return `PoolUnavailable` immediately (publish paths)
    FailFast,
    /// Wait for a reconnect or a free channel (consume paths)
    Wait,
}

/// Serializable pool snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub generation: u64,
    pub valid: bool,
    pub reconnecting: bool,
    pub connections: usize,
    pub channels: usize,
    pub leased: usize,
}

struct Slot {
    connection_index: usize,
    channel: Arc<dyn BrokerChannel>,
    leased: bool,
}

struct PoolState {
    generation: u64,
    valid: bool,
    connections: Vec<Arc<dyn BrokerConnection>>,
    slots: Vec<Slot>,
}

impl PoolState {
    /// Idle open slot on the connection with the fewest leases.
    fn pick_slot(&self) -> Option<usize> {
        let mut leases = vec![0usize; self.connections.len()];
        for slot in self.slots.iter().filter(|s| s.leased) {
            leases[slot.connection_index] += 1;
        }

        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| !slot.leased && slot.channel.is_open())
            .min_by_key(|(index, slot)| (leases[slot.connection_index], *index))
            .map(|(index, _)| index)
    }

    fn take_resources(&mut self) -> Resources {
        Resources {
            channels: self.slots.drain(..).map(|slot| slot.channel).collect(),
            connections: self.connections.drain(..).collect(),
        }
    }
}

/// Channels and connections of a retired generation.
struct Resources {
    channels: Vec<Arc<dyn BrokerChannel>>,
    connections: Vec<Arc<dyn BrokerConnection>>,
}

impl Resources {
    async fn close(self) {
        for channel in self.channels {
            if let Err(e) = channel.close().await {
                debug!(error = %e, "Error closing retired channel");
            }
        }
        for connection in self.connections {
            if let Err(e) = connection.close().await {
                debug!(error = %e, "Error closing retired connection");
            }
        }
    }
}

struct PoolInner {
    connector: Arc<dyn Connector>,
    config: PoolConfig,
    state: Mutex<PoolState>,
    available: Notify,
    generation_tx: watch::Sender<u64>,
    closed_tx: watch::Sender<bool>,
    reconnecting: AtomicBool,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    fn release_slot(&self, generation: u64, slot: usize) {
        let mut state = self.lock();
        if state.generation != generation {
            return;
        }
        if let Some(slot) = state.slots.get_mut(slot) {
            slot.leased = false;
        }
        drop(state);
        self.available.notify_waiters();
    }

    /// Open every connection and channel for a new generation.
    async fn establish(&self) -> Result<u64, WorkerError> {
        let mut connections: Vec<Arc<dyn BrokerConnection>> = Vec::new();
        let mut slots = Vec::new();

        let opened = async {
            for connection_index in 0..self.config.connections {
                let connection = self.connector.connect().await?;
                connections.push(Arc::clone(&connection));
                for _ in 0..self.config.channels_per_connection {
                    let channel = connection.open_channel().await?;
                    slots.push(Slot {
                        connection_index,
                        channel,
                        leased: false,
                    });
                }
            }
            Ok::<_, WorkerError>(())
        }
        .await;

        if let Err(e) = opened {
            Resources {
                channels: slots.into_iter().map(|slot| slot.channel).collect(),
                connections,
            }
            .close()
            .await;
            return Err(e);
        }

        let generation = {
            let mut state = self.lock();
            if self.is_closed() {
                None
            } else {
                state.generation += 1;
                state.valid = true;
                state.connections = connections.clone();
                state.slots = slots;
                Some(state.generation)
            }
        };

        let Some(generation) = generation else {
            Resources {
                channels: Vec::new(),
                connections,
            }
            .close()
            .await;
            return Err(WorkerError::Shutdown);
        };

        self.generation_tx.send_replace(generation);
        self.available.notify_waiters();
        metrics::reconnected(generation);
        info!(
            connector = self.connector.name(),
            generation,
            connections = self.config.connections,
            channels = self.config.total_channels(),
            "Channel pool connected"
        );
        Ok(generation)
    }

    /// Connect with exponential backoff until success or shutdown.
    async fn connect_with_backoff(&self, immediate: bool) {
        let mut closed_rx = self.closed_tx.subscribe();
        let mut attempt: u32 = if immediate { 0 } else { 1 };

        loop {
            if attempt > 0 {
                let delay = self.config.backoff.delay_for_attempt(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "Waiting before reconnect");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = closed_rx.changed() => return,
                }
            }
            if self.is_closed() {
                return;
            }

            match self.establish().await {
                Ok(_) => return,
                Err(WorkerError::Shutdown) => return,
                Err(e) => {
                    metrics::reconnect_failed();
                    warn!(
                        connector = self.connector.name(),
                        attempt,
                        error = %e,
                        "Broker connection failed, retrying"
                    );
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }
}

/// Bounded pool of broker connections and channels.
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct ChannelPool {
    inner: Arc<PoolInner>,
}

impl ChannelPool {
    pub fn new(connector: Arc<dyn Connector>, config: PoolConfig) -> Self {
        let (generation_tx, _) = watch::channel(0);
        let (closed_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(PoolInner {
                connector,
                config,
                state: Mutex::new(PoolState {
                    generation: 0,
                    valid: false,
                    connections: Vec::new(),
                    slots: Vec::new(),
                }),
                available: Notify::new(),
                generation_tx,
                closed_tx,
                reconnecting: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Start connecting in the background.
    ///
    /// A broker that is down at boot is retried with backoff.
    pub fn start(&self) {
        self.spawn_reconnect(true);
    }

    /// Lease a channel from the current generation.
    pub async fn acquire(&self, mode: AcquireMode) -> Result<ChannelLease, WorkerError> {
        let timeout = self.inner.config.acquire_timeout;
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.inner.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let mut broken_generation = None;
            {
                let mut state = self.inner.lock();
                if self.inner.is_closed() {
                    return Err(WorkerError::Shutdown);
                }

                if state.valid {
                    let generation = state.generation;
                    if let Some(index) = state.pick_slot() {
                        let slot = &mut state.slots[index];
                        slot.leased = true;
                        return Ok(ChannelLease {
                            pool: Arc::downgrade(&self.inner),
                            generation,
                            channel_id: index,
                            channel: Arc::clone(&slot.channel),
                        });
                    }

                    // Idle slots exist but every one of them is closed
                    if state.slots.iter().any(|slot| !slot.leased) {
                        broken_generation = Some(generation);
                    }
                } else if mode == AcquireMode::FailFast {
                    return Err(WorkerError::PoolUnavailable {
                        generation: state.generation,
                    });
                }
            }

            if let Some(generation) = broken_generation {
                self.report_failure(generation, "all idle channels closed");
                if mode == AcquireMode::FailFast {
                    return Err(WorkerError::PoolUnavailable { generation });
                }
            }

            if timeout_at(deadline, notified).await.is_err() {
                return Err(WorkerError::AcquireTimeout(timeout));
            }
        }
    }

    /// Return a lease. Dropping the lease has the same effect.
    pub fn release(&self, lease: ChannelLease) {
        drop(lease);
    }

    /// Latest generation number (0 = never connected).
    pub fn current_generation(&self) -> u64 {
        self.inner.lock().generation
    }

    /// The current generation, if it is still valid.
    pub fn valid_generation(&self) -> Option<u64> {
        let state = self.inner.lock();
        state.valid.then_some(state.generation)
    }

    /// Channel `channel_id` of `generation`, if that generation is still valid.
    pub fn channel_for(&self, generation: u64, channel_id: usize) -> Option<Arc<dyn BrokerChannel>> {
        let state = self.inner.lock();
        if !state.valid || state.generation != generation {
            return None;
        }
        state
            .slots
            .get(channel_id)
            .map(|slot| Arc::clone(&slot.channel))
    }

    /// Invalidate `generation` and reconnect.
    ///
    /// Reports for an older or already invalidated generation are ignored.
    pub fn report_failure(&self, generation: u64, reason: &str) {
        let resources = {
            let mut state = self.inner.lock();
            if !state.valid || state.generation != generation {
                debug!(generation, current = state.generation, reason, "Ignoring failure report");
                return;
            }
            state.valid = false;
            state.take_resources()
        };

        warn!(generation, reason, "Channel pool generation invalidated");
        tokio::spawn(resources.close());
        self.inner.available.notify_waiters();
        self.spawn_reconnect(false);
    }

    /// Whether every connection and channel of the current generation is usable.
    pub fn is_live(&self) -> bool {
        let state = self.inner.lock();
        state.valid
            && !state.connections.is_empty()
            && state.connections.iter().all(|c| c.is_connected())
            && state.slots.iter().all(|s| s.channel.is_open())
    }

    /// Tear down the current generation (if any) and reconnect.
    pub fn force_reconnect(&self) {
        match self.valid_generation() {
            Some(generation) => self.report_failure(generation, "forced reconnect"),
            None => self.spawn_reconnect(true),
        }
    }

    /// Receiver that observes every new generation.
    pub fn subscribe_generation(&self) -> watch::Receiver<u64> {
        self.inner.generation_tx.subscribe()
    }

    /// Wait until a generation of at least `min` exists.
    pub async fn wait_for_generation(&self, min: u64) -> Result<u64, WorkerError> {
        let mut rx = self.subscribe_generation();
        loop {
            let generation = *rx.borrow_and_update();
            if generation >= min {
                return Ok(generation);
            }
            rx.changed().await.map_err(|_| WorkerError::Shutdown)?;
        }
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.inner.lock();
        PoolStatus {
            generation: state.generation,
            valid: state.valid,
            reconnecting: self.inner.reconnecting.load(Ordering::SeqCst),
            connections: state.connections.len(),
            channels: state.slots.len(),
            leased: state.slots.iter().filter(|s| s.leased).count(),
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.is_closed()
    }

    /// Close everything and stop reconnecting.
    pub async fn shutdown(&self) {
        self.inner.closed_tx.send_replace(true);
        let resources = {
            let mut state = self.inner.lock();
            state.valid = false;
            state.take_resources()
        };
        self.inner.available.notify_waiters();
        resources.close().await;
        info!("Channel pool shut down");
    }

    fn spawn_reconnect(&self, immediate: bool) {
        if self.inner.is_closed() || self.inner.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut immediate = immediate;
            loop {
                inner.connect_with_backoff(immediate).await;
                inner.reconnecting.store(false, Ordering::SeqCst);

                // A failure reported while the flag was still set would be lost
                if inner.is_closed() || inner.lock().valid {
                    break;
                }
                if inner.reconnecting.swap(true, Ordering::SeqCst) {
                    break;
                }
                immediate = false;
            }
        });
    }
}

/// A leased channel. Released back to the pool on drop.
pub struct ChannelLease {
    pool: Weak<PoolInner>,
    generation: u64,
    channel_id: usize,
    channel: Arc<dyn BrokerChannel>,
}

impl ChannelLease {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Slot of the channel inside its generation
    pub fn channel_id(&self) -> usize {
        self.channel_id
    }

    pub fn channel(&self) -> &Arc<dyn BrokerChannel> {
        &self.channel
    }
}

impl std::fmt::Debug for ChannelLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelLease")
            .field("generation", &self.generation)
            .field("channel_id", &self.channel_id)
            .finish()
    }
}

impl Drop for ChannelLease {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.release_slot(self.generation, self.channel_id);
        }
    }
}
