//! In-process broker
//!
//! Implements the transport traits with AMQP-like semantics: per-channel
//! delivery tags starting at 1, prefetch-bounded dispatch, unacknowledged
//! messages requeued as redelivered when their channel closes, and an
//! unknown delivery tag closing the channel. Used by tests and for local
//! runs without a broker.
//!
//! Publishing routes on the routing key: the message lands in the queue of
//! the same name, whatever the exchange.

use crate::delivery::IncomingDelivery;
use crate::error::WorkerError;
use crate::transport::{BrokerChannel, BrokerConnection, Connector, DeliveryStream};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

type DeliverySender = mpsc::UnboundedSender<Result<IncomingDelivery, WorkerError>>;

/// Broker-side record of an ACK, NACK or publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerCall {
    Ack {
        queue: String,
        delivery_tag: u64,
        payload: Vec<u8>,
    },
    Nack {
        queue: String,
        delivery_tag: u64,
        requeue: bool,
        payload: Vec<u8>,
    },
    Publish {
        exchange: String,
        routing_key: String,
        payload: Vec<u8>,
    },
}

#[derive(Debug, Clone)]
struct Message {
    payload: Vec<u8>,
    /// Number of previous deliveries
    deliveries: u32,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Message>,
    /// `(channel_id, consumer_tag)`
    consumers: Vec<(u64, String)>,
    next_consumer: usize,
}

struct ChannelState {
    connection: u64,
    open: bool,
    prefetch: u16,
    next_tag: u64,
    unacked: BTreeMap<u64, (String, Message)>,
    consumers: HashMap<String, (String, DeliverySender)>,
}

impl ChannelState {
    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.unacked.len() < usize::from(self.prefetch)
    }
}

struct BrokerState {
    available: bool,
    fail_acks: bool,
    connect_attempts: u64,
    next_id: u64,
    connections: HashMap<u64, bool>,
    channels: HashMap<u64, ChannelState>,
    queues: HashMap<String, QueueState>,
    calls: Vec<BrokerCall>,
    dead_letters: HashMap<String, Vec<Vec<u8>>>,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self {
            available: true,
            fail_acks: false,
            connect_attempts: 0,
            next_id: 0,
            connections: HashMap::new(),
            channels: HashMap::new(),
            queues: HashMap::new(),
            calls: Vec::new(),
            dead_letters: HashMap::new(),
        }
    }
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn channel_open(&self, channel_id: u64) -> bool {
        self.channels
            .get(&channel_id)
            .is_some_and(|channel| channel.open)
    }

    /// Hand ready messages to consumers with spare prefetch capacity.
    fn dispatch(&mut self) {
        let queue_names: Vec<String> = self.queues.keys().cloned().collect();
        for name in queue_names {
            loop {
                let Some(queue) = self.queues.get(&name) else {
                    break;
                };
                if queue.ready.is_empty() || queue.consumers.is_empty() {
                    break;
                }

                let count = queue.consumers.len();
                let start = queue.next_consumer % count;
                let candidates: Vec<(u64, String)> = (0..count)
                    .map(|offset| queue.consumers[(start + offset) % count].clone())
                    .collect();

                let target = candidates.into_iter().enumerate().find(|(_, (channel_id, _))| {
                    self.channels
                        .get(channel_id)
                        .is_some_and(|channel| channel.open && channel.has_capacity())
                });
                let Some((offset, (channel_id, tag))) = target else {
                    break;
                };

                let Some(queue) = self.queues.get_mut(&name) else {
                    break;
                };
                queue.next_consumer = (start + offset + 1) % count;
                let Some(message) = queue.ready.pop_front() else {
                    break;
                };

                let Some(channel) = self.channels.get_mut(&channel_id) else {
                    break;
                };
                channel.next_tag += 1;
                let delivery_tag = channel.next_tag;
                let delivery = IncomingDelivery {
                    delivery_tag,
                    redelivered: message.deliveries > 0,
                    delivery_count: (message.deliveries > 0).then_some(message.deliveries),
                    payload: message.payload.clone(),
                };

                let sent = channel
                    .consumers
                    .get(&tag)
                    .map(|(_, sender)| sender.send(Ok(delivery)).is_ok())
                    .unwrap_or(false);

                if sent {
                    channel.unacked.insert(delivery_tag, (name.clone(), message));
                } else {
                    // Subscriber went away
                    channel.consumers.remove(&tag);
                    if let Some(queue) = self.queues.get_mut(&name) {
                        queue.ready.push_front(message);
                        queue.consumers.retain(|(id, t)| !(*id == channel_id && *t == tag));
                    }
                }
            }
        }
    }

    fn requeue(&mut self, queue: &str, mut message: Message) {
        message.deliveries += 1;
        self.queues
            .entry(queue.to_string())
            .or_default()
            .ready
            .push_front(message);
    }

    /// Close a channel: end its subscriptions and requeue its unacked messages.
    fn close_channel(&mut self, channel_id: u64) {
        let Some(channel) = self.channels.get_mut(&channel_id) else {
            return;
        };
        if !channel.open {
            return;
        }
        channel.open = false;
        channel.consumers.clear();
        let unacked = std::mem::take(&mut channel.unacked);

        for queue in self.queues.values_mut() {
            queue.consumers.retain(|(id, _)| *id != channel_id);
        }
        for (_, (queue, message)) in unacked.into_iter().rev() {
            self.requeue(&queue, message);
        }
    }

    fn close_connection(&mut self, connection_id: u64) {
        if let Some(open) = self.connections.get_mut(&connection_id) {
            *open = false;
        }
        let channel_ids: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, channel)| channel.connection == connection_id)
            .map(|(id, _)| *id)
            .collect();
        for channel_id in channel_ids {
            self.close_channel(channel_id);
        }
    }

    fn settle(
        &mut self,
        channel_id: u64,
        delivery_tag: u64,
        requeue: Option<bool>,
    ) -> Result<(), WorkerError> {
        let failed = |message: &str| WorkerError::AckCallFailed {
            delivery_tag,
            message: message.to_string(),
        };

        if !self.channel_open(channel_id) {
            return Err(failed("channel closed"));
        }
        if self.fail_acks {
            return Err(failed("broker rejected acknowledgment"));
        }

        let settled = self
            .channels
            .get_mut(&channel_id)
            .and_then(|channel| channel.unacked.remove(&delivery_tag));
        let Some((queue, message)) = settled else {
            // PRECONDITION_FAILED closes the channel
            self.close_channel(channel_id);
            self.dispatch();
            return Err(failed("unknown delivery tag"));
        };

        match requeue {
            None => self.calls.push(BrokerCall::Ack {
                queue,
                delivery_tag,
                payload: message.payload,
            }),
            Some(requeue) => {
                self.calls.push(BrokerCall::Nack {
                    queue: queue.clone(),
                    delivery_tag,
                    requeue,
                    payload: message.payload.clone(),
                });
                if requeue {
                    self.requeue(&queue, message);
                } else {
                    self.dead_letters
                        .entry(queue)
                        .or_default()
                        .push(message.payload);
                }
            }
        }

        self.dispatch();
        Ok(())
    }
}

/// In-process broker; clones share the same state.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Put a message on a queue, as a producer would.
    pub fn enqueue(&self, queue: &str, payload: impl Into<Vec<u8>>) {
        let mut state = self.lock();
        state
            .queues
            .entry(queue.to_string())
            .or_default()
            .ready
            .push_back(Message {
                payload: payload.into(),
                deliveries: 0,
            });
        state.dispatch();
    }

    /// Refuse (or accept again) new connections.
    pub fn set_available(&self, available: bool) {
        self.lock().available = available;
    }

    /// Make every ACK/NACK call fail while set.
    pub fn set_fail_acks(&self, fail: bool) {
        self.lock().fail_acks = fail;
    }

    /// Drop every connection, as a broker restart or network partition would.
    pub fn disconnect(&self) {
        let mut state = self.lock();
        let connection_ids: Vec<u64> = state.connections.keys().copied().collect();
        for connection_id in connection_ids {
            state.close_connection(connection_id);
        }
    }

    /// Every ACK, NACK and publish so far, in order.
    pub fn calls(&self) -> Vec<BrokerCall> {
        self.lock().calls.clone()
    }

    /// Payloads that were acknowledged.
    pub fn acked(&self) -> Vec<Vec<u8>> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                BrokerCall::Ack { payload, .. } => Some(payload),
                _ => None,
            })
            .collect()
    }

    /// `(payload, requeue)` of every NACK.
    pub fn nacked(&self) -> Vec<(Vec<u8>, bool)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                BrokerCall::Nack {
                    payload, requeue, ..
                } => Some((payload, requeue)),
                _ => None,
            })
            .collect()
    }

    /// Number of ACK and NACK calls that reached the broker.
    pub fn settle_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| !matches!(call, BrokerCall::Publish { .. }))
            .count()
    }

    /// Messages waiting for a consumer.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or(0)
    }

    /// Messages delivered but not yet settled.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.lock()
            .channels
            .values()
            .flat_map(|channel| channel.unacked.values())
            .filter(|(q, _)| q == queue)
            .count()
    }

    /// Payloads rejected without requeue.
    pub fn dead_letters(&self, queue: &str) -> Vec<Vec<u8>> {
        self.lock()
            .dead_letters
            .get(queue)
            .cloned()
            .unwrap_or_default()
    }

    pub fn connect_attempts(&self) -> u64 {
        self.lock().connect_attempts
    }

    pub fn open_connections(&self) -> usize {
        self.lock().connections.values().filter(|open| **open).count()
    }

    /// Number of active `basic.consume` subscriptions on a queue.
    pub fn consumer_count(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.consumers.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Connector for InMemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, WorkerError> {
        let mut state = self.lock();
        state.connect_attempts += 1;
        if !state.available {
            return Err(WorkerError::BrokerUnavailable(
                "connection refused".to_string(),
            ));
        }
        let id = state.next_id();
        state.connections.insert(id, true);
        Ok(Arc::new(MemoryConnection {
            broker: self.clone(),
            id,
        }))
    }

    fn name(&self) -> &str {
        "in-memory"
    }
}

struct MemoryConnection {
    broker: InMemoryBroker,
    id: u64,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, WorkerError> {
        let mut state = self.broker.lock();
        if !state.connections.get(&self.id).copied().unwrap_or(false) {
            return Err(WorkerError::Channel("connection closed".to_string()));
        }
        let id = state.next_id();
        state.channels.insert(
            id,
            ChannelState {
                connection: self.id,
                open: true,
                prefetch: 0,
                next_tag: 0,
                unacked: BTreeMap::new(),
                consumers: HashMap::new(),
            },
        );
        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            id,
        }))
    }

    fn is_connected(&self) -> bool {
        self.broker
            .lock()
            .connections
            .get(&self.id)
            .copied()
            .unwrap_or(false)
    }

    async fn close(&self) -> Result<(), WorkerError> {
        let mut state = self.broker.lock();
        state.close_connection(self.id);
        state.dispatch();
        Ok(())
    }
}

struct MemoryChannel {
    broker: InMemoryBroker,
    id: u64,
}

impl MemoryChannel {
    fn closed(&self) -> WorkerError {
        WorkerError::Channel(format!("channel {} is closed", self.id))
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn qos(&self, prefetch: u16) -> Result<(), WorkerError> {
        let mut state = self.broker.lock();
        match state.channels.get_mut(&self.id) {
            Some(channel) if channel.open => {
                channel.prefetch = prefetch;
                Ok(())
            }
            _ => Err(self.closed()),
        }
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, WorkerError> {
        let mut state = self.broker.lock();
        let (tx, rx) = mpsc::unbounded_channel();
        match state.channels.get_mut(&self.id) {
            Some(channel) if channel.open => {
                channel
                    .consumers
                    .insert(consumer_tag.to_string(), (queue.to_string(), tx));
            }
            _ => return Err(self.closed()),
        }
        state
            .queues
            .entry(queue.to_string())
            .or_default()
            .consumers
            .push((self.id, consumer_tag.to_string()));
        state.dispatch();

        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), WorkerError> {
        let mut state = self.broker.lock();
        let removed = match state.channels.get_mut(&self.id) {
            Some(channel) if channel.open => channel.consumers.remove(consumer_tag),
            _ => return Err(self.closed()),
        };
        if let Some((queue_name, _)) = removed
            && let Some(queue) = state.queues.get_mut(&queue_name)
        {
            queue
                .consumers
                .retain(|(id, tag)| !(*id == self.id && tag == consumer_tag));
        }
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), WorkerError> {
        self.broker.lock().settle(self.id, delivery_tag, None)
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), WorkerError> {
        self.broker.lock().settle(self.id, delivery_tag, Some(requeue))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<(), WorkerError> {
        let mut state = self.broker.lock();
        if !state.channel_open(self.id) {
            return Err(self.closed());
        }
        state.calls.push(BrokerCall::Publish {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload: payload.to_vec(),
        });
        state
            .queues
            .entry(routing_key.to_string())
            .or_default()
            .ready
            .push_back(Message {
                payload: payload.to_vec(),
                deliveries: 0,
            });
        state.dispatch();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.broker.lock().channel_open(self.id)
    }

    async fn close(&self) -> Result<(), WorkerError> {
        let mut state = self.broker.lock();
        state.close_channel(self.id);
        state.dispatch();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn channel(broker: &InMemoryBroker) -> Arc<dyn BrokerChannel> {
        let connection = broker.connect().await.unwrap();
        connection.open_channel().await.unwrap()
    }

    #[tokio::test]
    async fn test_delivery_tags_start_at_one_per_channel() {
        let broker = InMemoryBroker::new();
        broker.enqueue("q", b"a".to_vec());
        broker.enqueue("q", b"b".to_vec());

        let first = channel(&broker).await;
        first.qos(1).await.unwrap();
        let mut first_stream = first.consume("q", "c1").await.unwrap();

        let second = channel(&broker).await;
        second.qos(1).await.unwrap();
        let mut second_stream = second.consume("q", "c2").await.unwrap();

        let a = first_stream.next().await.unwrap().unwrap();
        let b = second_stream.next().await.unwrap().unwrap();
        assert_eq!(a.delivery_tag, 1);
        assert_eq!(b.delivery_tag, 1);
        assert_eq!(a.payload, b"a");
        assert_eq!(b.payload, b"b");
    }

    #[tokio::test]
    async fn test_prefetch_limits_unacked() {
        let broker = InMemoryBroker::new();
        for i in 0..5u8 {
            broker.enqueue("q", vec![i]);
        }
        let ch = channel(&broker).await;
        ch.qos(2).await.unwrap();
        let mut stream = ch.consume("q", "c").await.unwrap();

        let d1 = stream.next().await.unwrap().unwrap();
        let _d2 = stream.next().await.unwrap().unwrap();
        assert_eq!(broker.unacked_count("q"), 2);
        assert_eq!(broker.queue_depth("q"), 3);

        ch.ack(d1.delivery_tag).await.unwrap();
        let d3 = stream.next().await.unwrap().unwrap();
        assert_eq!(d3.delivery_tag, 3);
        assert_eq!(broker.queue_depth("q"), 2);
    }

    #[tokio::test]
    async fn test_nack_requeue_redelivers_with_count() {
        let broker = InMemoryBroker::new();
        broker.enqueue("q", b"job".to_vec());
        let ch = channel(&broker).await;
        let mut stream = ch.consume("q", "c").await.unwrap();

        let first = stream.next().await.unwrap().unwrap();
        assert!(!first.redelivered);
        ch.nack(first.delivery_tag, true).await.unwrap();

        let second = stream.next().await.unwrap().unwrap();
        assert!(second.redelivered);
        assert_eq!(second.delivery_count, Some(1));
        assert_eq!(second.delivery_tag, 2);
        assert_eq!(broker.nacked(), vec![(b"job".to_vec(), true)]);
    }

    #[tokio::test]
    async fn test_nack_without_requeue_dead_letters() {
        let broker = InMemoryBroker::new();
        broker.enqueue("q", b"poison".to_vec());
        let ch = channel(&broker).await;
        let mut stream = ch.consume("q", "c").await.unwrap();

        let d = stream.next().await.unwrap().unwrap();
        ch.nack(d.delivery_tag, false).await.unwrap();

        assert_eq!(broker.dead_letters("q"), vec![b"poison".to_vec()]);
        assert_eq!(broker.queue_depth("q"), 0);
        assert_eq!(broker.unacked_count("q"), 0);
    }

    #[tokio::test]
    async fn test_unknown_tag_closes_channel() {
        let broker = InMemoryBroker::new();
        let ch = channel(&broker).await;

        let err = ch.ack(99).await.unwrap_err();
        assert!(matches!(err, WorkerError::AckCallFailed { delivery_tag: 99, .. }));
        assert!(!ch.is_open());
    }

    #[tokio::test]
    async fn test_disconnect_requeues_unacked_and_ends_streams() {
        let broker = InMemoryBroker::new();
        broker.enqueue("q", b"job".to_vec());
        let ch = channel(&broker).await;
        let mut stream = ch.consume("q", "c").await.unwrap();
        let d = stream.next().await.unwrap().unwrap();

        broker.disconnect();
        assert!(stream.next().await.is_none());
        assert_eq!(broker.queue_depth("q"), 1);
        assert_eq!(broker.open_connections(), 0);

        // Old tag cannot be acknowledged anymore
        assert!(ch.ack(d.delivery_tag).await.is_err());
        assert!(broker.acked().is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_broker_refuses_connections() {
        let broker = InMemoryBroker::new();
        broker.set_available(false);
        assert!(matches!(
            broker.connect().await,
            Err(WorkerError::BrokerUnavailable(_))
        ));
        assert_eq!(broker.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_publish_routes_to_queue() {
        let broker = InMemoryBroker::new();
        let ch = channel(&broker).await;
        ch.publish("scans", "scan.requested", b"{}").await.unwrap();

        assert_eq!(broker.queue_depth("scan.requested"), 1);
        assert!(matches!(
            broker.calls().as_slice(),
            [BrokerCall::Publish { exchange, .. }] if exchange == "scans"
        ));
    }

    #[tokio::test]
    async fn test_cancel_stops_dispatch() {
        let broker = InMemoryBroker::new();
        let ch = channel(&broker).await;
        let mut stream = ch.consume("q", "c").await.unwrap();
        assert_eq!(broker.consumer_count("q"), 1);

        ch.cancel("c").await.unwrap();
        assert_eq!(broker.consumer_count("q"), 0);
        assert!(stream.next().await.is_none());

        broker.enqueue("q", b"later".to_vec());
        assert_eq!(broker.queue_depth("q"), 1);
    }
}
