//! Broker state shared by every connection of one [`MemoryBroker`].
//!
//! Queues hold ready messages in FIFO order and dispatch them round-robin to
//! their consumers, never handing a consumer more than its prefetch of
//! unacknowledged deliveries. Exchanges are not modelled: a dead-lettered
//! message is routed to the queue named by the dead-letter routing key (or
//! the source queue's name when none was given), if that queue exists.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::common::{BackendError, ConsumeError, Credentials, QueueSpec};
use crate::message::{DeliveryTag, MessageProperties, RawDelivery};

use super::backend::MemoryBackend;

pub(crate) type DeliverySender = mpsc::UnboundedSender<Result<RawDelivery, ConsumeError>>;

#[derive(Clone, Debug)]
struct Stored {
    /// Publish order; requeued messages go back to their old position.
    sequence: u64,
    payload: Vec<u8>,
    properties: MessageProperties,
    redelivered: bool,
}

struct Consumer {
    channel: u64,
    tag: String,
    prefetch: u16,
    sender: DeliverySender,
}

struct QueueState {
    spec: QueueSpec,
    ready: VecDeque<Stored>,
    consumers: Vec<Consumer>,
    next_consumer: usize,
}

struct Unacked {
    queue: String,
    consumer_tag: String,
    message: Stored,
}

struct ChannelState {
    connection: u64,
    open: bool,
    next_tag: u64,
    unacked: HashMap<u64, Unacked>,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    channels: HashMap<u64, ChannelState>,
    connections: HashMap<u64, bool>,
    next_id: u64,
    unreachable: bool,
    credentials: Option<Credentials>,
    confirm_delay: Duration,
    connect_attempts: Vec<Instant>,
}

/// An in-process broker. Clones share the same state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

fn lock(state: &Mutex<BrokerState>) -> MutexGuard<'_, BrokerState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

impl BrokerState {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn channel_open(&self, channel: u64) -> bool {
        self.channels.get(&channel).is_some_and(|state| {
            state.open && self.connections.get(&state.connection).copied().unwrap_or(false)
        })
    }

    fn in_flight(&self, channel: u64, consumer_tag: &str) -> usize {
        self.channels.get(&channel).map_or(0, |state| {
            state
                .unacked
                .values()
                .filter(|entry| entry.consumer_tag == consumer_tag)
                .count()
        })
    }

    /// Hands ready messages of `queue` to consumers with spare prefetch.
    fn dispatch(&mut self, queue: &str) {
        loop {
            let Some(state) = self.queues.get(queue) else {
                return;
            };
            if state.ready.is_empty() || state.consumers.is_empty() {
                return;
            }

            let count = state.consumers.len();
            let start = state.next_consumer % count;
            let target = (0..count).map(|offset| (start + offset) % count).find(|&index| {
                let consumer = &state.consumers[index];
                self.in_flight(consumer.channel, &consumer.tag) < usize::from(consumer.prefetch)
            });
            let Some(index) = target else {
                return;
            };

            let Some(state) = self.queues.get_mut(queue) else {
                return;
            };
            state.next_consumer = index + 1;
            let Some(message) = state.ready.pop_front() else {
                return;
            };
            let consumer = &state.consumers[index];
            let channel_id = consumer.channel;
            let consumer_tag = consumer.tag.clone();
            let sender = consumer.sender.clone();

            let Some(channel) = self.channels.get_mut(&channel_id) else {
                return;
            };
            channel.next_tag += 1;
            let tag = channel.next_tag;
            let delivery = RawDelivery {
                delivery_tag: DeliveryTag(tag),
                redelivered: message.redelivered,
                payload: message.payload.clone(),
                properties: message.properties.clone(),
            };

            if sender.send(Ok(delivery)).is_err() {
                // Receiver gone: forget the consumer, keep the message.
                channel.next_tag -= 1;
                if let Some(state) = self.queues.get_mut(queue) {
                    state.ready.push_front(message);
                    state.consumers.retain(|c| c.tag != consumer_tag);
                }
                continue;
            }

            trace!(queue, delivery_tag = tag, consumer_tag = %consumer_tag, "dispatched");
            channel.unacked.insert(
                tag,
                Unacked {
                    queue: queue.to_string(),
                    consumer_tag,
                    message,
                },
            );
        }
    }

    /// Returns unacked deliveries to their queues, in publish order.
    fn requeue(&mut self, entries: Vec<Unacked>) {
        let mut touched = Vec::new();
        for entry in entries {
            if let Some(queue) = self.queues.get_mut(&entry.queue) {
                let mut message = entry.message;
                message.redelivered = true;
                let position = queue
                    .ready
                    .iter()
                    .position(|m| m.sequence > message.sequence)
                    .unwrap_or(queue.ready.len());
                queue.ready.insert(position, message);
            }
            if !touched.contains(&entry.queue) {
                touched.push(entry.queue);
            }
        }
        for queue in touched {
            self.dispatch(&queue);
        }
    }

    /// Closes a channel: its consumers go away and unacked messages return.
    fn close_channel(&mut self, channel: u64, reason: Option<&str>) {
        for queue in self.queues.values_mut() {
            queue.consumers.retain(|consumer| {
                if consumer.channel != channel {
                    return true;
                }
                if let Some(reason) = reason {
                    let _ = consumer
                        .sender
                        .send(Err(ConsumeError::ChannelClosed(reason.to_string())));
                }
                false
            });
        }
        let entries = match self.channels.get_mut(&channel) {
            Some(state) => {
                state.open = false;
                state.unacked.drain().map(|(_, entry)| entry).collect()
            }
            None => Vec::new(),
        };
        self.requeue(entries);
    }

    fn close_connection(&mut self, connection: u64, reason: Option<&str>) {
        self.connections.insert(connection, false);
        let channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, state)| state.connection == connection && state.open)
            .map(|(id, _)| *id)
            .collect();
        for channel in channels {
            self.close_channel(channel, reason);
        }
    }

    fn take_unacked(&mut self, channel: u64, tag: DeliveryTag) -> Result<Unacked, BackendError> {
        if !self.channel_open(channel) {
            return Err(BackendError::ChannelClosed("channel is closed".to_string()));
        }
        let entry = self
            .channels
            .get_mut(&channel)
            .and_then(|state| state.unacked.remove(&tag.0));
        match entry {
            Some(entry) => Ok(entry),
            None => {
                // A broker closes the channel on an unknown delivery tag.
                let reason = format!("PRECONDITION_FAILED - unknown delivery tag {}", tag.0);
                self.close_channel(channel, Some(&reason));
                Err(BackendError::ChannelClosed(reason))
            }
        }
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend whose connections all talk to this broker.
    pub fn backend(&self) -> MemoryBackend {
        MemoryBackend::new(self.clone())
    }

    /// While set, every connection attempt fails as unreachable.
    pub fn set_unreachable(&self, unreachable: bool) {
        lock(&self.state).unreachable = unreachable;
    }

    /// Only these credentials are accepted from now on.
    pub fn require_credentials(&self, credentials: Credentials) {
        lock(&self.state).credentials = Some(credentials);
    }

    /// Delays every publisher confirm by `delay`.
    pub fn set_confirm_delay(&self, delay: Duration) {
        lock(&self.state).confirm_delay = delay;
    }

    /// When each connection attempt was made.
    pub fn connect_attempts(&self) -> Vec<Instant> {
        lock(&self.state).connect_attempts.clone()
    }

    /// Kills every open connection, as a broker restart would.
    pub fn drop_connections(&self) {
        let mut state = lock(&self.state);
        let open: Vec<u64> = state
            .connections
            .iter()
            .filter(|(_, open)| **open)
            .map(|(id, _)| *id)
            .collect();
        debug!(connections = open.len(), "dropping all connections");
        for connection in open {
            state.close_connection(connection, Some("CONNECTION_FORCED - broker shutdown"));
        }
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        lock(&self.state).queues.contains_key(queue)
    }

    /// Messages ready for delivery (not handed to any consumer).
    pub fn ready_count(&self, queue: &str) -> usize {
        lock(&self.state)
            .queues
            .get(queue)
            .map_or(0, |state| state.ready.len())
    }

    /// Messages delivered and not yet acked or nacked.
    pub fn unacked_count(&self, queue: &str) -> usize {
        lock(&self.state)
            .channels
            .values()
            .flat_map(|channel| channel.unacked.values())
            .filter(|entry| entry.queue == queue)
            .count()
    }

    /// Channels currently open, across all connections.
    pub fn open_channels(&self) -> usize {
        let state = lock(&self.state);
        state
            .channels
            .keys()
            .filter(|channel| state.channel_open(**channel))
            .count()
    }

    /// Payloads of the ready messages, head first.
    pub fn ready_payloads(&self, queue: &str) -> Vec<Vec<u8>> {
        lock(&self.state).queues.get(queue).map_or_else(Vec::new, |state| {
            state.ready.iter().map(|m| m.payload.clone()).collect()
        })
    }

    pub(crate) fn open_connection(&self, credentials: &Credentials) -> Result<u64, BackendError> {
        let mut state = lock(&self.state);
        state.connect_attempts.push(Instant::now());
        if state.unreachable {
            return Err(BackendError::Unreachable("connection refused".to_string()));
        }
        if let Some(expected) = &state.credentials {
            if expected.username != credentials.username || expected.password != credentials.password {
                return Err(BackendError::Rejected(format!(
                    "ACCESS_REFUSED - login refused for user '{}'",
                    credentials.username
                )));
            }
        }
        let id = state.allocate_id();
        state.connections.insert(id, true);
        Ok(id)
    }

    pub(crate) fn connection_open(&self, connection: u64) -> bool {
        lock(&self.state)
            .connections
            .get(&connection)
            .copied()
            .unwrap_or(false)
    }

    pub(crate) fn close_connection(&self, connection: u64) -> Result<(), BackendError> {
        let mut state = lock(&self.state);
        if !state.connections.get(&connection).copied().unwrap_or(false) {
            return Err(BackendError::ChannelClosed("connection already closed".to_string()));
        }
        state.close_connection(connection, None);
        Ok(())
    }

    pub(crate) fn open_channel(&self, connection: u64) -> Result<u64, BackendError> {
        let mut state = lock(&self.state);
        if !state.connections.get(&connection).copied().unwrap_or(false) {
            return Err(BackendError::ChannelClosed("connection is closed".to_string()));
        }
        let id = state.allocate_id();
        state.channels.insert(
            id,
            ChannelState {
                connection,
                open: true,
                next_tag: 0,
                unacked: HashMap::new(),
            },
        );
        Ok(id)
    }

    pub(crate) fn channel_open(&self, channel: u64) -> bool {
        lock(&self.state).channel_open(channel)
    }

    pub(crate) fn close_channel(&self, channel: u64) {
        lock(&self.state).close_channel(channel, None);
    }

    pub(crate) fn declare(&self, channel: u64, spec: &QueueSpec) -> Result<(), BackendError> {
        let mut state = lock(&self.state);
        if !state.channel_open(channel) {
            return Err(BackendError::ChannelClosed("channel is closed".to_string()));
        }
        if let Some(existing) = state.queues.get(&spec.name) {
            if existing.spec.durable != spec.durable {
                return Err(BackendError::PreconditionFailed(format!(
                    "PRECONDITION_FAILED - inequivalent arg 'durable' for queue '{}': received '{}' but current is '{}'",
                    spec.name, spec.durable, existing.spec.durable
                )));
            }
            return Ok(());
        }
        state.queues.insert(
            spec.name.clone(),
            QueueState {
                spec: spec.clone(),
                ready: VecDeque::new(),
                consumers: Vec::new(),
                next_consumer: 0,
            },
        );
        Ok(())
    }

    pub(crate) fn confirm_delay(&self) -> Duration {
        lock(&self.state).confirm_delay
    }

    pub(crate) fn publish(
        &self,
        channel: u64,
        queue: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), BackendError> {
        let mut state = lock(&self.state);
        if !state.channel_open(channel) {
            return Err(BackendError::ChannelClosed("channel is closed".to_string()));
        }
        if !state.queues.contains_key(queue) {
            return Err(BackendError::Rejected(format!("NO_ROUTE - no queue '{}'", queue)));
        }
        let sequence = state.allocate_id();
        let Some(target) = state.queues.get_mut(queue) else {
            return Ok(());
        };
        target.ready.push_back(Stored {
            sequence,
            payload: payload.to_vec(),
            properties: properties.clone(),
            redelivered: false,
        });
        state.dispatch(queue);
        Ok(())
    }

    pub(crate) fn consume(
        &self,
        channel: u64,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
        sender: DeliverySender,
    ) -> Result<(), BackendError> {
        let mut state = lock(&self.state);
        if !state.channel_open(channel) {
            return Err(BackendError::ChannelClosed("channel is closed".to_string()));
        }
        let Some(target) = state.queues.get_mut(queue) else {
            return Err(BackendError::Rejected(format!("NOT_FOUND - no queue '{}'", queue)));
        };
        target.consumers.push(Consumer {
            channel,
            tag: consumer_tag.to_string(),
            prefetch: prefetch.max(1),
            sender,
        });
        state.dispatch(queue);
        Ok(())
    }

    pub(crate) fn cancel(&self, channel: u64, consumer_tag: &str) -> Result<(), BackendError> {
        let mut state = lock(&self.state);
        if !state.channel_open(channel) {
            return Err(BackendError::ChannelClosed("channel is closed".to_string()));
        }
        for queue in state.queues.values_mut() {
            queue
                .consumers
                .retain(|c| !(c.channel == channel && c.tag == consumer_tag));
        }
        Ok(())
    }

    pub(crate) fn ack(&self, channel: u64, tag: DeliveryTag) -> Result<(), BackendError> {
        let mut state = lock(&self.state);
        let entry = state.take_unacked(channel, tag)?;
        state.dispatch(&entry.queue);
        Ok(())
    }

    pub(crate) fn nack(&self, channel: u64, tag: DeliveryTag, requeue: bool) -> Result<(), BackendError> {
        let mut state = lock(&self.state);
        let entry = state.take_unacked(channel, tag)?;
        if requeue {
            state.requeue(vec![entry]);
            return Ok(());
        }

        let source = entry.queue.clone();
        let route = state.queues.get(&source).and_then(|queue| {
            queue.spec.dead_letter_exchange.as_ref().map(|_| {
                queue
                    .spec
                    .dead_letter_routing_key
                    .clone()
                    .unwrap_or_else(|| source.clone())
            })
        });
        match route {
            Some(target) if state.queues.contains_key(&target) => {
                debug!(from = %source, to = %target, "dead-lettering message");
                let sequence = state.allocate_id();
                if let Some(queue) = state.queues.get_mut(&target) {
                    let mut message = entry.message;
                    message.sequence = sequence;
                    message.redelivered = false;
                    queue.ready.push_back(message);
                }
                state.dispatch(&target);
            }
            _ => debug!(queue = %source, "discarding rejected message"),
        }
        state.dispatch(&source);
        Ok(())
    }
}
