//! In-process broker for tests and single-process dry runs.
//!
//! [`MemoryBroker`] implements the [`Broker`] capability set with plain
//! queues behind a mutex. It routes by exchange binding with topic-style
//! patterns, hands out deliveries whose acknowledgments are recorded, and
//! can be told to misbehave:
//!
//! - refuse connections, channels or confirm mode
//! - nack publishes whose body contains a marker
//! - close a given channel on its k-th publish
//! - never confirm at all
//!
//! Channels behave like the real client's: a delivery can only be settled
//! on the channel it came from while that channel is open, closing a channel
//! (or dropping its last handle) requeues every delivery it never settled,
//! and a `no_local` consumer never receives what its own connection
//! published.
//!
//! ## Example
//!
//! ```
//! use amqp_tools::memory::MemoryBroker;
//!
//! let broker = MemoryBroker::new();
//! broker.declare("order-q");
//! broker.push("order-q", "first");
//! broker.push("order-q", "second");
//! assert_eq!(broker.queue_len("order-q"), 2);
//! ```

use async_trait::async_trait;
use futures::future::{self, FutureExt};
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::debug;

use crate::binding::QueueBinding;
use crate::broker::{
    Acknowledger, Broker, BrokerChannel, BrokerConnection, BrokerError, CloseHandle,
    CloseNotifier, Confirmation, ConsumeOptions, Delivery, DeliveryStream, PendingConfirm,
    PublishFlags, QueueOptions,
};
use crate::properties::{MessageProperties, OutboundMessage};

/// A message sitting in a queue.
#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    properties: MessageProperties,
    body: Vec<u8>,
    redelivered: bool,
    /// Connection that published it, if any
    publisher: Option<usize>,
}

struct ConsumerSink {
    tag: String,
    channel: usize,
    connection: usize,
    exclusive: bool,
    no_local: bool,
    sender: mpsc::UnboundedSender<Delivery>,
}

impl ConsumerSink {
    fn accepts(&self, message: &StoredMessage) -> bool {
        !(self.no_local && message.publisher == Some(self.connection))
    }
}

#[derive(Default)]
struct QueueState {
    messages: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerSink>,
    next_consumer: usize,
}

struct ChannelState {
    close: CloseHandle,
    confirm_mode: bool,
    publishes: usize,
    /// delivery tag -> (queue, message) handed out and not yet settled
    unacked: BTreeMap<u64, (String, StoredMessage)>,
}

/// A message accepted by `basic.publish`.
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub flags: PublishFlags,
    pub message: OutboundMessage,
}

/// A consumer registration as the broker saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerRecord {
    pub queue: String,
    pub tag: String,
    pub options: ConsumeOptions,
}

#[derive(Default)]
struct Faults {
    connect: Option<String>,
    open_channel: Option<String>,
    qos: Option<String>,
    confirm_select: Option<String>,
    nack_marker: Option<Vec<u8>>,
    /// channel index -> publish number that closes it
    channel_fault: HashMap<usize, usize>,
    hang_confirms: bool,
}

#[derive(Default)]
struct State {
    queues: HashMap<String, QueueState>,
    bindings: Vec<QueueBinding>,
    declared: Vec<(String, QueueOptions)>,
    consumers: Vec<ConsumerRecord>,
    published: Vec<PublishedMessage>,
    prefetch: Vec<u16>,
    connections: Vec<CloseHandle>,
    channels: Vec<ChannelState>,
    faults: Faults,
    next_delivery_tag: u64,
    generated_queues: usize,
    acked: usize,
    rejected: usize,
    requeued: usize,
}

impl State {
    fn next_tag(&mut self) -> u64 {
        self.next_delivery_tag += 1;
        self.next_delivery_tag
    }

    fn queue_names_for(&self, exchange: &str, routing_key: &str) -> Vec<String> {
        if exchange.is_empty() {
            return if self.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            };
        }

        let mut names: Vec<String> = Vec::new();
        for binding in &self.bindings {
            if binding.exchange() == exchange
                && topic_matches(binding.routing_key(), routing_key)
                && !names.iter().any(|n| n == binding.queue_name())
            {
                names.push(binding.queue_name().to_string());
            }
        }
        names
    }
}

/// In-memory [`Broker`].
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }

    /// Create a queue if it does not exist yet.
    pub fn declare(&self, queue: &str) {
        self.lock().queues.entry(queue.to_string()).or_default();
    }

    /// Place a message directly on a queue.
    pub fn push(&self, queue: &str, body: impl Into<Vec<u8>>) {
        self.push_message(queue, MessageProperties::default(), body);
    }

    pub fn push_message(
        &self,
        queue: &str,
        properties: MessageProperties,
        body: impl Into<Vec<u8>>,
    ) {
        let message = StoredMessage {
            exchange: String::new(),
            routing_key: queue.to_string(),
            properties,
            body: body.into(),
            redelivered: false,
            publisher: None,
        };
        let state = self.state.clone();
        enqueue(&state, &mut self.lock(), queue, message, false);
    }

    /// Route a message as if a client had published it, without confirms.
    pub fn route(&self, exchange: &str, routing_key: &str, body: impl Into<Vec<u8>>) -> usize {
        self.route_message(exchange, routing_key, MessageProperties::default(), body)
    }

    /// [`MemoryBroker::route`] with explicit properties. Returns the number
    /// of queues the message reached.
    pub fn route_message(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: MessageProperties,
        body: impl Into<Vec<u8>>,
    ) -> usize {
        let message = StoredMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            properties,
            body: body.into(),
            redelivered: false,
            publisher: None,
        };
        let state = self.state.clone();
        let mut guard = self.lock();
        let targets = guard.queue_names_for(exchange, routing_key);
        for queue in &targets {
            enqueue(&state, &mut guard, queue, message.clone(), false);
        }
        targets.len()
    }

    pub fn queue_len(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.messages.len())
            .unwrap_or(0)
    }

    pub fn acked(&self) -> usize {
        self.lock().acked
    }

    pub fn rejected(&self) -> usize {
        self.lock().rejected
    }

    pub fn requeued(&self) -> usize {
        self.lock().requeued
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.clone()
    }

    pub fn prefetch_values(&self) -> Vec<u16> {
        self.lock().prefetch.clone()
    }

    pub fn consumers(&self) -> Vec<ConsumerRecord> {
        self.lock().consumers.clone()
    }

    pub fn bindings(&self) -> Vec<QueueBinding> {
        self.lock().bindings.clone()
    }

    pub fn declared(&self) -> Vec<(String, QueueOptions)> {
        self.lock().declared.clone()
    }

    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn channel_count(&self) -> usize {
        self.lock().channels.len()
    }

    /// Channels neither closed by a fault, by the client, nor by dropping
    /// their last handle.
    pub fn open_channels(&self) -> usize {
        self.lock()
            .channels
            .iter()
            .filter(|c| !c.close.is_closed())
            .count()
    }

    pub fn fail_connect(&self, reason: &str) {
        self.lock().faults.connect = Some(reason.to_string());
    }

    pub fn fail_open_channel(&self, reason: &str) {
        self.lock().faults.open_channel = Some(reason.to_string());
    }

    pub fn fail_qos(&self, reason: &str) {
        self.lock().faults.qos = Some(reason.to_string());
    }

    pub fn fail_confirm_select(&self, reason: &str) {
        self.lock().faults.confirm_select = Some(reason.to_string());
    }

    /// Nack every publish whose body contains `marker`.
    pub fn nack_bodies_containing(&self, marker: &str) {
        self.lock().faults.nack_marker = Some(marker.as_bytes().to_vec());
    }

    /// Close channel `index` (in open order) on its `publish`-th publish,
    /// leaving that publish unconfirmed.
    pub fn fault_channel_after(&self, index: usize, publish: usize) {
        self.lock().faults.channel_fault.insert(index, publish);
    }

    /// Accept publishes but never confirm them.
    pub fn hang_confirms(&self) {
        self.lock().faults.hang_confirms = true;
    }

    /// Close every open channel, as a broker-side channel error would.
    pub fn close_channels(&self, reason: &str) {
        let mut state = self.lock();
        for index in 0..state.channels.len() {
            close_channel(&self.state, &mut state, index, reason);
        }
    }

    /// Drop every connection, closing their channels with it.
    pub fn close_connections(&self, reason: &str) {
        let mut state = self.lock();
        for connection in &state.connections {
            connection.close(reason);
        }
        for index in 0..state.channels.len() {
            close_channel(&self.state, &mut state, index, reason);
        }
    }
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Mark channel `index` closed, end its consumer streams and requeue every
/// delivery it handed out without settling.
fn close_channel(shared: &Arc<Mutex<State>>, state: &mut State, index: usize, reason: &str) {
    let unacked = match state.channels.get_mut(index) {
        Some(channel) => {
            channel.close.close(reason);
            std::mem::take(&mut channel.unacked)
        }
        None => return,
    };
    // Dropping the senders ends the consumer streams.
    for queue in state.queues.values_mut() {
        queue.consumers.retain(|c| c.channel != index);
    }
    for (_, (queue, mut message)) in unacked.into_iter().rev() {
        message.redelivered = true;
        enqueue(shared, state, &queue, message, true);
    }
}

/// Hand a message to the next live consumer of `queue` that accepts it, or
/// store it.
fn enqueue(
    shared: &Arc<Mutex<State>>,
    state: &mut State,
    queue: &str,
    message: StoredMessage,
    front: bool,
) {
    let tag = state.next_tag();
    let Some(queue_state) = state.queues.get_mut(queue) else {
        debug!(queue = %queue, "Dropping message for unknown queue");
        return;
    };

    let mut skipped = 0;
    while skipped < queue_state.consumers.len() {
        let slot = queue_state.next_consumer % queue_state.consumers.len();
        let consumer = &queue_state.consumers[slot];
        if !consumer.accepts(&message) {
            queue_state.next_consumer = slot + 1;
            skipped += 1;
            continue;
        }

        let channel = consumer.channel;
        let delivery = build_delivery(shared, queue, channel, tag, message.clone());
        if consumer.sender.send(delivery).is_ok() {
            queue_state.next_consumer = slot + 1;
            if let Some(channel) = state.channels.get_mut(channel) {
                channel.unacked.insert(tag, (queue.to_string(), message));
            }
            return;
        }
        let gone = queue_state.consumers.remove(slot);
        debug!(queue = %queue, consumer = %gone.tag, "Removing dropped consumer");
    }

    if front {
        queue_state.messages.push_front(message);
    } else {
        queue_state.messages.push_back(message);
    }
}

fn build_delivery(
    shared: &Arc<Mutex<State>>,
    queue: &str,
    channel: usize,
    tag: u64,
    message: StoredMessage,
) -> Delivery {
    let acker = MemoryAcker {
        state: shared.clone(),
        channel,
        tag,
        queue: queue.to_string(),
        message: message.clone(),
    };
    Delivery::new(
        tag,
        message.exchange,
        message.routing_key,
        message.redelivered,
        message.properties,
        message.body,
        Box::new(acker),
    )
}

/// Topic matching: `*` is one word, `#` is zero or more words.
fn topic_matches(pattern: &str, key: &str) -> bool {
    fn walk(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                walk(&pattern[1..], key) || (!key.is_empty() && walk(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => walk(&pattern[1..], &key[1..]),
            (Some(p), Some(k)) if p == k => walk(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = if key.is_empty() {
        Vec::new()
    } else {
        key.split('.').collect()
    };
    walk(&pattern, &key)
}

struct MemoryAcker {
    state: Arc<Mutex<State>>,
    channel: usize,
    tag: u64,
    queue: String,
    message: StoredMessage,
}

impl MemoryAcker {
    /// Take the delivery off its channel's unsettled set.
    fn release(&self, state: &mut State) -> Result<(), BrokerError> {
        let channel = state
            .channels
            .get_mut(self.channel)
            .filter(|c| !c.close.is_closed())
            .ok_or_else(|| BrokerError::Closed(format!("channel {} closed", self.channel)))?;
        channel.unacked.remove(&self.tag);
        Ok(())
    }

    fn settle(&self, requeue: bool) -> Result<(), BrokerError> {
        let mut state = lock(&self.state);
        self.release(&mut state)?;
        state.rejected += 1;
        if requeue {
            state.requeued += 1;
            let mut message = self.message.clone();
            message.redelivered = true;
            enqueue(&self.state, &mut state, &self.queue, message, true);
        }
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        let mut state = lock(&self.state);
        self.release(&mut state)?;
        state.acked += 1;
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        self.settle(requeue)
    }

    async fn reject(&self, requeue: bool) -> Result<(), BrokerError> {
        self.settle(requeue)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self, uri: &str) -> Result<Box<dyn BrokerConnection>, BrokerError> {
        let mut state = self.lock();
        if let Some(reason) = &state.faults.connect {
            return Err(BrokerError::Connect(reason.clone()));
        }
        let close = CloseHandle::new();
        state.connections.push(close.clone());
        debug!(uri = %uri, "Memory connection opened");
        Ok(Box::new(MemoryConnection {
            state: self.state.clone(),
            index: state.connections.len() - 1,
            close,
        }))
    }
}

struct MemoryConnection {
    state: Arc<Mutex<State>>,
    index: usize,
    close: CloseHandle,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        if self.close.is_closed() {
            return Err(BrokerError::Closed("connection closed".to_string()));
        }
        let mut state = lock(&self.state);
        if let Some(reason) = &state.faults.open_channel {
            return Err(BrokerError::Channel(reason.clone()));
        }
        let close = CloseHandle::new();
        state.channels.push(ChannelState {
            close: close.clone(),
            confirm_mode: false,
            publishes: 0,
            unacked: BTreeMap::new(),
        });
        Ok(Arc::new(MemoryChannel {
            state: self.state.clone(),
            index: state.channels.len() - 1,
            connection: self.index,
            close,
        }))
    }

    fn close_notifier(&self) -> CloseNotifier {
        self.close.notifier()
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.close.close("connection closed by client");
        Ok(())
    }
}

struct MemoryChannel {
    state: Arc<Mutex<State>>,
    index: usize,
    connection: usize,
    close: CloseHandle,
}

impl Drop for MemoryChannel {
    // The last handle going away closes the channel.
    fn drop(&mut self) {
        if !self.close.is_closed() {
            let mut state = lock(&self.state);
            close_channel(&self.state, &mut state, self.index, "channel handle dropped");
        }
    }
}

impl MemoryChannel {
    fn open_state(&self) -> Result<MutexGuard<'_, State>, BrokerError> {
        if self.close.is_closed() {
            return Err(BrokerError::Closed(format!("channel {} closed", self.index)));
        }
        Ok(lock(&self.state))
    }
}

fn not_found(queue: &str) -> BrokerError {
    BrokerError::Rejected(format!("NOT_FOUND - no queue '{}'", queue))
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn qos(&self, prefetch_count: u16) -> Result<(), BrokerError> {
        let mut state = self.open_state()?;
        if let Some(reason) = &state.faults.qos {
            return Err(BrokerError::Rejected(reason.clone()));
        }
        state.prefetch.push(prefetch_count);
        Ok(())
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
    ) -> Result<String, BrokerError> {
        let mut state = self.open_state()?;
        let name = if name.is_empty() {
            state.generated_queues += 1;
            format!("amq.gen-{}", state.generated_queues)
        } else {
            name.to_string()
        };
        state.queues.entry(name.clone()).or_default();
        state.declared.push((name.clone(), options));
        Ok(name)
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), BrokerError> {
        let mut state = self.open_state()?;
        if !state.queues.contains_key(binding.queue_name()) {
            return Err(not_found(binding.queue_name()));
        }
        state.bindings.push(binding.clone());
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, BrokerError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        {
            let mut state = self.open_state()?;
            let queue_state = state.queues.get_mut(queue).ok_or_else(|| not_found(queue))?;
            let locked = queue_state.consumers.iter().any(|c| c.exclusive);
            if locked || (options.exclusive && !queue_state.consumers.is_empty()) {
                return Err(BrokerError::Rejected(format!(
                    "ACCESS_REFUSED - queue '{}' in exclusive use",
                    queue
                )));
            }
            queue_state.consumers.push(ConsumerSink {
                tag: consumer_tag.to_string(),
                channel: self.index,
                connection: self.connection,
                exclusive: options.exclusive,
                no_local: options.no_local,
                sender,
            });
            state.consumers.push(ConsumerRecord {
                queue: queue.to_string(),
                tag: consumer_tag.to_string(),
                options,
            });

            let backlog: Vec<StoredMessage> = state
                .queues
                .get_mut(queue)
                .map(|q| q.messages.drain(..).collect())
                .unwrap_or_default();
            for message in backlog {
                enqueue(&self.state, &mut state, queue, message, false);
            }
        }

        let deliveries = stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|d| (Ok(d), receiver))
        });
        Ok(deliveries.boxed())
    }

    async fn get(&self, queue: &str) -> Result<Option<Delivery>, BrokerError> {
        let mut state = self.open_state()?;
        let tag = state.next_tag();
        let Some(message) = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| not_found(queue))?
            .messages
            .pop_front()
        else {
            return Ok(None);
        };
        state.channels[self.index]
            .unacked
            .insert(tag, (queue.to_string(), message.clone()));
        Ok(Some(build_delivery(&self.state, queue, self.index, tag, message)))
    }

    async fn confirm_select(&self) -> Result<(), BrokerError> {
        let mut state = self.open_state()?;
        if let Some(reason) = &state.faults.confirm_select {
            return Err(BrokerError::Rejected(reason.clone()));
        }
        state.channels[self.index].confirm_mode = true;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        flags: PublishFlags,
        message: &OutboundMessage,
    ) -> Result<PendingConfirm, BrokerError> {
        let mut state = self.open_state()?;
        state.channels[self.index].publishes += 1;
        let publishes = state.channels[self.index].publishes;

        if state.faults.channel_fault.get(&self.index) == Some(&publishes) {
            close_channel(&self.state, &mut state, self.index, "CHANNEL_ERROR - injected fault");
            return Ok(future::pending().boxed());
        }
        if state.faults.hang_confirms {
            return Ok(future::pending().boxed());
        }

        let nacked = state
            .faults
            .nack_marker
            .as_ref()
            .map(|marker| contains(&message.body, marker))
            .unwrap_or(false);

        if !nacked {
            state.published.push(PublishedMessage {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                flags,
                message: message.clone(),
            });
            let stored = StoredMessage {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                properties: message.properties.clone(),
                body: message.body.clone(),
                redelivered: false,
                publisher: Some(self.connection),
            };
            for queue in state.queue_names_for(exchange, routing_key) {
                enqueue(&self.state, &mut state, &queue, stored.clone(), false);
            }
        }

        let confirm_mode = state.channels[self.index].confirm_mode;
        Ok(async move {
            // Confirms arrive asynchronously on a real channel.
            tokio::task::yield_now().await;
            if nacked && confirm_mode {
                Ok(Confirmation::Nack)
            } else {
                Ok(Confirmation::Ack)
            }
        }
        .boxed())
    }

    fn close_notifier(&self) -> CloseNotifier {
        self.close.notifier()
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut state = lock(&self.state);
        close_channel(&self.state, &mut state, self.index, "channel closed by client");
        Ok(())
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|w| w == needle)
}
