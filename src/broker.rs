//! Capability interface over the AMQP client.
//!
//! The pipelines never touch a protocol client directly. They drive these
//! traits, which [`crate::amqp`] implements with `lapin` and
//! [`crate::memory`] implements in process.
//!
//! ```text
//! Broker::connect ──> BrokerConnection::open_channel ──> BrokerChannel
//!                           │                               │
//!                           └── close_notifier()            ├── qos / declare / bind
//!                                                           ├── consume / get ──> Delivery
//!                                                           ├── confirm_select / publish ──> PendingConfirm
//!                                                           └── close_notifier()
//! ```

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

use crate::binding::QueueBinding;
use crate::properties::{MessageProperties, OutboundMessage};

/// Errors reported by a broker adapter.
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    #[error("unable to connect: {0}")]
    Connect(String),

    #[error("channel unavailable: {0}")]
    Channel(String),

    #[error("{0}")]
    Rejected(String),

    #[error("closed: {0}")]
    Closed(String),
}

/// Broker answer to one publish on a channel in confirm mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmation {
    Ack,
    Nack,
}

/// Resolves once the broker confirms the publish it was returned for.
pub type PendingConfirm = BoxFuture<'static, Result<Confirmation, BrokerError>>;

/// Deliveries from one registered consumer.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;

/// Entry point of a broker adapter.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(&self, uri: &str) -> Result<Box<dyn BrokerConnection>, BrokerError>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError>;

    /// Fires when the connection closes underneath its user.
    fn close_notifier(&self) -> CloseNotifier;

    async fn close(&self) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Limit unacknowledged deliveries per consumer on this channel.
    async fn qos(&self, prefetch_count: u16) -> Result<(), BrokerError>;

    /// Declare a queue and return its (possibly server-generated) name.
    async fn declare_queue(&self, name: &str, options: QueueOptions)
        -> Result<String, BrokerError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), BrokerError>;

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, BrokerError>;

    /// Fetch one message without auto-ack. `None` means the queue is empty.
    async fn get(&self, queue: &str) -> Result<Option<Delivery>, BrokerError>;

    async fn confirm_select(&self) -> Result<(), BrokerError>;

    /// Publish one message. The returned future resolves with the confirm
    /// for this publish once the channel is in confirm mode.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        flags: PublishFlags,
        message: &OutboundMessage,
    ) -> Result<PendingConfirm, BrokerError>;

    /// Fires when the broker closes the channel.
    fn close_notifier(&self) -> CloseNotifier;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// Options for `queue.declare`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

/// Options for `basic.consume`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    pub no_ack: bool,
    pub exclusive: bool,
    pub no_local: bool,
}

/// Flags for `basic.publish`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishFlags {
    pub mandatory: bool,
    pub immediate: bool,
}

/// Sending half of a close notification.
#[derive(Debug, Clone)]
pub struct CloseHandle {
    sender: Arc<watch::Sender<Option<String>>>,
}

impl CloseHandle {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(None);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Record the close. Only the first reason is kept.
    pub fn close(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.sender.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }

    pub fn is_closed(&self) -> bool {
        self.sender.borrow().is_some()
    }

    pub fn notifier(&self) -> CloseNotifier {
        CloseNotifier {
            receiver: self.sender.subscribe(),
        }
    }
}

impl Default for CloseHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving half of a close notification. A close that happened before the
/// notifier was created is still observed.
#[derive(Debug, Clone)]
pub struct CloseNotifier {
    receiver: watch::Receiver<Option<String>>,
}

impl CloseNotifier {
    /// Wait until closed and return the reason.
    pub async fn closed(&mut self) -> String {
        match self.receiver.wait_for(|reason| reason.is_some()).await {
            Ok(reason) => reason.clone().unwrap_or_default(),
            // The handle is gone, so nothing can report the channel alive.
            Err(_) => "close notifier dropped".to_string(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.receiver.borrow().is_some()
    }
}

/// Settles one delivery on the channel it came from.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), BrokerError>;
    async fn nack(&self, requeue: bool) -> Result<(), BrokerError>;
    async fn reject(&self, requeue: bool) -> Result<(), BrokerError>;
}

/// One received message.
///
/// Settling methods take `self`, so each delivery is acked, nacked or
/// rejected at most once, by whoever ends up owning it.
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        delivery_tag: u64,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        redelivered: bool,
        properties: MessageProperties,
        body: Vec<u8>,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            delivery_tag,
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            redelivered,
            properties,
            body,
            acker,
        }
    }

    pub fn message_id(&self) -> Option<&str> {
        self.properties.message_id.as_deref()
    }

    pub async fn ack(self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }

    pub async fn nack(self, requeue: bool) -> Result<(), BrokerError> {
        self.acker.nack(requeue).await
    }

    pub async fn reject(self, requeue: bool) -> Result<(), BrokerError> {
        self.acker.reject(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("properties", &self.properties)
            .field("body_len", &self.body.len())
            .finish()
    }
}
