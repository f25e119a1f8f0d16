//! [`Broker`] over the `lapin` AMQP client.
//!
//! Close notifications come from `on_error` callbacks on the connection and
//! channel, plus client-initiated closes.

use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use lapin::{
    acker::Acker,
    message::Delivery as LapinDelivery,
    options::*,
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::binding::QueueBinding;
use crate::broker::{
    Acknowledger, Broker, BrokerChannel, BrokerConnection, BrokerError, CloseHandle,
    CloseNotifier, Confirmation, ConsumeOptions, Delivery, DeliveryStream, PendingConfirm,
    PublishFlags, QueueOptions,
};
use crate::properties::{MessageProperties, OutboundMessage};

/// Reply code for a normal close.
const REPLY_SUCCESS: u16 = 200;

/// Connects to a real broker.
#[derive(Debug, Clone, Default)]
pub struct AmqpBroker;

impl AmqpBroker {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn connect(&self, uri: &str) -> Result<Box<dyn BrokerConnection>, BrokerError> {
        let connection = Connection::connect(uri, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Connect(e.to_string()))?;

        let close = CloseHandle::new();
        let on_error = close.clone();
        connection.on_error(move |err| {
            warn!(error = %err, "AMQP connection error");
            on_error.close(err.to_string());
        });

        info!("AMQP connection established");
        Ok(Box::new(AmqpConnection { connection, close }))
    }
}

struct AmqpConnection {
    connection: Connection,
    close: CloseHandle,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Channel(e.to_string()))?;

        let close = CloseHandle::new();
        let on_error = close.clone();
        channel.on_error(move |err| {
            warn!(error = %err, "AMQP channel error");
            on_error.close(err.to_string());
        });

        debug!(channel = channel.id(), "AMQP channel opened");
        Ok(Arc::new(AmqpChannel { channel, close }))
    }

    fn close_notifier(&self) -> CloseNotifier {
        self.close.notifier()
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.close.close("connection closed by client");
        self.connection
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(map_error)
    }
}

struct AmqpChannel {
    channel: Channel,
    close: CloseHandle,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn qos(&self, prefetch_count: u16) -> Result<(), BrokerError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(map_error)
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
    ) -> Result<String, BrokerError> {
        let queue = self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: false,
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(map_error)?;
        Ok(queue.name().as_str().to_string())
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), BrokerError> {
        self.channel
            .queue_bind(
                binding.queue_name(),
                binding.exchange(),
                binding.routing_key(),
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(map_error)
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, BrokerError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: options.no_local,
                    no_ack: options.no_ack,
                    exclusive: options.exclusive,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(map_error)?;

        Ok(consumer
            .map(|delivery| delivery.map(into_delivery).map_err(map_error))
            .boxed())
    }

    async fn get(&self, queue: &str) -> Result<Option<Delivery>, BrokerError> {
        let message = self
            .channel
            .basic_get(queue, BasicGetOptions { no_ack: false })
            .await
            .map_err(map_error)?;
        Ok(message.map(|m| into_delivery(m.delivery)))
    }

    async fn confirm_select(&self) -> Result<(), BrokerError> {
        self.channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(map_error)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        flags: PublishFlags,
        message: &OutboundMessage,
    ) -> Result<PendingConfirm, BrokerError> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: flags.mandatory,
                    immediate: flags.immediate,
                },
                &message.body,
                to_basic_properties(&message.properties),
            )
            .await
            .map_err(map_error)?;

        Ok(async move {
            let confirmation = confirm.await.map_err(map_error)?;
            if confirmation.is_nack() {
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
        self.close.close("channel closed by client");
        self.channel
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(map_error)
    }
}

struct AmqpAcker {
    acker: Acker,
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.acker
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(map_error)
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        self.acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map_err(map_error)
    }

    async fn reject(&self, requeue: bool) -> Result<(), BrokerError> {
        self.acker
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(map_error)
    }
}

fn map_error(err: lapin::Error) -> BrokerError {
    match err {
        lapin::Error::InvalidChannelState(state) => {
            BrokerError::Closed(format!("channel is {:?}", state))
        }
        lapin::Error::InvalidConnectionState(state) => {
            BrokerError::Closed(format!("connection is {:?}", state))
        }
        other => BrokerError::Rejected(other.to_string()),
    }
}

fn into_delivery(delivery: LapinDelivery) -> Delivery {
    let properties = from_basic_properties(&delivery.properties);
    Delivery::new(
        delivery.delivery_tag,
        delivery.exchange.as_str(),
        delivery.routing_key.as_str(),
        delivery.redelivered,
        properties,
        delivery.data,
        Box::new(AmqpAcker {
            acker: delivery.acker,
        }),
    )
}

fn short(value: &Option<ShortString>) -> Option<String> {
    value.as_ref().map(|s| s.as_str().to_string())
}

fn header_value(value: &AMQPValue) -> String {
    match value {
        AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
        AMQPValue::ShortString(s) => s.as_str().to_string(),
        AMQPValue::Boolean(b) => b.to_string(),
        AMQPValue::LongInt(n) => n.to_string(),
        AMQPValue::LongLongInt(n) => n.to_string(),
        AMQPValue::Timestamp(t) => t.to_string(),
        other => format!("{:?}", other),
    }
}

fn from_basic_properties(properties: &BasicProperties) -> MessageProperties {
    let headers = properties
        .headers()
        .as_ref()
        .map(|table| {
            table
                .inner()
                .iter()
                .map(|(key, value)| (key.as_str().to_string(), header_value(value)))
                .collect::<BTreeMap<_, _>>()
        })
        .unwrap_or_default();

    MessageProperties {
        content_type: short(properties.content_type()),
        content_encoding: short(properties.content_encoding()),
        delivery_mode: *properties.delivery_mode(),
        priority: *properties.priority(),
        correlation_id: short(properties.correlation_id()),
        reply_to: short(properties.reply_to()),
        expiration: short(properties.expiration()),
        message_id: short(properties.message_id()),
        timestamp: *properties.timestamp(),
        kind: short(properties.kind()),
        user_id: short(properties.user_id()),
        app_id: short(properties.app_id()),
        headers,
    }
}

fn to_basic_properties(properties: &MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default();
    if let Some(v) = &properties.content_type {
        basic = basic.with_content_type(v.clone().into());
    }
    if let Some(v) = &properties.content_encoding {
        basic = basic.with_content_encoding(v.clone().into());
    }
    if let Some(v) = properties.delivery_mode {
        basic = basic.with_delivery_mode(v);
    }
    if let Some(v) = properties.priority {
        basic = basic.with_priority(v);
    }
    if let Some(v) = &properties.correlation_id {
        basic = basic.with_correlation_id(v.clone().into());
    }
    if let Some(v) = &properties.reply_to {
        basic = basic.with_reply_to(v.clone().into());
    }
    if let Some(v) = &properties.expiration {
        basic = basic.with_expiration(v.clone().into());
    }
    if let Some(v) = &properties.message_id {
        basic = basic.with_message_id(v.clone().into());
    }
    if let Some(v) = properties.timestamp {
        basic = basic.with_timestamp(v);
    }
    if let Some(v) = &properties.kind {
        basic = basic.with_kind(v.clone().into());
    }
    if let Some(v) = &properties.user_id {
        basic = basic.with_user_id(v.clone().into());
    }
    if let Some(v) = &properties.app_id {
        basic = basic.with_app_id(v.clone().into());
    }
    if !properties.headers.is_empty() {
        let mut table = FieldTable::default();
        for (key, value) in &properties.headers {
            table.insert(key.clone().into(), AMQPValue::LongString(value.clone().into()));
        }
        basic = basic.with_headers(table);
    }
    basic
}
