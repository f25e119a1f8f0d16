//! Firehose tailing.
//!
//! A [`LogTailer`] declares one private, server-named queue, binds it to the
//! broker's log and trace exchanges with `#`, and merges the two consumers
//! into one [`ConsumeSession`]. The stream ends as soon as the channel or the
//! connection reports a close, or on shutdown.

use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::binding::QueueBinding;
use crate::broker::{Broker, CloseNotifier, ConsumeOptions, DeliveryStream, QueueOptions};
use crate::consume::{ConsumeEvent, ConsumeSession};
use crate::error::{Error, Result, SetupStage};
use crate::identifier::IdentifierGenerator;
use crate::shutdown::ShutdownSignal;
use crate::{FIREHOSE_LOG_EXCHANGE, FIREHOSE_TRACE_EXCHANGE};

const FIREHOSE_TOPICS: [&str; 2] = [FIREHOSE_LOG_EXCHANGE, FIREHOSE_TRACE_EXCHANGE];

pub struct LogTailer {
    broker: Arc<dyn Broker>,
    shutdown: ShutdownSignal,
    tag_generator: IdentifierGenerator,
}

impl LogTailer {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            shutdown: ShutdownSignal::new(),
            tag_generator: IdentifierGenerator::Uuid,
        }
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn with_tag_generator(mut self, generator: IdentifierGenerator) -> Self {
        self.tag_generator = generator;
        self
    }

    /// Set up the firehose queue and start forwarding its messages.
    pub async fn start(&self, uri: &str) -> Result<ConsumeSession> {
        let connection = self
            .broker
            .connect(uri)
            .await
            .map_err(|source| Error::Connection {
                stage: SetupStage::Connect,
                source,
            })?;
        let channel = connection
            .open_channel()
            .await
            .map_err(|source| Error::Connection {
                stage: SetupStage::ChannelOpen,
                source,
            })?;

        let options = QueueOptions {
            durable: false,
            exclusive: true,
            auto_delete: true,
        };
        let queue = channel
            .declare_queue("", options)
            .await
            .map_err(|source| Error::Protocol {
                operation: "queue.declare",
                source,
            })?;
        debug!(queue = %queue, "Firehose queue declared");

        let consumer_tag = self.tag_generator.next()?;
        let mut consumers: Vec<DeliveryStream> = Vec::with_capacity(FIREHOSE_TOPICS.len());

        for (index, exchange) in FIREHOSE_TOPICS.iter().enumerate() {
            let binding = QueueBinding::new(*exchange, queue.as_str(), "#");
            channel
                .bind_queue(&binding)
                .await
                .map_err(|source| Error::Protocol {
                    operation: "queue.bind",
                    source,
                })?;

            let deliveries = channel
                .consume(
                    &queue,
                    &format!("{}-{}", consumer_tag, index),
                    ConsumeOptions::default(),
                )
                .await
                .map_err(|source| Error::Protocol {
                    operation: "basic.consume",
                    source,
                })?;
            consumers.push(deliveries);
            info!(exchange = %exchange, queue = %queue, "Tailing firehose topic");
        }

        let (sender, events) = mpsc::channel(crate::CONSUME_PREFETCH as usize);
        let task = tokio::spawn(pump_firehose(
            consumers,
            channel.close_notifier(),
            connection.close_notifier(),
            sender,
            self.shutdown.clone(),
        ));

        Ok(ConsumeSession::new(events, task, channel, connection))
    }
}

async fn pump_firehose(
    consumers: Vec<DeliveryStream>,
    mut channel_closed: CloseNotifier,
    mut connection_closed: CloseNotifier,
    sender: mpsc::Sender<ConsumeEvent>,
    shutdown: ShutdownSignal,
) -> Result<()> {
    let mut merged = stream::select_all(consumers);
    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                info!("Firehose tail cancelled");
                return Ok(());
            }
            reason = channel_closed.closed() => {
                warn!(reason = %reason, "Firehose channel closed");
                return Err(Error::ChannelFault(reason));
            }
            reason = connection_closed.closed() => {
                warn!(reason = %reason, "Firehose connection closed");
                return Err(Error::ChannelFault(reason));
            }
            next = merged.next() => match next {
                Some(Ok(delivery)) => {
                    if sender.send(ConsumeEvent::Delivery(delivery)).await.is_err() {
                        return Ok(());
                    }
                }
                Some(Err(e)) => return Err(Error::ChannelFault(e.to_string())),
                None => return Err(Error::ChannelFault("firehose consumers ended".to_string())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;
    use std::time::Duration;

    #[tokio::test]
    async fn test_declares_private_queue_bound_to_both_topics() {
        let broker = MemoryBroker::new();
        let tailer = LogTailer::new(Arc::new(broker.clone()));
        let session = tailer.start("amqp://memory").await.unwrap();

        let declared = broker.declared();
        assert_eq!(declared.len(), 1);
        let (queue, options) = &declared[0];
        assert!(queue.starts_with("amq.gen-"));
        assert!(options.exclusive && options.auto_delete && !options.durable);

        let bindings = broker.bindings();
        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings[0].exchange(), FIREHOSE_LOG_EXCHANGE);
        assert_eq!(bindings[1].exchange(), FIREHOSE_TRACE_EXCHANGE);
        assert!(bindings.iter().all(|b| b.routing_key() == "#"));
        assert_eq!(broker.consumers().len(), 2);

        drop(session);
    }

    #[tokio::test]
    async fn test_forwards_log_and_trace_messages() {
        let broker = MemoryBroker::new();
        let mut session = LogTailer::new(Arc::new(broker.clone()))
            .start("amqp://memory")
            .await
            .unwrap();

        broker.route(FIREHOSE_LOG_EXCHANGE, "info", "log line");
        broker.route(FIREHOSE_TRACE_EXCHANGE, "publish.orders", "trace line");

        let mut bodies = Vec::new();
        for _ in 0..2 {
            match session.next().await {
                Some(ConsumeEvent::Delivery(d)) => bodies.push(String::from_utf8(d.body).unwrap()),
                other => panic!("unexpected event: {:?}", other),
            }
        }
        bodies.sort();
        assert_eq!(bodies, vec!["log line", "trace line"]);
    }

    #[tokio::test]
    async fn test_connection_close_ends_stream() {
        let broker = MemoryBroker::new();
        let mut session = LogTailer::new(Arc::new(broker.clone()))
            .start("amqp://memory")
            .await
            .unwrap();

        broker.close_connections("CONNECTION_FORCED - broker shutdown");

        let end = tokio::time::timeout(Duration::from_secs(1), session.next()).await;
        assert!(matches!(end, Ok(None)));
        let outcome = session.finish().await;
        assert!(matches!(outcome, Err(Error::ChannelFault(_))));
    }

    #[tokio::test]
    async fn test_channel_close_drops_pending_messages() {
        let broker = MemoryBroker::new();
        let mut session = LogTailer::new(Arc::new(broker.clone()))
            .start("amqp://memory")
            .await
            .unwrap();

        broker.route(FIREHOSE_LOG_EXCHANGE, "info", "before close");
        broker.route(FIREHOSE_TRACE_EXCHANGE, "publish.orders", "also before close");
        broker.close_channels("CHANNEL_ERROR - forced");

        let mut forwarded = 0;
        loop {
            let event = tokio::time::timeout(Duration::from_secs(1), session.next())
                .await
                .unwrap();
            match event {
                Some(ConsumeEvent::Delivery(_)) => forwarded += 1,
                Some(other) => panic!("unexpected event: {:?}", other),
                None => break,
            }
        }
        assert_eq!(forwarded, 0);

        let outcome = session.finish().await;
        assert!(matches!(outcome, Err(Error::ChannelFault(reason)) if reason.contains("forced")));
    }

    #[tokio::test]
    async fn test_session_keeps_channel_open() {
        let broker = MemoryBroker::new();
        let mut session = LogTailer::new(Arc::new(broker.clone()))
            .start("amqp://memory")
            .await
            .unwrap();

        broker.route(FIREHOSE_LOG_EXCHANGE, "info", "line");
        let Some(ConsumeEvent::Delivery(delivery)) = session.next().await else {
            panic!("expected a delivery");
        };
        assert_eq!(broker.open_channels(), 1);
        delivery.ack().await.unwrap();
        assert_eq!(broker.acked(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_ends_stream_cleanly() {
        let broker = MemoryBroker::new();
        let shutdown = ShutdownSignal::new();
        let mut session = LogTailer::new(Arc::new(broker.clone()))
            .with_shutdown(shutdown.clone())
            .start("amqp://memory")
            .await
            .unwrap();

        shutdown.trigger();
        let end = tokio::time::timeout(Duration::from_secs(1), session.next()).await;
        assert!(matches!(end, Ok(None)));
        assert!(session.finish().await.is_ok());
    }
}
