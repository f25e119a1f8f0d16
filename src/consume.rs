//! Consumption multiplexer.
//!
//! Binds one or many queues and funnels their deliveries into a single
//! [`ConsumeSession`].
//!
//! # Modes
//!
//! ```text
//! Continuous | prefetch 10, one exclusive no-local consumer per queue,
//!            | deliveries interleaved as they arrive, runs until cancelled
//! Drain      | no consumer; basic.get each binding's queue until empty,
//!            | then a Drained marker; the stream closes after the last one
//! ```
//!
//! Setup is all or nothing: a failure at any stage for any binding aborts
//! the session before a stream exists. The multiplexer never acknowledges;
//! each [`crate::broker::Delivery`] carries its own handle.

use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::binding::{BindingSet, QueueBinding};
use crate::broker::{Broker, BrokerChannel, BrokerConnection, ConsumeOptions, DeliveryStream};
use crate::error::{Error, Result, SetupStage};
use crate::identifier::IdentifierGenerator;
use crate::shutdown::ShutdownSignal;
use crate::CONSUME_PREFETCH;

/// How a session reads its queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeMode {
    Continuous,
    Drain,
}

/// One item of a consume session's output.
#[derive(Debug)]
pub enum ConsumeEvent {
    Delivery(crate::broker::Delivery),
    /// Every message of this binding's queue has been forwarded
    Drained(QueueBinding),
}

/// Output of a running consume session.
///
/// The session holds the channel and the connection, so deliveries can still
/// be acked after the stream has closed. Dropping the last channel handle
/// closes the channel and the broker requeues whatever was not settled. Call
/// [`ConsumeSession::finish`] once every delivery is settled to close both
/// and learn why the stream ended.
pub struct ConsumeSession {
    events: mpsc::Receiver<ConsumeEvent>,
    task: Option<JoinHandle<Result<()>>>,
    channel: Option<Arc<dyn BrokerChannel>>,
    connection: Option<Box<dyn BrokerConnection>>,
}

impl ConsumeSession {
    pub(crate) fn new(
        events: mpsc::Receiver<ConsumeEvent>,
        task: JoinHandle<Result<()>>,
        channel: Arc<dyn BrokerChannel>,
        connection: Box<dyn BrokerConnection>,
    ) -> Self {
        Self {
            events,
            task: Some(task),
            channel: Some(channel),
            connection: Some(connection),
        }
    }

    /// Next event, or `None` once the stream has closed.
    pub async fn next(&mut self) -> Option<ConsumeEvent> {
        self.events.recv().await
    }

    /// Wait for the pump to stop, close the channel and the connection, and
    /// return the reason the stream ended.
    pub async fn finish(mut self) -> Result<()> {
        self.events.close();
        let outcome = match self.task.take() {
            Some(task) => match task.await {
                Ok(outcome) => outcome,
                Err(e) if e.is_cancelled() => Ok(()),
                Err(e) => Err(Error::ChannelFault(format!("consume task failed: {}", e))),
            },
            None => Ok(()),
        };

        if let Some(channel) = self.channel.take() {
            if let Err(e) = channel.close().await {
                debug!(error = %e, "Channel close failed");
            }
        }
        if let Some(connection) = self.connection.take() {
            if let Err(e) = connection.close().await {
                debug!(error = %e, "Connection close failed");
            }
        }
        outcome
    }
}

impl Drop for ConsumeSession {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Fans many bound queues into one [`ConsumeSession`].
pub struct ConsumeMultiplexer {
    broker: Arc<dyn Broker>,
    shutdown: ShutdownSignal,
    tag_generator: IdentifierGenerator,
}

impl ConsumeMultiplexer {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            shutdown: ShutdownSignal::new(),
            tag_generator: IdentifierGenerator::Uuid,
        }
    }

    /// Stop the session when `shutdown` fires.
    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Source of consumer tags; one tag is drawn per session.
    pub fn with_tag_generator(mut self, generator: IdentifierGenerator) -> Self {
        self.tag_generator = generator;
        self
    }

    /// Run setup and start forwarding deliveries.
    pub async fn start(
        &self,
        uri: &str,
        bindings: &BindingSet,
        mode: ConsumeMode,
    ) -> Result<ConsumeSession> {
        if bindings.is_empty() {
            return Err(Error::Configuration(
                "at least one exchange/queue/routing-key binding is required".to_string(),
            ));
        }

        let connection = self
            .broker
            .connect(uri)
            .await
            .map_err(|source| Error::Connection {
                stage: SetupStage::Connect,
                source,
            })?;
        debug!("Connection established");

        let channel = connection
            .open_channel()
            .await
            .map_err(|source| Error::Connection {
                stage: SetupStage::ChannelOpen,
                source,
            })?;
        debug!("Channel opened");

        if mode == ConsumeMode::Continuous {
            channel
                .qos(CONSUME_PREFETCH)
                .await
                .map_err(|source| Error::Protocol {
                    operation: "basic.qos",
                    source,
                })?;
            debug!(prefetch = CONSUME_PREFETCH, "Channel QOS set");
        }

        let consumer_tag = self.tag_generator.next()?;
        let mut consumers: Vec<DeliveryStream> = Vec::new();
        let mut consumed_queues: Vec<&str> = Vec::new();

        for binding in bindings {
            channel
                .bind_queue(binding)
                .await
                .map_err(|source| Error::Protocol {
                    operation: "queue.bind",
                    source,
                })?;
            info!(binding = %binding, "Queue bound");

            if mode == ConsumeMode::Continuous && !consumed_queues.contains(&binding.queue_name()) {
                // Tags must be unique per channel.
                let tag = format!("{}-{}", consumer_tag, consumed_queues.len());
                let options = ConsumeOptions {
                    no_ack: false,
                    exclusive: true,
                    no_local: true,
                };
                let deliveries = channel
                    .consume(binding.queue_name(), &tag, options)
                    .await
                    .map_err(|source| Error::Protocol {
                        operation: "basic.consume",
                        source,
                    })?;
                consumed_queues.push(binding.queue_name());
                consumers.push(deliveries);
            }
        }

        let (sender, events) = mpsc::channel(CONSUME_PREFETCH as usize);
        let shutdown = self.shutdown.clone();
        let task = match mode {
            ConsumeMode::Continuous => tokio::spawn(pump_continuous(consumers, sender, shutdown)),
            ConsumeMode::Drain => tokio::spawn(pump_drain(
                channel.clone(),
                bindings.iter().cloned().collect(),
                sender,
                shutdown,
            )),
        };

        Ok(ConsumeSession::new(events, task, channel, connection))
    }
}

/// Forward deliveries from every consumer as they become ready.
async fn pump_continuous(
    consumers: Vec<DeliveryStream>,
    sender: mpsc::Sender<ConsumeEvent>,
    shutdown: ShutdownSignal,
) -> Result<()> {
    let mut merged = stream::select_all(consumers);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Consume session cancelled");
                return Ok(());
            }
            next = merged.next() => match next {
                Some(Ok(delivery)) => {
                    if sender.send(ConsumeEvent::Delivery(delivery)).await.is_err() {
                        debug!("Event receiver dropped, stopping");
                        return Ok(());
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Consumer stream failed");
                    return Err(Error::ChannelFault(e.to_string()));
                }
                None => {
                    warn!("All consumers closed");
                    return Err(Error::ChannelFault("consumer streams ended".to_string()));
                }
            }
        }
    }
}

/// Empty each binding's queue in order, marking the end of each.
async fn pump_drain(
    channel: Arc<dyn BrokerChannel>,
    bindings: Vec<QueueBinding>,
    sender: mpsc::Sender<ConsumeEvent>,
    shutdown: ShutdownSignal,
) -> Result<()> {
    for binding in bindings {
        debug!(queue = %binding.queue_name(), "Getting messages from queue");
        let mut count: u64 = 0;

        loop {
            if shutdown.is_shutdown() {
                info!("Drain cancelled");
                return Ok(());
            }

            let fetched = channel
                .get(binding.queue_name())
                .await
                .map_err(|source| Error::Protocol {
                    operation: "basic.get",
                    source,
                })?;

            let Some(delivery) = fetched else {
                break;
            };
            count += 1;
            if sender.send(ConsumeEvent::Delivery(delivery)).await.is_err() {
                debug!("Event receiver dropped, stopping");
                return Ok(());
            }
        }

        info!(binding = %binding, count = count, "Queue drained");
        if sender.send(ConsumeEvent::Drained(binding)).await.is_err() {
            return Ok(());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;
    use std::time::Duration;

    fn multiplexer(broker: &MemoryBroker) -> ConsumeMultiplexer {
        ConsumeMultiplexer::new(Arc::new(broker.clone()))
    }

    #[tokio::test]
    async fn test_empty_binding_set_is_rejected_before_connecting() {
        let broker = MemoryBroker::new();
        let result = multiplexer(&broker)
            .start("amqp://memory", &BindingSet::new(), ConsumeMode::Drain)
            .await;
        assert!(matches!(result, Err(Error::Configuration(_))));
        assert_eq!(broker.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_drain_counts_and_marks() {
        let broker = MemoryBroker::new();
        broker.declare("q");
        for i in 0..4 {
            broker.push("q", format!("m{}", i));
        }

        let bindings = BindingSet::parse(["ex/q/key"]).unwrap();
        let mut session = multiplexer(&broker)
            .start("amqp://memory", &bindings, ConsumeMode::Drain)
            .await
            .unwrap();

        let mut bodies = Vec::new();
        let mut markers = 0;
        while let Some(event) = session.next().await {
            match event {
                ConsumeEvent::Delivery(d) => bodies.push(String::from_utf8(d.body).unwrap()),
                ConsumeEvent::Drained(_) => markers += 1,
            }
        }

        assert_eq!(bodies, vec!["m0", "m1", "m2", "m3"]);
        assert_eq!(markers, 1);
        assert!(session.finish().await.is_ok());
        assert!(broker.consumers().is_empty());
        assert!(broker.prefetch_values().is_empty());
    }

    #[tokio::test]
    async fn test_drain_channel_outlives_pump() {
        let broker = MemoryBroker::new();
        broker.declare("q");
        for i in 0..5 {
            broker.push("q", format!("m{}", i));
        }

        let bindings = BindingSet::parse(["ex/q/key"]).unwrap();
        let mut session = multiplexer(&broker)
            .start("amqp://memory", &bindings, ConsumeMode::Drain)
            .await
            .unwrap();

        // Everything fits in the event buffer, so the pump is long gone.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(broker.open_channels(), 1);

        let mut acked = 0;
        while let Some(event) = session.next().await {
            if let ConsumeEvent::Delivery(delivery) = event {
                delivery.ack().await.unwrap();
                acked += 1;
            }
        }
        assert_eq!(acked, 5);

        session.finish().await.unwrap();
        assert_eq!(broker.open_channels(), 0);
        assert_eq!(broker.acked(), 5);
        assert_eq!(broker.queue_len("q"), 0);
    }

    #[tokio::test]
    async fn test_dropped_session_requeues_unsettled() {
        let broker = MemoryBroker::new();
        broker.declare("q");
        broker.push("q", "pending");

        let bindings = BindingSet::parse(["ex/q/key"]).unwrap();
        let mut session = multiplexer(&broker)
            .start("amqp://memory", &bindings, ConsumeMode::Drain)
            .await
            .unwrap();
        let Some(ConsumeEvent::Delivery(_unsettled)) = session.next().await else {
            panic!("expected a delivery");
        };
        drop(session);

        assert_eq!(broker.open_channels(), 0);
        assert_eq!(broker.queue_len("q"), 1);
    }

    #[tokio::test]
    async fn test_bind_failure_aborts_setup() {
        let broker = MemoryBroker::new();
        broker.declare("present");

        let bindings = BindingSet::parse(["ex/present/a", "ex/missing/b"]).unwrap();
        let result = multiplexer(&broker)
            .start("amqp://memory", &bindings, ConsumeMode::Continuous)
            .await;

        let err = result.err().unwrap();
        assert_eq!(err.stage(), Some(SetupStage::BindConsume));
    }

    #[tokio::test]
    async fn test_setup_stage_reported() {
        let broker = MemoryBroker::new();
        broker.fail_connect("refused");
        let bindings = BindingSet::parse(["ex/q/key"]).unwrap();
        let err = multiplexer(&broker)
            .start("amqp://memory", &bindings, ConsumeMode::Drain)
            .await
            .err()
            .unwrap();
        assert_eq!(err.stage(), Some(SetupStage::Connect));

        let broker = MemoryBroker::new();
        broker.fail_open_channel("no channels");
        let err = multiplexer(&broker)
            .start("amqp://memory", &bindings, ConsumeMode::Drain)
            .await
            .err()
            .unwrap();
        assert_eq!(err.stage(), Some(SetupStage::ChannelOpen));

        let broker = MemoryBroker::new();
        broker.declare("q");
        broker.fail_qos("qos refused");
        let err = multiplexer(&broker)
            .start("amqp://memory", &bindings, ConsumeMode::Continuous)
            .await
            .err()
            .unwrap();
        assert_eq!(err.stage(), Some(SetupStage::Prefetch));
    }
}
