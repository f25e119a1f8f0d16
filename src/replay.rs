//! Republishing of dumped messages.
//!
//! Reads back the JSON envelopes written by [`crate::dump`] and publishes
//! each message again, to the exchange and routing key it was consumed from
//! and with its original properties, through one [`ConfirmPublisher`].
//!
//! ```text
//! ReplaySource (file | stdin line) ──> ReplayEnvelope ──> publish_one ──> PublishResult
//! ```
//!
//! Unreadable sources, malformed envelopes and nacks are per-item results.
//! A fault on the channel ends the run with one fatal result.

use chrono::Utc;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::broker::Broker;
use crate::dispatch::PublishResult;
use crate::error::{Error, Result};
use crate::properties::{MessageProperties, OutboundMessage};
use crate::publish::{Confirm, ConfirmPublisher, DEFAULT_CONFIRM_TIMEOUT};
use crate::shutdown::ShutdownSignal;

/// The parts of a dumped delivery needed to publish it again.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReplayEnvelope {
    pub exchange: String,
    pub routing_key: String,
    #[serde(default)]
    pub properties: MessageProperties,
    pub body_as_string: String,
}

impl ReplayEnvelope {
    pub fn parse(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Rebuild the message, optionally replacing its timestamp.
    pub fn into_message(self, timestamp: Option<u64>) -> OutboundMessage {
        let mut properties = self.properties;
        if timestamp.is_some() {
            properties.timestamp = timestamp;
        }
        OutboundMessage::new(properties, self.body_as_string.into_bytes())
    }
}

/// Where one envelope comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplaySource {
    /// A `message.json` file, possibly pretty printed
    File(PathBuf),
    /// One envelope per line, as `amqp-consume` prints them
    Line { number: usize, text: String },
}

impl ReplaySource {
    /// Name used in results.
    pub fn target(&self) -> String {
        match self {
            ReplaySource::File(path) => path.display().to_string(),
            ReplaySource::Line { number, .. } => format!("stdin:{}", number),
        }
    }

    async fn read(self) -> Result<String> {
        match self {
            ReplaySource::File(path) => Ok(tokio::fs::read_to_string(path).await?),
            ReplaySource::Line { text, .. } => Ok(text),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReplayConfig {
    pub uri: String,
    pub mandatory: bool,
    pub immediate: bool,
    pub confirm_timeout: Duration,
    /// Stamp the current time instead of the recorded one
    pub restamp: bool,
}

impl ReplayConfig {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            mandatory: true,
            immediate: false,
            confirm_timeout: DEFAULT_CONFIRM_TIMEOUT,
            restamp: false,
        }
    }
}

/// Publishes dumped messages back to where they came from.
pub struct Replayer {
    broker: Arc<dyn Broker>,
    config: ReplayConfig,
    shutdown: ShutdownSignal,
}

impl Replayer {
    pub fn new(broker: Arc<dyn Broker>, config: ReplayConfig) -> Self {
        Self {
            broker,
            config,
            shutdown: ShutdownSignal::new(),
        }
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Start replaying. The result stream ends once `sources` is closed and
    /// drained, after a fatal result, or on shutdown.
    pub fn spawn(
        self,
        sources: mpsc::UnboundedReceiver<ReplaySource>,
    ) -> mpsc::UnboundedReceiver<PublishResult> {
        let (results, receiver) = mpsc::unbounded_channel();
        tokio::spawn(self.run(sources, results));
        receiver
    }

    async fn run(
        self,
        mut sources: mpsc::UnboundedReceiver<ReplaySource>,
        results: mpsc::UnboundedSender<PublishResult>,
    ) {
        let mut publisher = ConfirmPublisher::new(self.config.confirm_timeout);

        let connected = tokio::select! {
            biased;

            _ = self.shutdown.cancelled() => return,
            connected = publisher.connect(self.broker.as_ref(), &self.config.uri) => connected,
        };
        if let Err(e) = connected {
            error!(error = %e, "Replay setup failed");
            let _ = results.send(PublishResult::failure("", e));
            return;
        }

        let mut replayed = 0usize;
        loop {
            let next = tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => None,
                source = sources.recv() => source,
            };
            let Some(source) = next else {
                break;
            };

            let result = self.replay_one(&mut publisher, source).await;
            let fatal = result.fatal;
            if result.is_success() {
                replayed += 1;
            } else {
                warn!(source = %result.target, error = %result.message, "Replay failed");
            }

            if results.send(result).is_err() || fatal {
                break;
            }
        }

        publisher.close().await;
        info!(replayed = replayed, "Replay finished");
    }

    async fn replay_one(
        &self,
        publisher: &mut ConfirmPublisher,
        source: ReplaySource,
    ) -> PublishResult {
        let target = source.target();

        let envelope = match source.read().await {
            Ok(json) => match ReplayEnvelope::parse(&json) {
                Ok(envelope) => envelope,
                Err(e) => return PublishResult::failure(target, e),
            },
            Err(e) => return PublishResult::failure(target, e),
        };

        let timestamp = if self.config.restamp {
            u64::try_from(Utc::now().timestamp()).ok()
        } else {
            None
        };
        let exchange = envelope.exchange.clone();
        let routing_key = envelope.routing_key.clone();
        let message = envelope.into_message(timestamp);
        debug!(
            source = %target,
            exchange = %exchange,
            routing_key = %routing_key,
            "Replaying"
        );

        match publisher
            .publish_one(
                &exchange,
                &routing_key,
                self.config.mandatory,
                self.config.immediate,
                &message,
            )
            .await
        {
            Ok(Confirm::Acked) => PublishResult::success(
                target,
                format!(
                    "replayed {} bytes to {}/{}",
                    message.body.len(),
                    exchange,
                    routing_key
                ),
            ),
            Ok(Confirm::Nacked(reason)) => {
                PublishResult::failure(target, Error::ConfirmNegative(reason))
            }
            Err(e) => PublishResult::failure(target, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;

    const DUMPED: &str = r#"{
        "exchange": "orders",
        "routing_key": "order.created",
        "delivery_tag": 7,
        "redelivered": true,
        "properties": {"message_id": "m-1", "timestamp": 1700000000},
        "body_as_string": "{\"id\":1}"
    }"#;

    #[test]
    fn test_parse_ignores_delivery_metadata() {
        let envelope = ReplayEnvelope::parse(DUMPED).unwrap();
        assert_eq!(envelope.exchange, "orders");
        assert_eq!(envelope.routing_key, "order.created");
        assert_eq!(envelope.properties.message_id.as_deref(), Some("m-1"));
        assert_eq!(envelope.body_as_string, "{\"id\":1}");
    }

    #[test]
    fn test_into_message_keeps_or_replaces_timestamp() {
        let envelope = ReplayEnvelope::parse(DUMPED).unwrap();
        let kept = envelope.clone().into_message(None);
        assert_eq!(kept.properties.timestamp, Some(1_700_000_000));
        assert_eq!(kept.body, b"{\"id\":1}");

        let restamped = envelope.into_message(Some(1_800_000_000));
        assert_eq!(restamped.properties.timestamp, Some(1_800_000_000));
    }

    #[test]
    fn test_missing_fields_are_an_envelope_error() {
        let err = ReplayEnvelope::parse(r#"{"exchange": "orders"}"#).unwrap_err();
        assert!(matches!(err, Error::Envelope(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_source_targets() {
        let file = ReplaySource::File(PathBuf::from("/d/message.json"));
        assert_eq!(file.target(), "/d/message.json");
        let line = ReplaySource::Line {
            number: 3,
            text: String::new(),
        };
        assert_eq!(line.target(), "stdin:3");
    }

    #[tokio::test]
    async fn test_setup_failure_is_one_fatal_result() {
        let broker = MemoryBroker::new();
        broker.fail_confirm_select("NOT_IMPLEMENTED");
        let replayer = Replayer::new(Arc::new(broker), ReplayConfig::new("amqp://memory"));

        let (_sources, queue) = mpsc::unbounded_channel();
        let mut results = replayer.spawn(queue);
        let result = results.recv().await.unwrap();
        assert!(result.fatal);
        assert!(result.target.is_empty());
        assert!(results.recv().await.is_none());
    }
}
