//! Confirm-gated publisher.
//!
//! # State machine
//!
//! ```text
//! Disconnected ──connect──> Connected ──confirm.select──> ConfirmModeEnabled ──> Ready
//!                                                                               │  ▲
//!                                                               publish_one ────┘  │ ack / nack
//!                                                                               │
//!                          channel or connection closed, confirm timeout ───────┴──> Faulted
//! close() ──> Closed
//! ```
//!
//! One publish is outstanding at a time, so the n-th confirm on the channel
//! always belongs to the n-th publish. `Faulted` is sticky: once the channel
//! has gone away, or a confirm is late enough that pairing can no longer be
//! trusted, every later publish is refused.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::broker::{
    Broker, BrokerChannel, BrokerConnection, BrokerError, CloseNotifier, Confirmation,
    PublishFlags,
};
use crate::error::{Error, Result, SetupStage};
use crate::properties::OutboundMessage;

/// Default wait for a publisher confirm.
pub const DEFAULT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublisherState {
    Disconnected,
    Connected,
    ConfirmModeEnabled,
    Ready,
    Closed,
    Faulted,
}

impl PublisherState {
    fn name(&self) -> &'static str {
        match self {
            PublisherState::Disconnected => "disconnected",
            PublisherState::Connected => "connected",
            PublisherState::ConfirmModeEnabled => "confirm-mode-enabled",
            PublisherState::Ready => "ready",
            PublisherState::Closed => "closed",
            PublisherState::Faulted => "faulted",
        }
    }
}

impl fmt::Display for PublisherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Broker verdict on one publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirm {
    Acked,
    Nacked(String),
}

/// Publishes over one channel, waiting for each confirm before returning.
pub struct ConfirmPublisher {
    connection: Option<Box<dyn BrokerConnection>>,
    channel: Option<Arc<dyn BrokerChannel>>,
    state: PublisherState,
    confirm_timeout: Duration,
    published: u64,
}

impl ConfirmPublisher {
    pub fn new(confirm_timeout: Duration) -> Self {
        Self {
            connection: None,
            channel: None,
            state: PublisherState::Disconnected,
            confirm_timeout,
            published: 0,
        }
    }

    /// Dial, open a channel and enable confirm mode.
    ///
    /// On failure the publisher is `Faulted` and the error names the stage.
    pub async fn connect(&mut self, broker: &dyn Broker, uri: &str) -> Result<()> {
        if self.state != PublisherState::Disconnected {
            return Err(Error::PublisherUnusable(self.state.name()));
        }

        let connection = match broker.connect(uri).await {
            Ok(connection) => connection,
            Err(source) => return Err(self.setup_failed(SetupStage::Connect, source)),
        };
        self.connection = Some(connection);
        self.state = PublisherState::Connected;

        let opened = match &self.connection {
            Some(connection) => connection.open_channel().await,
            None => Err(BrokerError::Closed("connection missing".to_string())),
        };
        let channel = match opened {
            Ok(channel) => channel,
            Err(source) => return Err(self.setup_failed(SetupStage::ChannelOpen, source)),
        };

        if let Err(source) = channel.confirm_select().await {
            return Err(self.setup_failed(SetupStage::ConfirmMode, source));
        }
        self.state = PublisherState::ConfirmModeEnabled;
        self.channel = Some(channel);
        self.state = PublisherState::Ready;
        debug!("Publisher ready");
        Ok(())
    }

    fn setup_failed(&mut self, stage: SetupStage, source: BrokerError) -> Error {
        warn!(stage = %stage, error = %source, "Publisher setup failed");
        self.state = PublisherState::Faulted;
        Error::Connection { stage, source }
    }

    pub fn state(&self) -> PublisherState {
        self.state
    }

    pub fn confirm_timeout(&self) -> Duration {
        self.confirm_timeout
    }

    /// Publish one message and wait for its confirm.
    ///
    /// Returns the verdict, or an error. Fatal errors ([`Error::is_fatal`])
    /// leave the publisher `Faulted`; a publish the client rejects outright
    /// does not.
    pub async fn publish_one(
        &mut self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        immediate: bool,
        message: &OutboundMessage,
    ) -> Result<Confirm> {
        let (mut connection_closed, channel): (CloseNotifier, Arc<dyn BrokerChannel>) =
            match (self.state, &self.connection, &self.channel) {
                (PublisherState::Ready, Some(connection), Some(channel)) => {
                    (connection.close_notifier(), channel.clone())
                }
                (state, _, _) => return Err(Error::PublisherUnusable(state.name())),
            };
        let mut channel_closed = channel.close_notifier();

        if channel_closed.is_closed() || connection_closed.is_closed() {
            let reason = tokio::select! {
                reason = channel_closed.closed() => reason,
                reason = connection_closed.closed() => reason,
            };
            return Err(self.fault(Error::ChannelFault(reason)));
        }

        let flags = PublishFlags {
            mandatory,
            immediate,
        };
        let pending = match channel.publish(exchange, routing_key, flags, message).await {
            Ok(pending) => pending,
            Err(BrokerError::Closed(reason)) => {
                return Err(self.fault(Error::ChannelFault(reason)));
            }
            Err(source) => {
                return Err(Error::Protocol {
                    operation: "basic.publish",
                    source,
                });
            }
        };
        self.published += 1;
        let sequence = self.published;

        let outcome = tokio::select! {
            biased;

            confirmation = pending => match confirmation {
                Ok(Confirmation::Ack) => Ok(Confirm::Acked),
                Ok(Confirmation::Nack) => Ok(Confirm::Nacked(format!(
                    "basic.nack for publish {} to {}/{}",
                    sequence, exchange, routing_key
                ))),
                Err(e) => Err(Error::ChannelFault(e.to_string())),
            },
            reason = channel_closed.closed() => Err(Error::ChannelFault(reason)),
            reason = connection_closed.closed() => Err(Error::ChannelFault(reason)),
            _ = tokio::time::sleep(self.confirm_timeout) => {
                Err(Error::ConfirmTimeout(self.confirm_timeout))
            }
        };

        match outcome {
            Ok(confirm) => {
                debug!(sequence = sequence, confirm = ?confirm, "Publish confirmed");
                Ok(confirm)
            }
            Err(e) => Err(self.fault(e)),
        }
    }

    fn fault(&mut self, error: Error) -> Error {
        warn!(error = %error, "Publisher faulted");
        self.state = PublisherState::Faulted;
        error
    }

    /// Close the channel and connection.
    pub async fn close(&mut self) {
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
        if self.state != PublisherState::Faulted {
            self.state = PublisherState::Closed;
        }
        info!(published = self.published, state = %self.state, "Publisher closed");
    }
}
