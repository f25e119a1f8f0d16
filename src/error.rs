//! Error taxonomy shared by the consume and publish pipelines.
//!
//! Errors split into per-item failures, which are reported and skipped, and
//! session faults, which end the owning worker or consume session. Use
//! [`Error::is_fatal`] to tell them apart.

use std::time::Duration;
use thiserror::Error;

use crate::broker::BrokerError;
use crate::identifier::IdentifierError;

/// Errors raised by the consume and publish pipelines.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed configuration, rejected before any network activity
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Dial or channel-open failure
    #[error("connection error ({stage}): {source}")]
    Connection {
        stage: SetupStage,
        #[source]
        source: BrokerError,
    },

    /// Bind, consume, fetch or publish rejected by the broker
    #[error("{operation} rejected: {source}")]
    Protocol {
        operation: &'static str,
        #[source]
        source: BrokerError,
    },

    /// The broker answered a publish with basic.nack
    #[error("received basic.nack: {0}")]
    ConfirmNegative(String),

    /// The channel was closed while it was in use
    #[error("channel closed: {0}")]
    ChannelFault(String),

    /// No confirm arrived within the configured window
    #[error("no publisher confirm within {}ms", .0.as_millis())]
    ConfirmTimeout(Duration),

    /// A publisher in a terminal state was asked to publish
    #[error("publisher is {0} and cannot be reused")]
    PublisherUnusable(&'static str),

    /// A dumped message could not be read back
    #[error("invalid message envelope: {0}")]
    Envelope(#[from] serde_json::Error),

    #[error(transparent)]
    Identifier(#[from] IdentifierError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True when the owning session or worker can no longer be used.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Connection { .. }
                | Error::ChannelFault(_)
                | Error::ConfirmTimeout(_)
                | Error::PublisherUnusable(_)
        )
    }

    /// Setup stage this error aborted, if it happened during setup.
    pub fn stage(&self) -> Option<SetupStage> {
        match self {
            Error::Connection { stage, .. } => Some(*stage),
            Error::Protocol { operation, .. } => match *operation {
                "basic.qos" => Some(SetupStage::Prefetch),
                "queue.bind" | "basic.consume" | "queue.declare" => Some(SetupStage::BindConsume),
                _ => None,
            },
            Error::Identifier(_) => Some(SetupStage::ConsumerTag),
            _ => None,
        }
    }
}

/// Stages of session setup, each with a distinct process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupStage {
    Connect,
    ChannelOpen,
    Prefetch,
    ConsumerTag,
    BindConsume,
    ConfirmMode,
}

impl SetupStage {
    /// Exit code the consume front end uses when setup fails at this stage.
    pub fn exit_code(&self) -> i32 {
        match self {
            SetupStage::Connect => 1,
            SetupStage::ChannelOpen => 2,
            SetupStage::Prefetch => 3,
            SetupStage::ConsumerTag => 4,
            SetupStage::BindConsume => 5,
            SetupStage::ConfirmMode => 6,
        }
    }
}

impl std::fmt::Display for SetupStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SetupStage::Connect => "connection.establish",
            SetupStage::ChannelOpen => "channel.open",
            SetupStage::Prefetch => "channel.qos",
            SetupStage::ConsumerTag => "consumer.tag",
            SetupStage::BindConsume => "queue.bind",
            SetupStage::ConfirmMode => "confirm.select",
        };
        f.write_str(name)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_stage_exit_codes_are_distinct() {
        let stages = [
            SetupStage::Connect,
            SetupStage::ChannelOpen,
            SetupStage::Prefetch,
            SetupStage::ConsumerTag,
            SetupStage::BindConsume,
            SetupStage::ConfirmMode,
        ];
        let codes: HashSet<i32> = stages.iter().map(|s| s.exit_code()).collect();
        assert_eq!(codes.len(), stages.len());
        assert_eq!(SetupStage::Connect.exit_code(), 1);
        assert_eq!(SetupStage::BindConsume.exit_code(), 5);
    }

    #[test]
    fn test_fatality() {
        assert!(Error::ChannelFault("gone".into()).is_fatal());
        assert!(Error::ConfirmTimeout(Duration::from_secs(1)).is_fatal());
        assert!(!Error::ConfirmNegative("nack".into()).is_fatal());
        assert!(!Error::Configuration("bad".into()).is_fatal());

        let envelope = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(!Error::Envelope(envelope).is_fatal());
    }

    #[test]
    fn test_protocol_stage_mapping() {
        let err = Error::Protocol {
            operation: "basic.qos",
            source: BrokerError::Rejected("no".into()),
        };
        assert_eq!(err.stage(), Some(SetupStage::Prefetch));

        let err = Error::Protocol {
            operation: "queue.bind",
            source: BrokerError::Rejected("no".into()),
        };
        assert_eq!(err.stage(), Some(SetupStage::BindConsume));
    }
}
