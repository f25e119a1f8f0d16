//! # amqp-tools
//!
//! Concurrency pipelines for working with an AMQP 0-9-1 broker from the
//! command line.
//!
//! ## Architecture
//!
//! ```text
//! bindings ──> ConsumeMultiplexer ──> ConsumeEvent stream ──> dump / ack
//! firehose ──> LogTailer ─────────┘
//!
//! filenames ──> FileDispatcher (W workers) ──> ConfirmPublisher ──> PublishResult stream
//! dumps ──────> Replayer ─────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`broker`]: capability traits over the protocol client, plus [`Delivery`]
//! - [`amqp`]: the capability traits implemented with `lapin`
//! - [`memory`]: an in-process broker for tests and dry runs
//! - [`binding`]: `exchange/queue/routing-key` parsing
//! - [`identifier`]: per-message id strategies
//! - [`properties`]: static delivery properties stamped on published messages
//! - [`consume`]: continuous and drain consumption over many bindings
//! - [`tail`]: firehose tailing of the broker's log and trace topics
//! - [`publish`]: the confirm-gated single-channel publisher
//! - [`dispatch`]: the file publishing worker pool
//! - [`dump`]: JSON rendering and on-disk layout of consumed messages
//! - [`replay`]: publishing dumped messages back to their exchange

pub mod amqp;
pub mod binding;
pub mod broker;
pub mod config;
pub mod consume;
pub mod dispatch;
pub mod dump;
pub mod error;
pub mod identifier;
pub mod memory;
pub mod properties;
pub mod publish;
pub mod replay;
pub mod shutdown;
pub mod tail;

pub use binding::{BindingSet, QueueBinding};
pub use broker::{Broker, BrokerChannel, BrokerConnection, Delivery};
pub use consume::{ConsumeEvent, ConsumeMode, ConsumeMultiplexer, ConsumeSession};
pub use dispatch::{DispatcherConfig, FileDispatcher, PublishResult, ResultSummary, RunStatus};
pub use error::{Error, SetupStage};
pub use identifier::IdentifierGenerator;
pub use properties::{DeliveryProperties, MessageProperties, OutboundMessage};
pub use publish::{Confirm, ConfirmPublisher, PublisherState};
pub use replay::{ReplayConfig, ReplayEnvelope, ReplaySource, Replayer};
pub use shutdown::ShutdownSignal;
pub use tail::LogTailer;

/// Unacknowledged deliveries allowed per channel in continuous mode.
pub const CONSUME_PREFETCH: u16 = 10;

/// Broker topic carrying the operational log.
pub const FIREHOSE_LOG_EXCHANGE: &str = "amq.rabbitmq.log";

/// Broker topic carrying the protocol trace.
pub const FIREHOSE_TRACE_EXCHANGE: &str = "amq.rabbitmq.trace";
