//! File publishing worker pool.
//!
//! # Flow
//!
//! ```text
//! filenames ──> Arc<Mutex<UnboundedReceiver<PathBuf>>> ──┬──> worker 0 ─┐
//!                                                        ├──> worker 1 ─┼──> UnboundedSender<PublishResult>
//!                                                        └──> worker N ─┘
//! ```
//!
//! Each worker owns one connection, one channel and one [`ConfirmPublisher`].
//! A filename is taken by exactly one worker. Per-file problems (unreadable
//! file, rejected publish, nack) become non-fatal results and the worker
//! moves on. A fault on the worker's channel becomes a single fatal result
//! and the worker stops; files it never took stay with the other workers.
//!
//! The result stream closes once every worker has stopped.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::broker::Broker;
use crate::error::Error;
use crate::properties::{DeliveryProperties, OutboundMessage};
use crate::publish::{Confirm, ConfirmPublisher, DEFAULT_CONFIRM_TIMEOUT};
use crate::shutdown::ShutdownSignal;

/// Everything a worker needs to publish files.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub uri: String,
    pub exchange: String,
    pub routing_key: String,
    pub mandatory: bool,
    pub immediate: bool,
    pub workers: usize,
    pub confirm_timeout: Duration,
    pub properties: DeliveryProperties,
}

impl DispatcherConfig {
    pub fn new(
        uri: impl Into<String>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            uri: uri.into(),
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            mandatory: false,
            immediate: false,
            workers: 3,
            confirm_timeout: DEFAULT_CONFIRM_TIMEOUT,
            properties: DeliveryProperties::default(),
        }
    }
}

/// Outcome of publishing one file.
#[derive(Debug)]
pub struct PublishResult {
    /// Filename, or empty when a worker failed before taking one
    pub target: String,
    pub message: String,
    pub error: Option<Error>,
    /// The producing worker has stopped
    pub fatal: bool,
}

impl PublishResult {
    pub fn success(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            message: message.into(),
            error: None,
            fatal: false,
        }
    }

    pub fn failure(target: impl Into<String>, error: Error) -> Self {
        Self {
            target: target.into(),
            message: error.to_string(),
            fatal: error.is_fatal(),
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

impl fmt::Display for PublishResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let target = if self.target.is_empty() {
            "<worker>"
        } else {
            self.target.as_str()
        };
        if self.fatal {
            write!(f, "{}: FATAL {}", target, self.message)
        } else {
            write!(f, "{}: {}", target, self.message)
        }
    }
}

/// Overall outcome of a publishing run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    PartialFailure,
    Fatal,
}

impl RunStatus {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunStatus::Success => 0,
            RunStatus::PartialFailure => 9,
            RunStatus::Fatal => 86,
        }
    }
}

/// Running tally of [`PublishResult`]s.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub fatal: usize,
}

impl ResultSummary {
    pub fn record(&mut self, result: &PublishResult) {
        if result.fatal {
            self.fatal += 1;
        } else if result.is_success() {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
    }

    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.fatal
    }

    pub fn status(&self) -> RunStatus {
        if self.fatal > 0 {
            RunStatus::Fatal
        } else if self.failed > 0 {
            RunStatus::PartialFailure
        } else {
            RunStatus::Success
        }
    }
}

/// Spawns publish workers over a shared filename queue.
pub struct FileDispatcher {
    broker: Arc<dyn Broker>,
    config: Arc<DispatcherConfig>,
    shutdown: ShutdownSignal,
}

impl FileDispatcher {
    pub fn new(broker: Arc<dyn Broker>, config: DispatcherConfig) -> Self {
        Self {
            broker,
            config: Arc::new(config),
            shutdown: ShutdownSignal::new(),
        }
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Start the workers. Results arrive as files are published; the stream
    /// ends when every worker has stopped, which happens once `files` is
    /// closed and drained, or on shutdown.
    pub fn spawn(
        &self,
        files: mpsc::UnboundedReceiver<PathBuf>,
    ) -> mpsc::UnboundedReceiver<PublishResult> {
        let queue = Arc::new(Mutex::new(files));
        let (results, receiver) = mpsc::unbounded_channel();
        let workers = self.config.workers.max(1);

        info!(
            workers = workers,
            exchange = %self.config.exchange,
            routing_key = %self.config.routing_key,
            "Starting publish workers"
        );

        for id in 0..workers {
            let worker = Worker {
                id,
                broker: self.broker.clone(),
                config: self.config.clone(),
                queue: queue.clone(),
                results: results.clone(),
                shutdown: self.shutdown.clone(),
            };
            tokio::spawn(worker.run());
        }

        receiver
    }
}

struct Worker {
    id: usize,
    broker: Arc<dyn Broker>,
    config: Arc<DispatcherConfig>,
    queue: Arc<Mutex<mpsc::UnboundedReceiver<PathBuf>>>,
    results: mpsc::UnboundedSender<PublishResult>,
    shutdown: ShutdownSignal,
}

impl Worker {
    async fn run(self) {
        let mut publisher = ConfirmPublisher::new(self.config.confirm_timeout);

        let connected = tokio::select! {
            biased;

            _ = self.shutdown.cancelled() => return,
            connected = publisher.connect(self.broker.as_ref(), &self.config.uri) => connected,
        };
        if let Err(e) = connected {
            error!(worker = self.id, error = %e, "Worker setup failed");
            let _ = self.results.send(PublishResult::failure("", e));
            return;
        }
        debug!(worker = self.id, "Worker ready");

        let mut published = 0usize;
        loop {
            let next = tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => None,
                path = self.next_file() => path,
            };
            let Some(path) = next else {
                break;
            };

            let result = self.publish_file(&mut publisher, &path).await;
            let fatal = result.fatal;
            if result.is_success() {
                published += 1;
            } else {
                warn!(
                    worker = self.id,
                    file = %path.display(),
                    error = %result.message,
                    "Publish failed"
                );
            }

            if self.results.send(result).is_err() || fatal {
                break;
            }
        }

        publisher.close().await;
        debug!(worker = self.id, published = published, "Worker stopped");
    }

    async fn next_file(&self) -> Option<PathBuf> {
        self.queue.lock().await.recv().await
    }

    async fn publish_file(&self, publisher: &mut ConfirmPublisher, path: &Path) -> PublishResult {
        let target = path.display().to_string();

        let body = match tokio::fs::read(path).await {
            Ok(body) => body,
            Err(e) => return PublishResult::failure(target, Error::Io(e)),
        };

        let mut properties = match self.config.properties.stamp() {
            Ok(properties) => properties,
            Err(e) => return PublishResult::failure(target, e.into()),
        };
        if properties.content_type.is_none() {
            properties.content_type = content_type_for(path);
        }

        let size = body.len();
        let message = OutboundMessage::new(properties, body);
        let config = &self.config;
        match publisher
            .publish_one(
                &config.exchange,
                &config.routing_key,
                config.mandatory,
                config.immediate,
                &message,
            )
            .await
        {
            Ok(Confirm::Acked) => PublishResult::success(
                target,
                format!(
                    "published {} bytes to {}/{}",
                    size, config.exchange, config.routing_key
                ),
            ),
            Ok(Confirm::Nacked(reason)) => {
                PublishResult::failure(target, Error::ConfirmNegative(reason))
            }
            Err(e) => PublishResult::failure(target, e),
        }
    }
}

/// Content type guessed from the file extension.
fn content_type_for(path: &Path) -> Option<String> {
    mime_guess::from_path(path).first_raw().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BrokerError;
    use crate::memory::MemoryBroker;

    #[test]
    fn test_summary_status() {
        let mut summary = ResultSummary::default();
        assert_eq!(summary.status(), RunStatus::Success);

        summary.record(&PublishResult::success("a.json", "ok"));
        assert_eq!(summary.status().exit_code(), 0);

        summary.record(&PublishResult::failure(
            "b.json",
            Error::ConfirmNegative("nack".to_string()),
        ));
        assert_eq!(summary.status(), RunStatus::PartialFailure);
        assert_eq!(summary.status().exit_code(), 9);

        summary.record(&PublishResult::failure("c.json", Error::ChannelFault("gone".to_string())));
        assert_eq!(summary.status(), RunStatus::Fatal);
        assert_eq!(summary.status().exit_code(), 86);
        assert_eq!(summary.total(), 3);
    }

    #[test]
    fn test_failure_fatality_follows_error() {
        let result = PublishResult::failure(
            "x",
            Error::Protocol {
                operation: "basic.publish",
                source: BrokerError::Rejected("frame too large".to_string()),
            },
        );
        assert!(!result.fatal);
        assert!(!result.is_success());

        let result = PublishResult::failure("", Error::ConfirmTimeout(Duration::from_secs(30)));
        assert!(result.fatal);
        assert!(result.to_string().starts_with("<worker>: FATAL"));
    }

    #[test]
    fn test_content_type_from_extension() {
        assert_eq!(content_type_for(Path::new("order.json")).as_deref(), Some("application/json"));
        assert_eq!(content_type_for(Path::new("notes.txt")).as_deref(), Some("text/plain"));
        assert_eq!(content_type_for(Path::new("blob")), None);
    }

    #[tokio::test]
    async fn test_unreadable_file_is_not_fatal() {
        let broker = MemoryBroker::new();
        let mut config = DispatcherConfig::new("amqp://memory", "orders", "order.created");
        config.workers = 1;
        let dispatcher = FileDispatcher::new(Arc::new(broker.clone()), config);

        let (files, queue) = mpsc::unbounded_channel();
        files.send(PathBuf::from("/nonexistent/order-1.json")).unwrap();
        drop(files);

        let mut results = dispatcher.spawn(queue);
        let result = results.recv().await.unwrap();
        assert_eq!(result.target, "/nonexistent/order-1.json");
        assert!(matches!(result.error, Some(Error::Io(_))));
        assert!(!result.fatal);
        assert!(results.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_setup_failure_yields_one_fatal_per_worker() {
        let broker = MemoryBroker::new();
        broker.fail_connect("connection refused");
        let mut config = DispatcherConfig::new("amqp://memory", "orders", "k");
        config.workers = 2;
        let dispatcher = FileDispatcher::new(Arc::new(broker), config);

        let (_files, queue) = mpsc::unbounded_channel();
        let mut results = dispatcher.spawn(queue);

        let mut fatal = 0;
        while let Some(result) = results.recv().await {
            assert!(result.fatal);
            assert!(result.target.is_empty());
            fatal += 1;
        }
        assert_eq!(fatal, 2);
    }
}
