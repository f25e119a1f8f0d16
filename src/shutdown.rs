//! Cancellation shared by every long-running loop.
//!
//! A [`ShutdownSignal`] is cloned into each consume pump and publish worker.
//! Triggering any clone (manually or from SIGINT/SIGTERM) stops them all at
//! their next suspension point.
//!
//! # Example
//!
//! ```rust,ignore
//! use amqp_tools::shutdown::ShutdownSignal;
//!
//! let shutdown = ShutdownSignal::new();
//! let worker_shutdown = shutdown.clone();
//!
//! tokio::spawn(async move {
//!     loop {
//!         tokio::select! {
//!             _ = worker_shutdown.cancelled() => break,
//!             // ... next delivery
//!         }
//!     }
//! });
//!
//! shutdown.listen_for_signals().await;
//! ```

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// A cancellation flag that can be awaited.
///
/// Unlike a broadcast, the flag is sticky: a clone that starts waiting after
/// the trigger still returns immediately.
#[derive(Clone, Debug)]
pub struct ShutdownSignal {
    sender: Arc<watch::Sender<bool>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Trigger shutdown for every clone.
    pub fn trigger(&self) {
        if !self.is_shutdown() {
            info!("Shutdown triggered");
        }
        self.sender.send_replace(true);
    }

    /// Non-blocking check.
    pub fn is_shutdown(&self) -> bool {
        *self.sender.borrow()
    }

    /// Resolve once shutdown has been triggered.
    pub async fn cancelled(&self) {
        let mut receiver = self.sender.subscribe();
        // The sender lives in `self`, so the wait only ends by trigger.
        let _ = receiver.wait_for(|stopped| *stopped).await;
    }

    /// Wait for SIGINT or SIGTERM, then trigger.
    pub async fn listen_for_signals(&self) {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
            _ = terminate => info!("Received SIGTERM, shutting down"),
            _ = self.cancelled() => return,
        }

        self.trigger();
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_manual_trigger() {
        let signal = ShutdownSignal::new();
        let trigger_signal = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger_signal.trigger();
        });

        let result = tokio::time::timeout(Duration::from_millis(500), signal.cancelled()).await;
        assert!(result.is_ok());
        assert!(signal.is_shutdown());
    }

    #[tokio::test]
    async fn test_late_waiter_sees_trigger() {
        let signal = ShutdownSignal::new();
        signal.trigger();

        let late = signal.clone();
        let result = tokio::time::timeout(Duration::from_millis(50), late.cancelled()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_untriggered_signal_keeps_waiting() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_shutdown());
        let result = tokio::time::timeout(Duration::from_millis(20), signal.cancelled()).await;
        assert!(result.is_err());
    }
}
