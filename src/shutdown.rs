//! Graceful shutdown coordination.
//!
//! A [`ShutdownSignal`] is cloned into the HTTP server and every foreman. When
//! SIGTERM or SIGINT arrives, the server stops accepting requests and each
//! worker finishes its current task before exiting.
//!
//! ```rust,ignore
//! let shutdown = ShutdownSignal::new();
//!
//! let worker_shutdown = shutdown.clone();
//! tokio::spawn(async move {
//!     loop {
//!         if worker_shutdown.is_shutdown() {
//!             break;
//!         }
//!         // ... pop and perform one task
//!     }
//! });
//!
//! shutdown.wait().await;
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Default time workers get to finish their current task, in seconds.
const DEFAULT_SHUTDOWN_TIMEOUT: u64 = 30;

/// A signal for coordinating graceful shutdown across components.
#[derive(Clone)]
pub struct ShutdownSignal {
    sender: broadcast::Sender<()>,
    triggered: Arc<AtomicBool>,
    timeout: Duration,
}

impl ShutdownSignal {
    /// Create a new shutdown signal with default timeout (30 seconds).
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT))
    }

    /// Create a new shutdown signal with custom timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        let (sender, _) = broadcast::channel(1);
        Self {
            sender,
            triggered: Arc::new(AtomicBool::new(false)),
            timeout,
        }
    }

    /// How long components get to drain after the signal.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Waits for SIGTERM or SIGINT, then notifies all subscribers.
    pub async fn wait(&self) {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Unable to listen for Ctrl+C");
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
                    error!(error = %e, "Unable to listen for SIGTERM");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received Ctrl+C, initiating graceful shutdown...");
            }
            _ = terminate => {
                info!("Received SIGTERM, initiating graceful shutdown...");
            }
        }

        self.notify();
    }

    /// Subscribe to shutdown notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.sender.subscribe()
    }

    /// Non-blocking check, true once the signal has fired.
    pub fn is_shutdown(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Trigger shutdown manually (for testing or programmatic shutdown).
    pub fn trigger(&self) {
        info!("Shutdown triggered programmatically");
        self.notify();
    }

    /// Resolves once shutdown has been signalled, including when that
    /// happened before the call.
    pub async fn recv(&self) {
        let mut receiver = self.sender.subscribe();
        if self.is_shutdown() {
            return;
        }
        let _ = receiver.recv().await;
    }

    /// Waits for shutdown for at most `timeout`.
    ///
    /// Returns `true` if shutdown was signalled within the timeout.
    pub async fn wait_with_timeout(&self, timeout: Duration) -> bool {
        tokio::select! {
            _ = self.recv() => true,
            _ = tokio::time::sleep(timeout) => {
                warn!(
                    timeout_secs = timeout.as_secs(),
                    "Shutdown timeout reached, forcing shutdown"
                );
                false
            }
        }
    }

    fn notify(&self) {
        self.triggered.store(true, Ordering::SeqCst);
        let _ = self.sender.send(());
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

    #[tokio::test]
    async fn test_custom_timeout() {
        assert_eq!(ShutdownSignal::new().timeout(), Duration::from_secs(30));
        let signal = ShutdownSignal::with_timeout(Duration::from_secs(60));
        assert_eq!(signal.timeout(), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_manual_trigger() {
        let signal = ShutdownSignal::new();
        let mut receiver = signal.subscribe();
        assert!(!signal.is_shutdown());

        let trigger_signal = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger_signal.trigger();
        });

        let result = tokio::time::timeout(Duration::from_millis(100), receiver.recv()).await;
        assert!(result.is_ok());
        assert!(signal.is_shutdown());
    }

    #[tokio::test]
    async fn test_recv_after_trigger() {
        let signal = ShutdownSignal::new();
        let clone = signal.clone();
        signal.trigger();

        assert!(clone.is_shutdown());
        assert!(clone.wait_with_timeout(Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let signal = ShutdownSignal::new();
        assert!(!signal.wait_with_timeout(Duration::from_millis(10)).await);
    }
}
