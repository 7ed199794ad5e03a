//! Cooperative shutdown shared by every worker loop.
//!
//! Loops check the signal between iterations only, so a batch that has been
//! claimed is always finished and saved before its worker exits.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

const DEFAULT_GRACE: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct ShutdownSignal {
    sender: Arc<watch::Sender<bool>>,
    grace: Duration
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::with_grace(DEFAULT_GRACE)
    }

    pub fn with_grace(grace: Duration) -> Self {
        let (sender, _) = watch::channel(false);

        Self {
            sender: Arc::new(sender),
            grace
        }
    }

    /// How long the owner waits for workers to drain after triggering.
    pub fn grace(&self) -> Duration {
        self.grace
    }

    pub fn trigger(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.sender.borrow()
    }

    /// Resolves once [`trigger`](Self::trigger) has been called, immediately if
    /// it already was.
    pub async fn triggered(&self) {
        let mut receiver = self.sender.subscribe();
        let _ = receiver.wait_for(|triggered| *triggered).await;
    }

    /// Waits for Ctrl+C or SIGTERM and then triggers the signal.
    pub async fn wait_for_os_signal(&self) {
        let ctrl_c = async {
            if let Err(error) = tokio::signal::ctrl_c().await {
                warn!("Unable to listen for Ctrl+C: {error}");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(error) => {
                    warn!("Unable to listen for SIGTERM: {error}");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
            _ = terminate => info!("Received SIGTERM, shutting down"),
            _ = self.triggered() => return
        }

        self.trigger();
    }
}
