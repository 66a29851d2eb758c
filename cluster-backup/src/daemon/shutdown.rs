//! SIGINT/SIGTERM handling.
//!
//! A signal cancels the shared token; in-flight exec streams observe it and
//! stop, and the run is sealed with its cancellation flag set. A restore
//! interrupted after scale-down leaves the deployment at zero and reports it.

use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Token cancelled on the first signal.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Cancel without a signal.
    pub fn trigger(&self) {
        self.token.cancel();
    }

    /// Listen for signals in the background until the token is cancelled.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let token = self.token.clone();
            tokio::select! {
                _ = self.wait_for_signal() => self.trigger(),
                _ = token.cancelled() => {}
            }
        })
    }

    /// Wait for SIGINT or SIGTERM
    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                warn!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                }
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received SIGINT (Ctrl+C), cancelling in-flight work...");
            }
            _ = terminate => {
                info!("Received SIGTERM, cancelling in-flight work...");
            }
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
