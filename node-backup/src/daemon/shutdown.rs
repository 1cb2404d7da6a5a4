//! Graceful shutdown handling for SIGTERM and SIGINT.
//!
//! Running operations get a grace period to finish; whatever is still running
//! afterwards is cancelled. Shutdown returns once the cancelled operations
//! have cleared their snapshots and released their locks.

use crate::operations::OperationsService;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(250);

pub struct ShutdownCoordinator {
    shutdown_tx: broadcast::Sender<()>,
    operations: OperationsService,
}

impl ShutdownCoordinator {
    pub fn new(operations: OperationsService) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            shutdown_tx,
            operations,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Wait for SIGTERM or SIGINT and notify subscribers.
    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
            }
            _ = terminate => {
                info!("Received SIGTERM, initiating graceful shutdown...");
            }
        }

        self.notify();
    }

    fn notify(&self) {
        if let Err(e) = self.shutdown_tx.send(()) {
            warn!("Failed to broadcast shutdown signal: {}", e);
        }
    }

    /// Give running operations up to `grace` to finish, then cancel the rest.
    pub async fn shutdown(&self, grace: Duration) {
        info!("Graceful shutdown initiated");

        let drained = tokio::time::timeout(grace, async {
            while self.operations.running_count().await > 0 {
                tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
            }
        })
        .await;

        if drained.is_err() {
            let running = self.operations.running_count().await;
            warn!("{} operation(s) still running after {:?}, cancelling", running, grace);
            self.operations.cancel_all().await;
        }

        info!("Graceful shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::NodetoolClusterControl;
    use crate::operations::Engine;
    use crate::storage::StorageRegistry;
    use crate::ws::WsState;
    use std::sync::Arc;

    fn coordinator() -> ShutdownCoordinator {
        let engine = Engine::new(
            Arc::new(NodetoolClusterControl::new("nodetool", Vec::new())),
            StorageRegistry::with_defaults(),
        );
        ShutdownCoordinator::new(OperationsService::new(engine, WsState::new()))
    }

    #[tokio::test]
    async fn test_subscribers_are_notified() {
        let coordinator = coordinator();
        let mut rx = coordinator.subscribe();

        let handle = tokio::spawn(async move {
            rx.recv().await.ok();
        });

        coordinator.notify();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_idle_shutdown_returns_immediately() {
        let coordinator = coordinator();
        let started = std::time::Instant::now();

        coordinator.shutdown(Duration::from_secs(30)).await;

        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
