//! Coordinated Shutdown
//!
//! Every long-running piece of a node (transport accept loop, per-connection
//! readers, retransmission worker, failure detector) listens on a
//! [`ShutdownController`] and stops when it fires.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::Notify;

/// Shutdown coordinator for one component.
///
/// Tracks active connections and signals shutdown to every subscriber.
#[derive(Clone)]
pub struct ShutdownController {
    /// Component name used in log lines
    component: &'static str,
    /// Whether shutdown has been initiated
    shutdown_initiated: Arc<AtomicBool>,
    /// Number of active connections
    active_connections: Arc<AtomicUsize>,
    /// Broadcast channel for shutdown signal
    shutdown_tx: broadcast::Sender<()>,
    /// Notify when all connections are drained
    drain_complete: Arc<Notify>,
}

impl ShutdownController {
    /// Create a new shutdown controller for the named component.
    pub fn new(component: &'static str) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            component,
            shutdown_initiated: Arc::new(AtomicBool::new(false)),
            active_connections: Arc::new(AtomicUsize::new(0)),
            shutdown_tx,
            drain_complete: Arc::new(Notify::new()),
        }
    }

    /// Name of the component this controller stops.
    pub fn component(&self) -> &'static str {
        self.component
    }

    /// Subscribe to shutdown notifications.
    ///
    /// Subscribe before spawning the task that waits, otherwise a shutdown
    /// racing the spawn is missed. Tasks should also check [`is_shutdown`].
    ///
    /// [`is_shutdown`]: ShutdownController::is_shutdown
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Initiate shutdown. Idempotent.
    pub fn shutdown(&self) {
        if !self.shutdown_initiated.swap(true, Ordering::SeqCst) {
            tracing::debug!("{} shutting down", self.component);
            let _ = self.shutdown_tx.send(());
        }
    }

    /// Check if shutdown has been initiated.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown_initiated.load(Ordering::SeqCst)
    }

    /// Get the number of active connections.
    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::SeqCst)
    }

    fn connection_started(&self) {
        self.active_connections.fetch_add(1, Ordering::SeqCst);
    }

    fn connection_ended(&self) {
        let prev = self.active_connections.fetch_sub(1, Ordering::SeqCst);
        if prev == 1 && self.is_shutdown() {
            self.drain_complete.notify_waiters();
        }
    }

    /// Wait for all connections to drain (with timeout).
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let drained = self.drain_complete.notified();
        tokio::pin!(drained);
        drained.as_mut().enable();

        if self.active_connections() == 0 {
            return true;
        }

        tokio::select! {
            _ = drained => true,
            _ = tokio::time::sleep(timeout) => {
                tracing::warn!(
                    "{} drain timeout: {} connections still active",
                    self.component,
                    self.active_connections()
                );
                false
            }
        }
    }

    /// Create a connection guard that auto-decrements on drop.
    pub fn connection_guard(&self) -> ConnectionGuard {
        self.connection_started();
        ConnectionGuard {
            controller: self.clone(),
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new("node")
    }
}

/// RAII guard for tracking active connections.
pub struct ConnectionGuard {
    controller: ShutdownController,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.controller.connection_ended();
    }
}

/// Install signal handlers for graceful shutdown.
///
/// Returns a future that completes when Ctrl+C or SIGTERM is received.
#[cfg_attr(coverage_nightly, coverage(off))]
pub async fn shutdown_signal(controller: ShutdownController) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received Ctrl+C, leaving cluster");
        }
        _ = terminate => {
            tracing::info!("received SIGTERM, leaving cluster");
        }
    }

    controller.shutdown();
}
