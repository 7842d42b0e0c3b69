use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// How long draining connections get after the shutdown notice.
pub const GRACE_PERIOD: std::time::Duration = std::time::Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub connected_at: DateTime<Utc>,
}

/// Registry of live WebSocket sessions plus the channel used to tell them
/// the server is going away.
#[derive(Clone)]
pub struct SessionRegistry {
    shutdown_tx: broadcast::Sender<()>,
    sessions: Arc<DashMap<u64, SessionInfo>>,
    next_id: Arc<AtomicU64>,
}

/// Handle held by a session for its lifetime; dropping it removes the
/// session from the registry.
pub struct SessionGuard {
    id: u64,
    sessions: Arc<DashMap<u64, SessionInfo>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            shutdown_tx,
            sessions: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn register(&self) -> SessionGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.sessions.insert(
            id,
            SessionInfo {
                connected_at: Utc::now(),
            },
        );
        metrics::gauge!("ws.connections").set(self.sessions.len() as f64);
        SessionGuard {
            id,
            sessions: Arc::clone(&self.sessions),
        }
    }

    /// Subscribe to the shutdown notice. Must be called before the signal
    /// fires to be guaranteed delivery.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Tell every live session to say goodbye. Returns how many sessions
    /// were connected at that moment.
    pub fn broadcast_shutdown(&self) -> usize {
        let count = self.sessions.len();
        let _ = self.shutdown_tx.send(());
        count
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.sessions.remove(&self.id);
        metrics::gauge!("ws.connections").set(self.sessions.len() as f64);
    }
}

/// Sequences process termination: notify WebSocket sessions, stop the
/// ingester, then let the HTTP listener drain.
pub struct ShutdownCoordinator {
    registry: SessionRegistry,
    ingest_cancel: CancellationToken,
    http_cancel: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new(
        registry: SessionRegistry,
        ingest_cancel: CancellationToken,
        http_cancel: CancellationToken,
    ) -> Self {
        Self {
            registry,
            ingest_cancel,
            http_cancel,
        }
    }

    /// Block until SIGINT or SIGTERM.
    pub async fn wait_for_signal(&self) {
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("installing SIGTERM handler");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
    }

    /// Kick off the shutdown sequence.
    pub fn begin(&self) {
        let notified = self.registry.broadcast_shutdown();
        info!(
            "Shutting down: notified {} sessions, stopping ingester",
            notified
        );
        self.ingest_cancel.cancel();
        self.http_cancel.cancel();
    }
}
