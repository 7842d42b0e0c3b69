// In-process pub/sub for "ingest tick completed" events.
//
// Each subscriber gets a buffered channel of capacity 1 and the publisher
// uses a non-blocking send, so consecutive ticks coalesce into one pending
// notification and a slow WebSocket session can never block the ingester.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

type Subscribers = Arc<Mutex<HashMap<u64, mpsc::Sender<()>>>>;

#[derive(Clone, Default)]
pub struct UpdateBus {
    subscribers: Subscribers,
    next_id: Arc<AtomicU64>,
}

/// Receive handle returned by [`UpdateBus::subscribe`]. Dropping it removes
/// the subscription from the registry.
pub struct UpdateSubscription {
    id: u64,
    rx: mpsc::Receiver<()>,
    subscribers: Subscribers,
}

impl UpdateBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> UpdateSubscription {
        let (tx, rx) = mpsc::channel(1);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().unwrap().insert(id, tx);
        UpdateSubscription {
            id,
            rx,
            subscribers: Arc::clone(&self.subscribers),
        }
    }

    /// Notify every subscriber without blocking; subscribers whose buffer
    /// is already full keep their single pending notification.
    pub fn publish(&self) {
        let subscribers = self.subscribers.lock().unwrap();
        for tx in subscribers.values() {
            let _ = tx.try_send(());
        }
        debug!("Published update to {} subscribers", subscribers.len());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }
}

impl UpdateSubscription {
    /// Wait for the next notification. Returns `false` once the bus side
    /// of the channel is gone.
    pub async fn notified(&mut self) -> bool {
        self.rx.recv().await.is_some()
    }
}

impl Drop for UpdateSubscription {
    fn drop(&mut self) {
        self.subscribers.lock().unwrap().remove(&self.id);
    }
}
