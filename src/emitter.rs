use async_trait::async_trait;
use std::sync::Arc;

use crate::broadcast::Broadcaster;
use crate::event::{EventEmitter, PresenceEvent};
use crate::storage::EventStore;

/// Persists each event, then fans it out to live subscribers.
///
/// A persistence failure is logged and the event is still broadcast.
pub struct StoreAndBroadcast {
    store: Arc<dyn EventStore>,
    broadcaster: Arc<Broadcaster>,
}

impl StoreAndBroadcast {
    pub fn new(store: Arc<dyn EventStore>, broadcaster: Arc<Broadcaster>) -> Self {
        Self { store, broadcaster }
    }
}

#[async_trait]
impl EventEmitter for StoreAndBroadcast {
    async fn emit(&self, event: PresenceEvent) {
        let store = self.store.clone();
        let record = event.clone();
        match tokio::task::spawn_blocking(move || store.append(&record)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::error!("failed to persist event {}: {}", event.id, e),
            Err(e) => log::error!("persist task for event {} failed: {}", event.id, e),
        }
        let report = self.broadcaster.broadcast(&event).await;
        log::debug!(
            "event {} delivered to {} subscribers ({} pruned)",
            event.id,
            report.delivered,
            report.pruned.len()
        );
    }
}
