//! Live fan-out of presence events to connected subscribers.
//!
//! Delivery to one subscriber never affects the others. Subscribers whose
//! delivery fails are pruned after the sweep, in one step, so the subscriber
//! set is never modified while it is being iterated.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, RwLock};

use crate::event::{EventEmitter, PresenceEvent};

/// Default time a `ChannelSink` waits for room in a full channel.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// One subscriber connection.
#[async_trait]
pub trait EventSink: Send {
    /// One-time handshake, run by `Broadcaster::connect` before registration.
    async fn accept(&mut self) -> Result<()> {
        Ok(())
    }

    /// Deliver one serialized message. An error marks the sink dead.
    async fn send(&mut self, message: &str) -> Result<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

type SharedSink = Arc<Mutex<Box<dyn EventSink>>>;

/// Outcome of one broadcast sweep.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub pruned: Vec<SubscriberId>,
}

pub struct Broadcaster {
    subscribers: RwLock<HashMap<SubscriberId, SharedSink>>,
    next_id: AtomicU64,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Handshake with `sink` and add it to the subscriber set.
    pub async fn connect(&self, mut sink: Box<dyn EventSink>) -> Result<SubscriberId> {
        sink.accept().await?;
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let count = {
            let mut subscribers = self.subscribers.write().await;
            subscribers.insert(id, Arc::new(Mutex::new(sink)));
            subscribers.len()
        };
        log::info!("broadcast: {} connected ({} subscribers)", id, count);
        Ok(id)
    }

    /// Remove a subscriber. Returns false if it was not connected.
    pub async fn disconnect(&self, id: SubscriberId) -> bool {
        let removed = self.subscribers.write().await.remove(&id).is_some();
        if removed {
            log::info!("broadcast: {} disconnected", id);
        }
        removed
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Deliver `event` to every subscriber connected at call time.
    pub async fn broadcast(&self, event: &PresenceEvent) -> BroadcastReport {
        let message = match event.to_wire_json() {
            Ok(message) => message,
            Err(e) => {
                log::error!("broadcast: failed to serialize event {}: {}", event.id, e);
                return BroadcastReport::default();
            }
        };
        self.broadcast_text(&message).await
    }

    /// Deliver an already serialized message.
    pub async fn broadcast_text(&self, message: &str) -> BroadcastReport {
        let targets: Vec<(SubscriberId, SharedSink)> = {
            let subscribers = self.subscribers.read().await;
            let mut targets: Vec<_> = subscribers
                .iter()
                .map(|(id, sink)| (*id, sink.clone()))
                .collect();
            targets.sort_by_key(|(id, _)| *id);
            targets
        };

        let mut report = BroadcastReport::default();
        for (id, sink) in targets {
            let result = sink.lock().await.send(message).await;
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    log::warn!("broadcast: dropping {}: {:#}", id, e);
                    report.pruned.push(id);
                }
            }
        }

        if !report.pruned.is_empty() {
            let mut subscribers = self.subscribers.write().await;
            for id in &report.pruned {
                subscribers.remove(id);
            }
        }
        report
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventEmitter for Broadcaster {
    async fn emit(&self, event: PresenceEvent) {
        self.broadcast(&event).await;
    }
}

/// Subscriber backed by a bounded channel. A closed receiver, or a receiver
/// that stays full past the send timeout, counts as a dead subscriber.
pub struct ChannelSink {
    tx: mpsc::Sender<String>,
    send_timeout: Duration,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<String>) -> Self {
        Self {
            tx,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }

    /// A sink and the receiver its messages arrive on.
    pub fn pair(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    pub fn with_send_timeout(mut self, send_timeout: Duration) -> Self {
        self.send_timeout = send_timeout;
        self
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn accept(&mut self) -> Result<()> {
        if self.tx.is_closed() {
            return Err(anyhow!("subscriber channel closed before connect"));
        }
        Ok(())
    }

    async fn send(&mut self, message: &str) -> Result<()> {
        self.tx
            .send_timeout(message.to_string(), self.send_timeout)
            .await
            .map_err(|e| match e {
                mpsc::error::SendTimeoutError::Timeout(_) => anyhow!("subscriber too slow"),
                mpsc::error::SendTimeoutError::Closed(_) => anyhow!("subscriber channel closed"),
            })
    }
}
