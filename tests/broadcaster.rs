use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;

use presence_kernel::{BBox, Broadcaster, ChannelSink, EventEmitter, EventSink, PresenceEvent};

/// Accepts `budget` messages, then fails forever.
struct Flaky {
    budget: usize,
}

#[async_trait]
impl EventSink for Flaky {
    async fn send(&mut self, _message: &str) -> anyhow::Result<()> {
        if self.budget == 0 {
            return Err(anyhow!("connection reset"));
        }
        self.budget -= 1;
        Ok(())
    }
}

/// Slow but healthy subscriber.
struct Slow {
    tx: tokio::sync::mpsc::UnboundedSender<String>,
}

#[async_trait]
impl EventSink for Slow {
    async fn send(&mut self, message: &str) -> anyhow::Result<()> {
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.tx.send(message.to_string()).map_err(|_| anyhow!("closed"))
    }
}

fn event(ts: f64) -> PresenceEvent {
    PresenceEvent::new(ts, "cam01", "stub", BBox::new(0, 0, 10, 10), None)
}

#[tokio::test]
async fn broken_sinks_do_not_block_healthy_ones() {
    let hub = Broadcaster::new();
    let mut receivers = Vec::new();
    for i in 0..6 {
        if i % 2 == 0 {
            let (sink, rx) = ChannelSink::pair(16);
            hub.connect(Box::new(sink)).await.unwrap();
            receivers.push(rx);
        } else {
            hub.connect(Box::new(Flaky { budget: i })).await.unwrap();
        }
    }
    assert_eq!(hub.subscriber_count().await, 6);

    for ts in 0..6 {
        hub.emit(event(ts as f64)).await;
    }
    // Flaky sinks with budgets 1, 3 and 5 have all failed by the sixth event.
    assert_eq!(hub.subscriber_count().await, 3);

    for rx in receivers.iter_mut() {
        let mut seen = Vec::new();
        while let Ok(line) = rx.try_recv() {
            let ev: PresenceEvent = serde_json::from_str(&line).unwrap();
            seen.push(ev.ts);
        }
        assert_eq!(seen, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
    }
}

#[tokio::test]
async fn per_sink_order_holds_under_concurrent_connects() {
    let hub = Arc::new(Broadcaster::new());
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    hub.connect(Box::new(Slow { tx })).await.unwrap();

    let publisher = {
        let hub = hub.clone();
        tokio::spawn(async move {
            for ts in 0..20 {
                hub.broadcast(&event(ts as f64)).await;
            }
        })
    };
    let joiners = {
        let hub = hub.clone();
        tokio::spawn(async move {
            let mut ids = Vec::new();
            for _ in 0..20 {
                let (sink, _rx) = ChannelSink::pair(64);
                ids.push(hub.connect(Box::new(sink)).await.unwrap());
                tokio::task::yield_now().await;
            }
            for id in ids {
                hub.disconnect(id).await;
            }
        })
    };
    publisher.await.unwrap();
    joiners.await.unwrap();

    let mut seen = Vec::new();
    while let Ok(line) = rx.try_recv() {
        let ev: PresenceEvent = serde_json::from_str(&line).unwrap();
        seen.push(ev.ts as u32);
    }
    assert_eq!(seen, (0..20).collect::<Vec<u32>>());
    assert_eq!(hub.subscriber_count().await, 1);
}
