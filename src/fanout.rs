//! Real-time fan-out hub.
//!
//! One publisher, many independent subscribers, no coordination between
//! them. Channels are free-form strings; payloads are structured JSON.
//! Delivery is best-effort broadcast: no history replay, and a subscriber
//! that cannot keep up lags and loses messages rather than slowing
//! `publish` down.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Per-channel buffer; a subscriber further behind than this starts
/// losing the oldest messages.
const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum FanoutError {
    #[error("fan-out hub is closed")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct FanoutMessage {
    pub channel: String,
    pub payload: serde_json::Value,
}

pub struct FanoutHub {
    channels: Mutex<HashMap<String, broadcast::Sender<FanoutMessage>>>,
    closed: AtomicBool,
}

impl FanoutHub {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Publish a message to one channel. Never blocks on subscriber
    /// consumption; publishing to a channel nobody listens on succeeds.
    /// Returns the number of subscribers the message was offered to.
    pub fn publish(&self, channel: &str, payload: serde_json::Value) -> Result<usize, FanoutError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(FanoutError::Closed);
        }
        let sender = self.sender_for(channel);
        let receivers = sender.receiver_count();
        // send only errors when there are no receivers; for a broadcast
        // that is not a failure
        let _ = sender.send(FanoutMessage {
            channel: channel.to_string(),
            payload,
        });
        tracing::debug!(channel = %channel, receivers, "Fan-out message published");
        Ok(receivers)
    }

    /// Subscribe to a set of channels. Only messages published after this
    /// call are seen; there is no replay. Must be called within a tokio
    /// runtime.
    pub fn subscribe(&self, channels: &[&str]) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut forwarders = Vec::with_capacity(channels.len());

        if self.closed.load(Ordering::SeqCst) {
            tracing::warn!("Subscribe on a closed fan-out hub — subscription starts exhausted");
            return Subscription { rx, forwarders };
        }

        for name in channels {
            let mut source = self.sender_for(name).subscribe();
            let sink = tx.clone();
            let channel = name.to_string();
            forwarders.push(tokio::spawn(async move {
                loop {
                    match source.recv().await {
                        Ok(message) => {
                            if sink.send(message).is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(
                                channel = %channel,
                                skipped,
                                "Subscriber lagged — messages dropped"
                            );
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }));
        }

        Subscription { rx, forwarders }
    }

    /// Tear the hub down. Idempotent; underlying channel resources are
    /// released exactly once and live subscriptions drain then end.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let released = {
            let mut channels = self.channels.lock().unwrap();
            let count = channels.len();
            channels.clear();
            count
        };
        tracing::info!(channels = released, "Fan-out hub closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn sender_for(&self, channel: &str) -> broadcast::Sender<FanoutMessage> {
        let mut channels = self.channels.lock().unwrap();
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

impl Default for FanoutHub {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for FanoutHub {
    fn drop(&mut self) {
        self.close();
    }
}

/// A live view of one or more channels.
///
/// `recv` yields each matching message in publish order per channel and
/// returns `None` once the hub (or this subscription) is closed and the
/// buffer drains. Not restartable: after `close`, create a new
/// subscription to resume.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<FanoutMessage>,
    forwarders: Vec<JoinHandle<()>>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<FanoutMessage> {
        self.rx.recv().await
    }

    /// Non-blocking variant for polling consumers.
    pub fn try_recv(&mut self) -> Option<FanoutMessage> {
        self.rx.try_recv().ok()
    }

    pub fn close(&mut self) {
        for task in self.forwarders.drain(..) {
            task.abort();
        }
        self.rx.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        for task in &self.forwarders {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let hub = FanoutHub::new();
        let receivers = hub.publish("screenshotCaptured", json!({"id": 1})).unwrap();
        assert_eq!(receivers, 0);
    }

    #[tokio::test]
    async fn test_subscriber_receives_in_publish_order() {
        let hub = FanoutHub::new();
        let mut sub = hub.subscribe(&["events"]);

        hub.publish("events", json!({"n": 1})).unwrap();
        hub.publish("events", json!({"n": 2})).unwrap();
        hub.publish("events", json!({"n": 3})).unwrap();

        for expected in 1..=3 {
            let message = sub.recv().await.unwrap();
            assert_eq!(message.channel, "events");
            assert_eq!(message.payload["n"], expected);
        }
    }

    #[tokio::test]
    async fn test_every_subscriber_gets_every_message() {
        let hub = FanoutHub::new();
        let mut first = hub.subscribe(&["events"]);
        let mut second = hub.subscribe(&["events"]);

        hub.publish("events", json!({"n": 1})).unwrap();

        assert_eq!(first.recv().await.unwrap().payload["n"], 1);
        assert_eq!(second.recv().await.unwrap().payload["n"], 1);
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_no_history() {
        let hub = FanoutHub::new();
        hub.publish("events", json!({"n": "early"})).unwrap();

        let mut sub = hub.subscribe(&["events"]);
        hub.publish("events", json!({"n": "late"})).unwrap();

        let message = sub.recv().await.unwrap();
        assert_eq!(message.payload["n"], "late");
        assert!(sub.try_recv().is_none(), "no replay of earlier messages");
    }

    #[tokio::test]
    async fn test_multi_channel_subscription() {
        let hub = FanoutHub::new();
        let mut sub = hub.subscribe(&["a", "b"]);

        hub.publish("a", json!({"from": "a"})).unwrap();
        hub.publish("c", json!({"from": "c"})).unwrap();
        hub.publish("b", json!({"from": "b"})).unwrap();

        let mut seen: Vec<String> = Vec::new();
        seen.push(sub.recv().await.unwrap().channel);
        seen.push(sub.recv().await.unwrap().channel);
        seen.sort();
        assert_eq!(seen, vec!["a", "b"], "unsubscribed channel never delivered");
    }

    #[tokio::test]
    async fn test_channel_isolation() {
        let hub = FanoutHub::new();
        let mut only_a = hub.subscribe(&["a"]);

        hub.publish("b", json!({})).unwrap();
        hub.publish("a", json!({"n": 1})).unwrap();

        assert_eq!(only_a.recv().await.unwrap().payload["n"], 1);
        assert!(only_a.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_ends_subscriptions() {
        let hub = FanoutHub::new();
        let mut sub = hub.subscribe(&["events"]);
        hub.publish("events", json!({"n": 1})).unwrap();

        hub.close();
        hub.close();
        assert!(hub.is_closed());

        // Buffered message drains, then the stream ends
        assert_eq!(sub.recv().await.unwrap().payload["n"], 1);
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_publish_after_close_is_rejected() {
        let hub = FanoutHub::new();
        hub.close();
        assert!(matches!(
            hub.publish("events", json!({})),
            Err(FanoutError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_closed_subscription_is_not_restartable() {
        let hub = FanoutHub::new();
        let mut sub = hub.subscribe(&["events"]);
        sub.close();

        hub.publish("events", json!({"n": 1})).unwrap();
        assert!(sub.recv().await.is_none());

        // A fresh subscription resumes delivery
        let mut fresh = hub.subscribe(&["events"]);
        hub.publish("events", json!({"n": 2})).unwrap();
        assert_eq!(fresh.recv().await.unwrap().payload["n"], 2);
    }
}
