//! Live progress fan-out.
//!
//! Delivery is best effort and at most once: a topic without subscribers
//! drops messages, and a subscriber that falls behind skips ahead. The
//! durable state is always the source row.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use ingest_harness_core::models::{CrawlProgress, SourceStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

/// Topic carrying crawl progress for one source.
pub fn progress_topic(source_id: &str) -> String {
    format!("crawl-progress:{}", source_id)
}

/// Payload published on [`progress_topic`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressMessage {
    pub source_id: String,
    pub status: SourceStatus,
    pub progress: CrawlProgress,
    pub chunk_count: i64,
    pub size_kb: f64,
}

impl ProgressMessage {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

pub trait PubSub: Send + Sync {
    fn publish(&self, topic: &str, payload: Value);

    fn subscribe(&self, topic: &str) -> broadcast::Receiver<Value>;
}

/// In-process pub/sub over `tokio::sync::broadcast`, one channel per topic.
pub struct BroadcastPubSub {
    capacity: usize,
    topics: Mutex<HashMap<String, broadcast::Sender<Value>>>,
}

impl BroadcastPubSub {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            topics: Mutex::new(HashMap::new()),
        }
    }

    fn topics(&self) -> MutexGuard<'_, HashMap<String, broadcast::Sender<Value>>> {
        self.topics.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of topics with a live channel.
    pub fn topic_count(&self) -> usize {
        self.topics().len()
    }
}

impl Default for BroadcastPubSub {
    fn default() -> Self {
        Self::new(256)
    }
}

impl PubSub for BroadcastPubSub {
    fn publish(&self, topic: &str, payload: Value) {
        let mut topics = self.topics();
        let Some(sender) = topics.get(topic) else {
            return;
        };
        if sender.send(payload).is_err() {
            debug!(topic, "no subscribers left, dropping topic");
            topics.remove(topic);
        }
    }

    fn subscribe(&self, topic: &str) -> broadcast::Receiver<Value> {
        self.topics()
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn topic_name() {
        assert_eq!(progress_topic("abc"), "crawl-progress:abc");
    }

    #[tokio::test]
    async fn subscribers_receive_in_order() {
        let bus = BroadcastPubSub::new(16);
        let mut rx = bus.subscribe("t");
        bus.publish("t", json!({"n": 1}));
        bus.publish("t", json!({"n": 2}));
        bus.publish("other", json!({"n": 3}));
        assert_eq!(rx.recv().await.unwrap(), json!({"n": 1}));
        assert_eq!(rx.recv().await.unwrap(), json!({"n": 2}));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn publish_without_subscribers_is_dropped() {
        let bus = BroadcastPubSub::default();
        bus.publish("nobody", json!(1));
        assert_eq!(bus.topic_count(), 0);

        let rx = bus.subscribe("gone");
        drop(rx);
        bus.publish("gone", json!(1));
        assert_eq!(bus.topic_count(), 0);
    }

    #[tokio::test]
    async fn slow_subscriber_skips_ahead() {
        let bus = BroadcastPubSub::new(2);
        let mut rx = bus.subscribe("t");
        for n in 0..5 {
            bus.publish("t", json!(n));
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
        assert_eq!(rx.recv().await.unwrap(), json!(3));
    }

    #[test]
    fn progress_message_shape() {
        let msg = ProgressMessage {
            source_id: "s1".into(),
            status: SourceStatus::Processing,
            progress: CrawlProgress::start(3),
            chunk_count: 0,
            size_kb: 0.0,
        };
        let value = msg.to_value();
        assert_eq!(value["status"], "processing");
        assert_eq!(value["progress"]["phase"], "discovering");
        assert_eq!(value["progress"]["total_pages"], 3);
    }
}
