use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

/// Topic carrying `user-status:changed` broadcasts.
pub const USER_STATUS_TOPIC: &str = "user-status:changed";

/// Buffered updates per topic before slow subscribers start lagging.
const TOPIC_CAPACITY: usize = 256;

/// Topic name for a channel's live updates.
pub fn chat_topic(channel_id: u64) -> String {
    format!("/chat/{channel_id}")
}

/// In-process publish/subscribe fabric standing in for the server push
/// transport. Topics are named and created lazily; payloads are raw JSON so
/// publishers and subscribers agree only on the wire shape.
#[derive(Clone, Default)]
pub struct MessageBus {
    topics: Arc<Mutex<HashMap<String, broadcast::Sender<Value>>>>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self, topic: &str) -> broadcast::Receiver<Value> {
        self.sender(topic).await.subscribe()
    }

    /// Publish a payload to everyone currently subscribed to `topic`.
    /// Publishing to a topic nobody listens on is not an error.
    pub async fn publish(&self, topic: &str, payload: Value) -> usize {
        let delivered = self.sender(topic).await.send(payload).unwrap_or(0);
        debug!("Published to {topic} ({delivered} subscriber(s))");
        delivered
    }

    async fn sender(&self, topic: &str) -> broadcast::Sender<Value> {
        let mut topics = self.topics.lock().await;
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }
}
