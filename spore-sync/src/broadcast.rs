//! In-process topic bus for the pub/sub transport.
//!
//! Uses tokio broadcast channels: one channel per named topic, each
//! subscriber with an independent receiver buffering up to `capacity`
//! messages. Every message carries the publisher's replica id so
//! receivers can skip their own.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use spore_core::ReplicaId;
use tokio::sync::{broadcast, RwLock};

/// One published payload.
#[derive(Debug, Clone)]
pub struct TopicMessage {
    pub from: ReplicaId,
    pub data: Arc<Vec<u8>>,
}

/// Statistics for monitoring topic health.
#[derive(Debug, Clone, Default)]
pub struct TopicStats {
    pub messages_sent: u64,
    pub subscribers: usize,
}

/// A single named topic.
pub struct Topic {
    name: String,
    sender: broadcast::Sender<TopicMessage>,
    capacity: usize,
    /// Lock-free on the publish path
    messages_sent: AtomicU64,
}

impl Topic {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            name: name.into(),
            sender,
            capacity,
            messages_sent: AtomicU64::new(0),
        }
    }

    /// Publish to every subscriber, the publisher's own included.
    ///
    /// Returns the number of receivers reached.
    pub fn publish(&self, from: ReplicaId, data: Vec<u8>) -> usize {
        let count = self
            .sender
            .send(TopicMessage {
                from,
                data: Arc::new(data),
            })
            .unwrap_or(0);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TopicMessage> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> TopicStats {
        TopicStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            subscribers: self.subscriber_count(),
        }
    }
}

/// Maps topic names to topics. Clones share the same set of topics.
#[derive(Clone)]
pub struct TopicBus {
    topics: Arc<RwLock<HashMap<String, Arc<Topic>>>>,
    default_capacity: usize,
}

impl Default for TopicBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl TopicBus {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            topics: Arc::new(RwLock::new(HashMap::new())),
            default_capacity,
        }
    }

    /// Get or create the named topic.
    pub async fn get_or_create(&self, name: &str) -> Arc<Topic> {
        // Fast path: read lock
        {
            let topics = self.topics.read().await;
            if let Some(topic) = topics.get(name) {
                return topic.clone();
            }
        }

        let mut topics = self.topics.write().await;
        topics
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Topic::new(name, self.default_capacity)))
            .clone()
    }

    pub async fn subscribe(&self, name: &str) -> broadcast::Receiver<TopicMessage> {
        self.get_or_create(name).await.subscribe()
    }

    pub async fn publish(&self, name: &str, from: ReplicaId, data: Vec<u8>) -> usize {
        self.get_or_create(name).await.publish(from, data)
    }

    /// Drop a topic nobody listens to.
    pub async fn remove_if_unused(&self, name: &str) -> bool {
        let mut topics = self.topics.write().await;
        if topics.get(name).is_some_and(|t| t.subscriber_count() == 0) {
            topics.remove(name);
            return true;
        }
        false
    }

    pub async fn topic_count(&self) -> usize {
        self.topics.read().await.len()
    }

    pub async fn topics(&self) -> Vec<String> {
        self.topics.read().await.keys().cloned().collect()
    }
}
