//! Per-namespace fan-out of change records.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers.
//! Every record published for a namespace reaches every current
//! subscriber of that namespace, including the one belonging to the
//! process that caused the mutation — echo suppression is the
//! receiver's job, not the bus's.
//!
//! Within one namespace, publish order equals the store's serialized
//! mutation order: the store publishes while still holding its lock.
//!
//! Reference: Patterson & Hennessy, Section 6.4 — Interconnection Networks

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use crate::protocol::ChangeRecord;

/// Statistics for monitoring a topic.
#[derive(Debug, Clone, Default)]
pub struct TopicStats {
    pub records_published: u64,
    pub subscribers: usize,
}

/// Fan-out channel for a single namespace.
pub struct ChangeTopic {
    sender: broadcast::Sender<ChangeRecord>,
    capacity: usize,
    records_published: AtomicU64,
}

impl ChangeTopic {
    /// `capacity` bounds how many records a slow subscriber may buffer
    /// before it starts lagging and dropping.
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            capacity,
            records_published: AtomicU64::new(0),
        }
    }

    /// Publish a record to all current subscribers.
    ///
    /// Returns the number of receivers. Lock-free.
    pub fn publish(&self, record: ChangeRecord) -> usize {
        let receivers = self.sender.send(record).unwrap_or(0);
        self.records_published.fetch_add(1, Ordering::Relaxed);
        receivers
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeRecord> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> TopicStats {
        TopicStats {
            records_published: self.records_published.load(Ordering::Relaxed),
            subscribers: self.sender.receiver_count(),
        }
    }
}

/// The change bus: namespace → topic.
///
/// Topics are created lazily on first publish or subscribe, so a
/// namespace gets its channel the moment any process touches it.
pub struct ChangeBus {
    topics: RwLock<HashMap<String, Arc<ChangeTopic>>>,
    default_capacity: usize,
}

impl ChangeBus {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Get or create the topic for a namespace.
    pub async fn get_or_create(&self, namespace: &str) -> Arc<ChangeTopic> {
        // Fast path: read lock
        {
            let topics = self.topics.read().await;
            if let Some(topic) = topics.get(namespace) {
                return topic.clone();
            }
        }

        // Slow path: write lock to create
        let mut topics = self.topics.write().await;
        // Double-check after acquiring write lock
        if let Some(topic) = topics.get(namespace) {
            return topic.clone();
        }

        let topic = Arc::new(ChangeTopic::new(self.default_capacity));
        topics.insert(namespace.to_string(), topic.clone());
        topic
    }

    /// Publish a record to its namespace's subscribers.
    ///
    /// Returns the number of receivers that got it.
    pub async fn publish(&self, record: ChangeRecord) -> usize {
        let topic = self.get_or_create(&record.namespace).await;
        topic.publish(record)
    }

    /// Subscribe to one namespace's records.
    pub async fn subscribe(&self, namespace: &str) -> broadcast::Receiver<ChangeRecord> {
        self.get_or_create(namespace).await.subscribe()
    }

    /// Drop a topic that has no subscribers left.
    pub async fn remove_if_idle(&self, namespace: &str) -> bool {
        let mut topics = self.topics.write().await;
        if let Some(topic) = topics.get(namespace) {
            if topic.subscriber_count() == 0 {
                topics.remove(namespace);
                return true;
            }
        }
        false
    }

    pub async fn topic_count(&self) -> usize {
        self.topics.read().await.len()
    }

    pub async fn active_namespaces(&self) -> Vec<String> {
        self.topics.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prefsync_core::PrefType;
    use uuid::Uuid;

    fn record(namespace: &str, seq: u64) -> ChangeRecord {
        ChangeRecord::put(namespace, seq, Uuid::new_v4(), "k", PrefType::Int, "1")
    }

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let bus = ChangeBus::new(16);

        let mut rx1 = bus.subscribe("settings").await;
        let mut rx2 = bus.subscribe("settings").await;

        let delivered = bus.publish(record("settings", 1)).await;
        assert_eq!(delivered, 2);

        assert_eq!(rx1.recv().await.unwrap().seq, 1);
        assert_eq!(rx2.recv().await.unwrap().seq, 1);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = ChangeBus::new(16);
        let delivered = bus.publish(record("settings", 1)).await;
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn test_namespaces_are_isolated() {
        let bus = ChangeBus::new(16);

        let mut settings_rx = bus.subscribe("settings").await;
        let mut session_rx = bus.subscribe("session").await;

        bus.publish(record("settings", 1)).await;

        assert_eq!(settings_rx.recv().await.unwrap().namespace, "settings");
        assert!(session_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_delivery_preserves_publish_order() {
        let bus = ChangeBus::new(64);
        let mut rx = bus.subscribe("settings").await;

        for seq in 1..=10 {
            bus.publish(record("settings", seq)).await;
        }

        for expected in 1..=10 {
            assert_eq!(rx.recv().await.unwrap().seq, expected);
        }
    }

    #[tokio::test]
    async fn test_get_or_create_returns_same_topic() {
        let bus = ChangeBus::new(16);
        let t1 = bus.get_or_create("settings").await;
        let t2 = bus.get_or_create("settings").await;
        assert!(Arc::ptr_eq(&t1, &t2));
        assert_eq!(bus.topic_count().await, 1);
    }

    #[tokio::test]
    async fn test_topic_stats() {
        let bus = ChangeBus::new(16);
        let _rx = bus.subscribe("settings").await;

        bus.publish(record("settings", 1)).await;
        bus.publish(record("settings", 2)).await;

        let stats = bus.get_or_create("settings").await.stats();
        assert_eq!(stats.records_published, 2);
        assert_eq!(stats.subscribers, 1);
    }

    #[tokio::test]
    async fn test_remove_if_idle() {
        let bus = ChangeBus::new(16);

        let rx = bus.subscribe("settings").await;
        assert!(!bus.remove_if_idle("settings").await);
        assert_eq!(bus.topic_count().await, 1);

        drop(rx);
        assert!(bus.remove_if_idle("settings").await);
        assert_eq!(bus.topic_count().await, 0);
    }

    #[tokio::test]
    async fn test_active_namespaces() {
        let bus = ChangeBus::new(16);
        let _a = bus.subscribe("a").await;
        let _b = bus.subscribe("b").await;

        let mut names = bus.active_namespaces().await;
        names.sort();
        assert_eq!(names, vec!["a", "b"]);
    }
}
