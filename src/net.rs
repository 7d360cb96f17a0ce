//! Pubsub boundary for head announcements.
//!
//! Replicas of a database subscribe to a topic named after the database and
//! publish the content address of each new head to it. The [`Gossip`] trait
//! is the seam a real transport plugs into; [`MemoryGossip`] connects
//! replicas within one process.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;

/// A topic-based publish/subscribe transport.
pub trait Gossip: Send + Sync + 'static {
    /// Subscribe to a topic. Every message published afterwards is delivered
    /// to the returned receiver.
    fn subscribe(&self, topic: &str) -> flume::Receiver<Bytes>;

    /// Publish a message to all current subscribers of a topic.
    fn publish(&self, topic: &str, data: Bytes) -> anyhow::Result<()>;
}

/// In-process [`Gossip`] backed by per-topic channels.
///
/// Clones share the same topic map. Delivery includes the publisher's own
/// subscriptions; subscribers identify and ignore their own announcements.
#[derive(Debug, Clone, Default)]
pub struct MemoryGossip {
    topics: Arc<RwLock<HashMap<String, Vec<flume::Sender<Bytes>>>>>,
}

impl MemoryGossip {
    /// Create an empty gossip network.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Gossip for MemoryGossip {
    fn subscribe(&self, topic: &str) -> flume::Receiver<Bytes> {
        let (tx, rx) = flume::unbounded();
        self.topics
            .write()
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        rx
    }

    fn publish(&self, topic: &str, data: Bytes) -> anyhow::Result<()> {
        if let Some(subscribers) = self.topics.write().get_mut(topic) {
            // drop subscribers whose receiver is gone
            subscribers.retain(|tx| tx.send(data.clone()).is_ok());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_reaches_all_subscribers() {
        let gossip = MemoryGossip::new();
        let a = gossip.subscribe("topic");
        let b = gossip.subscribe("topic");
        let other = gossip.subscribe("other");

        gossip.publish("topic", Bytes::from_static(b"hi")).unwrap();
        assert_eq!(a.try_recv().unwrap(), &b"hi"[..]);
        assert_eq!(b.try_recv().unwrap(), &b"hi"[..]);
        assert!(other.try_recv().is_err());
    }

    #[test]
    fn test_dropped_subscribers_are_pruned() {
        let gossip = MemoryGossip::new();
        let rx = gossip.subscribe("topic");
        drop(rx);
        gossip.publish("topic", Bytes::from_static(b"hi")).unwrap();
        assert!(gossip.topics.read().get("topic").unwrap().is_empty());
    }

    #[test]
    fn test_clones_share_topics() {
        let gossip = MemoryGossip::new();
        let clone = gossip.clone();
        let rx = gossip.subscribe("topic");
        clone.publish("topic", Bytes::from_static(b"hi")).unwrap();
        assert_eq!(rx.try_recv().unwrap(), &b"hi"[..]);
    }
}
