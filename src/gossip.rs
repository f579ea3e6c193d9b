//! Gossip transport seam and the in-process bus.
//!
//! Databases reconcile by exchanging head CIDs on a pub/sub topic named by
//! the database address. The transport is a trait: `publish` is best-effort
//! broadcast, `send_to` targets one peer currently in the topic, and joining
//! a topic fires peer-join callbacks so existing members can push their heads
//! to the newcomer. The transport holds only an explicit subscriber handle —
//! never a callback borrowed from coordinator internals.
//!
//! [`LocalGossip`] wires any number of in-process peers together and is what
//! the multi-peer tests run on.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use ciborium::{from_reader, into_writer};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::cid::Cid;

// ─── Error ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum GossipError {
    #[error("not subscribed to topic {0}")]
    NotSubscribed(String),
    #[error("no peer {peer} on topic {topic}")]
    UnknownPeer { topic: String, peer: String },
    #[error("payload encode error: {0}")]
    Encode(String),
    #[error("payload decode error: {0}")]
    Decode(String),
}

// ─── Wire format ─────────────────────────────────────────────────────────────

/// CBOR envelope carried by every gossip message on a database topic: the
/// sender's current head CIDs. Receivers feed these to their replicator; the
/// entries themselves travel through the object store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeadsMessage {
    pub heads: Vec<Cid>,
}

impl HeadsMessage {
    pub fn to_bytes(&self) -> Result<Vec<u8>, GossipError> {
        let mut buf = Vec::new();
        into_writer(self, &mut buf).map_err(|e| GossipError::Encode(e.to_string()))?;
        Ok(buf)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, GossipError> {
        from_reader(bytes).map_err(|e| GossipError::Decode(e.to_string()))
    }
}

// ─── Traits ──────────────────────────────────────────────────────────────────

/// Handle a subscriber registers with the bus. Implementations must not block
/// the bus; long work belongs on spawned tasks.
#[async_trait]
pub trait GossipSubscriber: Send + Sync {
    async fn on_message(&self, topic: &str, payload: &[u8]);
    async fn on_peer_joined(&self, topic: &str, peer: &str);
}

#[async_trait]
pub trait GossipBus: Send + Sync {
    /// Join `topic` as `peer`. Subscribing twice with the same peer id
    /// replaces the previous handle.
    async fn subscribe(
        &self,
        topic: &str,
        peer: &str,
        subscriber: Arc<dyn GossipSubscriber>,
    ) -> Result<(), GossipError>;

    /// Best-effort broadcast to every subscriber of `topic`.
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), GossipError>;

    async fn unsubscribe(&self, topic: &str, peer: &str) -> Result<(), GossipError>;

    /// Direct message to one peer currently in `topic`.
    async fn send_to(&self, topic: &str, peer: &str, payload: &[u8]) -> Result<(), GossipError>;
}

// ─── In-process bus ──────────────────────────────────────────────────────────

type Members = Vec<(String, Arc<dyn GossipSubscriber>)>;

#[derive(Default)]
pub struct LocalGossip {
    topics: RwLock<HashMap<String, Members>>,
}

impl LocalGossip {
    pub fn new() -> Self {
        Self::default()
    }

    async fn members_of(&self, topic: &str) -> Result<Members, GossipError> {
        self.topics
            .read()
            .await
            .get(topic)
            .cloned()
            .ok_or_else(|| GossipError::NotSubscribed(topic.to_string()))
    }
}

#[async_trait]
impl GossipBus for LocalGossip {
    async fn subscribe(
        &self,
        topic: &str,
        peer: &str,
        subscriber: Arc<dyn GossipSubscriber>,
    ) -> Result<(), GossipError> {
        let existing: Members = {
            let mut topics = self.topics.write().await;
            let members = topics.entry(topic.to_string()).or_default();
            members.retain(|(id, _)| id != peer);
            let existing = members.clone();
            members.push((peer.to_string(), subscriber.clone()));
            existing
        };

        // Join notifications run outside the registry lock: both sides learn
        // of each other so either can push heads first.
        for (other_id, other) in existing {
            other.on_peer_joined(topic, peer).await;
            subscriber.on_peer_joined(topic, &other_id).await;
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), GossipError> {
        let members = self.members_of(topic).await?;
        join_all(
            members
                .iter()
                .map(|(_, subscriber)| subscriber.on_message(topic, payload)),
        )
        .await;
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str, peer: &str) -> Result<(), GossipError> {
        let mut topics = self.topics.write().await;
        if let Some(members) = topics.get_mut(topic) {
            members.retain(|(id, _)| id != peer);
            if members.is_empty() {
                topics.remove(topic);
            }
        }
        Ok(())
    }

    async fn send_to(&self, topic: &str, peer: &str, payload: &[u8]) -> Result<(), GossipError> {
        let members = self.members_of(topic).await?;
        let target = members
            .iter()
            .find(|(id, _)| id == peer)
            .ok_or_else(|| GossipError::UnknownPeer {
                topic: topic.to_string(),
                peer: peer.to_string(),
            })?;
        target.1.on_message(topic, payload).await;
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        messages: Mutex<Vec<Vec<u8>>>,
        joins: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl GossipSubscriber for Recorder {
        async fn on_message(&self, _topic: &str, payload: &[u8]) {
            self.messages.lock().await.push(payload.to_vec());
        }

        async fn on_peer_joined(&self, _topic: &str, peer: &str) {
            self.joins.lock().await.push(peer.to_string());
        }
    }

    #[tokio::test]
    async fn publish_reaches_all_subscribers() {
        let bus = LocalGossip::new();
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());

        bus.subscribe("t", "a", a.clone()).await.unwrap();
        bus.subscribe("t", "b", b.clone()).await.unwrap();
        bus.publish("t", b"hello").await.unwrap();

        assert_eq!(a.messages.lock().await.len(), 1);
        assert_eq!(b.messages.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn join_notifies_both_sides() {
        let bus = LocalGossip::new();
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());

        bus.subscribe("t", "a", a.clone()).await.unwrap();
        bus.subscribe("t", "b", b.clone()).await.unwrap();

        assert_eq!(*a.joins.lock().await, vec!["b".to_string()]);
        assert_eq!(*b.joins.lock().await, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn send_to_targets_one_peer() {
        let bus = LocalGossip::new();
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());

        bus.subscribe("t", "a", a.clone()).await.unwrap();
        bus.subscribe("t", "b", b.clone()).await.unwrap();
        bus.send_to("t", "b", b"direct").await.unwrap();

        assert!(a.messages.lock().await.is_empty());
        assert_eq!(b.messages.lock().await.len(), 1);

        let missing = bus.send_to("t", "nobody", b"x").await;
        assert!(matches!(missing, Err(GossipError::UnknownPeer { .. })));
    }

    #[tokio::test]
    async fn unsubscribe_removes_peer() {
        let bus = LocalGossip::new();
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());

        bus.subscribe("t", "a", a.clone()).await.unwrap();
        bus.subscribe("t", "b", b.clone()).await.unwrap();
        bus.unsubscribe("t", "a").await.unwrap();
        bus.publish("t", b"after").await.unwrap();

        assert!(a.messages.lock().await.is_empty());
        assert_eq!(b.messages.lock().await.len(), 1);
    }

    #[test]
    fn heads_message_roundtrip() {
        let msg = HeadsMessage { heads: vec![Cid::digest(b"h1"), Cid::digest(b"h2")] };
        let bytes = msg.to_bytes().unwrap();
        let back = HeadsMessage::from_bytes(&bytes).unwrap();
        assert_eq!(back.heads, msg.heads);
    }
}
