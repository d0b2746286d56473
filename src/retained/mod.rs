//! Retained message store
//!
//! Last retained message per concrete topic, replayed to new matching
//! subscribers. A retained publish with an empty payload deletes the entry.
//! Wildcard subscriptions enumerate matching topics through a topic index
//! trie; exact subscriptions hit the map directly.
//!
//! With durable storage configured, writes go through the batching
//! persistence writer and the map is reloaded at startup.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::debug;

use crate::broker::Message;
use crate::persistence::{PersistenceManager, PersistenceOp, StoredRetainedMessage};
use crate::protocol::{Properties, QoS};
use crate::topic::{is_wildcard, TopicTrie};

/// The stored form of a retained publish
#[derive(Debug, Clone)]
pub struct RetainedMessage {
    pub topic: Arc<str>,
    pub payload: Bytes,
    pub qos: QoS,
    pub properties: Properties,
    pub stored_at: Instant,
}

impl RetainedMessage {
    /// Message expiry remaining at replay time; `None` when expired
    pub fn remaining_expiry(&self) -> Option<Option<u32>> {
        match self.properties.message_expiry_interval {
            None => Some(None),
            Some(expiry) => {
                let elapsed = self.stored_at.elapsed().as_secs() as u32;
                if elapsed >= expiry {
                    None
                } else {
                    Some(Some(expiry - elapsed))
                }
            }
        }
    }
}

/// Topic-keyed store of the newest retained message per topic
pub struct RetainedStore {
    messages: DashMap<Arc<str>, RetainedMessage>,
    /// Concrete-topic index for wildcard enumeration
    index: RwLock<TopicTrie<Arc<str>>>,
    persistence: Option<Arc<PersistenceManager>>,
}

impl RetainedStore {
    pub fn new() -> Self {
        Self {
            messages: DashMap::new(),
            index: RwLock::new(TopicTrie::new()),
            persistence: None,
        }
    }

    /// Durable store writing through the persistence manager
    pub fn durable(persistence: Arc<PersistenceManager>) -> Self {
        Self {
            messages: DashMap::new(),
            index: RwLock::new(TopicTrie::new()),
            persistence: Some(persistence),
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Apply a retained publish: store it, or delete on empty payload
    pub fn apply(&self, message: &Message) {
        if message.payload.is_empty() {
            self.delete(&message.topic);
        } else {
            self.set(message);
        }
    }

    fn set(&self, message: &Message) {
        let retained = RetainedMessage {
            topic: message.topic.clone(),
            payload: message.payload.clone(),
            qos: message.qos,
            properties: message.properties.clone(),
            stored_at: Instant::now(),
        };

        if self.messages.insert(message.topic.clone(), retained).is_none() {
            self.index
                .write()
                .insert(&message.topic, message.topic.clone());
        }

        if let Some(persistence) = &self.persistence {
            persistence.write(PersistenceOp::SetRetained {
                topic: message.topic.to_string(),
                message: StoredRetainedMessage {
                    topic: message.topic.to_string(),
                    payload: message.payload.to_vec(),
                    qos: message.qos as u8,
                    properties: (&message.properties).into(),
                    timestamp_secs: StoredRetainedMessage::now_secs(),
                },
            });
        }
    }

    fn delete(&self, topic: &str) {
        if self.messages.remove(topic).is_some() {
            self.index.write().remove(topic);
            debug!("retained message cleared for '{}'", topic);
        }
        if let Some(persistence) = &self.persistence {
            persistence.write(PersistenceOp::DeleteRetained {
                topic: topic.to_string(),
            });
        }
    }

    /// The retained message for one concrete topic
    pub fn get(&self, topic: &str) -> Option<RetainedMessage> {
        self.messages.get(topic).map(|r| r.clone())
    }

    /// Every retained message whose topic matches the filter
    ///
    /// Wildcard filters walk the topic index; exact filters are a direct
    /// lookup.
    pub fn matching(&self, filter: &str) -> Vec<RetainedMessage> {
        if !is_wildcard(filter) {
            return self.get(filter).into_iter().collect();
        }

        let index = self.index.read();
        let mut result = Vec::new();
        index.match_filter(filter, |topic| {
            if let Some(msg) = self.messages.get(topic.as_ref()) {
                result.push(msg.clone());
            }
        });
        result
    }

    /// Administrative purge of every retained message
    pub fn purge(&self) {
        let topics: Vec<Arc<str>> = self.messages.iter().map(|e| e.key().clone()).collect();
        for topic in topics {
            self.delete(&topic);
        }
    }

    /// Topics currently holding a retained message, for admin listing
    pub fn topics(&self) -> Vec<Arc<str>> {
        self.messages.iter().map(|e| e.key().clone()).collect()
    }

    /// Reload entries from persisted state at startup
    pub fn load(&self, entries: Vec<(String, StoredRetainedMessage)>) {
        let mut index = self.index.write();
        for (topic, stored) in entries {
            let topic: Arc<str> = Arc::from(topic.as_str());
            let retained = RetainedMessage {
                topic: topic.clone(),
                payload: Bytes::from(stored.payload),
                qos: QoS::from_u8(stored.qos).unwrap_or(QoS::AtMostOnce),
                properties: stored.properties.into_properties(),
                stored_at: Instant::now(),
            };
            if self.messages.insert(topic.clone(), retained).is_none() {
                index.insert(&topic, topic.clone());
            }
        }
    }
}

impl Default for RetainedStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MessageIdGen;

    fn retain_msg(topic: &str, payload: &'static [u8]) -> Message {
        Message::sys(
            MessageIdGen::new().next(),
            Arc::from(topic),
            Bytes::from_static(payload),
            QoS::AtLeastOnce,
            true,
        )
    }

    #[test]
    fn test_set_get_overwrite() {
        let store = RetainedStore::new();
        store.apply(&retain_msg("s/k", b"1"));
        assert_eq!(store.get("s/k").unwrap().payload.as_ref(), b"1");

        store.apply(&retain_msg("s/k", b"2"));
        assert_eq!(store.get("s/k").unwrap().payload.as_ref(), b"2");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_empty_payload_deletes() {
        let store = RetainedStore::new();
        store.apply(&retain_msg("s/k", b"1"));
        store.apply(&retain_msg("s/k", b""));
        assert!(store.get("s/k").is_none());
        assert!(store.is_empty());
        assert!(store.matching("s/#").is_empty());
    }

    #[test]
    fn test_matching_exact_and_wildcard() {
        let store = RetainedStore::new();
        store.apply(&retain_msg("room/1/temp", b"20"));
        store.apply(&retain_msg("room/2/temp", b"21"));
        store.apply(&retain_msg("hall/temp", b"18"));

        assert_eq!(store.matching("room/1/temp").len(), 1);
        assert_eq!(store.matching("room/+/temp").len(), 2);
        assert_eq!(store.matching("#").len(), 3);
        assert_eq!(store.matching("none/+").len(), 0);
    }

    #[test]
    fn test_wildcard_excludes_sys_topics() {
        let store = RetainedStore::new();
        store.apply(&retain_msg("$SYS/uptime", b"100"));
        store.apply(&retain_msg("a", b"1"));

        assert_eq!(store.matching("#").len(), 1);
        assert_eq!(store.matching("$SYS/#").len(), 1);
    }

    #[test]
    fn test_purge() {
        let store = RetainedStore::new();
        store.apply(&retain_msg("a", b"1"));
        store.apply(&retain_msg("b", b"2"));
        store.purge();
        assert!(store.is_empty());
        assert!(store.matching("#").is_empty());
    }

    #[test]
    fn test_load_rebuilds_index() {
        let store = RetainedStore::new();
        store.load(vec![(
            "x/y".to_string(),
            StoredRetainedMessage {
                topic: "x/y".to_string(),
                payload: vec![7],
                qos: 0,
                properties: Default::default(),
                timestamp_secs: 0,
            },
        )]);

        assert_eq!(store.matching("x/+").len(), 1);
        assert_eq!(store.get("x/y").unwrap().payload.as_ref(), &[7]);
    }

    #[test]
    fn test_expiry_accounting() {
        let store = RetainedStore::new();
        let mut msg = retain_msg("t", b"1");
        msg.properties.message_expiry_interval = Some(0);
        store.apply(&msg);

        // Zero expiry: already stale at replay time
        assert!(store.get("t").unwrap().remaining_expiry().is_none());
    }
}
