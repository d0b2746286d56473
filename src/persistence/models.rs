//! Storage models
//!
//! Flat bincode-encodable mirrors of the in-memory types. The live types
//! use `Bytes`/`Arc<str>`/`Instant`, none of which belong on disk, so
//! conversion is explicit in both directions.

use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use bincode::{Decode, Encode};
use bytes::Bytes;

use crate::protocol::{Properties, Publish, QoS, SubscriptionOptions};
use crate::session::{InflightMessage, Qos2State, Session};

/// Subset of v5 properties worth persisting with a message
#[derive(Debug, Clone, Default, Encode, Decode)]
pub struct StoredProperties {
    pub message_expiry_interval: Option<u32>,
    pub content_type: Option<String>,
    pub response_topic: Option<String>,
    pub correlation_data: Option<Vec<u8>>,
    pub user_properties: Vec<(String, String)>,
}

impl From<&Properties> for StoredProperties {
    fn from(props: &Properties) -> Self {
        Self {
            message_expiry_interval: props.message_expiry_interval,
            content_type: props.content_type.clone(),
            response_topic: props.response_topic.clone(),
            correlation_data: props.correlation_data.as_ref().map(|b| b.to_vec()),
            user_properties: props.user_properties.clone(),
        }
    }
}

impl StoredProperties {
    pub fn into_properties(self) -> Properties {
        Properties {
            message_expiry_interval: self.message_expiry_interval,
            content_type: self.content_type,
            response_topic: self.response_topic,
            correlation_data: self.correlation_data.map(Bytes::from),
            user_properties: self.user_properties,
            ..Default::default()
        }
    }
}

/// A persisted PUBLISH
#[derive(Debug, Clone, Encode, Decode)]
pub struct StoredPublish {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
    pub packet_id: Option<u16>,
    pub properties: StoredProperties,
}

impl From<&Publish> for StoredPublish {
    fn from(publish: &Publish) -> Self {
        Self {
            topic: publish.topic.to_string(),
            payload: publish.payload.to_vec(),
            qos: publish.qos as u8,
            retain: publish.retain,
            packet_id: publish.packet_id,
            properties: StoredProperties::from(&publish.properties),
        }
    }
}

impl StoredPublish {
    pub fn into_publish(self) -> Publish {
        Publish {
            dup: false,
            qos: QoS::from_u8(self.qos).unwrap_or(QoS::AtMostOnce),
            retain: self.retain,
            topic: Arc::from(self.topic.as_str()),
            packet_id: self.packet_id,
            payload: Bytes::from(self.payload),
            properties: self.properties.into_properties(),
        }
    }
}

/// A persisted retained message
#[derive(Debug, Clone, Encode, Decode)]
pub struct StoredRetainedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub properties: StoredProperties,
    /// Unix seconds at store time, for expiry accounting across restarts
    pub timestamp_secs: u64,
}

impl StoredRetainedMessage {
    pub fn now_secs() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

/// A persisted subscription
#[derive(Debug, Clone, Encode, Decode)]
pub struct StoredSubscription {
    pub filter: String,
    /// v5 subscription options byte
    pub options: u8,
    pub subscription_id: Option<u32>,
}

impl StoredSubscription {
    pub fn options(&self) -> SubscriptionOptions {
        SubscriptionOptions::from_byte(self.options).unwrap_or_default()
    }
}

/// A persisted inflight entry
#[derive(Debug, Clone, Encode, Decode)]
pub struct StoredInflightMessage {
    pub packet_id: u16,
    pub publish: StoredPublish,
    /// 0 = QoS 1 / awaiting PUBREC, 1 = awaiting PUBCOMP
    pub qos2_phase: u8,
    pub retry_count: u32,
}

impl From<&InflightMessage> for StoredInflightMessage {
    fn from(inflight: &InflightMessage) -> Self {
        Self {
            packet_id: inflight.packet_id,
            publish: StoredPublish::from(&inflight.publish),
            qos2_phase: match inflight.qos2_state {
                Some(Qos2State::AwaitingPubComp) => 1,
                _ => 0,
            },
            retry_count: inflight.retry_count,
        }
    }
}

impl StoredInflightMessage {
    pub fn into_inflight(self) -> InflightMessage {
        let publish = self.publish.into_publish();
        let qos2_state = match (publish.qos, self.qos2_phase) {
            (QoS::ExactlyOnce, 1) => Some(Qos2State::AwaitingPubComp),
            (QoS::ExactlyOnce, _) => Some(Qos2State::AwaitingPubRec),
            _ => None,
        };
        InflightMessage {
            packet_id: self.packet_id,
            publish,
            qos2_state,
            sent_at: Instant::now(),
            retry_count: self.retry_count,
        }
    }
}

/// A persisted non-clean session
#[derive(Debug, Clone, Encode, Decode)]
pub struct StoredSession {
    pub client_id: String,
    pub session_expiry_interval: u32,
    pub subscriptions: Vec<StoredSubscription>,
    pub inflight: Vec<StoredInflightMessage>,
    /// Send-queue head, bounded to the newest entries at store time
    pub queued: Vec<StoredPublish>,
}

impl StoredSession {
    /// Capture a session, bounding the persisted queue to `queue_head_max`
    /// newest entries
    pub fn capture(session: &Session, queue_head_max: usize) -> Self {
        Self {
            client_id: session.client_id.to_string(),
            session_expiry_interval: session.session_expiry_interval,
            subscriptions: session
                .subscriptions
                .iter()
                .map(|(filter, sub)| StoredSubscription {
                    filter: filter.to_string(),
                    options: sub.options.to_byte(),
                    subscription_id: sub.subscription_id,
                })
                .collect(),
            inflight: session
                .inflight
                .outgoing_snapshot()
                .into_iter()
                .map(StoredInflightMessage::from)
                .collect(),
            queued: session
                .queue
                .newest(queue_head_max)
                .into_iter()
                .map(StoredPublish::from)
                .collect(),
        }
    }
}

/// Everything a backend loads at startup
#[derive(Debug, Default)]
pub struct LoadedState {
    pub retained: Vec<(String, StoredRetainedMessage)>,
    pub sessions: Vec<(String, StoredSession)>,
}
