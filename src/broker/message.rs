//! The routed message envelope
//!
//! A `Message` is made once per accepted publish and is immutable from then
//! on; fan-out clones are cheap (`Arc<str>` topic, `Bytes` payload). Hooks
//! may replace a message wholesale before routing, never mutate it in
//! place.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;

use crate::protocol::{Properties, ProtocolVersion, Publish, QoS};

/// Client id used as the origin of broker-generated messages
pub const SYS_ORIGIN: &str = "$broker";

/// Monotonic message id allocator, one per broker
#[derive(Debug, Default)]
pub struct MessageIdGen(AtomicU64);

impl MessageIdGen {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Delivery-relevant flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageFlags {
    pub dup: bool,
    pub retain: bool,
    /// Broker-originated ($SYS, wills synthesized by the broker, admin
    /// publishes)
    pub sys: bool,
}

/// Publisher metadata carried with the message
#[derive(Debug, Clone, Default)]
pub struct MessageHeaders {
    pub username: Option<String>,
    pub peer_addr: Option<SocketAddr>,
    pub protocol_version: Option<ProtocolVersion>,
    /// Message expiry in seconds, from the v5 property
    pub expiry: Option<u32>,
}

/// An immutable routed message
#[derive(Debug, Clone)]
pub struct Message {
    /// Monotonic per-broker id
    pub id: u64,
    /// Publishing client id, or [`SYS_ORIGIN`]
    pub from: Arc<str>,
    pub qos: QoS,
    pub flags: MessageFlags,
    pub headers: MessageHeaders,
    pub topic: Arc<str>,
    pub payload: Bytes,
    pub properties: Properties,
    pub timestamp: SystemTime,
}

impl Message {
    /// Build a message from an accepted client PUBLISH
    pub fn from_publish(
        id: u64,
        from: Arc<str>,
        publish: &Publish,
        headers: MessageHeaders,
    ) -> Self {
        Self {
            id,
            from,
            qos: publish.qos,
            flags: MessageFlags {
                dup: publish.dup,
                retain: publish.retain,
                sys: false,
            },
            headers: MessageHeaders {
                expiry: publish.properties.message_expiry_interval,
                ..headers
            },
            topic: publish.topic.clone(),
            payload: publish.payload.clone(),
            properties: publish.properties.clone(),
            timestamp: SystemTime::now(),
        }
    }

    /// Build a broker-originated message
    pub fn sys(id: u64, topic: Arc<str>, payload: Bytes, qos: QoS, retain: bool) -> Self {
        Self {
            id,
            from: Arc::from(SYS_ORIGIN),
            qos,
            flags: MessageFlags {
                dup: false,
                retain,
                sys: true,
            },
            headers: MessageHeaders::default(),
            topic,
            payload,
            properties: Properties::default(),
            timestamp: SystemTime::now(),
        }
    }

    /// Render an outbound PUBLISH for one subscriber
    ///
    /// The effective QoS and retain flag are per-subscription decisions made
    /// by dispatch; the packet id is assigned by the receiving session for
    /// QoS > 0.
    pub fn to_publish(&self, qos: QoS, retain: bool) -> Publish {
        Publish {
            dup: false,
            qos,
            retain,
            topic: self.topic.clone(),
            packet_id: None,
            payload: self.payload.clone(),
            properties: self.properties.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_gen_monotonic() {
        let gen = MessageIdGen::new();
        let a = gen.next();
        let b = gen.next();
        assert!(b > a);
    }

    #[test]
    fn test_from_publish_carries_expiry() {
        let mut publish = Publish {
            topic: Arc::from("a/b"),
            payload: Bytes::from_static(b"x"),
            qos: QoS::AtLeastOnce,
            ..Default::default()
        };
        publish.properties.message_expiry_interval = Some(30);

        let msg = Message::from_publish(7, Arc::from("c1"), &publish, MessageHeaders::default());
        assert_eq!(msg.id, 7);
        assert_eq!(msg.headers.expiry, Some(30));
        assert!(!msg.flags.sys);
        assert_eq!(msg.from.as_ref(), "c1");
    }

    #[test]
    fn test_sys_message() {
        let msg = Message::sys(
            1,
            Arc::from("$SYS/uptime"),
            Bytes::from_static(b"100"),
            QoS::AtMostOnce,
            false,
        );
        assert!(msg.flags.sys);
        assert_eq!(msg.from.as_ref(), SYS_ORIGIN);
    }

    #[test]
    fn test_to_publish_applies_effective_qos() {
        let msg = Message::sys(
            1,
            Arc::from("t"),
            Bytes::from_static(b"p"),
            QoS::ExactlyOnce,
            true,
        );
        let out = msg.to_publish(QoS::AtLeastOnce, false);
        assert_eq!(out.qos, QoS::AtLeastOnce);
        assert!(!out.retain);
        assert_eq!(out.packet_id, None);
    }
}
