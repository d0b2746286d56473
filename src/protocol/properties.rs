//! MQTT v5.0 properties
//!
//! Plain data carried between the codec and the core. The codec collaborator
//! owns the wire representation; the core only reads and forwards fields.

use bytes::Bytes;
use smallvec::SmallVec;

/// Decoded v5 properties. Empty (all `None`/empty) for v3.1 and v3.1.1.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Properties {
    /// Session Expiry Interval in seconds (CONNECT/DISCONNECT)
    pub session_expiry_interval: Option<u32>,
    /// Receive Maximum (CONNECT/CONNACK flow control)
    pub receive_maximum: Option<u16>,
    /// Maximum Packet Size the peer accepts
    pub maximum_packet_size: Option<u32>,
    /// Message Expiry Interval in seconds (PUBLISH)
    pub message_expiry_interval: Option<u32>,
    /// Will Delay Interval in seconds (will properties)
    pub will_delay_interval: Option<u32>,
    /// Subscription Identifier carried on SUBSCRIBE (single value)
    pub subscription_identifier: Option<u32>,
    /// Subscription Identifiers attached to an outbound PUBLISH
    pub subscription_identifiers: SmallVec<[u32; 4]>,
    /// Content Type (PUBLISH/will)
    pub content_type: Option<String>,
    /// Response Topic (PUBLISH/will)
    pub response_topic: Option<String>,
    /// Correlation Data (PUBLISH/will)
    pub correlation_data: Option<Bytes>,
    /// Reason String attached to acks and DISCONNECT
    pub reason_string: Option<String>,
    /// User Properties, in order of appearance
    pub user_properties: Vec<(String, String)>,
}

impl Properties {
    /// True when no property is set; such a set encodes to a zero length.
    pub fn is_empty(&self) -> bool {
        self.session_expiry_interval.is_none()
            && self.receive_maximum.is_none()
            && self.maximum_packet_size.is_none()
            && self.message_expiry_interval.is_none()
            && self.will_delay_interval.is_none()
            && self.subscription_identifier.is_none()
            && self.subscription_identifiers.is_empty()
            && self.content_type.is_none()
            && self.response_topic.is_none()
            && self.correlation_data.is_none()
            && self.reason_string.is_none()
            && self.user_properties.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_empty() {
        assert!(Properties::default().is_empty());
    }

    #[test]
    fn test_nonempty() {
        let props = Properties {
            message_expiry_interval: Some(30),
            ..Default::default()
        };
        assert!(!props.is_empty());
    }
}
