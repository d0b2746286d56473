//! Inter-node protocol
//!
//! Length-prefixed bincode frames over TCP between broker nodes. Carries
//! the publish forwarding path and incremental route table replication;
//! membership itself travels over gossip.

use bincode::{Decode, Encode};

/// Protocol version for compatibility checking
pub const NODE_PROTOCOL_VERSION: u8 = 1;

/// Messages exchanged between broker nodes
#[derive(Debug, Clone, Encode, Decode)]
pub enum NodeMessage {
    /// Handshake sent when connecting to a peer
    Hello { node_id: String, version: u8 },

    /// Handshake acknowledgment
    HelloAck { node_id: String, version: u8 },

    /// Forward a publish to a node with matching subscribers
    Publish {
        topic: String,
        payload: Vec<u8>,
        qos: u8,
        retain: bool,
        /// Broker-originated message
        sys: bool,
        /// Publishing client, for no_local on the receiving node
        from_client: String,
        /// Forwarding node, to prevent loops
        origin_node: String,
    },

    /// A filter gained its first subscriber on the sending node
    RouteAdd {
        filter: String,
        share_group: Option<String>,
    },

    /// A filter lost its last subscriber on the sending node
    RouteDelete {
        filter: String,
        share_group: Option<String>,
    },

    /// Full route state for anti-entropy, sent after the handshake
    RouteSync {
        routes: Vec<(String, Option<String>)>,
    },

    /// Keep-alive probe
    Ping,
    Pong,

    /// Graceful disconnect notification
    Goodbye,
}

impl NodeMessage {
    pub fn encode(&self) -> Result<Vec<u8>, bincode::error::EncodeError> {
        bincode::encode_to_vec(self, bincode::config::standard())
    }

    pub fn decode(data: &[u8]) -> Result<Self, bincode::error::DecodeError> {
        bincode::decode_from_slice(data, bincode::config::standard()).map(|(msg, _)| msg)
    }

    /// Message type name for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            NodeMessage::Hello { .. } => "Hello",
            NodeMessage::HelloAck { .. } => "HelloAck",
            NodeMessage::Publish { .. } => "Publish",
            NodeMessage::RouteAdd { .. } => "RouteAdd",
            NodeMessage::RouteDelete { .. } => "RouteDelete",
            NodeMessage::RouteSync { .. } => "RouteSync",
            NodeMessage::Ping => "Ping",
            NodeMessage::Pong => "Pong",
            NodeMessage::Goodbye => "Goodbye",
        }
    }
}

/// Frame a message with a u32 length prefix for TCP transmission
pub fn frame_message(msg: &NodeMessage) -> Result<Vec<u8>, bincode::error::EncodeError> {
    let payload = msg.encode()?;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Read the length prefix, `None` if fewer than 4 bytes are buffered
pub fn read_frame_length(data: &[u8]) -> Option<u32> {
    if data.len() < 4 {
        return None;
    }
    Some(u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_roundtrip() {
        let msg = NodeMessage::Publish {
            topic: "room/1/temp".to_string(),
            payload: vec![1, 2, 3],
            qos: 1,
            retain: false,
            sys: false,
            from_client: "c1".to_string(),
            origin_node: "n1".to_string(),
        };

        let decoded = NodeMessage::decode(&msg.encode().unwrap()).unwrap();
        match decoded {
            NodeMessage::Publish {
                topic,
                payload,
                qos,
                retain,
                sys,
                from_client,
                origin_node,
            } => {
                assert_eq!(topic, "room/1/temp");
                assert_eq!(payload, vec![1, 2, 3]);
                assert_eq!(qos, 1);
                assert!(!retain);
                assert!(!sys);
                assert_eq!(from_client, "c1");
                assert_eq!(origin_node, "n1");
            }
            other => panic!("wrong message: {:?}", other),
        }
    }

    #[test]
    fn test_route_sync_roundtrip() {
        let msg = NodeMessage::RouteSync {
            routes: vec![
                ("a/+".to_string(), None),
                ("jobs/#".to_string(), Some("workers".to_string())),
            ],
        };

        let decoded = NodeMessage::decode(&msg.encode().unwrap()).unwrap();
        match decoded {
            NodeMessage::RouteSync { routes } => {
                assert_eq!(routes.len(), 2);
                assert_eq!(routes[1].1.as_deref(), Some("workers"));
            }
            other => panic!("wrong message: {:?}", other),
        }
    }

    #[test]
    fn test_frame_roundtrip() {
        let frame = frame_message(&NodeMessage::Ping).unwrap();
        let len = read_frame_length(&frame).unwrap() as usize;
        assert_eq!(len, frame.len() - 4);
        assert!(matches!(
            NodeMessage::decode(&frame[4..]).unwrap(),
            NodeMessage::Ping
        ));
    }

    #[test]
    fn test_frame_length_needs_four_bytes() {
        assert_eq!(read_frame_length(&[0, 0, 1]), None);
    }
}
