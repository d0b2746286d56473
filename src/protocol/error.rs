//! Protocol-level error taxonomy
//!
//! Violations end the offending session with the matching v5 reason code;
//! they never tear down unrelated sessions.

use std::fmt;

use super::ReasonCode;

/// Errors raised while processing a decoded packet stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Packet not allowed in the current session state
    UnexpectedPacket(&'static str),
    /// A MUST of the protocol was violated
    ProtocolViolation(&'static str),
    /// Feature disabled or unsupported by this deployment
    Unsupported(&'static str),
    /// Authentication or authorization denied
    NotAuthorized,
    /// No bytes within 1.5x the negotiated keepalive
    KeepAliveTimeout,
    /// Session expired while disconnected
    SessionExpired,
    /// Peer exceeded its receive-maximum window
    ReceiveMaximumExceeded,
    /// Packet identifier already has an inflight message
    PacketIdInUse(u16),
}

impl ProtocolError {
    /// The v5 reason code to surface on DISCONNECT or the relevant ack
    pub fn reason_code(&self) -> ReasonCode {
        match self {
            ProtocolError::UnexpectedPacket(_) => ReasonCode::ProtocolError,
            ProtocolError::ProtocolViolation(_) => ReasonCode::ProtocolError,
            ProtocolError::Unsupported(_) => ReasonCode::ImplementationError,
            ProtocolError::NotAuthorized => ReasonCode::NotAuthorized,
            ProtocolError::KeepAliveTimeout => ReasonCode::KeepAliveTimeout,
            ProtocolError::SessionExpired => ReasonCode::SessionTakenOver,
            ProtocolError::ReceiveMaximumExceeded => ReasonCode::ReceiveMaxExceeded,
            ProtocolError::PacketIdInUse(_) => ReasonCode::PacketIdInUse,
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::UnexpectedPacket(what) => {
                write!(f, "unexpected packet in current state: {}", what)
            }
            ProtocolError::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
            ProtocolError::Unsupported(what) => write!(f, "unsupported: {}", what),
            ProtocolError::NotAuthorized => write!(f, "not authorized"),
            ProtocolError::KeepAliveTimeout => write!(f, "keep alive timeout"),
            ProtocolError::SessionExpired => write!(f, "session expired"),
            ProtocolError::ReceiveMaximumExceeded => write!(f, "receive maximum exceeded"),
            ProtocolError::PacketIdInUse(id) => write!(f, "packet identifier {} in use", id),
        }
    }
}

impl std::error::Error for ProtocolError {}
