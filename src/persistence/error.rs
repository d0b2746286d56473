//! Persistence error types

use std::fmt;

pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Errors from the storage backend
#[derive(Debug)]
pub enum PersistenceError {
    /// Underlying store failure
    Storage(String),
    /// Value could not be encoded
    Encode(String),
    /// Value could not be decoded
    Decode(String),
}

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PersistenceError::Storage(msg) => write!(f, "storage error: {}", msg),
            PersistenceError::Encode(msg) => write!(f, "encode error: {}", msg),
            PersistenceError::Decode(msg) => write!(f, "decode error: {}", msg),
        }
    }
}

impl std::error::Error for PersistenceError {}

impl From<fjall::Error> for PersistenceError {
    fn from(e: fjall::Error) -> Self {
        PersistenceError::Storage(e.to_string())
    }
}

impl From<bincode::error::EncodeError> for PersistenceError {
    fn from(e: bincode::error::EncodeError) -> Self {
        PersistenceError::Encode(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for PersistenceError {
    fn from(e: bincode::error::DecodeError) -> Self {
        PersistenceError::Decode(e.to_string())
    }
}
