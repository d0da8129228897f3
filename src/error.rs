//! Error types for the geolock lock manager.
//!
//! Infrastructure failures (storage, transport, serialization, configuration)
//! are reported as [`GeolockError`]. Expected lock outcomes such as
//! contention or a stale fencing token are not errors at this level; they
//! travel as [`crate::lock::LockError`] inside a [`crate::lock::LockResult`].
//!
//! # Example
//!
//! ```rust
//! use geolock::error::{GeolockError, Result};
//!
//! fn parse_port(raw: &str) -> Result<u16> {
//!     raw.parse().map_err(|_| GeolockError::Config(format!("bad port: {raw}")))
//! }
//!
//! let err = GeolockError::NotLeader { leader: Some(2) };
//! assert!(err.is_retryable());
//! assert!(parse_port("x").is_err());
//! ```

use std::io;
use thiserror::Error;

/// Main error type for geolock operations.
#[derive(Error, Debug)]
pub enum GeolockError {
    // Raft consensus errors
    #[error("Not the leader. Leader is: {leader:?}")]
    NotLeader { leader: Option<u64> },

    #[error("Raft log error: {0}")]
    RaftLog(String),

    #[error("Quorum not reached: got {got}, need {need}")]
    QuorumNotReached { got: usize, need: usize },

    #[error("Node not found: {0}")]
    NodeNotFound(u64),

    #[error("Region not found: {0}")]
    RegionNotFound(String),

    // Storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Operation timed out after {0}ms")]
    Timeout(u64),

    // Serialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    // Configuration
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration for {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Shutting down")]
    ShuttingDown,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GeolockError {
    /// Check if error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GeolockError::NotLeader { .. }
                | GeolockError::Timeout(_)
                | GeolockError::Network(_)
                | GeolockError::QuorumNotReached { .. }
        )
    }
}

impl From<bincode::Error> for GeolockError {
    fn from(e: bincode::Error) -> Self {
        GeolockError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for GeolockError {
    fn from(e: serde_json::Error) -> Self {
        GeolockError::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for GeolockError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            GeolockError::Network(format!("request timed out: {e}"))
        } else {
            GeolockError::Network(e.to_string())
        }
    }
}

/// Result type alias for geolock operations.
pub type Result<T> = std::result::Result<T, GeolockError>;
