//! Error types for OSD backoff handling
//!
//! Everything here is recoverable: faults caused by a client or by the
//! messenger. Broken internal invariants (index/count mismatch, a token
//! unlinked from the wrong owner, lock order violations) are assertions, not
//! errors.

use crate::hobject::HObject;
use crate::types::SpgId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OsdError {
    #[error("No backoff {id} on pg {pgid} at {begin}: {reason}")]
    UnknownBackoff {
        pgid: SpgId,
        id: u64,
        begin: HObject,
        reason: &'static str,
    },

    #[error("Backoff {id} on pg {pgid} acked with end {acked}, registered end is {registered}")]
    RangeMismatch {
        pgid: SpgId,
        id: u64,
        registered: HObject,
        acked: HObject,
    },

    #[error("Unexpected backoff op {0}")]
    UnexpectedOp(u8),

    #[error("Session already has backoff {id} on pg {pgid} covering {begin}")]
    BackoffExists { pgid: SpgId, id: u64, begin: HObject },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Send queue full")]
    SendQueueFull,

    #[error("Configuration error: {0}")]
    Config(#[from] cephconfig::ConfigError),
}

impl OsdError {
    /// True for errors caused by what a client sent us
    pub fn is_protocol_fault(&self) -> bool {
        matches!(
            self,
            OsdError::UnknownBackoff { .. }
                | OsdError::RangeMismatch { .. }
                | OsdError::UnexpectedOp(_)
        )
    }
}

/// Result type alias for OSD backoff operations
pub type Result<T> = std::result::Result<T, OsdError>;
