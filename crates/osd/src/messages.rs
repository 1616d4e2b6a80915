//! Backoff control messages exchanged with clients
//!
//! Only the in-memory form of MOSDBackoff lives here; framing and encoding
//! belong to the messenger.

use crate::error::{OsdError, Result};
use crate::hobject::HObject;
use crate::types::SpgId;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::fmt;

/// Message type for MOSDBackoff
pub const CEPH_MSG_OSD_BACKOFF: u16 = 61;

/// Backoff operation codes (CEPH_OSD_BACKOFF_OP_*)
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum BackoffOp {
    /// OSD -> client: stop sending ops in the range
    Block = 1,
    /// client -> OSD: block installed
    AckBlock = 2,
    /// OSD -> client: range released
    Unblock = 3,
}

impl BackoffOp {
    /// Decode a wire op code; unknown codes come from an untrusted peer
    pub fn from_wire(op: u8) -> Result<Self> {
        Self::try_from(op).map_err(|_| OsdError::UnexpectedOp(op))
    }

    pub fn name(&self) -> &'static str {
        match self {
            BackoffOp::Block => "block",
            BackoffOp::AckBlock => "ack-block",
            BackoffOp::Unblock => "unblock",
        }
    }
}

/// MOSDBackoff message (message type 61)
///
/// Reference: ~/dev/ceph/src/messages/MOSDBackoff.h
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MOSDBackoff {
    pub pgid: SpgId,
    /// OSDMap epoch of the sender
    pub map_epoch: u32,
    pub op: BackoffOp,
    /// Unique backoff ID within the session
    pub id: u64,
    /// Start of object range (inclusive)
    pub begin: HObject,
    /// End of object range (exclusive); if begin == end, blocks a single object
    pub end: HObject,
}

impl MOSDBackoff {
    pub fn new(
        pgid: SpgId,
        map_epoch: u32,
        op: BackoffOp,
        id: u64,
        begin: HObject,
        end: HObject,
    ) -> Self {
        Self {
            pgid,
            map_epoch,
            op,
            id,
            begin,
            end,
        }
    }

    /// The client's acknowledgement of this BLOCK
    pub fn ack(&self) -> Self {
        Self {
            op: BackoffOp::AckBlock,
            ..self.clone()
        }
    }
}

impl fmt::Display for MOSDBackoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "osd_backoff({} {} id {} [{},{}) e{})",
            self.pgid,
            self.op.name(),
            self.id,
            self.begin,
            self.end,
            self.map_epoch
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_codes_match_wire_values() {
        assert_eq!(u8::from(BackoffOp::Block), 1);
        assert_eq!(u8::from(BackoffOp::AckBlock), 2);
        assert_eq!(u8::from(BackoffOp::Unblock), 3);
        assert_eq!(BackoffOp::from_wire(2).unwrap(), BackoffOp::AckBlock);
    }

    #[test]
    fn test_unknown_op_is_rejected() {
        assert!(matches!(
            BackoffOp::from_wire(0),
            Err(OsdError::UnexpectedOp(0))
        ));
        assert!(matches!(
            BackoffOp::from_wire(9),
            Err(OsdError::UnexpectedOp(9))
        ));
    }

    #[test]
    fn test_display() {
        let begin = HObject::new(1, "a", 0);
        let m = MOSDBackoff::new(
            SpgId::from_pg(1, 2),
            7,
            BackoffOp::Block,
            3,
            begin.clone(),
            begin,
        );
        assert_eq!(
            m.to_string(),
            "osd_backoff(1.2 block id 3 [1:00000000:::a:head,1:00000000:::a:head) e7)"
        );
        assert_eq!(m.ack().op, BackoffOp::AckBlock);
        assert_eq!(m.ack().id, 3);
    }
}
