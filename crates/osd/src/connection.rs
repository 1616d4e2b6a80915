//! Outbound side of a client connection
//!
//! The backoff code only needs to hand BLOCK/UNBLOCK messages to whatever
//! owns the socket. Sends happen while backoff locks are held, so they must
//! never block: the channel implementation queues with `try_send` and reports
//! a full or closed queue as an error instead of waiting.

use crate::error::{OsdError, Result};
use crate::messages::{MOSDBackoff, CEPH_MSG_OSD_BACKOFF};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// A client connection as seen by a session
pub trait Connection: Send + Sync + fmt::Debug {
    fn peer_addr(&self) -> Option<SocketAddr>;

    /// Whether the peer negotiated CEPH_FEATURE_RADOS_BACKOFF
    fn supports_backoff(&self) -> bool {
        true
    }

    /// Queue a message for the peer without blocking
    fn send_message(&self, msg: MOSDBackoff) -> Result<()>;
}

pub type ConnectionRef = Arc<dyn Connection>;

/// Connection backed by a bounded tokio channel drained by the messenger's
/// I/O task
#[derive(Debug)]
pub struct ChannelConnection {
    peer_addr: Option<SocketAddr>,
    backoff_feature: bool,
    send_tx: mpsc::Sender<MOSDBackoff>,
}

impl ChannelConnection {
    /// Create a connection and the receiving end of its send queue
    pub fn new(
        peer_addr: Option<SocketAddr>,
        queue_depth: usize,
    ) -> (Arc<Self>, mpsc::Receiver<MOSDBackoff>) {
        Self::with_features(peer_addr, queue_depth, true)
    }

    pub fn with_features(
        peer_addr: Option<SocketAddr>,
        queue_depth: usize,
        backoff_feature: bool,
    ) -> (Arc<Self>, mpsc::Receiver<MOSDBackoff>) {
        let (send_tx, send_rx) = mpsc::channel(queue_depth);
        let con = Arc::new(Self {
            peer_addr,
            backoff_feature,
            send_tx,
        });
        (con, send_rx)
    }

    pub fn is_closed(&self) -> bool {
        self.send_tx.is_closed()
    }
}

impl Connection for ChannelConnection {
    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    fn supports_backoff(&self) -> bool {
        self.backoff_feature
    }

    fn send_message(&self, msg: MOSDBackoff) -> Result<()> {
        debug!(
            "Queueing message type {} to {:?}: {}",
            CEPH_MSG_OSD_BACKOFF, self.peer_addr, msg
        );
        match self.send_tx.try_send(msg) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(msg)) => {
                warn!("Send queue to {:?} full, dropping {}", self.peer_addr, msg);
                Err(OsdError::SendQueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(msg)) => {
                error!("Connection to {:?} closed, dropping {}", self.peer_addr, msg);
                Err(OsdError::ConnectionClosed)
            }
        }
    }
}
