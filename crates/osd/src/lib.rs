//! OSD backoff flow control
//!
//! A PG that temporarily cannot serve part of its key-space (while peering,
//! or while an object is degraded or unfound) tells the client to back off
//! instead of queueing or failing its requests. This crate implements the
//! OSD side of that protocol.
//!
//! # Architecture
//!
//! - `Backoff`: one blocked `[begin, end)` range of one PG for one client
//! - `Session`: per-connection index of the backoffs applied to that client
//! - `PgBackoffs`: per-PG index of the backoffs it issued, and the entry
//!   points that create and release them
//! - `Connection`: where BLOCK/UNBLOCK messages are handed to the messenger
//!
//! A `Backoff` is linked from both indexes and links back to both owners, so
//! it can be torn down from either end. Three locks are involved and are
//! always taken in this order (checked in debug builds, see [`lockdep`]):
//!
//! ```text
//! Backoff::lock
//!    PG::backoff_lock
//!      Session::backoff_lock
//! ```
//!
//! When a session goes away it moves its index aside, then locks each backoff
//! it referenced, clears the session link and unlinks it from the PG if it is
//! still there. When a PG releases a backoff it sends UNBLOCK if the session
//! is still attached and connected, and unlinks the session.

pub mod backoff;
pub mod config;
pub mod connection;
pub mod error;
pub mod hobject;
pub mod lockdep;
pub mod messages;
pub mod pg;
pub mod session;
pub mod types;

// Re-export commonly used types
pub use backoff::{Backoff, BackoffInfo, BackoffState, LockedBackoff};
pub use config::BackoffConfig;
pub use connection::{ChannelConnection, Connection, ConnectionRef};
pub use error::{OsdError, Result};
pub use hobject::{HObject, SNAP_DIR, SNAP_HEAD};
pub use messages::{BackoffOp, MOSDBackoff};
pub use pg::{BackoffReason, PgBackoffs};
pub use session::Session;
pub use types::SpgId;
