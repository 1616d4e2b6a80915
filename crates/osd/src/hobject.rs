//! hobject_t - Hashed object identifier
//!
//! From ~/dev/ceph/src/common/hobject.h
//!
//! Backoff ranges are expressed as `[begin, end)` intervals of hobjects, so the
//! ordering here is load-bearing: objects sort by pool, then by the
//! *bit-reversed* placement hash (the "bitwise key"), so that every PG covers a
//! single contiguous run of the ordering whatever the pool's `pg_num` is.

use serde::Serialize;
use std::cmp::Ordering;
use std::fmt;

/// Special snapid values
pub const SNAP_HEAD: u64 = u64::MAX - 1; // -2 in two's complement
pub const SNAP_DIR: u64 = u64::MAX; // -1 in two's complement

/// hobject_t - Hashed Object ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct HObject {
    /// Object locator key (usually empty)
    pub key: String,
    /// Object name/ID
    pub oid: String,
    /// Snapshot ID (SNAP_HEAD for live objects)
    pub snapid: u64,
    /// Hash for CRUSH placement
    pub hash: u32,
    /// Sorts after every other object
    pub max: bool,
    /// Namespace (usually empty)
    pub nspace: String,
    /// Pool ID (-1 for the meta pool, `i64::MIN` for the minimum object)
    pub pool: i64,
}

impl HObject {
    /// Create a new hobject_t for the head of a named object
    pub fn new(pool: i64, oid: impl Into<String>, hash: u32) -> Self {
        Self {
            key: String::new(),
            oid: oid.into(),
            snapid: SNAP_HEAD,
            hash,
            max: false,
            nspace: String::new(),
            pool,
        }
    }

    /// The default-constructed hobject_t, which sorts before every object
    pub fn min() -> Self {
        Self {
            key: String::new(),
            oid: String::new(),
            snapid: 0,
            hash: 0,
            max: false,
            nspace: String::new(),
            pool: i64::MIN,
        }
    }

    /// hobject_t::get_max()
    pub fn max() -> Self {
        Self {
            max: true,
            ..Self::min()
        }
    }

    /// A nameless object positioned at `bitwise_key` in `pool`
    ///
    /// Used for PG range boundaries.
    pub fn boundary(pool: i64, bitwise_key: u32, snapid: u64) -> Self {
        Self {
            key: String::new(),
            oid: String::new(),
            snapid,
            hash: bitwise_key.reverse_bits(),
            max: false,
            nspace: String::new(),
            pool,
        }
    }

    pub fn with_nspace(mut self, nspace: impl Into<String>) -> Self {
        self.nspace = nspace.into();
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn with_snap(mut self, snapid: u64) -> Self {
        self.snapid = snapid;
        self
    }

    pub fn is_max(&self) -> bool {
        self.max
    }

    pub fn is_min(&self) -> bool {
        *self == Self::min()
    }

    /// The placement hash with its bits reversed; the primary sort key within a pool
    pub fn bitwise_key(&self) -> u32 {
        self.hash.reverse_bits()
    }

    /// Locator key if set, otherwise the object name
    pub fn effective_key(&self) -> &str {
        if self.key.is_empty() {
            &self.oid
        } else {
            &self.key
        }
    }
}

impl PartialOrd for HObject {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HObject {
    /// Reference: ~/dev/ceph/src/common/hobject.cc cmp()
    ///
    /// Ordering: max > pool > bitwise key > nspace > effective key > oid > snap
    fn cmp(&self, other: &Self) -> Ordering {
        self.max
            .cmp(&other.max)
            .then_with(|| self.pool.cmp(&other.pool))
            .then_with(|| self.bitwise_key().cmp(&other.bitwise_key()))
            .then_with(|| self.nspace.cmp(&other.nspace))
            .then_with(|| self.effective_key().cmp(other.effective_key()))
            .then_with(|| self.oid.cmp(&other.oid))
            .then_with(|| self.snapid.cmp(&other.snapid))
            // keeps Ord consistent with Eq when only the locator differs
            .then_with(|| self.key.cmp(&other.key))
    }
}

impl fmt::Display for HObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_max() {
            return write!(f, "MAX");
        }
        if self.is_min() {
            return write!(f, "MIN");
        }
        write!(
            f,
            "{}:{:08x}:{}:{}:{}:",
            self.pool,
            self.bitwise_key(),
            self.nspace,
            self.key,
            self.oid
        )?;
        match self.snapid {
            SNAP_HEAD => write!(f, "head"),
            SNAP_DIR => write!(f, "snapdir"),
            snap => write!(f, "{:x}", snap),
        }
    }
}
