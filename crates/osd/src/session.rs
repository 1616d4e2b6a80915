//! Client session backoff tracking
//!
//! One `Session` exists per client connection. Besides the connection handle
//! it indexes every backoff currently applied to that client:
//!
//! ```text
//! pgid -> begin -> { id -> Backoff }
//! ```
//!
//! `backoff_lock` protects the index and nests inside both `Backoff::lock`
//! and the PG's backoff lock. When the session goes away the index is moved
//! aside first, so that each backoff can then be locked (token lock first)
//! without holding the session lock.

use crate::backoff::{Backoff, BackoffInfo, LockedBackoff};
use crate::config::BackoffConfig;
use crate::connection::ConnectionRef;
use crate::error::{OsdError, Result};
use crate::hobject::HObject;
use crate::lockdep::{self, LockClass};
use crate::messages::{BackoffOp, MOSDBackoff};
use crate::types::SpgId;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Backoffs of one PG, keyed by range start then backoff id
type PgBackoffMap = BTreeMap<HObject, BTreeMap<u64, Arc<Backoff>>>;
type BackoffIndex = HashMap<SpgId, PgBackoffMap>;

pub struct Session {
    entity_name: String,
    socket_addr: Option<SocketAddr>,
    /// Cleared on connection reset; a leaf lock
    con: Mutex<Option<ConnectionRef>>,
    config: Arc<BackoffConfig>,
    /// Protects the index; orders inside Backoff::lock *and* PG::backoff_lock
    backoff_lock: Mutex<BackoffIndex>,
    /// Number of backoffs in the index, readable without the lock
    backoff_count: AtomicUsize,
    backoff_seq: AtomicU64,
}

impl Session {
    pub fn new(
        entity_name: impl Into<String>,
        con: ConnectionRef,
        config: Arc<BackoffConfig>,
    ) -> Arc<Self> {
        Arc::new(Self {
            entity_name: entity_name.into(),
            socket_addr: con.peer_addr(),
            con: Mutex::new(Some(con)),
            config,
            backoff_lock: Mutex::new(HashMap::new()),
            backoff_count: AtomicUsize::new(0),
            backoff_seq: AtomicU64::new(0),
        })
    }

    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    pub fn peer_socket_addr(&self) -> Option<SocketAddr> {
        self.socket_addr
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// The connection, unless it has been reset
    pub fn connection(&self) -> Option<ConnectionRef> {
        lockdep::lock(&self.con, LockClass::Connection).clone()
    }

    pub fn is_connected(&self) -> bool {
        lockdep::lock(&self.con, LockClass::Connection).is_some()
    }

    pub fn supports_backoff(&self) -> bool {
        self.connection().is_some_and(|con| con.supports_backoff())
    }

    /// Number of registered backoffs
    pub fn backoff_count(&self) -> usize {
        self.backoff_count.load(Ordering::Acquire)
    }

    /// Allocate the id of a new backoff; ids start at 1
    pub(crate) fn next_backoff_id(&self) -> u64 {
        self.backoff_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn assert_count(&self, backoffs: &BackoffIndex) {
        let count = self.backoff_count.load(Ordering::Acquire);
        assert_eq!(
            count == 0,
            backoffs.is_empty(),
            "session {}: backoff_count {} disagrees with index of {} pgs",
            self,
            count,
            backoffs.len()
        );
    }

    /// Find the backoff of `pgid` that covers `oid`, if any
    ///
    /// The unlocked check of `backoff_count` is a best-effort fast path: a
    /// backoff registered concurrently may be missed. That is tolerated, the
    /// PG registers a backoff before telling the client about it, and an op
    /// that slipped through is simply handled (or backed off) by the PG.
    pub fn have_backoff(&self, pgid: SpgId, oid: &HObject) -> Option<Arc<Backoff>> {
        if self.backoff_count.load(Ordering::Acquire) == 0 {
            return None;
        }
        let backoffs = lockdep::lock(&self.backoff_lock, LockClass::Session);
        self.assert_count(&backoffs);
        let pg_backoffs = backoffs.get(&pgid)?;
        // greatest begin <= oid
        let (begin, set) = pg_backoffs.range::<HObject, _>(..=oid).next_back()?;
        if begin == oid {
            set.values().next().cloned()
        } else {
            set.values().find(|b| oid < b.end()).cloned()
        }
    }

    /// Whether an op from this client on `oid` must be dropped
    ///
    /// True if the op falls under a backoff, or if the session has been
    /// disconnected (the reset clears the connection before the backoffs, so
    /// an op racing the reset must not slip through).
    pub fn check_backoff<M: fmt::Debug>(&self, pgid: SpgId, oid: &HObject, m: &M) -> bool {
        if let Some(b) = self.have_backoff(pgid, oid) {
            debug!("session {} has backoff {} for {:?}", self, b, m);
            assert!(
                !b.is_acked() || !self.config.osd_debug_crash_on_ignored_backoff,
                "client {} ignored acked backoff {}",
                self.entity_name,
                b
            );
            return true;
        }
        if !self.is_connected() {
            debug!("session {} disconnected, dropping {:?}", self, m);
            return true;
        }
        false
    }

    /// Index `b`; refused (returns false) once the session has been reset
    ///
    /// `reset` drops the connection before clearing the index, so checking
    /// the connection under `backoff_lock` means a refused backoff was never
    /// visible and an accepted one will be seen by `clear_backoffs`.
    pub(crate) fn add_backoff(&self, b: Arc<Backoff>) -> bool {
        let mut backoffs = lockdep::lock(&self.backoff_lock, LockClass::Session);
        if !self.is_connected() {
            debug!("session {} reset, refusing {}", self, b);
            return false;
        }
        self.assert_count(&backoffs);
        let prev = backoffs
            .entry(b.pgid())
            .or_default()
            .entry(b.begin().clone())
            .or_default()
            .insert(b.id(), b);
        assert!(prev.is_none(), "session {}: duplicate backoff id", self);
        self.backoff_count.fetch_add(1, Ordering::AcqRel);
        self.assert_count(&backoffs);
        true
    }

    /// Unlink `b` from this session's index
    ///
    /// Called by the PG release paths with the token locked. Removing a
    /// backoff that is no longer indexed (it raced `clear_backoffs`, or was
    /// already removed) is a no-op.
    pub(crate) fn rm_backoff(&self, b: &LockedBackoff<'_>) {
        assert!(
            b.session_is(self),
            "session {}: rm_backoff of {} owned by another session",
            self,
            b
        );
        let mut backoffs = lockdep::lock(&self.backoff_lock, LockClass::Session);
        if let Some(pg_backoffs) = backoffs.get_mut(&b.pgid()) {
            if let Some(set) = pg_backoffs.get_mut(b.begin()) {
                if let Some(found) = set.get(&b.id()) {
                    assert!(
                        Arc::ptr_eq(found, b.backoff()),
                        "session {}: id {} indexed for a different backoff",
                        self,
                        b.id()
                    );
                    set.remove(&b.id());
                    self.backoff_count.fetch_sub(1, Ordering::AcqRel);
                    if set.is_empty() {
                        pg_backoffs.remove(b.begin());
                        if pg_backoffs.is_empty() {
                            backoffs.remove(&b.pgid());
                        }
                    }
                }
            }
        }
        self.assert_count(&backoffs);
    }

    /// Handle the client's ACK_BLOCK for backoff `id`
    ///
    /// A `New` backoff becomes `Acked`. A `Deleting` backoff has already been
    /// released by the PG and this ack completes its round trip, so it leaves
    /// the index. Anything that does not match a registered backoff is a
    /// protocol fault returned to the caller.
    pub fn ack_backoff(&self, pgid: SpgId, id: u64, begin: &HObject, end: &HObject) -> Result<()> {
        let mut backoffs = lockdep::lock(&self.backoff_lock, LockClass::Session);
        let result = self.ack_locked(&mut backoffs, pgid, id, begin, end);
        self.assert_count(&backoffs);
        result
    }

    fn ack_locked(
        &self,
        backoffs: &mut BackoffIndex,
        pgid: SpgId,
        id: u64,
        begin: &HObject,
        end: &HObject,
    ) -> Result<()> {
        let unknown = |reason| OsdError::UnknownBackoff {
            pgid,
            id,
            begin: begin.clone(),
            reason,
        };
        let pg_backoffs = backoffs.get_mut(&pgid).ok_or_else(|| unknown("pg not found"))?;
        let set = pg_backoffs
            .get_mut(begin)
            .ok_or_else(|| unknown("begin not found"))?;
        let b = set.get(&id).ok_or_else(|| unknown("id not found"))?;
        if b.end() != end {
            return Err(OsdError::RangeMismatch {
                pgid,
                id,
                registered: b.end().clone(),
                acked: end.clone(),
            });
        }

        if b.mark_acked() {
            debug!("session {} ack_backoff now {}", self, b);
        } else if b.is_deleting() {
            debug!("session {} ack_backoff deleting {}", self, b);
            set.remove(&id);
            self.backoff_count.fetch_sub(1, Ordering::AcqRel);
        } else {
            debug!("session {} ack_backoff duplicate ack for {}", self, b);
        }

        if set.is_empty() {
            debug!("session {} clearing begin bin {}", self, begin);
            pg_backoffs.remove(begin);
            if pg_backoffs.is_empty() {
                debug!("session {} clearing pg bin {}", self, pgid);
                backoffs.remove(&pgid);
            }
        }
        Ok(())
    }

    /// Detach every backoff from this session
    ///
    /// Called once when the session is torn down. Afterwards the index is
    /// empty and every backoff it held has its session link cleared; backoffs
    /// still linked to a PG are unlinked there as well.
    pub fn clear_backoffs(&self) {
        let ls = {
            let mut backoffs = lockdep::lock(&self.backoff_lock, LockClass::Session);
            self.backoff_count.store(0, Ordering::Release);
            std::mem::take(&mut *backoffs)
        };
        for b in ls.into_values().flat_map(|pg| pg.into_values()).flat_map(|set| set.into_values()) {
            let mut locked = b.lock();
            if let Some(pg) = locked.pg().cloned() {
                assert!(locked.session_is(self), "{} not owned by session {}", locked, self);
                assert!(
                    b.is_new() || b.is_acked(),
                    "{} linked to its pg while deleting",
                    locked
                );
                pg.rm_backoff(&locked);
                locked.take_pg();
                locked.take_session();
            } else if locked.session().is_some() {
                assert!(locked.session_is(self), "{} not owned by session {}", locked, self);
                assert!(b.is_deleting(), "{} detached from its pg but not deleting", locked);
                locked.take_session();
            }
        }
    }

    /// Dispatch a backoff message received from the client
    ///
    /// Reference: ~/dev/ceph/src/osd/OSD.cc handle_fast_backoff()
    pub fn handle_backoff(&self, m: &MOSDBackoff) {
        match m.op {
            BackoffOp::AckBlock => {
                if let Err(e) = self.ack_backoff(m.pgid, m.id, &m.begin, &m.end) {
                    debug!("session {} ignoring {}: {}", self, m, e);
                }
            }
            op => {
                warn!("session {} unexpected backoff op {} in {}", self, op.name(), m);
            }
        }
    }

    /// The client connection was reset
    ///
    /// Drops the connection first, so that concurrent `check_backoff` calls
    /// start rejecting ops, then tears down the backoffs.
    pub fn reset(&self) {
        let con = lockdep::lock(&self.con, LockClass::Connection).take();
        if con.is_some() {
            info!("session {} connection reset", self);
        }
        self.clear_backoffs();
    }

    /// Snapshot of the registered backoffs, ordered by pgid then range start
    pub fn dump_backoffs(&self) -> Vec<BackoffInfo> {
        let backoffs = lockdep::lock(&self.backoff_lock, LockClass::Session);
        let mut pgids: Vec<&SpgId> = backoffs.keys().collect();
        pgids.sort();
        pgids
            .into_iter()
            .flat_map(|pgid| backoffs[pgid].values())
            .flat_map(|set| set.values())
            .map(|b| b.info())
            .collect()
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:p} {}", self, self.entity_name)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("entity_name", &self.entity_name)
            .field("socket_addr", &self.socket_addr)
            .field("backoff_count", &self.backoff_count())
            .finish()
    }
}
