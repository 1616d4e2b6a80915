//! Backoff token
//!
//! A `Backoff` is one instance of a PG or an object range being plugged at a
//! client. It is shared (`Arc`) between the PG's backoff index and the client
//! session's backoff index, and points back at both owners:
//!
//! - *both* links set while the backoff is live,
//! - both cleared after teardown,
//! - only the session link set once the PG has released a backoff the client
//!   has not acked yet (state `Deleting`).
//!
//! The links are only read or changed under the token's own lock, which is the
//! outermost lock of the subsystem (see [`crate::lockdep`]). The state is an
//! atomic so that lookups and acks can read it without that lock.

use crate::hobject::HObject;
use crate::lockdep::{self, LockClass, OrderedGuard};
use crate::pg::PgBackoffs;
use crate::session::Session;
use crate::types::SpgId;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::Serialize;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, TryLockError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive, Serialize)]
#[repr(u8)]
#[serde(rename_all = "lowercase")]
pub enum BackoffState {
    /// backoff in flight to client
    New = 1,
    /// backoff acked
    Acked = 2,
    /// backoff deleted, but un-acked
    Deleting = 3,
}

impl BackoffState {
    pub fn name(&self) -> &'static str {
        match self {
            BackoffState::New => "new",
            BackoffState::Acked => "acked",
            BackoffState::Deleting => "deleting",
        }
    }
}

/// Owner links, guarded by `Backoff::links`
pub(crate) struct BackoffLinks {
    pg: Option<Arc<PgBackoffs>>,
    session: Option<Arc<Session>>,
}

pub struct Backoff {
    pgid: SpgId,
    id: u64,
    begin: HObject,
    end: HObject,
    state: AtomicU8,
    links: Mutex<BackoffLinks>,
}

impl Backoff {
    /// A new backoff is always attached to both its PG and its session
    pub(crate) fn new(
        pgid: SpgId,
        pg: Arc<PgBackoffs>,
        session: Arc<Session>,
        id: u64,
        begin: HObject,
        end: HObject,
    ) -> Arc<Self> {
        Arc::new(Self {
            pgid,
            id,
            begin,
            end,
            state: AtomicU8::new(BackoffState::New.into()),
            links: Mutex::new(BackoffLinks {
                pg: Some(pg),
                session: Some(session),
            }),
        })
    }

    pub fn pgid(&self) -> SpgId {
        self.pgid
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn begin(&self) -> &HObject {
        &self.begin
    }

    pub fn end(&self) -> &HObject {
        &self.end
    }

    /// `begin == end` blocks exactly one object
    pub fn is_single_object(&self) -> bool {
        self.begin == self.end
    }

    /// Whether an op on `oid` falls under this backoff
    pub fn covers(&self, oid: &HObject) -> bool {
        *oid == self.begin || (self.begin < *oid && *oid < self.end)
    }

    pub fn state(&self) -> BackoffState {
        let raw = self.state.load(Ordering::Acquire);
        BackoffState::try_from(raw)
            .unwrap_or_else(|_| panic!("backoff {} has corrupt state {}", self.id, raw))
    }

    pub fn is_new(&self) -> bool {
        self.state() == BackoffState::New
    }

    pub fn is_acked(&self) -> bool {
        self.state() == BackoffState::Acked
    }

    pub fn is_deleting(&self) -> bool {
        self.state() == BackoffState::Deleting
    }

    /// `New -> Acked`. Returns false, changing nothing, from any other state.
    pub fn mark_acked(&self) -> bool {
        self.transition(BackoffState::New, BackoffState::Acked)
    }

    /// `New | Acked -> Deleting`; idempotent. Returns the previous state.
    pub fn mark_deleting(&self) -> BackoffState {
        let prev = self
            .state
            .swap(BackoffState::Deleting.into(), Ordering::AcqRel);
        BackoffState::try_from(prev)
            .unwrap_or_else(|_| panic!("backoff {} had corrupt state {}", self.id, prev))
    }

    /// `New -> Deleting` only. Fails if the client acked first.
    pub(crate) fn mark_deleting_if_new(&self) -> bool {
        self.transition(BackoffState::New, BackoffState::Deleting)
    }

    fn transition(&self, from: BackoffState, to: BackoffState) -> bool {
        self.state
            .compare_exchange(from.into(), to.into(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Take the token lock
    pub fn lock(self: &Arc<Self>) -> LockedBackoff<'_> {
        LockedBackoff {
            backoff: self,
            links: lockdep::lock(&self.links, LockClass::Backoff),
        }
    }

    /// Whether a session still references this backoff
    pub fn has_session(self: &Arc<Self>) -> bool {
        self.lock().session().is_some()
    }

    /// Whether a PG still references this backoff
    pub fn has_pg(self: &Arc<Self>) -> bool {
        self.lock().pg().is_some()
    }

    pub fn info(&self) -> BackoffInfo {
        BackoffInfo {
            pgid: self.pgid.to_string(),
            id: self.id,
            state: self.state(),
            begin: self.begin.to_string(),
            end: self.end.to_string(),
        }
    }

    fn fmt_with_owners(
        &self,
        f: &mut fmt::Formatter<'_>,
        session: &str,
        pg: &str,
    ) -> fmt::Result {
        write!(
            f,
            "Backoff({:p} {} {} {} [{},{}) session {} pg {})",
            self,
            self.pgid,
            self.id,
            self.state().name(),
            self.begin,
            self.end,
            session,
            pg
        )
    }
}

fn session_name(session: Option<&Arc<Session>>) -> String {
    match session {
        Some(s) => format!("{:p}", Arc::as_ptr(s)),
        None => "0".to_string(),
    }
}

fn pg_name(pg: Option<&Arc<PgBackoffs>>) -> String {
    match pg {
        Some(p) => p.pgid().to_string(),
        None => "0".to_string(),
    }
}

impl fmt::Display for Backoff {
    /// Never blocks: owners held under a lock somebody else owns print as `?`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.links.try_lock() {
            Ok(links) => {
                let session = session_name(links.session.as_ref());
                let pg = pg_name(links.pg.as_ref());
                drop(links);
                self.fmt_with_owners(f, &session, &pg)
            }
            Err(TryLockError::WouldBlock) | Err(TryLockError::Poisoned(_)) => {
                self.fmt_with_owners(f, "?", "?")
            }
        }
    }
}

impl fmt::Debug for Backoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// A backoff whose lock is held by the current thread
///
/// Operations that require the caller to hold the token lock take a
/// `&LockedBackoff`, so the requirement is checked by the compiler.
pub struct LockedBackoff<'a> {
    backoff: &'a Arc<Backoff>,
    links: OrderedGuard<'a, BackoffLinks>,
}

impl<'a> LockedBackoff<'a> {
    pub fn backoff(&self) -> &'a Arc<Backoff> {
        self.backoff
    }

    pub fn session(&self) -> Option<&Arc<Session>> {
        self.links.session.as_ref()
    }

    pub fn pg(&self) -> Option<&Arc<PgBackoffs>> {
        self.links.pg.as_ref()
    }

    pub fn session_is(&self, session: &Session) -> bool {
        self.links
            .session
            .as_ref()
            .is_some_and(|s| std::ptr::eq(Arc::as_ptr(s), session))
    }

    pub fn pg_is(&self, pg: &PgBackoffs) -> bool {
        self.links
            .pg
            .as_ref()
            .is_some_and(|p| std::ptr::eq(Arc::as_ptr(p), pg))
    }

    pub(crate) fn take_session(&mut self) -> Option<Arc<Session>> {
        self.links.session.take()
    }

    pub(crate) fn take_pg(&mut self) -> Option<Arc<PgBackoffs>> {
        self.links.pg.take()
    }
}

impl Deref for LockedBackoff<'_> {
    type Target = Backoff;

    fn deref(&self) -> &Backoff {
        self.backoff
    }
}

impl fmt::Display for LockedBackoff<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.backoff.fmt_with_owners(
            f,
            &session_name(self.links.session.as_ref()),
            &pg_name(self.links.pg.as_ref()),
        )
    }
}

/// Serializable snapshot of a backoff, for diagnostics dumps
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackoffInfo {
    pub pgid: String,
    pub id: u64,
    pub state: BackoffState,
    pub begin: String,
    pub end: String,
}
