//! Lock ordering for the backoff subsystem
//!
//! Every lock taken by this crate belongs to one [`LockClass`]. A thread may
//! only acquire a lock whose class is strictly greater than every class it
//! already holds:
//!
//! ```text
//! Backoff::lock -> PgBackoffs::backoff_lock -> Session::backoff_lock -> Session::con
//! ```
//!
//! In debug builds each acquisition is checked against a per-thread record of
//! held classes and an out-of-order acquisition panics. Release builds only
//! take the mutex.

use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockClass {
    Backoff = 0,
    Pg = 1,
    Session = 2,
    Connection = 3,
}

impl LockClass {
    pub fn name(&self) -> &'static str {
        match self {
            LockClass::Backoff => "Backoff::lock",
            LockClass::Pg => "PG::backoff_lock",
            LockClass::Session => "Session::backoff_lock",
            LockClass::Connection => "Session::con",
        }
    }
}

#[cfg(debug_assertions)]
mod held {
    use super::LockClass;
    use std::cell::RefCell;

    thread_local! {
        static HELD: RefCell<Vec<LockClass>> = const { RefCell::new(Vec::new()) };
    }

    pub fn before_lock(next: LockClass) {
        let top = HELD.with(|held| held.borrow().iter().max().copied());
        if let Some(top) = top {
            assert!(
                top < next,
                "lock order violation: acquiring {} while holding {}",
                next.name(),
                top.name()
            );
        }
    }

    pub fn after_lock(locked: LockClass) {
        HELD.with(|held| held.borrow_mut().push(locked));
    }

    pub fn unlock(class: LockClass) {
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(pos) = held.iter().rposition(|c| *c == class) {
                held.remove(pos);
            }
        });
    }

    pub fn held() -> Vec<LockClass> {
        HELD.with(|held| held.borrow().clone())
    }
}

/// Lock classes currently held by this thread (always empty in release builds)
pub fn held_classes() -> Vec<LockClass> {
    #[cfg(debug_assertions)]
    {
        held::held()
    }
    #[cfg(not(debug_assertions))]
    {
        Vec::new()
    }
}

/// A mutex guard that remembers its lock class for the order checker
pub struct OrderedGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    #[cfg_attr(not(debug_assertions), allow(dead_code))]
    class: LockClass,
}

impl<T> Deref for OrderedGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for OrderedGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for OrderedGuard<'_, T> {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        held::unlock(self.class);
    }
}

/// Acquire `mutex` as a lock of class `class`
///
/// A poisoned lock means a thread panicked halfway through mutating backoff
/// state, so the owner links can no longer be trusted; that is fatal.
pub fn lock<T>(mutex: &Mutex<T>, class: LockClass) -> OrderedGuard<'_, T> {
    #[cfg(debug_assertions)]
    held::before_lock(class);
    let guard = mutex
        .lock()
        .unwrap_or_else(|_| panic!("{} poisoned", class.name()));
    #[cfg(debug_assertions)]
    held::after_lock(class);
    OrderedGuard { guard, class }
}
