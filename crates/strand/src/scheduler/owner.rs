//! Scheduler ownership token
//!
//! One atomic word names the thread allowed to run `schedule_dispatch`.
//! Whoever wins the CAS from "none" gets exclusive `&mut` access to the
//! dispatch state until the guard drops.

use super::dispatch::DispatchState;
use crate::defaults::MAX_EXCLUSIVE;
use crossbeam::utils::Backoff;
use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicI32, Ordering};
use tracing::trace;

const NO_OWNER: i32 = -1;
const TIMER_TOKEN: i32 = -2;
const EXTERNAL_TOKEN: i32 = -3;

/// Identity of a thread taking part in scheduling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadRole {
    /// Worker thread by index
    Worker(usize),
    /// Exclusive thread by index
    Exclusive(usize),
    /// Timer ticker
    Timer,
    /// A thread outside the runtime (bootstrap, external senders)
    External,
}

impl ThreadRole {
    fn token(self) -> i32 {
        match self {
            ThreadRole::Exclusive(n) => n as i32,
            ThreadRole::Worker(n) => (MAX_EXCLUSIVE + n) as i32,
            ThreadRole::Timer => TIMER_TOKEN,
            ThreadRole::External => EXTERNAL_TOKEN,
        }
    }
}

pub(crate) struct OwnerToken {
    owner: AtomicI32,
    state: UnsafeCell<DispatchState>,
}

// The state is only reachable through an OwnerGuard, and at most one guard
// exists at a time.
unsafe impl Sync for OwnerToken {}

impl OwnerToken {
    pub(crate) fn new(state: DispatchState) -> Self {
        Self {
            owner: AtomicI32::new(NO_OWNER),
            state: UnsafeCell::new(state),
        }
    }

    /// Take ownership if nobody holds it; never waits.
    pub(crate) fn try_acquire(&self, who: ThreadRole) -> Option<OwnerGuard<'_>> {
        if self.owner.load(Ordering::Relaxed) != NO_OWNER {
            return None;
        }
        self.owner
            .compare_exchange(NO_OWNER, who.token(), Ordering::Acquire, Ordering::Relaxed)
            .ok()?;
        trace!(?who, "acquire schedule");
        Some(OwnerGuard { token: self, who })
    }

    /// Spin until ownership is obtained
    pub(crate) fn acquire(&self, who: ThreadRole) -> OwnerGuard<'_> {
        let backoff = Backoff::new();
        loop {
            if let Some(guard) = self.try_acquire(who) {
                return guard;
            }
            backoff.snooze();
        }
    }
}

/// Exclusive access to the dispatch state; releases ownership on drop
pub(crate) struct OwnerGuard<'a> {
    token: &'a OwnerToken,
    who: ThreadRole,
}

impl Deref for OwnerGuard<'_> {
    type Target = DispatchState;

    fn deref(&self) -> &DispatchState {
        // SAFETY: holding the guard means we won the owner CAS.
        unsafe { &*self.token.state.get() }
    }
}

impl DerefMut for OwnerGuard<'_> {
    fn deref_mut(&mut self) -> &mut DispatchState {
        // SAFETY: as above, and `&mut self` prevents aliasing via this guard.
        unsafe { &mut *self.token.state.get() }
    }
}

impl Drop for OwnerGuard<'_> {
    fn drop(&mut self) {
        let current = self.token.owner.load(Ordering::Relaxed);
        debug_assert_eq!(current, self.who.token(), "released by a non-owner");
        self.token.owner.store(NO_OWNER, Ordering::Release);
        trace!(who = ?self.who, "release schedule");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    fn token() -> OwnerToken {
        OwnerToken::new(DispatchState::new(16, 2))
    }

    #[test]
    fn test_role_tokens_are_distinct() {
        let roles = [
            ThreadRole::Worker(0),
            ThreadRole::Worker(255),
            ThreadRole::Exclusive(0),
            ThreadRole::Exclusive(MAX_EXCLUSIVE - 1),
            ThreadRole::Timer,
            ThreadRole::External,
        ];
        let tokens: HashSet<i32> = roles.iter().map(|r| r.token()).collect();
        assert_eq!(tokens.len(), roles.len());
        assert!(!tokens.contains(&NO_OWNER));
    }

    #[test]
    fn test_try_acquire_is_exclusive() {
        let token = token();
        let guard = token.try_acquire(ThreadRole::Worker(0)).unwrap();
        assert!(token.try_acquire(ThreadRole::Worker(1)).is_none());
        assert!(token.try_acquire(ThreadRole::Timer).is_none());
        drop(guard);
        let again = token.try_acquire(ThreadRole::Worker(1));
        assert!(again.is_some());
        drop(again);
        assert!(token.try_acquire(ThreadRole::External).is_some());
    }

    #[test]
    fn test_acquire_serializes_threads() {
        let token = Arc::new(token());
        let inside = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let token = token.clone();
                let inside = inside.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        let _guard = token.acquire(ThreadRole::Exclusive(i));
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }
}
