//! Wake-up primitive for parked threads
//!
//! Exclusive services park on one of these while waiting for external
//! readiness; idle workers sleep on one too. A trigger that arrives before
//! the wait is remembered, so no wake-up is lost.

use parking_lot::{Condvar, Mutex};

/// OS-level wake-up handle
pub trait WakeEvent: Send + Sync {
    /// Signal the event. Idempotent while already signaled.
    /// Returns true when a thread was parked on it.
    fn trigger(&self) -> bool;

    /// Block until triggered (true) or closed (false).
    fn wait(&self) -> bool;

    /// Release any waiter permanently; later waits return false at once.
    fn close(&self);
}

#[derive(Debug, Default)]
struct EventState {
    signaled: bool,
    closed: bool,
    waiting: bool,
}

/// Mutex + condvar implementation of [`WakeEvent`]
#[derive(Debug, Default)]
pub struct CondvarEvent {
    state: Mutex<EventState>,
    cond: Condvar,
}

impl CondvarEvent {
    /// Create an unsignaled event
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a thread is currently parked
    pub fn is_waiting(&self) -> bool {
        self.state.lock().waiting
    }
}

impl WakeEvent for CondvarEvent {
    fn trigger(&self) -> bool {
        let mut state = self.state.lock();
        if state.signaled {
            return false;
        }
        state.signaled = true;
        let woke = state.waiting;
        self.cond.notify_one();
        woke
    }

    fn wait(&self) -> bool {
        let mut state = self.state.lock();
        while !state.signaled && !state.closed {
            state.waiting = true;
            self.cond.wait(&mut state);
        }
        state.waiting = false;
        if state.closed {
            return false;
        }
        state.signaled = false;
        true
    }

    fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_trigger_before_wait_is_kept() {
        let event = CondvarEvent::new();
        assert!(!event.trigger());
        assert!(!event.trigger());
        assert!(event.wait());
    }

    #[test]
    fn test_trigger_wakes_waiter() {
        let event = Arc::new(CondvarEvent::new());
        let waiter = {
            let event = event.clone();
            thread::spawn(move || event.wait())
        };
        while !event.is_waiting() {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(event.trigger());
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_close_releases_waiter() {
        let event = Arc::new(CondvarEvent::new());
        let waiter = {
            let event = event.clone();
            thread::spawn(move || event.wait())
        };
        thread::sleep(Duration::from_millis(10));
        event.close();
        assert!(!waiter.join().unwrap());
        assert!(!event.wait());
    }
}
