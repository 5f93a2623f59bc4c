//! Coalescing one-shot notification.
//!
//! At most one event is outstanding: notifying an already pending
//! notification is a no-op. Closing wakes every waiter for good.

use std::{
    sync::{Condvar, Mutex, MutexGuard},
    time::{Duration, Instant},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Pending,
    Closed,
}

/// Result of a wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// The pending event was consumed.
    Notified,
    /// The other side went away.
    Closed,
    TimedOut,
}

#[derive(Debug)]
pub struct Notification {
    state: Mutex<State>,
    cond: Condvar,
}

impl Default for Notification {
    fn default() -> Self {
        Self::new()
    }
}

impl Notification {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::Idle),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn state(&self) -> State {
        *self.lock()
    }

    /// Marks the event pending, returns false if it was already pending or closed.
    pub fn notify(&self) -> bool {
        let mut s = self.lock();
        if *s != State::Idle {
            return false;
        }
        *s = State::Pending;
        self.cond.notify_all();
        true
    }

    pub fn close(&self) {
        *self.lock() = State::Closed;
        self.cond.notify_all();
    }

    /// Consumes a pending event without blocking.
    pub fn try_wait(&self) -> Option<Wake> {
        let mut s = self.lock();
        Self::consume(&mut s)
    }

    /// Blocks until an event is pending or the notification is closed.
    pub fn wait(&self) -> Wake {
        let mut s = self.lock();
        loop {
            if let Some(w) = Self::consume(&mut s) {
                return w;
            }
            s = match self.cond.wait(s) {
                Ok(s) => s,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Wake {
        let deadline = Instant::now() + timeout;
        let mut s = self.lock();
        loop {
            if let Some(w) = Self::consume(&mut s) {
                return w;
            }
            let now = Instant::now();
            if now >= deadline {
                return Wake::TimedOut;
            }
            s = match self.cond.wait_timeout(s, deadline - now) {
                Ok((s, _)) => s,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    fn consume(s: &mut State) -> Option<Wake> {
        match *s {
            State::Idle => None,
            State::Pending => {
                *s = State::Idle;
                Some(Wake::Notified)
            }
            State::Closed => Some(Wake::Closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread};

    #[test]
    fn notifications_coalesce() {
        let n = Notification::new();
        assert!(n.notify());
        assert!(!n.notify());
        assert_eq!(n.try_wait(), Some(Wake::Notified));
        assert_eq!(n.try_wait(), None);
        assert_eq!(n.state(), State::Idle);
    }

    #[test]
    fn wait_across_threads() {
        let n = Arc::new(Notification::new());
        let n1 = Arc::clone(&n);
        let h = thread::spawn(move || n1.wait());
        thread::sleep(Duration::from_millis(20));
        n.notify();
        assert_eq!(h.join().unwrap(), Wake::Notified);
    }

    #[test]
    fn close_is_sticky() {
        let n = Notification::new();
        n.close();
        assert!(!n.notify());
        assert_eq!(n.wait(), Wake::Closed);
        assert_eq!(n.try_wait(), Some(Wake::Closed));
    }

    #[test]
    fn timeout_expires() {
        let n = Notification::new();
        let start = Instant::now();
        assert_eq!(n.wait_timeout(Duration::from_millis(30)), Wake::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(30));
        n.notify();
        assert_eq!(n.wait_timeout(Duration::from_secs(1)), Wake::Notified);
    }
}
