//! Run timeout.
//!
//! Run control blocks without a timeout. The watchdog bounds a single run by
//! killing the target once the deadline passes; the blocked wait then fails
//! with [`SyncError::TargetExited`](super::SyncError::TargetExited).

use super::notify::{Notification, Wake};
use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

#[derive(Debug, Clone, Copy)]
pub struct Watchdog {
    timeout: Duration,
}

impl Watchdog {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Starts the clock for `pid`, stopped when the returned guard is dropped
    /// or disarmed.
    pub fn arm(&self, pid: Pid) -> Armed {
        let done = Arc::new(Notification::new());
        let fired = Arc::new(AtomicBool::new(false));
        let timeout = self.timeout;
        let handle = {
            let done = Arc::clone(&done);
            let fired = Arc::clone(&fired);
            thread::spawn(move || {
                if done.wait_timeout(timeout) == Wake::TimedOut {
                    log::warn!("target {} timed out after {:?}, killing", pid, timeout);
                    fired.store(true, Ordering::SeqCst);
                    if let Err(e) = kill(pid, Signal::SIGKILL) {
                        log::warn!("failed to kill target {}: {}", pid, e);
                    }
                }
            })
        };
        Armed {
            done,
            fired,
            handle: Some(handle),
        }
    }
}

pub struct Armed {
    done: Arc<Notification>,
    fired: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Armed {
    /// Stops the clock, true if the target was killed.
    pub fn disarm(mut self) -> bool {
        self.stop();
        self.fired.load(Ordering::SeqCst)
    }

    fn stop(&mut self) {
        self.done.notify();
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for Armed {
    fn drop(&mut self) {
        self.stop();
    }
}
