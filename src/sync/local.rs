//! In-process channel, for targets embedded in the control process and for
//! tests.

use super::{
    notify::{Notification, State, Wake},
    Endpoint, Link, Request, SyncError,
};
use std::sync::{
    atomic::{AtomicU8, Ordering},
    Arc,
};

const REQ_RESET: u8 = 0;
const REQ_RUN: u8 = 1;

#[derive(Default)]
struct Channel {
    request: AtomicU8,
    to_target: Notification,
    to_control: Notification,
}

pub struct LocalLink {
    chan: Arc<Channel>,
}

pub struct LocalEndpoint {
    chan: Arc<Channel>,
}

/// Connected control and target sides; dropping either side disconnects the other.
pub fn pair() -> (LocalLink, LocalEndpoint) {
    let chan = Arc::new(Channel::default());
    (
        LocalLink {
            chan: Arc::clone(&chan),
        },
        LocalEndpoint { chan },
    )
}

impl Link for LocalLink {
    fn request(&mut self, req: Request) -> Result<(), SyncError> {
        let code = match req {
            Request::Reset => REQ_RESET,
            Request::Run => REQ_RUN,
        };
        self.chan.request.store(code, Ordering::Release);
        if self.chan.to_target.notify() {
            Ok(())
        } else if self.chan.to_target.state() == State::Closed {
            Err(SyncError::Disconnected)
        } else {
            Err(SyncError::Busy)
        }
    }

    fn wait_ack(&mut self) -> Result<(), SyncError> {
        match self.chan.to_control.wait() {
            Wake::Notified => Ok(()),
            _ => Err(SyncError::Disconnected),
        }
    }
}

impl Drop for LocalLink {
    fn drop(&mut self) {
        self.chan.to_target.close();
    }
}

impl Endpoint for LocalEndpoint {
    fn next_request(&mut self) -> Result<Request, SyncError> {
        match self.chan.to_target.wait() {
            Wake::Notified => {
                if self.chan.request.load(Ordering::Acquire) == REQ_RUN {
                    Ok(Request::Run)
                } else {
                    Ok(Request::Reset)
                }
            }
            _ => Err(SyncError::Disconnected),
        }
    }

    fn ack(&mut self) -> Result<(), SyncError> {
        // an ack nobody consumed yet coalesces with this one, a vanished
        // control side shows up in the next request.
        self.chan.to_control.notify();
        Ok(())
    }
}

impl Drop for LocalEndpoint {
    fn drop(&mut self) {
        self.chan.to_control.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::RunControl;
    use std::thread;

    #[test]
    fn control_and_target_rendezvous() {
        let (link, mut ep) = pair();
        let target = thread::spawn(move || {
            let mut seen = Vec::new();
            ep.ack().unwrap();
            while let Ok(req) = ep.next_request() {
                seen.push(req);
                ep.ack().unwrap();
            }
            seen
        });

        let mut ctl = RunControl::start(link).unwrap();
        for _ in 0..3 {
            ctl.reset().unwrap();
            ctl.run().unwrap();
        }
        drop(ctl);
        let seen = target.join().unwrap();
        assert_eq!(seen.len(), 6);
        assert!(seen
            .chunks(2)
            .all(|c| c == [Request::Reset, Request::Run]));
    }

    #[test]
    fn dead_target_disconnects() {
        let (link, ep) = pair();
        drop(ep);
        assert!(matches!(
            RunControl::start(link),
            Err(SyncError::Disconnected)
        ));
    }
}
