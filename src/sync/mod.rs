//! Run control: the reset/run rendezvous between the control process and the
//! target.
//!
//! The control side sends a [`Request`] over a [`Link`] and blocks until the
//! target acknowledges it. The target side pulls requests from an
//! [`Endpoint`] and acknowledges each one once it is done. A target signals
//! its readiness with one unsolicited acknowledgement.

pub mod local;
pub mod notify;
pub mod process;
pub mod watchdog;

pub use notify::{Notification, Wake};

use std::sync::atomic::{fence, Ordering};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Request {
    /// Roll the target back to its snapshot.
    Reset,
    /// Let the target run until its stop point.
    Run,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("failed to spawn target: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("failed to install notification handlers: {0}")]
    HandlerInstall(#[source] std::io::Error),
    #[error("failed to notify peer: {0}")]
    Signal(#[source] nix::Error),
    #[error("target exited: {0}")]
    TargetExited(String),
    #[error("peer disconnected")]
    Disconnected,
    #[error("another operation is outstanding")]
    Busy,
}

/// Control side of a synchronisation channel.
pub trait Link {
    fn request(&mut self, req: Request) -> Result<(), SyncError>;
    /// Blocks until the target's next acknowledgement.
    fn wait_ack(&mut self) -> Result<(), SyncError>;
}

/// Target side of a synchronisation channel.
pub trait Endpoint {
    /// Blocks until the control side sends a request.
    fn next_request(&mut self) -> Result<Request, SyncError>;
    fn ack(&mut self) -> Result<(), SyncError>;
}

impl<L: Link + ?Sized> Link for Box<L> {
    fn request(&mut self, req: Request) -> Result<(), SyncError> {
        (**self).request(req)
    }

    fn wait_ack(&mut self) -> Result<(), SyncError> {
        (**self).wait_ack()
    }
}

impl<E: Endpoint + ?Sized> Endpoint for Box<E> {
    fn next_request(&mut self) -> Result<Request, SyncError> {
        (**self).next_request()
    }

    fn ack(&mut self) -> Result<(), SyncError> {
        (**self).ack()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    AwaitingResetAck,
    AwaitingRunAck,
}

/// Control-side state machine over a [`Link`]: one request outstanding at a
/// time, each call returns once the target acknowledged it.
pub struct RunControl<L> {
    link: L,
    phase: Phase,
    runs: u64,
}

impl<L: Link> RunControl<L> {
    /// Waits for the target's readiness notification.
    pub fn start(mut link: L) -> Result<Self, SyncError> {
        link.wait_ack()?;
        log::debug!("target ready");
        Ok(Self {
            link,
            phase: Phase::Idle,
            runs: 0,
        })
    }

    pub fn reset(&mut self) -> Result<(), SyncError> {
        self.round_trip(Request::Reset)
    }

    pub fn run(&mut self) -> Result<(), SyncError> {
        self.round_trip(Request::Run)?;
        self.runs += 1;
        Ok(())
    }

    fn round_trip(&mut self, req: Request) -> Result<(), SyncError> {
        if self.phase != Phase::Idle {
            return Err(SyncError::Busy);
        }
        self.phase = match req {
            Request::Reset => Phase::AwaitingResetAck,
            Request::Run => Phase::AwaitingRunAck,
        };
        let ret = self.link.request(req).and_then(|_| self.link.wait_ack());
        self.phase = Phase::Idle;
        // pairs with the target's release fence before its ack: everything the
        // target wrote during the run, coverage included, is visible from here.
        fence(Ordering::Acquire);
        ret
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Completed runs.
    pub fn runs(&self) -> u64 {
        self.runs
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    pub fn into_link(self) -> L {
        self.link
    }
}
