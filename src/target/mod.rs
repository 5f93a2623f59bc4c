//! Target side of run control.
//!
//! A [`TargetAgent`] serves reset/run requests coming through an
//! [`Endpoint`] against a [`Snapshot`]: reset restores the snapshot, run
//! resumes execution until the stop point, and every request is acknowledged
//! once handled.

pub mod exits;
pub mod harness;

use crate::{
    dio::{ChannelInfo, DataChannel, DioError},
    sync::{Endpoint, Request, SyncError},
    transport::{DebugFlags, MagicTrap, Pipe, PIPE_MAGIC},
};
use std::{
    path::Path,
    process::Command,
    sync::{
        atomic::{fence, AtomicBool, Ordering},
        Arc,
    },
};
use thiserror::Error;

/// Exported to the target: name of the data channel.
pub const DIO_ENV: &str = "SNAPFORK_DIO";
/// Exported to the target: bound on pipe retransmissions.
pub const PIPE_RETRIES_ENV: &str = "SNAPFORK_PIPE_RETRIES";
/// Exported to the target: pipe debug mask.
pub const PIPE_DEBUG_ENV: &str = "SNAPFORK_PIPE_DEBUG";

#[derive(Debug, Error)]
pub enum TargetError {
    #[error("sync: {0}")]
    Sync(#[from] SyncError),
    #[error("snapshot: {0}")]
    Snapshot(String),
}

/// Something that can be rolled back and run to a stop point.
pub trait Snapshot {
    type Error: std::fmt::Display;

    /// Rolls the target back to the snapshot.
    fn restore(&mut self) -> Result<(), Self::Error>;

    /// Runs until the stop point or until `stop` is requested.
    fn resume(&mut self, stop: &StopHandle) -> Result<(), Self::Error>;
}

/// Shared "stop the current run" flag.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Settings the control process hands to the target through its
/// environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetEnv {
    pub dio: Option<String>,
    pub pipe_retries: Option<u64>,
    pub pipe_debug: DebugFlags,
}

impl TargetEnv {
    pub fn from_env() -> Self {
        Self::from_vars(|k| std::env::var(k).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            dio: var(DIO_ENV).filter(|v| !v.is_empty()),
            pipe_retries: var(PIPE_RETRIES_ENV).and_then(|v| v.trim().parse().ok()),
            pipe_debug: var(PIPE_DEBUG_ENV)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(0),
        }
    }

    /// Exports the settings to a target command.
    pub fn export(&self, cmd: &mut Command) {
        if let Some(dio) = self.dio.as_ref() {
            cmd.env(DIO_ENV, dio);
        }
        if let Some(n) = self.pipe_retries {
            cmd.env(PIPE_RETRIES_ENV, n.to_string());
        }
        if self.pipe_debug != 0 {
            cmd.env(PIPE_DEBUG_ENV, self.pipe_debug.to_string());
        }
    }

    /// Opens the data channel, looking it up in the info file of `project`
    /// when the environment does not name it.
    pub fn open_dio(&self, project: Option<&Path>) -> Result<Option<DataChannel>, DioError> {
        let name = match (self.dio.as_ref(), project) {
            (Some(name), _) => name.clone(),
            (None, Some(dir)) => match ChannelInfo::read(dir) {
                Ok(info) => info.dio,
                Err(e) => {
                    log::debug!("no channel info in {}: {}", dir.display(), e);
                    return Ok(None);
                }
            },
            (None, None) => return Ok(None),
        };
        DataChannel::open(&name).map(Some)
    }

    /// Pipe over `trap` with the exported retry bound and debug mask.
    pub fn pipe<T: MagicTrap>(&self, trap: T) -> Pipe<T> {
        let mut pipe = Pipe::open(PIPE_MAGIC, trap);
        pipe.set_max_retries(self.pipe_retries);
        pipe.set_debug(self.pipe_debug);
        pipe
    }
}

pub struct TargetAgent<E, S> {
    endpoint: E,
    snapshot: S,
    stop: StopHandle,
    resets: u64,
    runs: u64,
}

impl<E: Endpoint, S: Snapshot> TargetAgent<E, S> {
    pub fn new(endpoint: E, snapshot: S) -> Self {
        Self::with_stop(endpoint, snapshot, StopHandle::new())
    }

    /// Agent sharing `stop` with collaborators that end runs early.
    pub fn with_stop(endpoint: E, snapshot: S, stop: StopHandle) -> Self {
        Self {
            endpoint,
            snapshot,
            stop,
            resets: 0,
            runs: 0,
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn snapshot(&self) -> &S {
        &self.snapshot
    }

    pub fn snapshot_mut(&mut self) -> &mut S {
        &mut self.snapshot
    }

    pub fn resets(&self) -> u64 {
        self.resets
    }

    pub fn runs(&self) -> u64 {
        self.runs
    }

    /// Reports readiness, then serves requests until the control side goes
    /// away, which is a normal end.
    pub fn serve(&mut self) -> Result<(), TargetError> {
        self.endpoint.ack()?;
        loop {
            match self.endpoint.next_request() {
                Ok(req) => self.handle(req)?,
                Err(SyncError::Disconnected) => {
                    log::debug!(
                        "control side gone after {} resets, {} runs",
                        self.resets,
                        self.runs
                    );
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Handles one request and acknowledges it.
    pub fn handle(&mut self, req: Request) -> Result<(), TargetError> {
        self.stop.clear();
        match req {
            Request::Reset => {
                self.snapshot
                    .restore()
                    .map_err(|e| TargetError::Snapshot(e.to_string()))?;
                self.resets += 1;
            }
            Request::Run => {
                self.snapshot
                    .resume(&self.stop)
                    .map_err(|e| TargetError::Snapshot(e.to_string()))?;
                self.runs += 1;
            }
        }
        // pairs with the acquire fence on the control side.
        fence(Ordering::Release);
        self.endpoint.ack()?;
        Ok(())
    }
}
