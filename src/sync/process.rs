//! Signal-backed channel between two processes.
//!
//! The control process spawns the target, requests are OS signals sent to the
//! target's pid and acknowledgements are signals sent back to the pid found in
//! [`CONTROL_PID_ENV`]. Handlers are installed before the target exists, so an
//! early acknowledgement cannot be lost.

use super::{Endpoint, Link, Request, RunControl, SyncError};
use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use signal_hook::{consts::SIGCHLD, iterator::Signals};
use std::{
    collections::VecDeque,
    os::{raw::c_int, unix::process::CommandExt},
    process::{Child, Command},
};

/// Exported to the target: pid that receives its acknowledgements.
pub const CONTROL_PID_ENV: &str = "SNAPFORK_CONTROL_PID";

/// Signals used for each direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalSet {
    pub reset: Signal,
    pub run: Signal,
    /// Target to control.
    pub ack: Signal,
}

impl Default for SignalSet {
    fn default() -> Self {
        Self {
            reset: Signal::SIGUSR2,
            run: Signal::SIGUSR1,
            ack: Signal::SIGUSR2,
        }
    }
}

impl SignalSet {
    fn request(&self, req: Request) -> Signal {
        match req {
            Request::Reset => self.reset,
            Request::Run => self.run,
        }
    }
}

/// Control side: owns the target process.
pub struct ProcessLink {
    child: Child,
    signals: Signals,
    set: SignalSet,
}

impl ProcessLink {
    /// Spawns `cmd` as the target. The target is killed by the kernel when the
    /// control process dies.
    pub fn spawn(mut cmd: Command, set: SignalSet) -> Result<Self, SyncError> {
        let signals = Signals::new(&[set.ack as c_int, SIGCHLD]).map_err(SyncError::HandlerInstall)?;

        let control = std::process::id();
        cmd.env(CONTROL_PID_ENV, control.to_string());
        unsafe {
            cmd.pre_exec(move || set_parent_death_signal(control));
        }
        let child = cmd.spawn().map_err(SyncError::Spawn)?;
        log::debug!("target spawned, pid {}", child.id());

        Ok(Self {
            child,
            signals,
            set,
        })
    }

    pub fn pid(&self) -> Pid {
        Pid::from_raw(self.child.id() as i32)
    }

    /// Exit status if the target is gone.
    pub fn exited(&mut self) -> Option<String> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(status.to_string()),
            Ok(None) => None,
            Err(e) => Some(e.to_string()),
        }
    }

    pub fn kill(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

#[cfg(target_os = "linux")]
fn set_parent_death_signal(control: u32) -> std::io::Result<()> {
    if unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) } == -1 {
        return Err(std::io::Error::last_os_error());
    }
    // the control process may have died before the prctl
    if unsafe { libc::getppid() } as u32 != control {
        return Err(std::io::Error::from_raw_os_error(libc::ESRCH));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_parent_death_signal(_control: u32) -> std::io::Result<()> {
    Ok(())
}

impl Link for ProcessLink {
    fn request(&mut self, req: Request) -> Result<(), SyncError> {
        kill(self.pid(), self.set.request(req)).map_err(SyncError::Signal)
    }

    fn wait_ack(&mut self) -> Result<(), SyncError> {
        let ack = self.set.ack as c_int;
        loop {
            if let Some(status) = self.exited() {
                return Err(SyncError::TargetExited(status));
            }
            // SIGCHLD wakes us up to check the target again.
            let mut acked = false;
            for sig in self.signals.wait() {
                acked |= sig == ack;
            }
            if acked {
                return Ok(());
            }
        }
    }
}

impl Drop for ProcessLink {
    fn drop(&mut self) {
        self.kill();
    }
}

impl RunControl<ProcessLink> {
    /// Spawns the target and waits until it reports ready.
    pub fn spawn(cmd: Command, set: SignalSet) -> Result<Self, SyncError> {
        let link = ProcessLink::spawn(cmd, set)?;
        Self::start(link)
    }
}

/// Target side, living in the spawned process.
pub struct ProcessEndpoint {
    control: Pid,
    signals: Signals,
    set: SignalSet,
    pending: VecDeque<Request>,
}

impl ProcessEndpoint {
    pub fn new(control: Pid, set: SignalSet) -> Result<Self, SyncError> {
        let signals = Signals::new(&[set.reset as c_int, set.run as c_int])
            .map_err(SyncError::HandlerInstall)?;
        Ok(Self {
            control,
            signals,
            set,
            pending: VecDeque::new(),
        })
    }

    /// Endpoint towards the process named by [`CONTROL_PID_ENV`].
    pub fn from_env(set: SignalSet) -> Result<Self, SyncError> {
        let control = std::env::var(CONTROL_PID_ENV)
            .ok()
            .and_then(|pid| pid.trim().parse::<i32>().ok())
            .ok_or(SyncError::Disconnected)?;
        Self::new(Pid::from_raw(control), set)
    }

    pub fn control(&self) -> Pid {
        self.control
    }
}

impl Endpoint for ProcessEndpoint {
    fn next_request(&mut self) -> Result<Request, SyncError> {
        let (reset, run) = (self.set.reset as c_int, self.set.run as c_int);
        while self.pending.is_empty() {
            for sig in self.signals.wait() {
                if sig == reset {
                    self.pending.push_back(Request::Reset);
                } else if sig == run {
                    self.pending.push_back(Request::Run);
                }
            }
        }
        self.pending.pop_front().ok_or(SyncError::Disconnected)
    }

    fn ack(&mut self) -> Result<(), SyncError> {
        kill(self.control, self.set.ack).map_err(SyncError::Signal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    // Signal handlers are process wide, so everything touching them runs in
    // this one test.
    #[test]
    fn signal_rendezvous() {
        // Target answering every request with SIGUSR2 after one readiness ack.
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(
            "trap 'kill -USR2 $PPID' USR1 USR2; kill -USR2 $PPID; while :; do sleep 0.05; done",
        );
        let mut ctl = RunControl::spawn(cmd, SignalSet::default()).unwrap();
        for _ in 0..3 {
            ctl.reset().unwrap();
            ctl.run().unwrap();
        }
        assert_eq!(ctl.runs(), 3);

        // A dead target turns the next wait into an error instead of a hang.
        let pid = ctl.link().pid();
        kill(pid, Signal::SIGKILL).unwrap();
        assert!(matches!(ctl.run(), Err(SyncError::TargetExited(_))));
        drop(ctl);

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("exit 3");
        assert!(matches!(
            RunControl::spawn(cmd, SignalSet::default()),
            Err(SyncError::TargetExited(_))
        ));

        assert!(matches!(
            ProcessLink::spawn(Command::new("/nonexistent/target"), SignalSet::default()),
            Err(SyncError::Spawn(_))
        ));

        // Target side, talking to ourselves with a distinct ack signal.
        let set = SignalSet {
            reset: Signal::SIGUSR2,
            run: Signal::SIGUSR1,
            ack: Signal::SIGURG,
        };
        let mut acks = Signals::new(&[Signal::SIGURG as c_int]).unwrap();
        let me = Pid::this();
        let mut ep = ProcessEndpoint::new(me, set).unwrap();
        kill(me, Signal::SIGUSR2).unwrap();
        assert_eq!(ep.next_request().unwrap(), Request::Reset);
        kill(me, Signal::SIGUSR1).unwrap();
        assert_eq!(ep.next_request().unwrap(), Request::Run);
        ep.ack().unwrap();
        std::thread::sleep(Duration::from_millis(10));
        assert!(acks.wait().any(|sig| sig == Signal::SIGURG as c_int));
    }
}
