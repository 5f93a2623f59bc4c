//! Control-side handle on the target: spawning, one reset/run cycle per
//! iteration, and bringing the target back once it is lost.

use crate::{
    config::Config,
    dio::{DataChannel, RecordKind},
    forkserver::Outcome,
    sync::{
        process::{ProcessLink, SignalSet},
        watchdog::Watchdog,
        RunControl, SyncError,
    },
    target::TargetEnv,
    util::retry,
};
use anyhow::Context;
use nix::sys::signal::Signal;
use std::{
    process::{Command, Stdio},
    time::Duration,
};

const RESPAWN_DELAY: Duration = Duration::from_millis(100);

/// Runs inputs against a target on behalf of the iteration loop.
pub trait Runner {
    /// One reset/run cycle on `input`. A failing target is an outcome, an
    /// error means the cycle could not be judged at all.
    fn execute(&mut self, input: &[u8]) -> anyhow::Result<Outcome>;

    /// Brings a target lost in the last cycle back before the next one.
    fn ensure_target(&mut self) -> anyhow::Result<()>;
}

pub struct Session {
    config: Config,
    env: TargetEnv,
    dio: DataChannel,
    ctl: RunControl<ProcessLink>,
    watchdog: Option<Watchdog>,
    /// Run control failed in the last cycle.
    lost: bool,
    respawns: u64,
}

impl Session {
    /// Spawns the target and waits until it reports ready.
    pub fn spawn(config: &Config, env: TargetEnv, dio: DataChannel) -> anyhow::Result<Self> {
        let ctl = retry(config.respawn, RESPAWN_DELAY, || spawn_target(config, &env))
            .with_context(|| format!("failed to spawn target {}", config.target.display()))?;
        Ok(Self {
            config: config.clone(),
            env,
            dio,
            ctl,
            watchdog: config.timeout.map(Watchdog::new),
            lost: false,
            respawns: 0,
        })
    }

    pub fn dio(&self) -> &DataChannel {
        &self.dio
    }

    pub fn respawns(&self) -> u64 {
        self.respawns
    }

    pub fn runs(&self) -> u64 {
        self.ctl.runs()
    }

    fn run_guarded(&mut self) -> (Result<(), SyncError>, bool) {
        match self.watchdog.as_ref() {
            Some(w) => {
                let armed = w.arm(self.ctl.link().pid());
                let ret = self.ctl.run();
                (ret, armed.disarm())
            }
            None => (self.ctl.run(), false),
        }
    }

    fn respawn(&mut self) -> anyhow::Result<()> {
        let config = &self.config;
        let env = &self.env;
        self.ctl = retry(config.respawn, RESPAWN_DELAY, || spawn_target(config, env))
            .context("failed to respawn target")?;
        self.lost = false;
        self.respawns += 1;
        self.dio.clear();
        log::info!(
            "target respawned, pid {} ({} respawns)",
            self.ctl.link().pid(),
            self.respawns
        );
        Ok(())
    }
}

impl Runner for Session {
    /// Hands `input` to the target, resets and runs it once.
    fn execute(&mut self, input: &[u8]) -> anyhow::Result<Outcome> {
        self.dio
            .put(RecordKind::Input, input)
            .context("failed to pass input to target")?;
        let (ret, timed_out) = match self.ctl.reset() {
            Ok(()) => self.run_guarded(),
            Err(e) => (Err(e), false),
        };
        self.lost = ret.is_err() || timed_out;
        classify(ret, timed_out, &self.dio).context("run control failed")
    }

    fn ensure_target(&mut self) -> anyhow::Result<()> {
        if let Some(status) = self.ctl.link_mut().exited() {
            log::warn!("target lost ({}), respawning", status);
        } else if self.lost {
            log::warn!("target unresponsive, respawning");
        } else {
            return Ok(());
        }
        self.respawn()
    }
}

fn spawn_target(config: &Config, env: &TargetEnv) -> Result<RunControl<ProcessLink>, SyncError> {
    let mut cmd = Command::new(&config.target);
    cmd.args(&config.target_args)
        .current_dir(&config.project)
        .stdin(Stdio::null());
    env.export(&mut cmd);
    RunControl::spawn(cmd, SignalSet::default())
}

/// Maps the result of a reset/run cycle to what the engine is told.
///
/// A timeout, a target that died mid-cycle or one that could not be
/// signalled is a crash of unknown class, reported as SIGKILL. An abnormal
/// exit recorded by the target is reported as SIGABRT.
pub fn classify(
    ret: Result<(), SyncError>,
    timed_out: bool,
    dio: &DataChannel,
) -> Result<Outcome, SyncError> {
    if timed_out {
        return Ok(Outcome::Crash(Signal::SIGKILL));
    }
    match ret {
        Ok(()) => match dio.kind() {
            Ok(RecordKind::AbnormalExit) => {
                if let Ok(rec) = dio.get() {
                    log::info!("abnormal exit: {}", String::from_utf8_lossy(&rec.data));
                }
                Ok(Outcome::Crash(Signal::SIGABRT))
            }
            Ok(_) => Ok(Outcome::Normal),
            Err(e) => {
                log::warn!("data channel unreadable after run: {}", e);
                Ok(Outcome::Crash(Signal::SIGKILL))
            }
        },
        Err(SyncError::TargetExited(status)) => {
            log::info!("target died: {}", status);
            Ok(Outcome::Crash(Signal::SIGKILL))
        }
        Err(SyncError::Signal(e)) => {
            log::info!("target unreachable: {}", e);
            Ok(Outcome::Crash(Signal::SIGKILL))
        }
        Err(e) => Err(e),
    }
}
