//! Snapshot fuzzing glue
//!
//! Lets a forkserver-speaking fuzzing engine drive a target that is rolled
//! back to a snapshot instead of forked for every run.

pub mod config;
pub mod coverage;
pub mod dio;
pub mod forkserver;
pub mod session;
pub mod shm;
pub mod sync;
pub mod target;
pub mod transport;
pub mod util;

use crate::{
    config::Config,
    dio::{channel_name, ChannelInfo, DataChannel, RecordKind},
    forkserver::{Capabilities, Forkserver, ForkserverError, Iteration, Outcome, ShmIds},
    session::{Runner, Session},
    target::TargetEnv,
    util::{setup_signal_handler, stop_soon},
};
use anyhow::Context;
use nix::sys::signal::Signal;
use std::{
    fs::remove_file,
    io::{Read, Write},
    path::Path,
};

pub fn boot(mut config: Config) -> anyhow::Result<()> {
    config.check().context("config error")?;
    config.fixup()?;
    setup_signal_handler().context("failed to setup signal handler")?;

    let mut forkserver = Forkserver::with_fd(
        config.ctl_fd,
        ShmIds::from_env(),
        config.map_size,
        config.max_input,
    )
    .context("failed to open forkserver descriptors")?;
    let caps = forkserver.init().context("failed to init forkserver")?;

    let pid = std::process::id();
    let dio_name = channel_name(pid);
    let dio = DataChannel::create(&dio_name, config.dio_size)
        .with_context(|| format!("failed to create data channel {}", dio_name))?;
    let info = ChannelInfo {
        pid,
        dio: dio_name.clone(),
    }
    .write(&config.project)
    .context("failed to write target info file")?;

    let env = target_env(&config, dio_name);
    log::info!("spawning target {}...", config.target.display());
    let ret = Session::spawn(&config, env, dio).and_then(|mut session| {
        log::info!("ok, target ready");
        match caps {
            Capabilities::Attached { active: true, .. } => {
                fuzz_loop(config.input.as_deref(), &mut forkserver, &mut session)?;
                log::info!(
                    "All done, iterations: {}, target respawns: {}",
                    forkserver.iterations(),
                    session.respawns()
                );
                Ok(())
            }
            _ => standalone(&config, &forkserver, &mut session),
        }
    });

    if let Err(e) = remove_file(&info) {
        log::debug!("failed to remove {}: {}", info.display(), e);
    }
    ret
}

/// What the spawned target is told through its environment.
fn target_env(config: &Config, dio_name: String) -> TargetEnv {
    TargetEnv {
        dio: Some(dio_name),
        pipe_retries: config.pipe_retries,
        pipe_debug: config.pipe_debug,
    }
}

/// Serves engine iterations until the engine goes away or a stop is
/// requested. Every iteration taken from the engine gets a status word, even
/// the one that ends the loop with an error.
fn fuzz_loop<R: Read, W: Write>(
    fallback: Option<&Path>,
    forkserver: &mut Forkserver<R, W>,
    runner: &mut impl Runner,
) -> anyhow::Result<()> {
    let mut buf = Vec::new();
    while !stop_soon() {
        let token = match forkserver.wait_for_iteration() {
            Iteration::Token(t) => t,
            Iteration::Disconnected => break,
        };
        let ret = match forkserver.fetch_input(fallback, &mut buf) {
            Ok(input) => runner.execute(input),
            Err(e @ ForkserverError::InputTooLarge { .. })
            | Err(e @ ForkserverError::InputTruncated { .. }) => {
                log::warn!("input dropped: {}", e);
                Ok(Outcome::Normal)
            }
            Err(e) => Err(anyhow::Error::new(e).context("failed to fetch input")),
        };
        let (outcome, err) = match ret {
            Ok(outcome) => (outcome, None),
            Err(e) => (Outcome::Crash(Signal::SIGKILL), Some(e)),
        };
        forkserver.report(token, outcome);
        if let Some(e) = err {
            return Err(e);
        }
        runner.ensure_target()?;
    }
    Ok(())
}

/// Not under a fuzzer: one run on the fallback input.
fn standalone<R: Read, W: Write>(
    config: &Config,
    forkserver: &Forkserver<R, W>,
    session: &mut Session,
) -> anyhow::Result<()> {
    let mut buf = Vec::new();
    let input = forkserver
        .fetch_input(config.input.as_deref(), &mut buf)
        .context("failed to load input")?;
    log::info!("standalone run, {} bytes of input", input.len());
    let outcome = session.execute(input)?;
    if let Ok(rec) = session.dio().get() {
        if rec.kind == RecordKind::Output {
            log::info!("target output: {:?}", String::from_utf8_lossy(&rec.data));
        }
    }
    println!("outcome: {:?} (status {})", outcome, outcome.status());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::tests::SysVSegment;
    use bytes::Buf;
    use std::{collections::VecDeque, io::Cursor};

    const MAP_SIZE: usize = 1 << 16;

    /// Replays scripted results, one per call.
    #[derive(Default)]
    struct Scripted {
        runs: VecDeque<anyhow::Result<Outcome>>,
        checks: VecDeque<anyhow::Result<()>>,
        inputs: Vec<Vec<u8>>,
    }

    impl Runner for Scripted {
        fn execute(&mut self, input: &[u8]) -> anyhow::Result<Outcome> {
            self.inputs.push(input.to_vec());
            self.runs.pop_front().unwrap_or(Ok(Outcome::Normal))
        }

        fn ensure_target(&mut self) -> anyhow::Result<()> {
            self.checks.pop_front().unwrap_or(Ok(()))
        }
    }

    /// Runs the loop over `rounds` go words and returns the words written
    /// after the status word.
    fn serve(rounds: usize, runner: &mut Scripted) -> (anyhow::Result<()>, Vec<u32>) {
        let map = SysVSegment::new(MAP_SIZE);
        let ids = ShmIds {
            map: Some(map.0.to_string()),
            input: None,
        };
        let go = vec![0u8; 4 * rounds];
        let mut fs = Forkserver::new(ids, MAP_SIZE, 64, Cursor::new(go), Vec::new());
        fs.init().unwrap();
        let ret = fuzz_loop(None, &mut fs, runner);
        let (_, out) = fs.into_parts();
        let mut out = &out[4..];
        let mut words = Vec::new();
        while out.has_remaining() {
            words.push(out.get_u32_le());
        }
        (ret, words)
    }

    #[test]
    fn reports_every_iteration() {
        let pid = std::process::id();
        let mut runner = Scripted::default();
        runner.runs.push_back(Ok(Outcome::Normal));
        runner.runs.push_back(Ok(Outcome::Crash(Signal::SIGABRT)));
        let (ret, words) = serve(2, &mut runner);
        assert!(ret.is_ok());
        assert_eq!(words, vec![pid, 0, pid, Signal::SIGABRT as i32 as u32]);
        assert_eq!(runner.inputs, vec![Vec::<u8>::new(), Vec::new()]);
    }

    #[test]
    fn failed_run_is_reported_before_exit() {
        let pid = std::process::id();
        let mut runner = Scripted::default();
        runner.runs.push_back(Ok(Outcome::Normal));
        runner.runs.push_back(Err(anyhow::anyhow!("run control failed")));
        let (ret, words) = serve(3, &mut runner);
        assert!(ret.is_err());
        assert_eq!(words, vec![pid, 0, pid, Signal::SIGKILL as i32 as u32]);
    }

    #[test]
    fn failed_respawn_is_reported_before_exit() {
        let pid = std::process::id();
        let mut runner = Scripted::default();
        runner.runs.push_back(Ok(Outcome::Crash(Signal::SIGKILL)));
        runner.checks.push_back(Err(anyhow::anyhow!("failed to respawn target")));
        let (ret, words) = serve(2, &mut runner);
        assert!(ret.is_err());
        assert_eq!(words, vec![pid, Signal::SIGKILL as i32 as u32]);
        assert_eq!(runner.inputs.len(), 1);
    }

    #[test]
    fn pipe_debug_reaches_target_env() {
        let config = Config {
            pipe_debug: 3,
            pipe_retries: Some(5),
            ..Config::default()
        };
        let env = target_env(&config, "/snapfork-dio-1".to_string());
        assert_eq!(env.pipe_debug, 3);
        assert_eq!(env.pipe_retries, Some(5));
        assert_eq!(env.dio.as_deref(), Some("/snapfork-dio-1"));
    }
}
