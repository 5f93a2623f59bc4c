use crate::{coverage::DEFAULT_MAP_SIZE, forkserver::FORKSRV_FD, transport::DebugFlags};
use anyhow::Context;
use std::{
    fs::canonicalize,
    os::unix::io::RawFd,
    path::PathBuf,
    time::Duration,
};

/// Default largest fuzzer input.
pub const DEFAULT_MAX_INPUT: usize = 1 << 20;

#[derive(Debug, Clone)]
pub struct Config {
    /// Target executable, spawned once and reset between runs.
    pub target: PathBuf,
    pub target_args: Vec<String>,
    /// Working directory of the target, also receives the info file.
    pub project: PathBuf,
    /// Input used when the engine does not deliver through shared memory.
    pub input: Option<PathBuf>,
    pub map_size: usize,
    pub max_input: usize,
    /// Payload capacity of the data channel.
    pub dio_size: usize,
    /// Kill and report a crash if a run takes longer.
    pub timeout: Option<Duration>,
    /// Engine to adapter descriptor, the adapter answers on the next one.
    pub ctl_fd: RawFd,
    /// Bound on pipe retransmissions inside the target, unbounded if unset.
    pub pipe_retries: Option<u64>,
    /// Pipe debug mask handed to the target.
    pub pipe_debug: DebugFlags,
    /// Attempts at bringing a lost target back.
    pub respawn: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target: PathBuf::new(),
            target_args: Vec::new(),
            project: PathBuf::from("."),
            input: None,
            map_size: DEFAULT_MAP_SIZE,
            max_input: DEFAULT_MAX_INPUT,
            dio_size: DEFAULT_MAX_INPUT,
            timeout: None,
            ctl_fd: FORKSRV_FD,
            pipe_retries: None,
            pipe_debug: 0,
            respawn: 3,
        }
    }
}

impl Config {
    pub fn check(&self) -> anyhow::Result<()> {
        if !self.target.is_file() {
            anyhow::bail!("bad target: {}", self.target.display());
        }
        if !self.project.is_dir() {
            anyhow::bail!("bad project dir: {}", self.project.display());
        }
        if let Some(i) = self.input.as_ref() {
            if !i.is_file() {
                anyhow::bail!("bad input file: {}", i.display());
            }
        }
        if self.map_size == 0 || !self.map_size.is_power_of_two() {
            anyhow::bail!("map size must be a power of two: {}", self.map_size);
        }
        if self.max_input == 0 {
            anyhow::bail!("max input size must be non-zero");
        }
        if self.dio_size < self.max_input {
            anyhow::bail!(
                "data channel ({}) smaller than max input ({})",
                self.dio_size,
                self.max_input
            );
        }
        if self.timeout == Some(Duration::from_secs(0)) {
            anyhow::bail!("timeout must be non-zero");
        }
        if self.ctl_fd < 0 {
            anyhow::bail!("bad control descriptor: {}", self.ctl_fd);
        }
        Ok(())
    }

    pub fn fixup(&mut self) -> anyhow::Result<()> {
        self.target = canonicalize(&self.target)
            .with_context(|| format!("failed to resolve {}", self.target.display()))?;
        self.project = canonicalize(&self.project)
            .with_context(|| format!("failed to resolve {}", self.project.display()))?;
        if let Some(input) = self.input.as_mut() {
            let resolved = canonicalize(&input)
                .with_context(|| format!("failed to resolve {}", input.display()))?;
            *input = resolved;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Config {
        Config {
            target: PathBuf::from("/bin/sh"),
            project: std::env::temp_dir(),
            ..Config::default()
        }
    }

    #[test]
    fn defaults() {
        let c = Config::default();
        assert_eq!(c.map_size, 65536);
        assert_eq!(c.ctl_fd, 198);
        assert!(c.pipe_retries.is_none());
        assert!(valid().check().is_ok());
    }

    #[test]
    fn rejects_bad_values() {
        let mut c = valid();
        c.map_size = 1000;
        assert!(c.check().is_err());

        let mut c = valid();
        c.dio_size = c.max_input - 1;
        assert!(c.check().is_err());

        let mut c = valid();
        c.timeout = Some(Duration::from_secs(0));
        assert!(c.check().is_err());

        let mut c = valid();
        c.target = PathBuf::from("/nonexistent/target");
        assert!(c.check().is_err());

        let mut c = valid();
        c.input = Some(PathBuf::from("/nonexistent/input"));
        assert!(c.check().is_err());
    }

    #[test]
    fn fixup_resolves_paths() {
        let mut c = valid();
        c.project = PathBuf::from(".");
        c.fixup().unwrap();
        assert!(c.project.is_absolute());
        assert!(c.target.is_absolute());
    }
}
