//! Forkserver protocol adapter.
//!
//! Makes the control process look like a fork-per-run target to the fuzzing
//! engine: a status word at startup, then per iteration a 4 byte "go" from
//! the engine, a fake child pid back, and finally the child's exit status.
//! Every word on the control descriptors is a raw little-endian `u32`.
//!
//! A short read or write on the descriptors means the engine is gone: the
//! adapter deactivates itself and never escalates that to an error.

use crate::{
    coverage::{CoverageMap, MapSizeError},
    shm::{ShmError, ShmRegion},
};
use bytes::Buf;
use nix::sys::signal::Signal;
use std::{
    fs::File,
    io::{self, Read, Write},
    os::unix::io::{FromRawFd, RawFd},
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use thiserror::Error;

/// Engine to adapter descriptor; the adapter writes to `FORKSRV_FD + 1`.
pub const FORKSRV_FD: RawFd = 198;
/// Coverage map shm id.
pub const SHM_ENV_VAR: &str = "__AFL_SHM_ID";
/// Input map shm id, optional.
pub const SHM_FUZZ_ENV_VAR: &str = "__AFL_SHM_FUZZ_ID";

pub type StatusFlags = u32;

/// Input through shared memory.
pub const FS_OPT_SHDMEM_FUZZ: StatusFlags = 1 << 24;

/// Protocol active, bit 0 and bit 31.
pub const FS_OPT_ENABLED: StatusFlags = 0x8000_0001;
/// The map size field below is meaningful.
pub const FS_OPT_MAPSIZE: StatusFlags = 0x4000_0000;
pub const FS_OPT_MAX_MAPSIZE: usize = (0x00ff_fffe >> 1) + 1;

/// Map size field of the status word, 0 if `map_size` cannot be expressed.
pub fn status_map_size(map_size: usize) -> StatusFlags {
    if map_size <= 1 || map_size > FS_OPT_MAX_MAPSIZE {
        0
    } else {
        ((map_size - 1) << 1) as StatusFlags
    }
}

/// Map size advertised by a status word.
pub fn decode_map_size(status: StatusFlags) -> Option<usize> {
    if status & FS_OPT_MAPSIZE == 0 {
        return None;
    }
    Some((((status & 0x00ff_fffe) >> 1) + 1) as usize)
}

#[derive(Debug, Error)]
pub enum ForkserverError {
    #[error("shm: {0}")]
    Shm(#[from] ShmError),
    #[error("coverage map: {0}")]
    MapSize(#[from] MapSizeError),
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("input of {len} bytes exceeds limit {max}")]
    InputTooLarge { len: usize, max: usize },
    #[error("input truncated: {len} bytes announced, {avail} available")]
    InputTruncated { len: usize, avail: usize },
    #[error("control descriptors already owned by another adapter")]
    AlreadyOpen,
}

/// Set once the engine's descriptors are wrapped; they are never handed out
/// twice, even after the owning adapter is gone.
static CONTROL_FDS_CLAIMED: AtomicBool = AtomicBool::new(false);

/// Shared memory ids handed out by the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShmIds {
    pub map: Option<String>,
    pub input: Option<String>,
}

impl ShmIds {
    pub fn from_env() -> Self {
        Self {
            map: std::env::var(SHM_ENV_VAR).ok(),
            input: std::env::var(SHM_FUZZ_ENV_VAR).ok(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capabilities {
    /// No engine around, the adapter is inert.
    NotUnderFuzzer,
    Attached {
        map_size: usize,
        shm_input: bool,
        /// The status word reached the engine.
        active: bool,
    },
}

/// One iteration granted by the engine, to be reported exactly once.
#[derive(Debug)]
#[must_use]
pub struct IterationToken {
    seq: u64,
}

impl IterationToken {
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

#[derive(Debug)]
pub enum Iteration {
    Token(IterationToken),
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Normal,
    /// Reported as if the child died of this signal.
    Crash(Signal),
}

impl Outcome {
    pub fn status(&self) -> u32 {
        match self {
            Outcome::Normal => 0,
            Outcome::Crash(sig) => *sig as i32 as u32,
        }
    }
}

pub struct Forkserver<R, W> {
    ids: ShmIds,
    map_size: usize,
    max_input: usize,
    ctl_in: R,
    ctl_out: W,
    map: Option<Arc<CoverageMap>>,
    input: Option<ShmRegion>,
    active: bool,
    iterations: u64,
}

/// Control descriptor inherited from the engine, `Closed` if it was never
/// opened.
#[derive(Debug)]
pub enum ControlFd {
    Open(File),
    Closed,
}

impl ControlFd {
    pub fn inherit(fd: RawFd) -> Self {
        if unsafe { libc::fcntl(fd, libc::F_GETFD) } == -1 {
            return ControlFd::Closed;
        }
        // SAFETY: the descriptor is open and belongs to the engine for the
        // lifetime of the process.
        ControlFd::Open(unsafe { File::from_raw_fd(fd) })
    }

    fn closed() -> io::Error {
        io::Error::new(io::ErrorKind::BrokenPipe, "control descriptor not open")
    }
}

impl Read for ControlFd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            ControlFd::Open(f) => f.read(buf),
            ControlFd::Closed => Err(Self::closed()),
        }
    }
}

impl Write for ControlFd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            ControlFd::Open(f) => f.write(buf),
            ControlFd::Closed => Err(Self::closed()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            ControlFd::Open(f) => f.flush(),
            ControlFd::Closed => Ok(()),
        }
    }
}

impl Forkserver<ControlFd, ControlFd> {
    /// Adapter on the engine's descriptors, ids from the environment.
    pub fn from_env(map_size: usize, max_input: usize) -> Result<Self, ForkserverError> {
        Self::with_fd(FORKSRV_FD, ShmIds::from_env(), map_size, max_input)
    }

    /// Adapter on `fd` and `fd + 1`. The descriptors are only touched when
    /// an engine is around, and only one adapter per process may own them.
    pub fn with_fd(
        fd: RawFd,
        ids: ShmIds,
        map_size: usize,
        max_input: usize,
    ) -> Result<Self, ForkserverError> {
        let (ctl_in, ctl_out) = if ids.map.is_some() {
            if CONTROL_FDS_CLAIMED.swap(true, Ordering::SeqCst) {
                return Err(ForkserverError::AlreadyOpen);
            }
            (ControlFd::inherit(fd), ControlFd::inherit(fd + 1))
        } else {
            (ControlFd::Closed, ControlFd::Closed)
        };
        Ok(Self::new(ids, map_size, max_input, ctl_in, ctl_out))
    }
}

impl<R: Read, W: Write> Forkserver<R, W> {
    pub fn new(ids: ShmIds, map_size: usize, max_input: usize, ctl_in: R, ctl_out: W) -> Self {
        Self {
            ids,
            map_size,
            max_input,
            ctl_in,
            ctl_out,
            map: None,
            input: None,
            active: false,
            iterations: 0,
        }
    }

    /// Attaches the engine's shared memory and sends the status word.
    pub fn init(&mut self) -> Result<Capabilities, ForkserverError> {
        let map_id = match self.ids.map.as_ref() {
            Some(id) => id,
            None => {
                log::info!("{} not set, not running under a fuzzer", SHM_ENV_VAR);
                return Ok(Capabilities::NotUnderFuzzer);
            }
        };
        let region = ShmRegion::attach(map_id)?;
        self.map = Some(Arc::new(CoverageMap::with_shm(region, self.map_size)?));

        let mut status = FS_OPT_ENABLED;
        let size_field = status_map_size(self.map_size);
        if size_field != 0 {
            status |= FS_OPT_MAPSIZE | size_field;
        }
        if let Some(id) = self.ids.input.as_ref() {
            self.input = Some(ShmRegion::attach(id)?);
            status |= FS_OPT_SHDMEM_FUZZ;
        }

        self.active = write_word(&mut self.ctl_out, status).is_ok();
        if self.active {
            log::info!("forkserver up, status {:#010x}", status);
        } else {
            log::warn!("failed to send forkserver status, running without engine");
        }
        Ok(Capabilities::Attached {
            map_size: self.map_size,
            shm_input: self.input.is_some(),
            active: self.active,
        })
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    pub fn coverage(&self) -> Option<&Arc<CoverageMap>> {
        self.map.as_ref()
    }

    pub fn has_shm_input(&self) -> bool {
        self.input.is_some()
    }

    /// Blocks until the engine asks for the next run, answering with our
    /// own pid in place of a forked child's.
    pub fn wait_for_iteration(&mut self) -> Iteration {
        if !self.active {
            return Iteration::Disconnected;
        }
        if let Err(e) = read_word(&mut self.ctl_in) {
            log::info!("fuzzer disconnected: {}", e);
            self.active = false;
            return Iteration::Disconnected;
        }
        if let Err(e) = write_word(&mut self.ctl_out, std::process::id()) {
            log::info!("fuzzer disconnected: {}", e);
            self.active = false;
            return Iteration::Disconnected;
        }
        self.iterations += 1;
        Iteration::Token(IterationToken {
            seq: self.iterations,
        })
    }

    pub fn report(&mut self, token: IterationToken, outcome: Outcome) {
        if !self.active {
            return;
        }
        log::trace!("iteration {}: {:?}", token.seq, outcome);
        if let Err(e) = write_word(&mut self.ctl_out, outcome.status()) {
            log::info!("fuzzer disconnected: {}", e);
            self.active = false;
        }
    }

    /// Input of the current iteration: in place from the input map, or read
    /// from the `fallback` file into `buf`. Both carry a `u32` LE length
    /// prefix followed by the payload; anything past the payload is ignored.
    pub fn fetch_input<'a>(
        &'a self,
        fallback: Option<&Path>,
        buf: &'a mut Vec<u8>,
    ) -> Result<&'a [u8], ForkserverError> {
        if let Some(region) = self.input.as_ref() {
            // SAFETY: the engine only writes the map between iterations.
            let mem = unsafe { region.as_slice() };
            if mem.len() < 4 {
                return Err(ForkserverError::InputTruncated {
                    len: 4,
                    avail: mem.len(),
                });
            }
            let len = (&mem[..4]).get_u32_le() as usize;
            let max = self.max_input.min(mem.len() - 4);
            if len > max {
                return Err(ForkserverError::InputTooLarge { len, max });
            }
            return Ok(&mem[4..4 + len]);
        }

        buf.clear();
        let path = match fallback {
            Some(path) => path,
            None => return Ok(&buf[..]),
        };
        File::open(path)?
            .take(4 + self.max_input as u64)
            .read_to_end(buf)?;
        if buf.len() < 4 {
            return Err(ForkserverError::InputTruncated {
                len: 4,
                avail: buf.len(),
            });
        }
        let len = (&buf[..4]).get_u32_le() as usize;
        if len > self.max_input {
            return Err(ForkserverError::InputTooLarge {
                len,
                max: self.max_input,
            });
        }
        let avail = buf.len() - 4;
        if len > avail {
            return Err(ForkserverError::InputTruncated { len, avail });
        }
        Ok(&buf[4..4 + len])
    }

    pub fn into_parts(self) -> (R, W) {
        (self.ctl_in, self.ctl_out)
    }
}

fn read_word<R: Read>(r: &mut R) -> io::Result<u32> {
    let mut word = [0; 4];
    r.read_exact(&mut word)?;
    Ok((&word[..]).get_u32_le())
}

fn write_word<W: Write>(w: &mut W, word: u32) -> io::Result<()> {
    w.write_all(&word.to_le_bytes())?;
    w.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::tests::SysVSegment;
    use std::io::Cursor;

    const MAP_SIZE: usize = 1 << 16;

    fn words(bytes: &[u8]) -> Vec<u32> {
        bytes
            .chunks(4)
            .map(|mut c| c.get_u32_le())
            .collect()
    }

    fn attached(input: Option<&SysVSegment>, go: &[u8]) -> (SysVSegment, Forkserver<Cursor<Vec<u8>>, Vec<u8>>) {
        let map = SysVSegment::new(MAP_SIZE);
        let ids = ShmIds {
            map: Some(map.0.to_string()),
            input: input.map(|s| s.0.to_string()),
        };
        let fs = Forkserver::new(ids, MAP_SIZE, 1 << 20, Cursor::new(go.to_vec()), Vec::new());
        (map, fs)
    }

    #[test]
    fn handshake_status_word() {
        let (_map, mut fs) = attached(None, &[]);
        let caps = fs.init().unwrap();
        assert_eq!(
            caps,
            Capabilities::Attached {
                map_size: MAP_SIZE,
                shm_input: false,
                active: true
            }
        );
        let (_, out) = fs.into_parts();
        assert_eq!(out.len(), 4);
        let status = words(&out)[0];
        // no option bits beyond the ones the adapter implements
        assert_eq!(status, FS_OPT_ENABLED | FS_OPT_MAPSIZE | status_map_size(MAP_SIZE));
        assert_ne!(status & 1, 0);
        assert_eq!(status & FS_OPT_SHDMEM_FUZZ, 0);
        assert_eq!(decode_map_size(status), Some(MAP_SIZE));
    }

    #[test]
    fn shm_input_advertised_and_read() {
        let input = SysVSegment::new(4096);
        {
            let region = ShmRegion::attach(&input.0.to_string()).unwrap();
            let mem = unsafe { region.as_slice_mut() };
            mem[..4].copy_from_slice(&5u32.to_le_bytes());
            mem[4..9].copy_from_slice(b"hello");
        }
        let (_map, mut fs) = attached(Some(&input), &[]);
        fs.init().unwrap();
        assert!(fs.has_shm_input());
        let mut buf = Vec::new();
        assert_eq!(fs.fetch_input(None, &mut buf).unwrap(), b"hello");

        let (_, out) = fs.into_parts();
        assert_ne!(words(&out)[0] & FS_OPT_SHDMEM_FUZZ, 0);
    }

    #[test]
    fn oversized_shm_input() {
        let input = SysVSegment::new(4096);
        {
            let region = ShmRegion::attach(&input.0.to_string()).unwrap();
            let mem = unsafe { region.as_slice_mut() };
            mem[..4].copy_from_slice(&5000u32.to_le_bytes());
        }
        let (_map, mut fs) = attached(Some(&input), &[]);
        fs.init().unwrap();
        let mut buf = Vec::new();
        assert!(matches!(
            fs.fetch_input(None, &mut buf),
            Err(ForkserverError::InputTooLarge { len: 5000, .. })
        ));
    }

    #[test]
    fn iterations_and_reports() {
        let (_map, mut fs) = attached(None, &[0, 0, 0, 0, 1, 0, 0, 0, 9]);
        fs.init().unwrap();

        let token = match fs.wait_for_iteration() {
            Iteration::Token(t) => t,
            Iteration::Disconnected => panic!("disconnected"),
        };
        assert_eq!(token.seq(), 1);
        fs.report(token, Outcome::Normal);

        let token = match fs.wait_for_iteration() {
            Iteration::Token(t) => t,
            Iteration::Disconnected => panic!("disconnected"),
        };
        fs.report(token, Outcome::Crash(Signal::SIGABRT));

        // a single trailing byte is a short read
        assert!(matches!(fs.wait_for_iteration(), Iteration::Disconnected));
        assert!(!fs.is_active());
        assert!(matches!(fs.wait_for_iteration(), Iteration::Disconnected));
        assert_eq!(fs.iterations(), 2);

        let (_, out) = fs.into_parts();
        let pid = std::process::id();
        assert_eq!(&words(&out)[1..], &[pid, 0, pid, libc::SIGABRT as u32]);
    }

    /// Writer failing after `budget` bytes.
    struct Limited {
        budget: usize,
    }

    impl Write for Limited {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"));
            }
            let n = buf.len().min(self.budget);
            self.budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn short_status_write_is_inactive() {
        let map = SysVSegment::new(MAP_SIZE);
        let ids = ShmIds {
            map: Some(map.0.to_string()),
            input: None,
        };
        let mut fs = Forkserver::new(ids, MAP_SIZE, 1024, io::empty(), Limited { budget: 2 });
        assert_eq!(
            fs.init().unwrap(),
            Capabilities::Attached {
                map_size: MAP_SIZE,
                shm_input: false,
                active: false
            }
        );
        assert!(matches!(fs.wait_for_iteration(), Iteration::Disconnected));
    }

    #[test]
    fn missing_descriptors_deactivate() {
        assert!(matches!(ControlFd::inherit(-1), ControlFd::Closed));
        let map = SysVSegment::new(MAP_SIZE);
        let ids = ShmIds {
            map: Some(map.0.to_string()),
            input: None,
        };
        let mut fs = Forkserver::new(ids, MAP_SIZE, 1024, ControlFd::Closed, ControlFd::Closed);
        assert!(matches!(
            fs.init().unwrap(),
            Capabilities::Attached { active: false, .. }
        ));
        assert!(fs.coverage().is_some());
    }

    #[test]
    fn not_under_fuzzer() {
        let mut fs = Forkserver::new(ShmIds::default(), MAP_SIZE, 1024, io::empty(), Vec::new());
        assert_eq!(fs.init().unwrap(), Capabilities::NotUnderFuzzer);
        assert!(fs.coverage().is_none());
        assert!(matches!(fs.wait_for_iteration(), Iteration::Disconnected));
        let (_, out) = fs.into_parts();
        assert!(out.is_empty());
    }

    #[test]
    fn fallback_file_input() {
        let dir = std::env::temp_dir().join(format!("snapfork-fs-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("input");
        std::fs::write(&path, b"\x04\x00\x00\x00PINGtrailing").unwrap();

        let fs = Forkserver::new(ShmIds::default(), MAP_SIZE, 16, io::empty(), Vec::new());
        let mut buf = Vec::new();
        assert_eq!(fs.fetch_input(Some(path.as_path()), &mut buf).unwrap(), b"PING");
        assert_eq!(fs.fetch_input(None, &mut buf).unwrap(), b"");

        std::fs::write(&path, 17u32.to_le_bytes()).unwrap();
        assert!(matches!(
            fs.fetch_input(Some(path.as_path()), &mut buf),
            Err(ForkserverError::InputTooLarge { len: 17, max: 16 })
        ));

        std::fs::write(&path, b"\x08\x00\x00\x00abc").unwrap();
        assert!(matches!(
            fs.fetch_input(Some(path.as_path()), &mut buf),
            Err(ForkserverError::InputTruncated { len: 8, avail: 3 })
        ));
        std::fs::write(&path, b"\x01\x00").unwrap();
        assert!(matches!(
            fs.fetch_input(Some(path.as_path()), &mut buf),
            Err(ForkserverError::InputTruncated { len: 4, avail: 2 })
        ));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn single_owner_of_control_fds() {
        // without an engine the descriptors are left alone
        assert!(Forkserver::with_fd(-10, ShmIds::default(), MAP_SIZE, 16).is_ok());

        let ids = ShmIds {
            map: Some("0".to_string()),
            input: None,
        };
        let first = Forkserver::with_fd(-10, ids.clone(), MAP_SIZE, 16).unwrap();
        assert!(matches!(
            Forkserver::with_fd(-10, ids.clone(), MAP_SIZE, 16),
            Err(ForkserverError::AlreadyOpen)
        ));
        drop(first);
        assert!(matches!(
            Forkserver::with_fd(-10, ids, MAP_SIZE, 16),
            Err(ForkserverError::AlreadyOpen)
        ));
    }

    #[test]
    fn map_size_field() {
        assert_eq!(status_map_size(1), 0);
        assert_eq!(status_map_size(FS_OPT_MAX_MAPSIZE + 1), 0);
        for size in [2, 4096, MAP_SIZE, FS_OPT_MAX_MAPSIZE].iter().copied() {
            let status = FS_OPT_ENABLED | FS_OPT_MAPSIZE | status_map_size(size);
            assert_eq!(decode_map_size(status), Some(size));
        }
    }
}
