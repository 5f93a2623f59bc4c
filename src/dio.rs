//! Data I/O channel between the control process and the target.
//!
//! One record lives in a shared region:
//!
//! ```text
//! offset 0  kind: u32 LE
//! offset 4  len:  u32 LE
//! offset 8  payload
//! ```
//!
//! Only one side touches the region at a time: the control process before a
//! run and after its acknowledgement, the target while running.

use crate::shm::{ShmError, ShmRegion};
use bytes::{Buf, BufMut};
use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Mutex,
};
use thiserror::Error;

pub const RECORD_HEADER_SIZE: usize = 8;
/// Written to the project directory for the target to find the channel.
pub const INFO_FILE: &str = "_if_data_.tmp";

#[derive(Debug, Error)]
pub enum DioError {
    #[error("record of {len} bytes exceeds channel capacity {cap}")]
    TooLarge { len: usize, cap: usize },
    #[error("corrupted record: kind {kind}, len {len}")]
    Corrupted { kind: u32, len: u32 },
    #[error("shm: {0}")]
    Shm(#[from] ShmError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RecordKind {
    Empty = 0,
    /// Fuzzer input waiting for the target.
    Input = 1,
    /// Data the target sent out during the run.
    Output = 2,
    /// Message of a classified abnormal exit.
    AbnormalExit = 3,
}

impl RecordKind {
    fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Empty),
            1 => Some(Self::Input),
            2 => Some(Self::Output),
            3 => Some(Self::AbnormalExit),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub kind: RecordKind,
    pub data: Vec<u8>,
}

enum Storage {
    Shared(ShmRegion),
    Local(Mutex<Vec<u8>>),
}

pub struct DataChannel {
    storage: Storage,
}

/// Shared memory name of the channel owned by control process `pid`.
pub fn channel_name(pid: u32) -> String {
    format!("/snapfork-dio-{}", pid)
}

impl DataChannel {
    /// Creates the channel, control side. A stale region of the same name is
    /// taken over and cleared.
    pub fn create(name: &str, capacity: usize) -> Result<Self, DioError> {
        let region = ShmRegion::create(name, capacity + RECORD_HEADER_SIZE)?;
        let chan = Self {
            storage: Storage::Shared(region),
        };
        chan.clear();
        Ok(chan)
    }

    /// Opens the channel created by the control process, target side.
    pub fn open(name: &str) -> Result<Self, DioError> {
        let region = ShmRegion::attach(name)?;
        if region.len() < RECORD_HEADER_SIZE {
            return Err(DioError::TooLarge {
                len: RECORD_HEADER_SIZE,
                cap: region.len(),
            });
        }
        Ok(Self {
            storage: Storage::Shared(region),
        })
    }

    /// Process-local channel.
    pub fn local(capacity: usize) -> Self {
        Self {
            storage: Storage::Local(Mutex::new(vec![0; capacity + RECORD_HEADER_SIZE])),
        }
    }

    pub fn name(&self) -> Option<&str> {
        match &self.storage {
            Storage::Shared(r) => Some(r.id()),
            Storage::Local(_) => None,
        }
    }

    /// Largest payload a record can carry.
    pub fn capacity(&self) -> usize {
        self.with(|mem| mem.len() - RECORD_HEADER_SIZE)
    }

    fn with<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        match &self.storage {
            // SAFETY: access alternates between the two processes by the
            // run-control protocol.
            Storage::Shared(r) => f(unsafe { r.as_slice_mut() }),
            Storage::Local(m) => {
                let mut mem = match m.lock() {
                    Ok(mem) => mem,
                    Err(poisoned) => poisoned.into_inner(),
                };
                f(&mut mem[..])
            }
        }
    }

    pub fn put(&self, kind: RecordKind, data: &[u8]) -> Result<(), DioError> {
        self.with(|mem| {
            let cap = mem.len() - RECORD_HEADER_SIZE;
            if data.len() > cap {
                return Err(DioError::TooLarge {
                    len: data.len(),
                    cap,
                });
            }
            let (mut head, body) = mem.split_at_mut(RECORD_HEADER_SIZE);
            body[..data.len()].copy_from_slice(data);
            head.put_u32_le(kind as u32);
            head.put_u32_le(data.len() as u32);
            Ok(())
        })
    }

    pub fn clear(&self) {
        self.with(|mem| {
            let mut head = &mut mem[..RECORD_HEADER_SIZE];
            head.put_u32_le(RecordKind::Empty as u32);
            head.put_u32_le(0);
        })
    }

    pub fn kind(&self) -> Result<RecordKind, DioError> {
        self.with(|mem| {
            let (kind, _) = parse_header(mem)?;
            Ok(kind)
        })
    }

    pub fn get(&self) -> Result<Record, DioError> {
        self.with(|mem| {
            let (kind, len) = parse_header(mem)?;
            let data = mem[RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + len].to_vec();
            Ok(Record { kind, data })
        })
    }

    /// Copies the payload into `out` if the record is of `kind`, returns the
    /// number of bytes copied.
    pub fn copy_if(&self, kind: RecordKind, out: &mut [u8]) -> Result<Option<usize>, DioError> {
        self.with(|mem| {
            let (k, len) = parse_header(mem)?;
            if k != kind {
                return Ok(None);
            }
            let n = len.min(out.len());
            out[..n].copy_from_slice(&mem[RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + n]);
            Ok(Some(n))
        })
    }
}

/// Contents of the info file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    /// Control process.
    pub pid: u32,
    /// Data channel name.
    pub dio: String,
}

impl ChannelInfo {
    pub fn write(&self, project: &Path) -> io::Result<PathBuf> {
        let path = project.join(INFO_FILE);
        fs::write(&path, format!("if_pid:{}\nfuzzer_shm:{}\n", self.pid, self.dio))?;
        Ok(path)
    }

    pub fn read(project: &Path) -> io::Result<Self> {
        let content = fs::read_to_string(project.join(INFO_FILE))?;
        let mut pid = None;
        let mut dio = None;
        for l in content.lines().map(|l| l.trim()) {
            if let Some(v) = l.strip_prefix("if_pid:") {
                pid = v.trim().parse::<u32>().ok();
            } else if let Some(v) = l.strip_prefix("fuzzer_shm:") {
                dio = Some(v.trim().to_string());
            }
        }
        match (pid, dio) {
            (Some(pid), Some(dio)) => Ok(Self { pid, dio }),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("malformed {}", INFO_FILE),
            )),
        }
    }
}

fn parse_header(mem: &[u8]) -> Result<(RecordKind, usize), DioError> {
    let mut head = &mem[..RECORD_HEADER_SIZE];
    let raw_kind = head.get_u32_le();
    let raw_len = head.get_u32_le();
    let cap = mem.len() - RECORD_HEADER_SIZE;
    match RecordKind::from_u32(raw_kind) {
        Some(kind) if raw_len as usize <= cap => Ok((kind, raw_len as usize)),
        _ => Err(DioError::Corrupted {
            kind: raw_kind,
            len: raw_len,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_records() {
        let chan = DataChannel::local(16);
        assert_eq!(chan.capacity(), 16);
        assert_eq!(chan.kind().unwrap(), RecordKind::Empty);

        chan.put(RecordKind::Input, b"fuzz").unwrap();
        assert_eq!(
            chan.get().unwrap(),
            Record {
                kind: RecordKind::Input,
                data: b"fuzz".to_vec()
            }
        );

        let mut out = [0u8; 2];
        assert_eq!(chan.copy_if(RecordKind::Output, &mut out).unwrap(), None);
        assert_eq!(chan.copy_if(RecordKind::Input, &mut out).unwrap(), Some(2));
        assert_eq!(&out, b"fu");

        assert!(matches!(
            chan.put(RecordKind::Output, &[0; 17]),
            Err(DioError::TooLarge { len: 17, cap: 16 })
        ));
        chan.clear();
        assert_eq!(chan.get().unwrap().data, Vec::<u8>::new());
    }

    #[test]
    fn header_is_little_endian() {
        let chan = DataChannel::local(8);
        chan.put(RecordKind::AbnormalExit, b"bp").unwrap();
        let raw = chan.with(|mem| mem[..RECORD_HEADER_SIZE].to_vec());
        assert_eq!(raw, vec![3, 0, 0, 0, 2, 0, 0, 0]);
    }

    #[test]
    fn corrupted_header() {
        let chan = DataChannel::local(8);
        chan.with(|mem| mem[..4].copy_from_slice(&9u32.to_le_bytes()));
        assert!(matches!(chan.get(), Err(DioError::Corrupted { kind: 9, .. })));
        chan.with(|mem| {
            mem[..4].copy_from_slice(&2u32.to_le_bytes());
            mem[4..8].copy_from_slice(&100u32.to_le_bytes());
        });
        assert!(matches!(chan.get(), Err(DioError::Corrupted { len: 100, .. })));
    }

    #[test]
    fn info_file_round_trip() {
        let dir = std::env::temp_dir().join(format!("snapfork-info-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let info = ChannelInfo {
            pid: 1234,
            dio: channel_name(1234),
        };
        let path = info.write(&dir).unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "if_pid:1234\nfuzzer_shm:/snapfork-dio-1234\n"
        );
        assert_eq!(ChannelInfo::read(&dir).unwrap(), info);

        fs::write(&path, "if_pid:abc\n").unwrap();
        assert!(ChannelInfo::read(&dir).is_err());
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn shared_between_handles() {
        let name = format!("/snapfork-dio-test-{}", std::process::id());
        let control = DataChannel::create(&name, 64).unwrap();
        assert_eq!(control.name(), Some(name.as_str()));
        let target = DataChannel::open(&name).unwrap();
        control.put(RecordKind::Input, b"hello").unwrap();
        assert_eq!(target.get().unwrap().data, b"hello");
        target.put(RecordKind::Output, b"world").unwrap();
        assert_eq!(control.get().unwrap().kind, RecordKind::Output);
        assert_eq!(channel_name(42), "/snapfork-dio-42");
    }
}
