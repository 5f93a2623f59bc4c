//! Shared memory regions.
//!
//! The fuzzing engine hands out SysV segments by numeric id, the data channel
//! uses named POSIX segments. Both end up as a plain byte region.

use shared_memory::{Shmem, ShmemConf, ShmemError};
use std::{ptr, slice, sync::atomic::AtomicU8};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShmError {
    #[error("invalid shm id: '{0}'")]
    InvalidId(String),
    #[error("failed to attach shm '{id}': {source}")]
    Attach {
        id: String,
        source: std::io::Error,
    },
    #[error("failed to create shm '{id}': {source}")]
    Create { id: String, source: ShmemError },
    #[error("shm '{id}' too small: {len} < {expected}")]
    TooSmall {
        id: String,
        len: usize,
        expected: usize,
    },
}

enum Backing {
    SysV(*mut u8),
    Posix(Shmem),
}

pub struct ShmRegion {
    id: String,
    backing: Backing,
    len: usize,
}

// The region is plain memory, synchronisation is up to the users.
unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

impl ShmRegion {
    /// Attaches to an existing segment: a numeric id is a SysV segment,
    /// anything else a POSIX name.
    pub fn attach(id: &str) -> Result<Self, ShmError> {
        let id = id.trim();
        if id.is_empty() {
            return Err(ShmError::InvalidId(id.to_string()));
        }
        match id.parse::<libc::c_int>() {
            Ok(shm_id) if shm_id >= 0 => Self::attach_sysv(id, shm_id),
            Ok(_) => Err(ShmError::InvalidId(id.to_string())),
            Err(_) => Self::open_posix(id),
        }
    }

    fn attach_sysv(id: &str, shm_id: libc::c_int) -> Result<Self, ShmError> {
        let attach_err = || ShmError::Attach {
            id: id.to_string(),
            source: std::io::Error::last_os_error(),
        };

        let mut stat: libc::shmid_ds = unsafe { std::mem::zeroed() };
        if unsafe { libc::shmctl(shm_id, libc::IPC_STAT, &mut stat) } == -1 {
            return Err(attach_err());
        }
        let addr = unsafe { libc::shmat(shm_id, ptr::null(), 0) };
        if addr as isize == -1 {
            return Err(attach_err());
        }
        log::debug!("attached sysv shm {} ({} bytes)", shm_id, stat.shm_segsz);
        Ok(Self {
            id: id.to_string(),
            backing: Backing::SysV(addr as *mut u8),
            len: stat.shm_segsz as usize,
        })
    }

    fn open_posix(id: &str) -> Result<Self, ShmError> {
        let shm = ShmemConf::new()
            .os_id(id)
            .open()
            .map_err(|e| ShmError::Attach {
                id: id.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
            })?;
        let len = shm.len();
        Ok(Self {
            id: id.to_string(),
            backing: Backing::Posix(shm),
            len,
        })
    }

    /// Creates a named POSIX segment of at least `size` bytes owned by the
    /// caller: it is unlinked when the region is dropped. A stale segment of
    /// the same name is reused.
    pub fn create(id: &str, size: usize) -> Result<Self, ShmError> {
        let mut shm = match ShmemConf::new().os_id(id).size(size).create() {
            Ok(shm) => shm,
            Err(ShmemError::MappingIdExists) => {
                log::debug!("reusing stale shm {}", id);
                ShmemConf::new()
                    .os_id(id)
                    .size(size)
                    .open()
                    .map_err(|e| ShmError::Create {
                        id: id.to_string(),
                        source: e,
                    })?
            }
            Err(e) => {
                return Err(ShmError::Create {
                    id: id.to_string(),
                    source: e,
                })
            }
        };
        shm.set_owner(true);
        let len = shm.len();
        if len < size {
            return Err(ShmError::TooSmall {
                id: id.to_string(),
                len,
                expected: size,
            });
        }
        Ok(Self {
            id: id.to_string(),
            backing: Backing::Posix(shm),
            len,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *mut u8 {
        match &self.backing {
            Backing::SysV(p) => *p,
            Backing::Posix(shm) => shm.as_ptr(),
        }
    }

    /// # Safety
    ///
    /// No other party may write the region while the slice is alive.
    pub unsafe fn as_slice(&self) -> &[u8] {
        slice::from_raw_parts(self.as_ptr(), self.len)
    }

    /// # Safety
    ///
    /// No other party may access the region while the slice is alive.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_slice_mut(&self) -> &mut [u8] {
        slice::from_raw_parts_mut(self.as_ptr(), self.len)
    }

    /// The region as relaxed atomic bytes, safe for unsynchronised writers.
    pub fn as_atomic(&self) -> &[AtomicU8] {
        unsafe { slice::from_raw_parts(self.as_ptr() as *const AtomicU8, self.len) }
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        if let Backing::SysV(addr) = self.backing {
            if unsafe { libc::shmdt(addr as *const libc::c_void) } == -1 {
                log::warn!(
                    "failed to detach shm {}: {}",
                    self.id,
                    std::io::Error::last_os_error()
                );
            }
        }
    }
}
