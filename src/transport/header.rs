//! Pipe buffer header.
//!
//! Every transport buffer starts with a 16 byte header, always page-aligned:
//!
//! ```text
//! offset 0   magic: u64   connection identifier, or the generic greeting
//! offset 8   pages: u16   additional 4 KiB pages, the first one is implied
//! offset 10  csum:  u16   fletcher16 over the header with csum zeroed
//! offset 12  used:  u32   bits 0-27 payload length, bit 31 retry, 28-30 zero
//! ```
//!
//! All fields use the byte order of the side running the target.

use std::{fmt, mem};

/// Size of the header in bytes.
pub const HEADER_SIZE: usize = 16;
/// Page granularity of buffers.
pub const PAGE_SHIFT: usize = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
/// Largest buffer the `pages` field can express: 256 MiB.
pub const MAX_BUFFER_SIZE: usize = (u16::MAX as usize + 1) << PAGE_SHIFT;

const USED_MASK: u32 = (1 << 28) - 1;
const RETRY_BIT: u32 = 1 << 31;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PipeHeader {
    magic: u64,
    pages: u16,
    csum: u16,
    used: u32,
}

const _: () = assert!(mem::size_of::<PipeHeader>() == HEADER_SIZE);

impl PipeHeader {
    pub fn from_bytes(bytes: &[u8; HEADER_SIZE]) -> Self {
        let mut magic = [0; 8];
        magic.copy_from_slice(&bytes[0..8]);
        Self {
            magic: u64::from_ne_bytes(magic),
            pages: u16::from_ne_bytes([bytes[8], bytes[9]]),
            csum: u16::from_ne_bytes([bytes[10], bytes[11]]),
            used: u32::from_ne_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0; HEADER_SIZE];
        bytes[0..8].copy_from_slice(&self.magic.to_ne_bytes());
        bytes[8..10].copy_from_slice(&self.pages.to_ne_bytes());
        bytes[10..12].copy_from_slice(&self.csum.to_ne_bytes());
        bytes[12..16].copy_from_slice(&self.used.to_ne_bytes());
        bytes
    }

    /// Reads a header from the start of `buf`, `None` if `buf` is shorter than a header.
    pub fn read_from(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        let mut bytes = [0; HEADER_SIZE];
        bytes.copy_from_slice(&buf[..HEADER_SIZE]);
        Some(Self::from_bytes(&bytes))
    }

    pub fn write_to(&self, buf: &mut [u8]) {
        buf[..HEADER_SIZE].copy_from_slice(&self.to_bytes());
    }

    #[inline]
    pub fn magic(&self) -> u64 {
        self.magic
    }

    #[inline]
    pub fn set_magic(&mut self, magic: u64) {
        self.magic = magic;
    }

    /// Total buffer size in bytes, header included.
    #[inline]
    pub fn size(&self) -> usize {
        (self.pages as usize + 1) << PAGE_SHIFT
    }

    /// `size` must be a non-zero multiple of the page size, at most `MAX_BUFFER_SIZE`.
    #[inline]
    pub fn set_size(&mut self, size: usize) {
        debug_assert!(size >= PAGE_SIZE && size <= MAX_BUFFER_SIZE);
        self.pages = ((size >> PAGE_SHIFT) - 1) as u16;
    }

    #[inline]
    pub fn pages(&self) -> u16 {
        self.pages
    }

    /// Payload length, header excluded.
    #[inline]
    pub fn used(&self) -> usize {
        (self.used & USED_MASK) as usize
    }

    /// Sets the payload length, retry and reserved bits are left untouched.
    #[inline]
    pub fn set_used(&mut self, used: usize) {
        self.used = (used as u32 & USED_MASK) | (self.used & !USED_MASK);
    }

    #[inline]
    pub fn retry(&self) -> bool {
        self.used & RETRY_BIT != 0
    }

    #[inline]
    pub fn set_retry(&mut self, retry: bool) {
        if retry {
            self.used |= RETRY_BIT;
        } else {
            self.used &= !RETRY_BIT;
        }
    }

    #[inline]
    pub fn csum(&self) -> u16 {
        self.csum
    }

    pub fn set_csum(&mut self) {
        self.csum = self.calc_csum();
    }

    pub fn csum_ok(&self) -> bool {
        self.csum == self.calc_csum()
    }

    pub fn size_ok(&self) -> bool {
        HEADER_SIZE + self.used() <= self.size()
    }

    /// A header is only trusted if both the checksum and the used size hold up.
    pub fn is_valid(&self) -> bool {
        self.csum_ok() && self.size_ok()
    }

    fn calc_csum(&self) -> u16 {
        let mut hd = *self;
        hd.csum = 0;
        fletcher16(&hd.to_bytes())
    }
}

impl fmt::Display for PipeHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "magic={:#018x} used={:<9} pages={:<5} csum={:#06x}",
            self.magic, self.used, self.pages, self.csum
        )
    }
}

/// Fletcher-16 variant used by the pipe header.
///
/// Each byte contributes `1 + byte`, so runs of zeroes still move the sums.
/// The accumulators are not reduced while summing, which limits the input to a
/// few KiB; plenty for a header.
pub fn fletcher16(data: &[u8]) -> u16 {
    let mut acu1: u32 = 0xff;
    let mut acu2: u32 = 0xff;

    for &b in data {
        acu1 = acu1.wrapping_add(1 + b as u32);
        acu2 = acu2.wrapping_add(acu1);
    }
    ((fold8(acu2) as u16) << 8) | fold8(acu1) as u16
}

#[inline]
fn fold8(acu: u32) -> u8 {
    acu.wrapping_add(acu >> 8)
        .wrapping_add(acu >> 16)
        .wrapping_add(acu >> 24) as u8
}
