//! Framed buffers crossing the snapshot boundary.
//!
//! A [`Pipe`] is the sending side's connection context, a [`PipeBuffer`] is a
//! page-granular allocation prefixed with a [`PipeHeader`]. Sending a buffer
//! triggers the [`MagicTrap`]; when the trap returns the buffer holds the
//! receiver's response in place of the payload that was sent.

pub mod agent;
pub mod header;
pub mod trap;

pub use agent::{PipeAgent, PipeHandler};
pub use header::{PipeHeader, HEADER_SIZE, MAX_BUFFER_SIZE, PAGE_SIZE};
pub use trap::MagicTrap;

use header::PAGE_SHIFT;
use iota::iota;
use std::{
    alloc::{self, Layout},
    fmt, ptr,
    ptr::NonNull,
    slice,
    sync::atomic::{AtomicU64, Ordering},
};
use thiserror::Error;

/// Generic greeting magic, used until the receiver assigns a session magic.
pub const PIPE_MAGIC: u64 = 0x4242_0f8f_8ab1_4242;

/// Debug mask bits of a pipe.
pub type DebugFlags = u32;

iota! {
    pub const DEBUG_RECV: DebugFlags = 1 << (iota);  // log headers coming back from the receiver
    , DEBUG_SEND                                      // log headers before triggering
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid buffer size: {0}")]
    InvalidArgument(usize),
    #[error("out of memory allocating {0} bytes")]
    OutOfMemory(usize),
    #[error("corrupted response header: {0}")]
    Corrupted(PipeHeader),
    #[error("receiver not ready after {0} retransmissions")]
    RetryLimit(u64),
}

#[inline]
fn round_up_page(len: usize) -> usize {
    let pad = PAGE_SIZE - 1;
    (len + pad) & !pad
}

#[inline]
fn align_up(len: usize, align_bits: usize) -> Option<usize> {
    let pad = (1 << align_bits) - 1;
    len.checked_add(pad).map(|l| l & !pad)
}

static NEXT_PIPE_ID: AtomicU64 = AtomicU64::new(1);

/// Page-aligned buffer owned by whoever allocated it.
///
/// The memory is zeroed on allocation. Growing moves the buffer: pointers
/// into it are invalidated, offsets stay valid.
pub struct PipeBuffer {
    ptr: NonNull<u8>,
    size: usize,
    /// Pipe that handed the buffer out.
    pipe: u64,
}

// The buffer exclusively owns its allocation.
unsafe impl Send for PipeBuffer {}

impl PipeBuffer {
    /// Maps `len` bytes, header included, rounded up to whole pages.
    fn map(len: usize, pipe: u64) -> Result<Self, TransportError> {
        if len == 0 {
            return Err(TransportError::InvalidArgument(len));
        }
        let size = round_up_page(len);
        if size > MAX_BUFFER_SIZE {
            return Err(TransportError::InvalidArgument(len));
        }
        let layout = Self::layout(size)?;
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or(TransportError::OutOfMemory(size))?;

        let mut buf = Self { ptr, size, pipe };
        let mut head = buf.header();
        head.set_size(size);
        buf.set_header(&head);
        Ok(buf)
    }

    fn layout(size: usize) -> Result<Layout, TransportError> {
        Layout::from_size_align(size, PAGE_SIZE).map_err(|_| TransportError::InvalidArgument(size))
    }

    /// Whole buffer, header included.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.size) }
    }

    #[inline]
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size) }
    }

    pub fn header(&self) -> PipeHeader {
        // never fails, a buffer is at least one page.
        PipeHeader::read_from(self.as_bytes()).unwrap_or_default()
    }

    pub fn set_header(&mut self, head: &PipeHeader) {
        head.write_to(self.as_bytes_mut())
    }

    /// Allocated size, header included.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Payload bytes in use.
    #[inline]
    pub fn used(&self) -> usize {
        self.header().used()
    }

    /// Data area following the header.
    pub fn data(&self) -> &[u8] {
        &self.as_bytes()[HEADER_SIZE..]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.as_bytes_mut()[HEADER_SIZE..]
    }

    /// Used part of the data area.
    pub fn payload(&self) -> &[u8] {
        let used = self.used().min(self.size - HEADER_SIZE);
        &self.data()[..used]
    }

    /// Free tail of the data area.
    pub fn left(&mut self) -> &mut [u8] {
        let used = HEADER_SIZE + self.used();
        let size = self.size;
        &mut self.as_bytes_mut()[used.min(size)..]
    }

    /// Reallocates to `round_up_page(size + extra)` bytes.
    ///
    /// `align_bits` is the alignment the caller will use with
    /// [`add_used`](Self::add_used); page rounding already covers up to 12 bits.
    pub fn grow(&mut self, extra: usize, align_bits: usize) -> Result<(), TransportError> {
        debug_assert!(align_bits <= PAGE_SHIFT);
        let new_size = round_up_page(self.size + extra);
        if new_size > MAX_BUFFER_SIZE {
            return Err(TransportError::InvalidArgument(new_size));
        }
        if new_size == self.size {
            return Ok(());
        }

        let layout = Self::layout(self.size)?;
        let ptr = unsafe { alloc::realloc(self.ptr.as_ptr(), layout, new_size) };
        let ptr = NonNull::new(ptr).ok_or(TransportError::OutOfMemory(new_size))?;
        unsafe { ptr::write_bytes(ptr.as_ptr().add(self.size), 0, new_size - self.size) };
        self.ptr = ptr;
        self.size = new_size;

        let mut head = self.header();
        head.set_size(new_size);
        self.set_header(&head);
        Ok(())
    }

    /// Zeroes the payload and resets the used size; size and magic are kept.
    pub fn clear(&mut self) {
        let used = self.used();
        if used != 0 {
            self.data_mut()[..used].iter_mut().for_each(|b| *b = 0);
            let mut head = self.header();
            head.set_used(0);
            self.set_header(&head);
        }
    }

    /// Aligns the used size up to `1 << align_bits` and advances it by `len`.
    ///
    /// # Panics
    ///
    /// If the new used size plus the header would exceed the buffer size.
    pub fn add_used(&mut self, len: usize, align_bits: usize) {
        let mut head = self.header();
        let new_used = align_up(head.used(), align_bits).and_then(|u| u.checked_add(len));
        let fits = new_used
            .and_then(|u| u.checked_add(HEADER_SIZE))
            .map_or(false, |end| end <= self.size);
        assert!(
            fits,
            "pipe buffer overflow: used {} + {} bytes + header {} > size {}",
            head.used(),
            len,
            HEADER_SIZE,
            self.size
        );
        head.set_used(new_used.unwrap_or_default());
        self.set_header(&head);
    }

    /// Copies `data` to the free tail and accounts for it.
    ///
    /// # Panics
    ///
    /// Same as [`add_used`](Self::add_used).
    pub fn push(&mut self, data: &[u8], align_bits: usize) {
        let used = self.used();
        let start = align_up(used, align_bits).and_then(|u| u.checked_add(HEADER_SIZE));
        let end = start.and_then(|s| s.checked_add(data.len()));
        let (start, end) = match (start, end) {
            (Some(start), Some(end)) if end <= self.size => (start, end),
            _ => panic!(
                "pipe buffer overflow: push of {} bytes after {} used > size {}",
                data.len(),
                used,
                self.size
            ),
        };
        self.as_bytes_mut()[start..end].copy_from_slice(data);
        self.add_used(data.len(), align_bits);
    }

    /// Touches every page so the receiver never faults on them.
    fn populate(&mut self) {
        let base = self.ptr.as_ptr();
        for offset in (0..self.size).step_by(PAGE_SIZE) {
            unsafe {
                let p = base.add(offset);
                ptr::write_volatile(p, ptr::read_volatile(p));
            }
        }
    }
}

impl Drop for PipeBuffer {
    fn drop(&mut self) {
        if let Ok(layout) = Self::layout(self.size) {
            unsafe { alloc::dealloc(self.ptr.as_ptr(), layout) }
        }
    }
}

impl fmt::Debug for PipeBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeBuffer")
            .field("size", &self.size)
            .field("pipe", &self.pipe)
            .field("header", &self.header())
            .finish()
    }
}

/// Sending side of a pipe connection.
pub struct Pipe<T> {
    trap: T,
    id: u64,
    magic: u64,
    /// Trap events, retransmissions included.
    count: u64,
    /// Buffers handed out and not freed yet.
    live: usize,
    debug: DebugFlags,
    max_retries: Option<u64>,
}

impl<T: MagicTrap> Pipe<T> {
    pub fn open(magic: u64, trap: T) -> Self {
        Self {
            trap,
            id: NEXT_PIPE_ID.fetch_add(1, Ordering::Relaxed),
            magic,
            count: 0,
            live: 0,
            debug: 0,
            max_retries: None,
        }
    }

    /// Current magic, rotated by the receiver on each round trip.
    pub fn magic(&self) -> u64 {
        self.magic
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn live_buffers(&self) -> usize {
        self.live
    }

    pub fn set_debug(&mut self, mask: DebugFlags) {
        self.debug = mask;
    }

    /// Gives up after `max` retransmissions; unbounded by default.
    pub fn set_max_retries(&mut self, max: Option<u64>) {
        self.max_retries = max;
    }

    pub fn trap(&self) -> &T {
        &self.trap
    }

    pub fn trap_mut(&mut self) -> &mut T {
        &mut self.trap
    }

    /// Allocates a zeroed buffer with room for at least `size` payload bytes.
    pub fn alloc(&mut self, size: usize) -> Result<PipeBuffer, TransportError> {
        if size > MAX_BUFFER_SIZE - HEADER_SIZE {
            return Err(TransportError::InvalidArgument(size));
        }
        let buf = PipeBuffer::map(size + HEADER_SIZE, self.id)?;
        self.live += 1;
        Ok(buf)
    }

    /// Releases a buffer, whether it was ever sent or not. A buffer of
    /// another pipe is released without touching this pipe's accounting.
    pub fn free(&mut self, buf: PipeBuffer) {
        if buf.pipe == self.id {
            self.live = self.live.saturating_sub(1);
        } else {
            log::warn!("pipe {} freeing a buffer of pipe {}", self.id, buf.pipe);
        }
        drop(buf);
    }

    /// Sends `buf` and waits for the receiver's response, which replaces the
    /// payload in place.
    ///
    /// While the receiver reports it was not ready (retry bit set), the
    /// used size of the request is restored and the buffer retransmitted.
    pub fn send(&mut self, buf: &mut PipeBuffer) -> Result<(), TransportError> {
        let mut head = buf.header();
        let used = head.used();
        assert!(
            used + HEADER_SIZE <= buf.size(),
            "pipe buffer overflow on send: used {} + header {} > size {}",
            used,
            HEADER_SIZE,
            buf.size()
        );
        head.set_magic(self.magic);
        head.set_retry(false);
        head.set_csum();
        buf.set_header(&head);
        self.count += 1;
        if self.debug & DEBUG_SEND != 0 {
            self.log_header("out", buf);
        }

        self.trap.trigger(buf.as_bytes_mut());
        let mut retries = 0;
        loop {
            let mut head = buf.header();
            if !head.retry() {
                break;
            }
            if let Some(max) = self.max_retries {
                if retries >= max {
                    // hand the request back as the caller built it
                    head.set_retry(false);
                    head.set_used(used);
                    head.set_csum();
                    buf.set_header(&head);
                    return Err(TransportError::RetryLimit(retries));
                }
            }
            retries += 1;
            self.count += 1;
            log::debug!("pipe buffer retransmission for hap {}", self.count);

            head.set_retry(false);
            head.set_used(used);
            head.set_csum();
            buf.set_header(&head);
            buf.populate();
            self.trap.trigger(buf.as_bytes_mut());
        }

        let head = buf.header();
        if !head.is_valid() || head.size() != buf.size() {
            return Err(TransportError::Corrupted(head));
        }
        self.magic = head.magic();
        if self.debug & DEBUG_RECV != 0 {
            self.log_header("in", buf);
        }
        Ok(())
    }

    fn log_header(&self, dir: &str, buf: &PipeBuffer) {
        let head = buf.header();
        let free = head.size().saturating_sub(head.used() + HEADER_SIZE);
        log::debug!(
            "{} head: {} (size={} KiB free={})",
            dir,
            head,
            head.size() >> 10,
            free
        );
    }
}
