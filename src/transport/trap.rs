//! Boundary-crossing trap.
//!
//! Sending a buffer means executing an instruction the simulator intercepts.
//! The sender is suspended until the receiver handled the buffer, so from the
//! sender's point of view a trap is a synchronous call that may rewrite the
//! whole buffer in place.

use std::sync::{Arc, Mutex};

/// Default magic instruction number the simulator agent listens on.
pub const MAGIC_PIPE_HAP: u16 = 12;

/// Something that hands a buffer (header included) to the other side of the
/// snapshot boundary and returns once the other side is done with it.
pub trait MagicTrap {
    fn trigger(&mut self, buf: &mut [u8]);
}

impl<T: MagicTrap + ?Sized> MagicTrap for &mut T {
    fn trigger(&mut self, buf: &mut [u8]) {
        (**self).trigger(buf)
    }
}

impl<T: MagicTrap + ?Sized> MagicTrap for Box<T> {
    fn trigger(&mut self, buf: &mut [u8]) {
        (**self).trigger(buf)
    }
}

/// Shared receiver, e.g. an agent also inspected by the control thread.
impl<T: MagicTrap> MagicTrap for Arc<Mutex<T>> {
    fn trigger(&mut self, buf: &mut [u8]) {
        let mut inner = match self.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.trigger(buf)
    }
}

/// The `cpuid` based magic instruction understood by x86 simulators.
///
/// Only meaningful inside a simulated target: on real hardware `cpuid` with an
/// unknown leaf is a harmless no-op and the buffer comes back unchanged.
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
#[derive(Debug, Clone, Copy)]
pub struct CpuidTrap {
    hap: u16,
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
impl CpuidTrap {
    pub fn new(hap: u16) -> Self {
        Self { hap }
    }
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
impl Default for CpuidTrap {
    fn default() -> Self {
        Self::new(MAGIC_PIPE_HAP)
    }
}

#[cfg(target_arch = "x86_64")]
impl MagicTrap for CpuidTrap {
    fn trigger(&mut self, buf: &mut [u8]) {
        use std::arch::asm;

        let leaf = 0x4711u32 | ((self.hap as u32) << 16);
        // rbx is reserved by the compiler, swap the pointer through it.
        unsafe {
            asm!(
                "xchg {ptr}, rbx",
                "cpuid",
                "xchg {ptr}, rbx",
                ptr = inout(reg) buf.as_mut_ptr() => _,
                inout("eax") leaf => _,
                out("ecx") _,
                out("edx") _,
            );
        }
    }
}

#[cfg(target_arch = "x86")]
impl MagicTrap for CpuidTrap {
    fn trigger(&mut self, buf: &mut [u8]) {
        use std::arch::asm;

        let leaf = 0x4711u32 | ((self.hap as u32) << 16);
        unsafe {
            asm!(
                "xchg {ptr}, ebx",
                "cpuid",
                "xchg {ptr}, ebx",
                ptr = inout(reg) buf.as_mut_ptr() => _,
                inout("eax") leaf => _,
                out("ecx") _,
                out("edx") _,
            );
        }
    }
}
