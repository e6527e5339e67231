//! Fixed-base shadow mappings: one metadata byte per `GRANULARITY` bytes of
//! a primary region, found by a linear projection of the primary address.

use crate::platform;
use crate::util;
use core::sync::atomic::{AtomicU8, Ordering};

pub struct FixedShadow<
    const SHADOW_BASE: usize,
    const BASE: usize,
    const SIZE: usize,
    const GRANULARITY: usize,
>;

impl<const SHADOW_BASE: usize, const BASE: usize, const SIZE: usize, const GRANULARITY: usize>
    FixedShadow<SHADOW_BASE, BASE, SIZE, GRANULARITY>
{
    pub const SHADOW_SIZE: usize = SIZE / GRANULARITY;

    /// Map the shadow read-write at its fixed base.
    ///
    /// # Safety
    /// Must run during single-threaded init; the address range must be
    /// unoccupied.
    pub unsafe fn init() {
        if !platform::map_fixed(
            SHADOW_BASE,
            Self::SHADOW_SIZE,
            libc::PROT_READ | libc::PROT_WRITE,
            false,
        ) {
            util::report_and_abort("shadow mapping failed");
        }
    }

    #[inline(always)]
    pub fn contains(addr: usize) -> bool {
        addr >= BASE && addr < BASE + SIZE
    }

    #[inline(always)]
    pub fn shadow_addr(addr: usize) -> usize {
        SHADOW_BASE + (addr - BASE) / GRANULARITY
    }

    /// Raw pointer to the shadow byte of `addr`.
    ///
    /// # Safety
    /// `addr` must be inside the primary region and the shadow mapped.
    #[inline(always)]
    pub unsafe fn shadow_ptr(addr: usize) -> *mut u8 {
        Self::shadow_addr(addr) as *mut u8
    }

    #[inline(always)]
    fn check(value: usize) {
        if value % GRANULARITY != 0 {
            util::report_ptr_and_abort("shadow argument below granularity:", value);
        }
    }

    /// # Safety
    /// `addr` must be inside the primary region and the shadow mapped.
    #[inline(always)]
    pub unsafe fn get(addr: usize) -> u8 {
        (*(Self::shadow_addr(addr) as *const AtomicU8)).load(Ordering::Relaxed)
    }

    /// # Safety
    /// `addr` must be inside the primary region and the shadow mapped.
    #[inline(always)]
    pub unsafe fn set(addr: usize, value: u8) {
        Self::check(addr);
        (*(Self::shadow_addr(addr) as *const AtomicU8)).store(value, Ordering::Relaxed)
    }

    /// Fill the shadow of `[addr, addr + size)` with `value`.
    ///
    /// # Safety
    /// The range must be inside the primary region, the shadow mapped, and
    /// the caller the sole writer of this range's shadow.
    pub unsafe fn set_range(addr: usize, size: usize, value: u8) {
        Self::check(addr);
        Self::check(size);
        core::ptr::write_bytes(Self::shadow_addr(addr) as *mut u8, value, size / GRANULARITY);
    }
}
