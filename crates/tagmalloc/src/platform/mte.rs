//! ARM Memory Tagging Extension backend. On MTE hardware the memory tag
//! lives in the tag RAM instead of a software shadow and every load/store
//! checks it synchronously. Elsewhere all of this is a no-op and
//! `is_enabled` stays false.

use core::sync::atomic::{AtomicBool, Ordering};

static MTE_ENABLED: AtomicBool = AtomicBool::new(false);

/// Detect MTE and switch the task to synchronous tag checking.
///
/// # Safety
/// Single-threaded init only.
#[cfg(target_arch = "aarch64")]
pub unsafe fn init() {
    const AT_HWCAP2: libc::c_ulong = 26;
    const HWCAP2_MTE: libc::c_ulong = 1 << 18;

    if libc::getauxval(AT_HWCAP2) & HWCAP2_MTE == 0 {
        return;
    }

    const PR_SET_TAGGED_ADDR_CTRL: libc::c_int = 55;
    const PR_TAGGED_ADDR_ENABLE: libc::c_ulong = 1;
    const PR_MTE_TCF_SYNC: libc::c_ulong = 1 << 1;
    // Allow all tags except the reserved tag 0.
    const PR_MTE_TAG_MASK: libc::c_ulong = 0xfffe << 3;

    let ret = libc::prctl(
        PR_SET_TAGGED_ADDR_CTRL,
        PR_TAGGED_ADDR_ENABLE | PR_MTE_TCF_SYNC | PR_MTE_TAG_MASK,
        0,
        0,
        0,
    );
    if ret == 0 {
        MTE_ENABLED.store(true, Ordering::Release);
    }
}

/// # Safety
/// No-op off aarch64.
#[cfg(not(target_arch = "aarch64"))]
pub unsafe fn init() {}

#[inline(always)]
pub fn is_enabled() -> bool {
    MTE_ENABLED.load(Ordering::Relaxed)
}

/// Extra mmap protection flag for taggable pages.
pub fn prot_flags() -> libc::c_int {
    const PROT_MTE: libc::c_int = 0x20;
    if is_enabled() {
        PROT_MTE
    } else {
        0
    }
}

/// Insert a random allocation tag into `addr` (IRG).
///
/// # Safety
/// Meaningful only on MTE hardware; `addr` must be a valid pointer.
#[cfg(target_arch = "aarch64")]
#[inline(always)]
pub unsafe fn tag_pointer(addr: usize) -> usize {
    let tagged: usize;
    core::arch::asm!(
        "irg {out}, {inp}",
        inp = in(reg) addr,
        out = out(reg) tagged,
        options(nomem, nostack, preserves_flags),
    );
    tagged
}

/// # Safety
/// Identity off aarch64.
#[cfg(not(target_arch = "aarch64"))]
#[inline(always)]
pub unsafe fn tag_pointer(addr: usize) -> usize {
    addr
}

/// Store the tag of `tagged` over `size` bytes of tag RAM (STG per
/// 16-byte granule).
///
/// # Safety
/// `tagged` must come from `tag_pointer`; memory must be PROT_MTE mapped;
/// `size` must be a multiple of 16.
#[cfg(target_arch = "aarch64")]
#[inline]
pub unsafe fn store_tags(tagged: usize, size: usize) {
    let mut offset = 0usize;
    while offset < size {
        core::arch::asm!(
            "stg {ptr}, [{ptr}]",
            ptr = in(reg) tagged + offset,
            options(nostack, preserves_flags),
        );
        offset += 16;
    }
}

/// # Safety
/// No-op off aarch64.
#[cfg(not(target_arch = "aarch64"))]
#[inline(always)]
pub unsafe fn store_tags(_tagged: usize, _size: usize) {}

/// Read the memory tag of `addr` (LDG).
///
/// # Safety
/// `addr` must be a valid, PROT_MTE-mapped address.
#[cfg(target_arch = "aarch64")]
#[inline(always)]
pub unsafe fn load_tag(addr: usize) -> u8 {
    let mut tagged = addr;
    core::arch::asm!(
        "ldg {t}, [{a}]",
        t = inout(reg) tagged,
        a = in(reg) addr,
        options(nostack, preserves_flags),
    );
    ((tagged >> 56) & 0xF) as u8
}

/// # Safety
/// Always zero off aarch64.
#[cfg(not(target_arch = "aarch64"))]
#[inline(always)]
pub unsafe fn load_tag(_addr: usize) -> u8 {
    0
}
