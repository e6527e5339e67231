//! Memory tags and address tags.
//!
//! The memory tag of a chunk lives either in a software shadow (one byte
//! per 16-byte granule for range 0, per 1024-byte granule for range 1) or
//! in MTE tag RAM. The address tag rides in the pointer's high bits; the
//! encoding is fixed once at init:
//!
//! * `Alias`  - bits 37..41 select one of 16 virtual aliases of the same
//!   physical super-page (software tagging without hardware support).
//! * `Tbi`    - bits 56..63, checked by MTE loads and stores.
//! * `Identity` - tagging disabled; pointers are canonical.

use crate::config;
use crate::platform::mte;
use crate::shadow::FixedShadow;
use crate::util::{self, ALLOCATOR_SPACE, RANGE_SIZE, SECOND_RANGE_ALIGNMENT};
use core::sync::atomic::{AtomicU8, Ordering};

pub type SmallTagShadow =
    FixedShadow<{ util::SMALL_TAG_SPACE }, { ALLOCATOR_SPACE }, { RANGE_SIZE }, 16>;
pub type LargeTagShadow = FixedShadow<
    { util::LARGE_TAG_SPACE },
    { ALLOCATOR_SPACE + RANGE_SIZE },
    { RANGE_SIZE },
    { SECOND_RANGE_ALIGNMENT },
>;

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Identity,
    Alias,
    Tbi,
}

static ENCODING: AtomicU8 = AtomicU8::new(0);

/// Aliases are spaced by the reservation size, so the alias tag is the
/// bit-field just above it.
const ALIAS_SHIFT: u32 = 37;
const ALIAS_MASK: usize = 0xF;
const TBI_SHIFT: u32 = 56;
const TBI_MASK: usize = 0xFF;

#[inline(always)]
pub fn encoding() -> Encoding {
    match ENCODING.load(Ordering::Relaxed) {
        1 => Encoding::Alias,
        2 => Encoding::Tbi,
        _ => Encoding::Identity,
    }
}

/// Choose the pointer encoding and map the tag shadows.
///
/// # Safety
/// Single-threaded init only.
pub unsafe fn init() {
    if config::use_tag() != 0 {
        mte::init();
    }
    if config::use_shadow() {
        SmallTagShadow::init();
        LargeTagShadow::init();
    }
    let enc = if config::use_aliases() {
        Encoding::Alias
    } else if mte::is_enabled() && config::use_tag() != 0 {
        Encoding::Tbi
    } else {
        Encoding::Identity
    };
    ENCODING.store(enc as u8, Ordering::Relaxed);
}

/// Rewrite the tag bits of `addr` to `tag`.
#[inline(always)]
pub fn apply_address_tag(addr: usize, tag: u8) -> usize {
    match encoding() {
        Encoding::Identity => addr,
        Encoding::Alias => {
            (addr & !(ALIAS_MASK << ALIAS_SHIFT)) | ((tag as usize & ALIAS_MASK) << ALIAS_SHIFT)
        }
        Encoding::Tbi => {
            (addr & !(TBI_MASK << TBI_SHIFT)) | ((tag as usize & TBI_MASK) << TBI_SHIFT)
        }
    }
}

#[inline(always)]
pub fn address_tag(addr: usize) -> u8 {
    match encoding() {
        Encoding::Identity => 0,
        Encoding::Alias => ((addr >> ALIAS_SHIFT) & ALIAS_MASK) as u8,
        Encoding::Tbi => ((addr >> TBI_SHIFT) & TBI_MASK) as u8,
    }
}

/// Canonical (tag-zero) form of `addr`. Every chunk-lookup path strips
/// first.
#[inline(always)]
pub fn strip_address_tag(addr: usize) -> usize {
    apply_address_tag(addr, 0)
}

/// Current memory tag of the granule at `addr` (canonical address).
///
/// # Safety
/// `addr` must lie inside the allocator reservation; init must have run.
#[inline]
pub unsafe fn memory_tag(addr: usize) -> u8 {
    if mte::is_enabled() {
        return mte::load_tag(addr);
    }
    if !config::use_shadow() {
        return 0;
    }
    if SmallTagShadow::contains(addr) {
        SmallTagShadow::get(addr)
    } else if LargeTagShadow::contains(addr) {
        LargeTagShadow::get(addr)
    } else {
        util::report_ptr_and_abort("memory tag lookup outside reservation", addr)
    }
}

/// Retag `[addr, addr + size)`. With MTE the hardware picks a random tag
/// and `tag` is advisory; with the shadow the bytes are filled with `tag`.
///
/// # Safety
/// `addr`/`size` must describe one whole chunk owned by the caller.
pub unsafe fn set_memory_tag(addr: usize, size: usize, tag: u8) {
    if mte::is_enabled() {
        let tagged = mte::tag_pointer(addr);
        mte::store_tags(tagged, size);
        return;
    }
    if !config::use_shadow() {
        return;
    }
    if SmallTagShadow::contains(addr) {
        SmallTagShadow::set_range(addr, size, tag);
    } else if LargeTagShadow::contains(addr) {
        LargeTagShadow::set_range(addr, size, tag);
    } else {
        util::report_ptr_and_abort("memory tag store outside reservation", addr);
    }
}
