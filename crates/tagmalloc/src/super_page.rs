//! Super-pages: fixed-size, self-aligned regions holding the chunks of one
//! size class, driven by a byte-per-chunk state machine.
//!
//! Every state transition is a single byte store or byte CAS. AVAILABLE
//! must be zero (freshly mapped state arrays start all-available) and the
//! other states are odd so the word-wide byte search can test bit 0.

use crate::byte_scan;
use crate::shadow::FixedShadow;
use crate::size_class::{self, SizeClassDescr};
use crate::tags;
use crate::util::{
    self, round_down, ALLOCATOR_SIZE, ALLOCATOR_SPACE, FIRST_SUPER_PAGE, NUM_RANGES, RANGE_SIZE,
    SUPER_PAGE_SIZE,
};
use core::sync::atomic::{AtomicU8, Ordering};

pub const AVAILABLE: u8 = 0;
pub const USED_MIXED: u8 = 1;
pub const USED_DATA: u8 = 3;
pub const QUARANTINED: u8 = 5;
pub const MARKED: u8 = 7;
pub const RELEASING: u8 = 255;

/// One byte per super-page across the whole reservation: the size class
/// assigned at creation.
pub type SuperPageMeta = FixedShadow<
    { util::SUPER_PAGE_META_SPACE },
    { ALLOCATOR_SPACE },
    { ALLOCATOR_SIZE },
    { SUPER_PAGE_SIZE },
>;

/// External chunk-state storage for range 1: one byte per 1024 bytes, so a
/// super-page's states are a contiguous block in the shadow.
pub type SecondRangeState = FixedShadow<
    { util::SECOND_RANGE_META_SPACE },
    { ALLOCATOR_SPACE + RANGE_SIZE },
    { RANGE_SIZE },
    { util::SECOND_RANGE_ALIGNMENT },
>;

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SuperPage {
    base: usize,
}

impl SuperPage {
    /// Wrap a canonical super-page base address.
    #[inline]
    pub fn from_base(base: usize) -> SuperPage {
        if base < ALLOCATOR_SPACE
            || base >= ALLOCATOR_SPACE + ALLOCATOR_SIZE
            || base % SUPER_PAGE_SIZE != 0
        {
            util::report_ptr_and_abort("not a super-page address", base);
        }
        SuperPage { base }
    }

    /// Super-page `idx` of `range`.
    #[inline]
    pub fn at(range: usize, idx: usize) -> SuperPage {
        let base = FIRST_SUPER_PAGE[range] + idx * SUPER_PAGE_SIZE;
        if base >= ALLOCATOR_SPACE + ALLOCATOR_SIZE {
            util::report_ptr_and_abort("super-page index outside reservation", base);
        }
        SuperPage { base }
    }

    /// The super-page containing the canonical address `addr`.
    #[inline]
    pub fn containing(addr: usize) -> SuperPage {
        SuperPage::from_base(round_down(addr, SUPER_PAGE_SIZE))
    }

    #[inline(always)]
    pub fn base(&self) -> usize {
        self.base
    }

    #[inline(always)]
    fn end(&self) -> usize {
        self.base + SUPER_PAGE_SIZE
    }

    pub fn range(&self) -> usize {
        (self.base >= FIRST_SUPER_PAGE[1]) as usize
    }

    pub fn index(&self) -> usize {
        (self.base - FIRST_SUPER_PAGE[self.range()]) / SUPER_PAGE_SIZE
    }

    /// # Safety
    /// The super-page must have been created (its class byte written).
    #[inline(always)]
    pub unsafe fn class(&self) -> u8 {
        SuperPageMeta::get(self.base)
    }

    /// # Safety
    /// The super-page must have been created.
    #[inline(always)]
    pub unsafe fn descr(&self) -> SizeClassDescr {
        size_class::descr(self.class() as usize)
    }

    /// Base of the chunk state array: inline at the high end for range 0,
    /// in the external shadow for range 1.
    ///
    /// # Safety
    /// `scd` must be this super-page's descriptor.
    #[inline(always)]
    pub unsafe fn state_array(&self, scd: &SizeClassDescr) -> *mut u8 {
        if scd.range == 1 {
            SecondRangeState::shadow_ptr(self.base)
        } else {
            (self.end() - size_class::size_of_inline_state(scd.num_chunks as usize, 0)) as *mut u8
        }
    }

    #[inline(always)]
    unsafe fn state(&self, scd: &SizeClassDescr, idx: usize) -> &AtomicU8 {
        &*(self.state_array(scd).add(idx) as *const AtomicU8)
    }

    #[inline(always)]
    pub fn chunk_addr(&self, idx: usize, scd: &SizeClassDescr) -> usize {
        self.base + idx * scd.chunk_size()
    }

    /// Claim one AVAILABLE chunk, searching circularly from `*hint`.
    /// Returns a tagged user pointer, or None when the super-page is full.
    ///
    /// # Safety
    /// The super-page must be created and `scd` its descriptor.
    #[inline]
    pub unsafe fn try_allocate(
        &self,
        data_only: bool,
        scd: SizeClassDescr,
        hint: &mut usize,
    ) -> Option<usize> {
        let n = scd.num_chunks as usize;
        let states = self.state_array(&scd);
        let new_state = if data_only { USED_DATA } else { USED_MIXED };

        let pos = byte_scan::find_zero_byte(states, n, *hint, |idx| unsafe {
            (*(states.add(idx) as *const AtomicU8))
                .compare_exchange(AVAILABLE, new_state, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        })?;

        *hint = pos + 1;
        let addr = self.chunk_addr(pos, &scd);
        let tag = tags::memory_tag(addr);
        Some(tags::apply_address_tag(addr, tag))
    }

    /// Chunk index of a canonical pointer into this super-page. An address
    /// that is not an exact chunk base is an invalid free.
    ///
    /// # Safety
    /// The super-page must be created and `scd` its descriptor.
    pub unsafe fn chunk_index(&self, ptr: usize, scd: &SizeClassDescr) -> usize {
        let offset = ptr % SUPER_PAGE_SIZE;
        let idx = size_class::div_by_chunk_size(offset, scd.chunk_mul);
        if idx * scd.chunk_size() != offset || idx >= scd.num_chunks as usize {
            util::report_ptr_and_abort("free of an interior or foreign pointer", ptr);
        }
        idx
    }

    /// Bump the chunk's memory tag so stale pointers stop matching.
    /// Returns the new tag.
    unsafe fn update_memory_tag_on_free(&self, ptr: usize, size: usize) -> u8 {
        let old_tag = tags::memory_tag(ptr);
        let new_tag = old_tag.wrapping_add(1);
        tags::set_memory_tag(ptr, size, new_tag);
        new_tag
    }

    /// Single-byte transition out of USED_*; anything else was not a live
    /// allocation.
    #[inline(always)]
    unsafe fn transition_freed(&self, ptr: usize, scd: &SizeClassDescr, idx: usize, new_state: u8) {
        let state = self.state(scd, idx);
        let old = state.load(Ordering::Relaxed);
        state.store(new_state, Ordering::Relaxed);
        if old != USED_MIXED && old != USED_DATA {
            util::report_ptr_and_abort("DoubleFree on", ptr);
        }
    }

    /// Free with no quarantine: retag, then straight to AVAILABLE.
    ///
    /// # Safety
    /// `ptr` must be a canonical chunk address inside this super-page.
    pub unsafe fn deallocate(&self, ptr: usize) {
        let scd = self.descr();
        let idx = self.chunk_index(ptr, &scd);
        self.update_memory_tag_on_free(ptr, scd.chunk_size());
        self.transition_freed(ptr, &scd, idx, AVAILABLE);
    }

    /// Free into quarantine. With a narrow tag, a fresh non-zero tag
    /// already proves uniqueness and the chunk can skip quarantine
    /// entirely. Returns the bytes actually quarantined.
    ///
    /// # Safety
    /// `ptr` must be a canonical chunk address inside this super-page.
    pub unsafe fn quarantine(&self, ptr: usize) -> usize {
        let scd = self.descr();
        let idx = self.chunk_index(ptr, &scd);
        let new_tag = self.update_memory_tag_on_free(ptr, scd.chunk_size());
        let mut new_state = QUARANTINED;
        match crate::config::use_tag() {
            1 if new_tag & 15 != 0 => new_state = AVAILABLE,
            2 if new_tag != 0 => new_state = AVAILABLE,
            _ => {}
        }
        self.transition_freed(ptr, &scd, idx, new_state);
        if new_state == AVAILABLE {
            0
        } else {
            scd.chunk_size()
        }
    }

    /// Mark pass target: if the chunk holding `value` is QUARANTINED,
    /// promote it to MARKED.
    ///
    /// # Safety
    /// The super-page must be created.
    pub unsafe fn mark(&self, value: usize) {
        let scd = self.descr();
        let offset = value % SUPER_PAGE_SIZE;
        let idx = size_class::div_by_chunk_size(offset, scd.chunk_mul);
        if idx >= scd.num_chunks as usize {
            return;
        }
        let state = self.state(&scd, idx);
        if state.load(Ordering::Relaxed) == QUARANTINED {
            state.store(MARKED, Ordering::Relaxed);
        }
    }

    /// Conservative root scan of this super-page: every pointer-aligned
    /// word of every USED_MIXED chunk that lands in a created super-page of
    /// either range marks its target chunk.
    ///
    /// # Safety
    /// Must run while peer threads are stopped (or only performing
    /// byte-atomic state transitions).
    pub unsafe fn mark_all_live_pointers(&self, region_size: [usize; NUM_RANGES]) {
        let scd = self.descr();
        let chunk_size = scd.chunk_size();
        let states = self.state_array(&scd);
        for idx in 0..scd.num_chunks as usize {
            if (*(states.add(idx) as *const AtomicU8)).load(Ordering::Relaxed) != USED_MIXED {
                continue;
            }
            let chunk = self.chunk_addr(idx, &scd);
            let mut word = chunk;
            while word < chunk + chunk_size {
                // The hottest load of the scan.
                let value = (*(word as *const core::sync::atomic::AtomicUsize))
                    .load(Ordering::Relaxed);
                let value = tags::strip_address_tag(value);
                if value.wrapping_sub(FIRST_SUPER_PAGE[0]) < region_size[0]
                    || value.wrapping_sub(FIRST_SUPER_PAGE[1]) < region_size[1]
                {
                    SuperPage {
                        base: round_down(value, SUPER_PAGE_SIZE),
                    }
                    .mark(value);
                }
                word += core::mem::size_of::<usize>();
            }
        }
    }

    /// Post-scan transition: unreferenced quarantined chunks become
    /// available; marked chunks serve one more quarantine cycle.
    ///
    /// # Safety
    /// Coordinator only, after every shard has finished.
    pub unsafe fn sweep(&self) {
        let scd = self.descr();
        for idx in 0..scd.num_chunks as usize {
            let state = self.state(&scd, idx);
            match state.load(Ordering::Relaxed) {
                QUARANTINED => state.store(AVAILABLE, Ordering::Relaxed),
                MARKED => state.store(QUARANTINED, Ordering::Relaxed),
                _ => {}
            }
        }
    }

    /// # Safety
    /// The super-page must be created.
    pub unsafe fn count_state(&self, wanted: u8) -> usize {
        let scd = self.descr();
        let mut count = 0;
        for idx in 0..scd.num_chunks as usize {
            if self.state(&scd, idx).load(Ordering::Relaxed) == wanted {
                count += 1;
            }
        }
        count
    }

    /// Try to return this super-page's physical pages to the OS. Succeeds
    /// only if every chunk can be moved AVAILABLE -> RELEASING; otherwise
    /// every claimed byte is reverted.
    ///
    /// # Safety
    /// The super-page must be created.
    pub unsafe fn maybe_release_to_os(&self) {
        let scd = self.descr();
        let num_chunks = scd.num_chunks as usize;
        if self.count_state(AVAILABLE) != num_chunks {
            return;
        }
        let mut claimed = 0;
        for idx in 0..num_chunks {
            if self
                .state(&scd, idx)
                .compare_exchange(AVAILABLE, RELEASING, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                claimed += 1;
            }
        }
        if claimed == num_chunks {
            crate::platform::advise_dontneed(self.base, SUPER_PAGE_SIZE);
            // Range 0 keeps its state inline: the kernel just zeroed it
            // back to AVAILABLE. Range 1's shadow must be reset by hand.
            if scd.range == 1 {
                for idx in 0..num_chunks {
                    self.state(&scd, idx).store(AVAILABLE, Ordering::Relaxed);
                }
            }
        } else {
            for idx in 0..num_chunks {
                let state = self.state(&scd, idx);
                if state.load(Ordering::Relaxed) == RELEASING {
                    state.store(AVAILABLE, Ordering::Relaxed);
                }
            }
        }
    }

    /// One-line utilization dump for diagnostics.
    ///
    /// # Safety
    /// The super-page must be created.
    pub unsafe fn print(&self) {
        let scd = self.descr();
        let available = self.count_state(AVAILABLE);
        let quarantined = self.count_state(QUARANTINED);
        let marked = self.count_state(MARKED);
        let used_pct = (scd.num_chunks as usize).saturating_sub(available + quarantined)
            * scd.chunk_size()
            * 100
            / SUPER_PAGE_SIZE;
        crate::diag!(
            "SP r {} {} 0x{:x} sc {} size {} num {} ava {} qua {} mar {} uti {}%",
            self.range(),
            self.index(),
            self.base,
            self.class(),
            scd.chunk_size(),
            scd.num_chunks,
            available,
            quarantined,
            marked,
            used_pct
        );
    }
}
