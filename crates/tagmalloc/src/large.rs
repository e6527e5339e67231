//! Allocator for requests above the largest size class: a page-rounded
//! anonymous mapping with a one-page header carrying two magic words and
//! the mapped size. Optionally the freed region is fenced PROT_NONE
//! instead of unmapped, so dangling accesses fault forever.

use crate::config;
use crate::platform;
use crate::util::{self, round_up, PAGE_SIZE};

const LEFT_MAGIC: usize = 0x039C_8235_25B0_237E;
const RIGHT_MAGIC: usize = 0x1C2C_5300_098D_85AD;

pub struct LargeAllocator;

impl LargeAllocator {
    pub const fn new() -> Self {
        LargeAllocator
    }

    /// # Safety
    /// Fatal on mapping failure.
    pub unsafe fn allocate(&self, size: usize) -> *mut u8 {
        let total = round_up(size, PAGE_SIZE) + PAGE_SIZE;
        let header = platform::map_anonymous(total) as *mut usize;
        if header.is_null() {
            util::report_and_abort("out of memory in the large allocator");
        }
        if config::large_alloc_verbose() {
            crate::diag!("large.allocate 0x{:x} {}", header as usize, total);
        }
        *header = LEFT_MAGIC;
        *header.add(1) = total;
        *header.add(2) = RIGHT_MAGIC;
        (header as *mut u8).add(PAGE_SIZE)
    }

    /// # Safety
    /// `ptr` must be a live large allocation.
    pub unsafe fn size_of(&self, ptr: *mut u8) -> usize {
        *self.header(ptr).add(1) - PAGE_SIZE
    }

    /// Free `ptr`. With `protect` the whole region is remapped PROT_NONE
    /// in place rather than returned to the kernel.
    ///
    /// # Safety
    /// `ptr` must be a live large allocation.
    pub unsafe fn deallocate(&self, ptr: *mut u8, protect: bool) {
        let header = self.header(ptr);
        let total = *header.add(1);
        if config::large_alloc_verbose() {
            crate::diag!(
                "large.deallocate 0x{:x} {} {}",
                header as usize,
                total,
                if protect { "protect" } else { "recycle" }
            );
        }
        if protect {
            platform::fence_none(header as *mut u8, total);
        } else {
            platform::unmap(header as *mut u8, total);
        }
    }

    /// Header of `ptr`, with sanity checks on everything not provably a
    /// large allocation. User pointers are always page-aligned here, so
    /// anything else never touches the header page.
    unsafe fn header(&self, ptr: *mut u8) -> *mut usize {
        let p = ptr as usize;
        if p < PAGE_SIZE || p % PAGE_SIZE != 0 {
            util::report_ptr_and_abort("invalid pointer passed to free:", p);
        }
        let header = (p - PAGE_SIZE) as *mut usize;
        if *header != LEFT_MAGIC || *header.add(2) != RIGHT_MAGIC {
            util::report_ptr_and_abort("large allocation header corrupted:", p);
        }
        header
    }
}
