//! C ABI shim over the core operations.

use crate::init;
use crate::util;
use core::ffi::c_void;
use core::ptr;

#[no_mangle]
pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
    init::ensure_initialized();
    init::allocator().allocate(size) as *mut c_void
}

#[no_mangle]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    if ptr.is_null() {
        return;
    }
    init::ensure_initialized();
    init::allocator().free(ptr as *mut u8);
}

#[no_mangle]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut c_void {
    let total = match nmemb.checked_mul(size) {
        Some(t) => t,
        None => {
            *libc::__errno_location() = libc::ENOMEM;
            return ptr::null_mut();
        }
    };
    let p = malloc(total);
    if !p.is_null() {
        // Recycled chunks carry old contents; always clear.
        ptr::write_bytes(p as *mut u8, 0, total);
    }
    p
}

#[no_mangle]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    init::ensure_initialized();
    init::allocator().reallocate(ptr as *mut u8, size) as *mut c_void
}

#[no_mangle]
pub unsafe extern "C" fn posix_memalign(
    memptr: *mut *mut c_void,
    alignment: usize,
    size: usize,
) -> libc::c_int {
    if memptr.is_null() {
        return libc::EINVAL;
    }
    if !alignment.is_power_of_two() || alignment < core::mem::size_of::<*mut c_void>() {
        return libc::EINVAL;
    }
    init::ensure_initialized();
    let p = init::allocator().allocate_aligned(alignment, size);
    if p.is_null() {
        return libc::ENOMEM;
    }
    *memptr = p as *mut c_void;
    0
}

#[no_mangle]
pub unsafe extern "C" fn aligned_alloc(alignment: usize, size: usize) -> *mut c_void {
    // C11: size must be a multiple of alignment.
    if !alignment.is_power_of_two() || (size % alignment != 0 && size != 0) {
        *libc::__errno_location() = libc::EINVAL;
        return ptr::null_mut();
    }
    init::ensure_initialized();
    init::allocator().allocate_aligned(alignment, size) as *mut c_void
}

#[no_mangle]
pub unsafe extern "C" fn memalign(alignment: usize, size: usize) -> *mut c_void {
    init::ensure_initialized();
    init::allocator().allocate_aligned(alignment, size) as *mut c_void
}

#[no_mangle]
pub unsafe extern "C" fn valloc(size: usize) -> *mut c_void {
    init::ensure_initialized();
    init::allocator().allocate_aligned(util::PAGE_SIZE, size) as *mut c_void
}

#[no_mangle]
pub unsafe extern "C" fn pvalloc(size: usize) -> *mut c_void {
    init::ensure_initialized();
    let rounded = util::round_up(size, util::PAGE_SIZE);
    init::allocator().allocate_aligned(util::PAGE_SIZE, rounded) as *mut c_void
}

#[no_mangle]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut c_void) -> usize {
    if ptr.is_null() {
        return 0;
    }
    init::ensure_initialized();
    init::allocator().size_of(ptr as *mut u8)
}

/// Enter (+1) or leave (-1) a scope in which every allocation is treated
/// as opaque data and skipped as a scan root.
#[no_mangle]
pub unsafe extern "C" fn tagmalloc_dataonly_scope(level: libc::c_int) {
    init::ensure_initialized();
    init::allocator().data_only_scope(level);
}

/// Instrumentation hook for access counting (e.g. from a compiler
/// instrumentation pass).
#[no_mangle]
pub unsafe extern "C" fn tagmalloc_note_access(ptr: *mut c_void) {
    if init::is_ready() {
        init::allocator().note_access(ptr as *mut u8);
    }
}
