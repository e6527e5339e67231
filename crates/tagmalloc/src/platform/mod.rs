pub mod linux;
pub use linux as sys;

pub mod mte;
pub mod tasks;

/// Map anonymous memory at a fixed address. Returns false on failure.
///
/// # Safety
/// `addr` and `size` must be page-aligned; the range must belong to the
/// allocator's fixed layout.
#[inline]
pub unsafe fn map_fixed(addr: usize, size: usize, prot: libc::c_int, shared: bool) -> bool {
    sys::map_fixed(addr, size, prot, shared)
}

/// Map anonymous read-write memory anywhere. Returns null on failure.
///
/// # Safety
/// `size` must be page-aligned and non-zero.
#[inline]
pub unsafe fn map_anonymous(size: usize) -> *mut u8 {
    sys::map_anonymous(size)
}

/// # Safety
/// `ptr` must come from `map_anonymous` with the same `size`.
#[inline]
pub unsafe fn unmap(ptr: *mut u8, size: usize) {
    sys::unmap(ptr, size);
}

/// Replace a mapped region with an inaccessible one, so dangling accesses
/// fault instead of landing in recycled memory.
///
/// # Safety
/// Region must be valid and page-aligned.
#[inline]
pub unsafe fn fence_none(ptr: *mut u8, size: usize) {
    sys::fence_none(ptr, size);
}

/// Duplicate a MAP_SHARED mapping at a second fixed address.
///
/// # Safety
/// `src` must be a shared mapping of at least `size` bytes; `dst` must be
/// free address space.
#[inline]
pub unsafe fn remap_alias(src: usize, dst: usize, size: usize) -> bool {
    sys::remap_alias(src, dst, size)
}

/// Let the kernel reclaim the physical pages behind a range.
///
/// # Safety
/// Region must be valid and page-aligned.
#[inline]
pub unsafe fn advise_dontneed(addr: usize, size: usize) {
    sys::advise_dontneed(addr, size);
}

/// Cheap per-thread identifier (cached kernel tid).
#[inline]
pub fn thread_id() -> usize {
    sys::thread_id()
}

/// Install a SA_SIGINFO handler.
///
/// # Safety
/// Single-threaded init only.
pub unsafe fn install_signal_handler(
    signum: libc::c_int,
    handler: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void),
) {
    sys::install_signal_handler(signum, handler);
}

/// Spawn a detached worker thread over raw pthreads; std::thread would
/// allocate through the allocator being initialized.
///
/// # Safety
/// `entry` must be safe to run for the life of the process.
pub unsafe fn spawn_detached(entry: extern "C" fn(*mut libc::c_void) -> *mut libc::c_void) -> bool {
    sys::spawn_detached(entry)
}
