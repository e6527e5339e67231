use core::ptr;

/// # Safety
/// `addr`/`size` page-aligned, range owned by the caller's layout.
pub unsafe fn map_fixed(addr: usize, size: usize, prot: libc::c_int, shared: bool) -> bool {
    let vis = if shared { libc::MAP_SHARED } else { libc::MAP_PRIVATE };
    let res = libc::mmap(
        addr as *mut libc::c_void,
        size,
        prot,
        libc::MAP_FIXED | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE | vis,
        -1,
        0,
    );
    res == addr as *mut libc::c_void
}

/// # Safety
/// `size` page-aligned and non-zero.
pub unsafe fn map_anonymous(size: usize) -> *mut u8 {
    let res = libc::mmap(
        ptr::null_mut(),
        size,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
        -1,
        0,
    );
    if res == libc::MAP_FAILED {
        ptr::null_mut()
    } else {
        res as *mut u8
    }
}

/// # Safety
/// `ptr` from `map_anonymous` with the same `size`.
pub unsafe fn unmap(ptr: *mut u8, size: usize) {
    libc::munmap(ptr as *mut libc::c_void, size);
}

/// Map PROT_NONE over the region in place. Unlike mprotect this also drops
/// the backing pages.
///
/// # Safety
/// Region must be valid and page-aligned.
pub unsafe fn fence_none(ptr: *mut u8, size: usize) {
    libc::mmap(
        ptr as *mut libc::c_void,
        size,
        libc::PROT_NONE,
        libc::MAP_FIXED | libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
        -1,
        0,
    );
}

/// # Safety
/// `src` must be a shared mapping; `dst` must be free fixed space.
pub unsafe fn remap_alias(src: usize, dst: usize, size: usize) -> bool {
    let res = libc::mremap(
        src as *mut libc::c_void,
        0,
        size,
        libc::MREMAP_FIXED | libc::MREMAP_MAYMOVE,
        dst as *mut libc::c_void,
    );
    res == dst as *mut libc::c_void
}

/// # Safety
/// Region must be valid and page-aligned.
pub unsafe fn advise_dontneed(addr: usize, size: usize) {
    libc::madvise(addr as *mut libc::c_void, size, libc::MADV_DONTNEED);
}

/// Kernel tid, cached in TLS to avoid a syscall per allocation.
#[inline]
pub fn thread_id() -> usize {
    use core::cell::Cell;

    thread_local! {
        static CACHED_TID: Cell<usize> = const { Cell::new(0) };
    }

    CACHED_TID
        .try_with(|tid| {
            let cached = tid.get();
            if cached != 0 {
                return cached;
            }
            let new_tid = unsafe { libc::syscall(libc::SYS_gettid) as usize };
            tid.set(new_tid);
            new_tid
        })
        .unwrap_or_else(|_| unsafe { libc::syscall(libc::SYS_gettid) as usize })
}

/// # Safety
/// Single-threaded init only.
pub unsafe fn install_signal_handler(
    signum: libc::c_int,
    handler: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void),
) {
    let mut sa: libc::sigaction = core::mem::zeroed();
    sa.sa_sigaction = handler as usize;
    sa.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
    libc::sigemptyset(&mut sa.sa_mask);
    if libc::sigaction(signum, &sa, ptr::null_mut()) != 0 {
        crate::util::report_and_abort("sigaction failed");
    }
}

/// # Safety
/// `entry` must remain valid for the process lifetime.
pub unsafe fn spawn_detached(entry: extern "C" fn(*mut libc::c_void) -> *mut libc::c_void) -> bool {
    let mut tid: libc::pthread_t = core::mem::zeroed();
    if libc::pthread_create(&mut tid, ptr::null(), entry, ptr::null_mut()) != 0 {
        return false;
    }
    libc::pthread_detach(tid);
    true
}
