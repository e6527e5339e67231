use core::sync::atomic::{AtomicU32, Ordering};

/// Lock for the allocator's rare serialized sections: super-page creation
/// and scan arming. The allocate/free hot paths never take it, so the
/// design favours a small uncontended path over throughput under
/// contention: a held flag plus a count of sleepers, with the futex
/// revalidating the flag before any sleep. std::sync::Mutex may allocate,
/// which no allocator path can tolerate.
pub struct SlowPathLock {
    /// 0 = free, 1 = held.
    held: AtomicU32,
    /// Threads currently inside `wait`; unlock skips the wake syscall
    /// while this is zero.
    waiters: AtomicU32,
}

unsafe impl Send for SlowPathLock {}
unsafe impl Sync for SlowPathLock {}

impl SlowPathLock {
    pub const fn new() -> Self {
        SlowPathLock {
            held: AtomicU32::new(0),
            waiters: AtomicU32::new(0),
        }
    }

    /// Acquire for the lifetime of the returned guard.
    #[inline]
    pub fn lock_scope(&self) -> SlowPathGuard<'_> {
        while self
            .held
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            self.wait();
        }
        SlowPathGuard { lock: self }
    }

    #[cold]
    fn wait(&self) {
        self.waiters.fetch_add(1, Ordering::Relaxed);
        // FUTEX_WAIT re-reads `held` under the futex hash lock, so an
        // unlock between our announcement and the syscall cannot strand
        // us: the kernel sees 0 and returns immediately.
        if self.held.load(Ordering::Acquire) == 1 {
            unsafe {
                libc::syscall(
                    libc::SYS_futex,
                    &self.held as *const AtomicU32,
                    libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                    1u32,
                    core::ptr::null::<libc::timespec>(),
                );
            }
        }
        self.waiters.fetch_sub(1, Ordering::Relaxed);
    }

    fn unlock(&self) {
        self.held.store(0, Ordering::Release);
        if self.waiters.load(Ordering::Relaxed) != 0 {
            self.wake_one();
        }
    }

    #[cold]
    fn wake_one(&self) {
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                &self.held as *const AtomicU32,
                libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                1u32,
            );
        }
    }
}

pub struct SlowPathGuard<'a> {
    lock: &'a SlowPathLock,
}

impl Drop for SlowPathGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}
