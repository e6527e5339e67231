//! The process-scoped allocator: size-class routing, the lock-free fast
//! path over the thread's favourite super-page, the locked slow path that
//! probes and creates super-pages, quarantine bookkeeping, the cooperative
//! stop-the-world scan, and the release-to-OS loop.

pub mod thread_state;

use crate::config;
use crate::large::LargeAllocator;
use crate::platform::{self, mte, tasks};
use crate::size_class::{self, SizeClassDescr, MAX_SMALL_SIZE};
use crate::stats::GlobalStats;
use crate::super_page::{SuperPage, SuperPageMeta, QUARANTINED};
use crate::sync::SlowPathLock;
use crate::tags;
use crate::util::{
    self, ALLOCATOR_SIZE, ALLOCATOR_SPACE, LOCAL_QUARANTINE_FLUSH, MAX_THREADS, MIN_ALIGN,
    NUM_RANGES, PAGE_SIZE, SUPER_PAGE_SIZE,
};
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use thread_state::{rand_r, with_thread_state, ThreadState};

/// Super-pages each scanning thread claims per fetch-add on the shared
/// position counter.
const SCAN_POS_INCREMENT: usize = 1024;

pub struct Allocator {
    /// Guards super-page creation and scan arming. Never taken on the
    /// allocate/free fast paths.
    mu: SlowPathLock,
    num_super_pages: [AtomicUsize; NUM_RANGES],
    /// Flushed-in quarantine bytes; rewritten by the scan post-pass.
    bytes_in_quarantine: AtomicUsize,
    /// Quarantine remainder after the previous scan; the next scan fires
    /// at configured-size above this baseline.
    last_quarantine_bytes: AtomicUsize,
    scan_pos: [AtomicUsize; NUM_RANGES],
    num_scans: AtomicUsize,
    /// While non-zero, allocations are tagged USED_DATA and skipped as
    /// scan roots.
    data_only_depth: AtomicUsize,
    stats: GlobalStats,
    large: LargeAllocator,
}

unsafe impl Send for Allocator {}
unsafe impl Sync for Allocator {}

impl Allocator {
    pub const fn new() -> Self {
        const ZERO: AtomicUsize = AtomicUsize::new(0);
        Allocator {
            mu: SlowPathLock::new(),
            num_super_pages: [ZERO; NUM_RANGES],
            bytes_in_quarantine: ZERO,
            last_quarantine_bytes: ZERO,
            scan_pos: [ZERO; NUM_RANGES],
            num_scans: ZERO,
            data_only_depth: ZERO,
            stats: GlobalStats::new(),
            large: LargeAllocator::new(),
        }
    }

    pub fn stats(&self) -> &GlobalStats {
        &self.stats
    }

    #[inline]
    pub fn num_super_pages(&self, range: usize) -> usize {
        self.num_super_pages[range].load(Ordering::Acquire)
    }

    pub fn bytes_in_quarantine(&self) -> usize {
        self.bytes_in_quarantine.load(Ordering::Relaxed)
    }

    pub fn num_scans(&self) -> usize {
        self.num_scans.load(Ordering::Relaxed)
    }

    /// Allocate `size` bytes. Fatal on OS mapping failure.
    ///
    /// # Safety
    /// The allocator must be initialized.
    #[inline]
    pub unsafe fn allocate(&self, size: usize) -> *mut u8 {
        if size > MAX_SMALL_SIZE {
            with_thread_state(|t| t.stats.large_allocs += 1);
            return self.large.allocate(size);
        }
        let (class, scd) = size_class::resolve(size);
        self.allocate_class(class, scd)
    }

    #[inline]
    unsafe fn allocate_class(&self, class: u8, scd: SizeClassDescr) -> *mut u8 {
        let data_only = self.data_only_depth.load(Ordering::Relaxed) != 0;
        with_thread_state(|t| unsafe {
            t.stats.allocs_per_class[class as usize] += 1;
            let per = &mut t.per_class[class as usize];
            if let Some(sp) = per.sp {
                if let Some(p) = sp.try_allocate(data_only, scd, &mut per.hint) {
                    return p as *mut u8;
                }
            }
            self.allocate_class_slow(class, data_only, t)
        })
    }

    /// Probe existing super-pages of the class from a random start, then
    /// create a new one and retry.
    #[cold]
    unsafe fn allocate_class_slow(&self, class: u8, data_only: bool, t: &mut ThreadState) -> *mut u8 {
        if t.rand == 0 {
            crate::init::ensure_initialized();
            thread_state::register_thread();
            t.rand = platform::thread_id() as u32 | 1;
        }
        // The caller may have read its descriptor before init built the
        // table (first allocation of the process); reload it here.
        let scd = size_class::descr(class as usize);
        let range = scd.range as usize;
        let meta = SuperPageMeta::shadow_ptr(util::FIRST_SUPER_PAGE[range]);
        loop {
            let n = self.num_super_pages(range);
            let offset = if n != 0 { rand_r(&mut t.rand) as usize % n } else { 0 };
            for i in 0..n {
                let mut idx = i + offset;
                if idx >= n {
                    idx -= n;
                }
                if (*(meta.add(idx) as *const AtomicU8)).load(Ordering::Relaxed) != class {
                    continue;
                }
                let sp = SuperPage::at(range, idx);
                let per = &mut t.per_class[class as usize];
                per.sp = Some(sp);
                if let Some(p) = sp.try_allocate(data_only, scd, &mut per.hint) {
                    return p as *mut u8;
                }
            }
            self.create_super_page(class, scd, &mut t.rand);
            t.per_class[class as usize].hint = 0;
        }
    }

    /// Map the next super-page of the range at its fixed address and
    /// dedicate it to `class`.
    unsafe fn create_super_page(&self, class: u8, scd: SizeClassDescr, rand: &mut u32) {
        let _guard = self.mu.lock_scope();
        let range = scd.range as usize;
        let sp = SuperPage::at(range, self.num_super_pages(range));
        let prot = libc::PROT_READ | libc::PROT_WRITE | mte::prot_flags();
        if !platform::map_fixed(sp.base(), SUPER_PAGE_SIZE, prot, config::use_aliases()) {
            util::report_and_abort("out of memory mapping a super-page");
        }
        if config::use_aliases() {
            // One extra mapping of the same backing per non-zero tag,
            // spaced by the reservation size.
            for tag in 1..16usize {
                let alias = sp.base() + tag * ALLOCATOR_SIZE;
                if !platform::remap_alias(sp.base(), alias, SUPER_PAGE_SIZE) {
                    util::report_and_abort("alias mapping failed");
                }
            }
        }
        SuperPageMeta::set(sp.base(), class);
        if config::print_sp_alloc() {
            crate::diag!("allocated super-page: sc {}", class);
            sp.print();
        }
        let chunk_size = scd.chunk_size();
        let mut pos = sp.base();
        let end = pos + chunk_size * scd.num_chunks as usize;
        while pos < end {
            tags::set_memory_tag(pos, chunk_size, rand_r(rand) as u8);
            pos += chunk_size;
        }
        self.num_super_pages[range].fetch_add(1, Ordering::Release);
    }

    /// Free `ptr`, routing by ownership and quarantine configuration.
    ///
    /// # Safety
    /// `ptr` must come from this allocator (small or large side).
    pub unsafe fn free(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        if self.owns(ptr) {
            let quarantine_mb = config::quarantine_size_mb();
            if quarantine_mb == 0 {
                self.deallocate(ptr);
            } else {
                self.quarantine_and_maybe_scan(ptr, quarantine_mb << 20);
            }
        } else {
            self.large.deallocate(ptr, config::large_alloc_fence());
        }
    }

    /// Verify the pointer's address tag against the chunk's memory tag and
    /// return the canonical address. A mismatch is a double or invalid
    /// free.
    unsafe fn strip_and_check_tag(&self, ptr: *mut u8) -> usize {
        let addr_tag = tags::address_tag(ptr as usize);
        let p = tags::strip_address_tag(ptr as usize);
        if config::use_shadow() && config::use_aliases() {
            let memory_tag = tags::memory_tag(p) & 15;
            if addr_tag != memory_tag {
                util::report_ptr_and_abort("DoubleFree (stale address tag) on", p);
            }
        }
        p
    }

    /// Immediate free with no quarantine.
    ///
    /// # Safety
    /// `ptr` must be a live small allocation.
    pub unsafe fn deallocate(&self, ptr: *mut u8) {
        let p = self.strip_and_check_tag(ptr);
        SuperPage::containing(p).deallocate(p);
    }

    /// Move a freed chunk into quarantine.
    ///
    /// # Safety
    /// `ptr` must be a live small allocation.
    pub unsafe fn quarantine(&self, ptr: *mut u8) {
        with_thread_state(|t| unsafe { self.quarantine_with(ptr, t) });
    }

    unsafe fn quarantine_with(&self, ptr: *mut u8, t: &mut ThreadState) {
        let p = self.strip_and_check_tag(ptr);
        t.local_quarantine += SuperPage::containing(p).quarantine(p);
    }

    /// Quarantine `ptr`; when the flushed global quarantine exceeds
    /// `max_quarantine` above the previous scan's remainder, run a scan.
    ///
    /// # Safety
    /// `ptr` must be a live small allocation.
    pub unsafe fn quarantine_and_maybe_scan(&self, ptr: *mut u8, max_quarantine: usize) {
        with_thread_state(|t| unsafe {
            self.quarantine_with(ptr, t);
            if t.local_quarantine < LOCAL_QUARANTINE_FLUSH {
                return;
            }
            let total = self
                .bytes_in_quarantine
                .fetch_add(t.local_quarantine, Ordering::Relaxed)
                + t.local_quarantine;
            t.local_quarantine = 0;
            let limit = max_quarantine + self.last_quarantine_bytes.load(Ordering::Relaxed);
            if total > limit {
                let _guard = self.mu.lock_scope();
                // Another thread may have scanned while we waited.
                if self.bytes_in_quarantine.load(Ordering::Relaxed) < limit {
                    return;
                }
                self.scan_locked();
            }
        });
    }

    /// Run a full stop-the-world scan now.
    ///
    /// # Safety
    /// The allocator must be initialized.
    pub unsafe fn scan(&self) {
        let _guard = self.mu.lock_scope();
        self.scan_locked();
    }

    unsafe fn scan_locked(&self) {
        for range in 0..NUM_RANGES {
            self.scan_pos[range].store(0, Ordering::Relaxed);
        }
        let num_threads = self.stop_all_peers();
        self.num_scans.fetch_add(1, Ordering::Relaxed);
        let t1 = util::usec();
        let done_here = self.scan_shard();
        let new_bytes = self.post_scan();
        let t2 = util::usec();
        if config::print_scan() {
            crate::diag!(
                "scan {}: tid {} quarantine {}M => {}M super-pages {} scanned-here {} rss {}M time {}us threads {}",
                self.num_scans.load(Ordering::Relaxed),
                tasks::gettid(),
                self.bytes_in_quarantine.load(Ordering::Relaxed) >> 20,
                new_bytes >> 20,
                self.num_super_pages(0) + self.num_super_pages(1),
                done_here,
                util::rss_bytes() >> 20,
                t2 - t1,
                num_threads
            );
        }
        self.bytes_in_quarantine.store(new_bytes, Ordering::Relaxed);
        self.last_quarantine_bytes.store(new_bytes, Ordering::Relaxed);
    }

    /// Signal every other thread of the process, repeating the enumeration
    /// until no new ids appear so threads spawned mid-scan are caught too.
    unsafe fn stop_all_peers(&self) -> usize {
        let my_tid = tasks::gettid();
        let my_pid = libc::getpid();
        let mut seen = [0 as libc::pid_t; MAX_THREADS];
        let mut num_seen = 1usize;
        seen[0] = my_tid;
        let mut changed = true;
        while changed {
            changed = false;
            tasks::for_each_tid(|tid| {
                if !seen[..num_seen].contains(&tid) {
                    if num_seen >= MAX_THREADS {
                        util::report_and_abort("too many threads to stop");
                    }
                    seen[num_seen] = tid;
                    num_seen += 1;
                    tasks::send_stop_signal(my_pid, tid);
                    changed = true;
                }
            });
        }
        num_seen
    }

    /// Claim and mark shards of super-pages until both ranges are done.
    /// Runs in the coordinator and in every peer's signal handler; the
    /// shared position counter is the only synchronisation. Touches only
    /// atomic bytes and raw loads, so it is async-signal-safe.
    ///
    /// # Safety
    /// The allocator must be initialized.
    pub unsafe fn scan_shard(&self) -> usize {
        let num = [self.num_super_pages(0), self.num_super_pages(1)];
        let region_size = [num[0] * SUPER_PAGE_SIZE, num[1] * SUPER_PAGE_SIZE];
        let mut done = 0;
        for range in 0..NUM_RANGES {
            let n = num[range];
            loop {
                let pos = self.scan_pos[range].fetch_add(SCAN_POS_INCREMENT, Ordering::Relaxed);
                if pos >= n {
                    break;
                }
                let end = (pos + SCAN_POS_INCREMENT).min(n);
                done += end - pos;
                for idx in pos..end {
                    SuperPage::at(range, idx).mark_all_live_pointers(region_size);
                }
            }
        }
        done
    }

    /// Single-threaded post-pass: recycle unreferenced quarantined chunks,
    /// demote marked ones, and recount the surviving quarantine bytes.
    unsafe fn post_scan(&self) -> usize {
        let verbose = config::print_scan();
        let mut new_bytes = 0;
        for range in 0..NUM_RANGES {
            for idx in 0..self.num_super_pages(range) {
                let sp = SuperPage::at(range, idx);
                sp.sweep();
                let still = sp.count_state(QUARANTINED);
                if still != 0 {
                    new_bytes += still * sp.descr().chunk_size();
                }
                if verbose {
                    sp.print();
                }
            }
        }
        new_bytes
    }

    /// Pure pointer-range test on the fixed reservation.
    pub fn owns(&self, ptr: *mut u8) -> bool {
        let p = tags::strip_address_tag(ptr as usize);
        p >= ALLOCATOR_SPACE && p < ALLOCATOR_SPACE + ALLOCATOR_SIZE
    }

    /// Usable size of an allocation (its chunk size).
    ///
    /// # Safety
    /// `ptr` must come from this allocator.
    pub unsafe fn size_of(&self, ptr: *mut u8) -> usize {
        if self.owns(ptr) {
            let p = tags::strip_address_tag(ptr as usize);
            SuperPage::containing(p).descr().chunk_size()
        } else {
            self.large.size_of(ptr)
        }
    }

    /// Allocate-copy-free. Copies through the owner's chunk size.
    ///
    /// # Safety
    /// `ptr` must be null or a live allocation.
    pub unsafe fn reallocate(&self, ptr: *mut u8, new_size: usize) -> *mut u8 {
        if ptr.is_null() {
            return self.allocate(new_size);
        }
        let old_size = self.size_of(ptr);
        let new_ptr = self.allocate(new_size);
        core::ptr::copy_nonoverlapping(ptr, new_ptr, new_size.min(old_size));
        self.free(ptr);
        new_ptr
    }

    /// Aligned allocation. Up to MIN_ALIGN is free; up to one super-page
    /// is served by a size class whose chunk size is a multiple of the
    /// alignment; anything larger is unsupported.
    ///
    /// # Safety
    /// The allocator must be initialized.
    pub unsafe fn allocate_aligned(&self, align: usize, size: usize) -> *mut u8 {
        if !align.is_power_of_two() {
            util::report_and_abort("alignment must be a power of two");
        }
        if align <= MIN_ALIGN {
            return self.allocate(size);
        }
        if align > SUPER_PAGE_SIZE {
            util::report_and_abort("alignment above one super-page is unsupported");
        }
        if size <= MAX_SMALL_SIZE {
            if let Some((class, scd)) = size_class::resolve_aligned(align, size) {
                return self.allocate_class(class, scd);
            }
        }
        if align <= PAGE_SIZE {
            with_thread_state(|t| t.stats.large_allocs += 1);
            return self.large.allocate(size);
        }
        util::report_and_abort("no size class satisfies the requested alignment");
    }

    /// Enter (+1) or leave (-1) a data-only scope.
    pub fn data_only_scope(&self, delta: i32) {
        match delta {
            1 => {
                self.data_only_depth.fetch_add(1, Ordering::Relaxed);
            }
            -1 => {
                if self.data_only_depth.fetch_sub(1, Ordering::Relaxed) == 0 {
                    util::report_and_abort("data-only scope underflow");
                }
            }
            _ => util::report_and_abort("data-only scope delta must be +1 or -1"),
        }
    }

    /// Instrumentation hook: count an access to `ptr`.
    ///
    /// # Safety
    /// The allocator must be initialized.
    pub unsafe fn note_access(&self, ptr: *mut u8) {
        if self.owns(ptr) {
            let p = tags::strip_address_tag(ptr as usize);
            let class = SuperPage::containing(p).class() as usize;
            with_thread_state(|t| t.stats.accesses_per_class[class] += 1);
        } else {
            with_thread_state(|t| t.stats.access_other += 1);
        }
    }

    /// Body of the release-to-OS thread: wake every configured interval
    /// and try to release one super-page, round-robin across both ranges.
    ///
    /// # Safety
    /// Runs on its own thread after init.
    pub unsafe fn release_loop(&self) -> ! {
        let mut iter = 0usize;
        let mut cursor = [0usize; NUM_RANGES];
        loop {
            libc::usleep((1000 * config::release_freq_ms().max(1)) as libc::c_uint);
            let range = iter % NUM_RANGES;
            iter = iter.wrapping_add(1);
            let n = self.num_super_pages(range);
            if n == 0 {
                continue;
            }
            SuperPage::at(range, cursor[range] % n).maybe_release_to_os();
            cursor[range] = cursor[range].wrapping_add(1);
        }
    }

    /// Merge the calling thread's counters and print everything.
    pub fn print_all(&self) {
        crate::diag!(
            "rss {}M super-pages {{{} {}}}",
            util::rss_bytes() >> 20,
            self.num_super_pages(0),
            self.num_super_pages(1)
        );
        with_thread_state(|t| {
            self.stats.merge_from(&t.stats);
            t.stats.clear();
        });
        self.stats.print();
    }
}
