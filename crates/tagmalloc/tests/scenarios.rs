//! End-to-end scenarios that need a controlled environment: specific
//! config switches, a pristine allocator, or an expected abort.
//!
//! Each scenario re-executes this test binary with `TAGMALLOC_SCENARIO`
//! set (config is read from the environment once at process init, so a
//! fresh process is the only way to vary it). Abort scenarios assert on
//! the child's exit status and stderr.

use std::collections::HashSet;
use std::process::Command;

use tagmalloc::allocator::thread_state;
use tagmalloc::allocator::Allocator;
use tagmalloc::init;
use tagmalloc::util::{FIRST_SUPER_PAGE, SUPER_PAGE_SIZE};

unsafe fn alloc() -> &'static Allocator {
    init::ensure_initialized();
    init::allocator()
}

/// Pointers parked in test containers are stored XOR-masked so the
/// conservative scan cannot see them as live references.
const PTR_MASK: usize = 0xA5A5_A5A5_A5A5_A5A5;

fn run_scenario(name: &str, envs: &[(&str, &str)]) -> std::process::Output {
    let exe = std::env::current_exe().expect("cannot determine test binary path");
    let mut cmd = Command::new(&exe);
    cmd.env("TAGMALLOC_SCENARIO", name)
        .env("RUST_TEST_THREADS", "1")
        .arg("--exact")
        .arg("scenario_driver")
        .arg("--nocapture");
    for (k, v) in envs {
        cmd.env(k, v);
    }
    cmd.output().expect("failed to spawn scenario subprocess")
}

fn expect_ok(name: &str, envs: &[(&str, &str)]) {
    let output = run_scenario(name, envs);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        output.status.success(),
        "scenario '{}' failed.\nstdout:\n{}\nstderr:\n{}",
        name,
        stdout,
        stderr
    );
}

fn expect_abort(name: &str, envs: &[(&str, &str)], expected_msg: &str) {
    let output = run_scenario(name, envs);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        !output.status.success(),
        "scenario '{}' should have aborted. stderr:\n{}",
        name,
        stderr
    );
    assert!(
        stderr.contains(expected_msg),
        "scenario '{}' stderr does not contain '{}'. Full stderr:\n{}",
        name,
        expected_msg,
        stderr
    );
}

// ---------------------------------------------------------------------------
// Scenario driver: in the child process, run the requested scenario.
// ---------------------------------------------------------------------------

#[test]
fn scenario_driver() {
    let scenario = match std::env::var("TAGMALLOC_SCENARIO") {
        Ok(s) => s,
        Err(_) => return, // Not a subprocess invocation.
    };

    match scenario.as_str() {
        "double_free" => scenario_double_free(),
        "double_quarantine" => scenario_double_quarantine(),
        "alias_tag_mismatch" => scenario_alias_tag_mismatch(),
        "unique_allocations" => scenario_unique_allocations(),
        "first_placement" => scenario_first_placement(),
        "quarantine_scan" => scenario_quarantine_scan(),
        "probabilistic_quarantine" => scenario_probabilistic_quarantine(),
        "threads_stress" => scenario_threads_stress(),
        "release_to_os" => scenario_release_to_os(),
        _ => panic!("unknown scenario: {}", scenario),
    }
}

fn scenario_double_free() {
    unsafe {
        let a = alloc();
        let p = a.allocate(42);
        a.free(p);
        a.free(p);
    }
    unreachable!("double free was not detected");
}

fn scenario_double_quarantine() {
    unsafe {
        let a = alloc();
        let p = a.allocate(66);
        a.quarantine(p);
        a.quarantine(p);
    }
    unreachable!("double quarantine was not detected");
}

/// With shadow tags and aliased pointers, the second free no longer
/// matches the chunk's bumped memory tag.
fn scenario_alias_tag_mismatch() {
    unsafe {
        let a = alloc();
        let p = a.allocate(128);
        a.free(p);
        a.free(p);
    }
    unreachable!("stale address tag was not detected");
}

/// S1: 10,000 distinct pointers; after freeing, the same pointer values
/// come back eventually.
fn scenario_unique_allocations() {
    unsafe {
        let a = alloc();
        let n = 10_000usize;
        let mut originals: HashSet<usize> = HashSet::with_capacity(n);
        for i in 0..n {
            let size = i + 8;
            let p = a.allocate(size);
            core::ptr::write_bytes(p, 0x42, size);
            assert!(originals.insert(p as usize), "duplicate pointer from allocate");
        }
        // Build the bookkeeping containers before freeing so their own
        // storage cannot claim one of the original chunks afterwards.
        let mut remaining_sizes: Vec<usize> = (0..n).map(|i| i + 8).collect();
        let mut recovered: HashSet<usize> = HashSet::with_capacity(2 * n);

        for &p in &originals {
            a.free(p as *mut u8);
        }

        let mut attempts = 0usize;
        while !remaining_sizes.is_empty() {
            remaining_sizes.retain(|&size| {
                attempts += 1;
                let p = unsafe { a.allocate(size) } as usize;
                if originals.contains(&p) && !recovered.contains(&p) {
                    recovered.insert(p);
                    false
                } else {
                    // Keep the miss allocated so full super-pages push the
                    // search toward the remaining originals.
                    true
                }
            });
            assert!(
                attempts < 200_000,
                "original pointers did not reappear: {} of {} recovered",
                recovered.len(),
                n
            );
        }
        assert_eq!(recovered.len(), n);
    }
}

/// S4: a fresh super-page of a class hands out its chunks in index order
/// from the super-page base, and the class moves exactly one super-page
/// up once it is full.
fn scenario_first_placement() {
    unsafe {
        let a = alloc();
        let size = 1usize << 15;
        assert_eq!(SUPER_PAGE_SIZE / size, 16);

        // The runtime may have touched this class already (the allocator
        // serves the whole process); drain any partial super-pages until
        // an allocation opens a fresh one at the end of range 1.
        let mut first = 0usize;
        for _ in 0..64 {
            let expected = FIRST_SUPER_PAGE[1] + a.num_super_pages(1) * SUPER_PAGE_SIZE;
            let p = a.allocate(size) as usize;
            if p == expected {
                first = p;
                break;
            }
        }
        assert_ne!(first, 0, "no allocation opened a fresh super-page");
        assert_eq!(first % SUPER_PAGE_SIZE, 0);

        for i in 1..16 {
            let p = a.allocate(size) as usize;
            assert_eq!(p, first + i * size, "allocation {} misplaced", i);
        }
        for i in 0..16 {
            let p = a.allocate(size) as usize;
            assert_eq!(
                p,
                first + SUPER_PAGE_SIZE + i * size,
                "allocation {} not one super-page later",
                16 + i
            );
        }

        let n0 = a.num_super_pages(0);
        let small = a.allocate(16) as usize;
        if n0 == 0 {
            // Pristine heap: the very first small chunk sits at the base
            // of range 0.
            assert_eq!(small, FIRST_SUPER_PAGE[0]);
        } else {
            assert!(small >= FIRST_SUPER_PAGE[0] && small < FIRST_SUPER_PAGE[1]);
            assert_eq!(small % 16, 0);
        }
    }
}

/// S3 plus the quarantine accounting law: after a scan the global counter
/// equals the bytes still quarantined, and a chunk stays quarantined
/// exactly as long as a live pointer references it.
fn scenario_quarantine_scan() {
    unsafe {
        let a = alloc();

        // Phase 1: quarantine a crowd with no live references.
        let n = 5_000usize;
        let mut masked: Vec<usize> = Vec::with_capacity(n);
        let mut total_rounded = 0usize;
        for i in 0..n {
            let size = i + 8;
            let p = a.allocate(size);
            core::ptr::write_bytes(p, 0x42, size);
            total_rounded += a.size_of(p);
            masked.push(p as usize ^ PTR_MASK);
        }
        for &m in &masked {
            a.quarantine((m ^ PTR_MASK) as *mut u8);
        }
        assert_eq!(thread_state::local_quarantine_bytes(), total_rounded);

        a.scan();
        assert_eq!(a.bytes_in_quarantine(), 0, "unreferenced chunks must recycle");

        // Phase 2: one live reference keeps exactly one chunk quarantined.
        let p1 = a.allocate(100) as *mut usize;
        // Clear residue so the only pointer this chunk holds is the one
        // written below.
        core::ptr::write_bytes(p1 as *mut u8, 0, a.size_of(p1 as *mut u8));
        let p2 = a.allocate(1000);
        assert_eq!(a.size_of(p2), 1024);
        p1.write(p2 as usize);

        let filler_sizes = [2304usize, 2688, 2816, 3200, 3456, 3584];
        let mut fillers: Vec<usize> = Vec::with_capacity(3_000);
        for i in 0..3_000 {
            let size = filler_sizes[i % filler_sizes.len()];
            let p = a.allocate(size);
            core::ptr::write_bytes(p, 0x42, size);
            fillers.push(p as usize ^ PTR_MASK);
        }
        for &m in &fillers {
            a.quarantine((m ^ PTR_MASK) as *mut u8);
        }
        a.quarantine(p2);

        a.scan();
        assert_eq!(
            a.bytes_in_quarantine(),
            1024,
            "only the chunk referenced from *p1 may survive"
        );

        // Drop the reference; the survivor recycles on the next scan.
        p1.write(0xDEAD_BEEF);
        a.scan();
        assert_eq!(a.bytes_in_quarantine(), 0);

        // Phase 3: a reference held only in a data-only chunk is not a
        // root and keeps nothing alive.
        a.data_only_scope(1);
        let opaque = a.allocate(100) as *mut usize;
        a.data_only_scope(-1);
        let p3 = a.allocate(1000);
        opaque.write(p3 as usize);
        a.quarantine(p3);
        a.scan();
        assert_eq!(
            a.bytes_in_quarantine(),
            0,
            "data-only chunks must be skipped by the root scan"
        );
    }
}

/// With a 4-bit tag, a freed chunk whose fresh tag is non-zero skips
/// quarantine entirely; only ~1/16 of frees quarantine.
fn scenario_probabilistic_quarantine() {
    unsafe {
        let a = alloc();
        let count = 4096usize;
        let size = 1024usize;
        let mut masked: Vec<usize> = Vec::with_capacity(count);
        for _ in 0..count {
            masked.push(a.allocate(size) as usize ^ PTR_MASK);
        }
        for &m in &masked {
            a.quarantine((m ^ PTR_MASK) as *mut u8);
        }
        let quarantined = thread_state::local_quarantine_bytes();
        let total = count * size;
        assert!(quarantined > 0, "some frees must still hit quarantine");
        assert!(
            quarantined < total / 4,
            "most frees must skip quarantine: {} of {} bytes quarantined",
            quarantined,
            total
        );
    }
}

/// S5: two threads allocate, fill with a derived hash, verify, and
/// quarantine 100,000 chunks each; the threshold logic must fire scans.
fn scenario_threads_stress() {
    fn hash_word(seed: usize, word_index: usize) -> usize {
        let mut x = (seed ^ word_index).wrapping_mul(0x9E37_79B9_7F4A_7C15) as u64;
        x ^= x >> 30;
        x = x.wrapping_mul(0xBF58_476D_1CE4_E5B9);
        x ^= x >> 27;
        x as usize
    }

    fn worker(a: &'static Allocator) {
        for i in 0..100_000usize {
            unsafe {
                let size = 16 + 8 * (i % 2040);
                let p = a.allocate(size) as *mut usize;
                let words = size / core::mem::size_of::<usize>();
                for j in 0..words {
                    p.add(j).write(hash_word(p as usize, j));
                }
                for j in 0..words {
                    assert_eq!(p.add(j).read(), hash_word(p as usize, j), "heap corruption");
                }
                a.quarantine_and_maybe_scan(p as *mut u8, 1 << 28);
            }
        }
    }

    let a = unsafe { alloc() };
    let t1 = std::thread::spawn(move || worker(a));
    let t2 = std::thread::spawn(move || worker(a));
    t1.join().expect("worker 1 panicked");
    t2.join().expect("worker 2 panicked");
    assert!(
        a.num_scans() > 5,
        "expected more than five scans, got {}",
        a.num_scans()
    );
}

/// S6: after freeing everything, the release thread returns the physical
/// pages and RSS falls back to near its pre-test level.
fn scenario_release_to_os() {
    unsafe {
        let a = alloc();
        let pre_rss = tagmalloc::util::rss_bytes();

        let size = 4096usize;
        let count = (64 << 20) / size;
        let mut held: Vec<usize> = Vec::with_capacity(count);
        for _ in 0..count {
            let p = a.allocate(size);
            core::ptr::write_bytes(p, 0x42, size);
            held.push(p as usize ^ PTR_MASK);
        }
        let mid_rss = tagmalloc::util::rss_bytes();
        assert!(
            mid_rss >= pre_rss + (56 << 20),
            "expected at least 56M of new RSS, got {}M",
            (mid_rss - pre_rss) >> 20
        );
        for &m in &held {
            a.free((m ^ PTR_MASK) as *mut u8);
        }
        drop(held);

        // The release thread wakes every millisecond and visits one
        // super-page per wake; give it time to cover them all.
        std::thread::sleep(std::time::Duration::from_millis(4_000));

        let post_rss = tagmalloc::util::rss_bytes();
        assert!(
            post_rss < pre_rss + (16 << 20),
            "resident set did not drop: pre {}M mid {}M post {}M",
            pre_rss >> 20,
            mid_rss >> 20,
            post_rss >> 20
        );
    }
}

// ---------------------------------------------------------------------------
// Parent-side tests
// ---------------------------------------------------------------------------

#[test]
fn double_free_aborts() {
    expect_abort("double_free", &[], "DoubleFree");
}

#[test]
fn double_quarantine_aborts() {
    expect_abort("double_quarantine", &[], "DoubleFree");
}

#[test]
fn alias_tag_mismatch_aborts() {
    expect_abort(
        "alias_tag_mismatch",
        &[
            ("TAGMALLOC_USE_SHADOW", "1"),
            ("TAGMALLOC_USE_ALIASES", "1"),
            ("TAGMALLOC_USE_TAG", "1"),
        ],
        "DoubleFree",
    );
}

#[test]
fn unique_allocations_recycle() {
    expect_ok("unique_allocations", &[]);
}

#[test]
fn first_allocation_placement() {
    expect_ok("first_placement", &[]);
}

#[test]
fn quarantine_survives_via_live_pointer() {
    expect_ok("quarantine_scan", &[]);
}

#[test]
fn narrow_tag_quarantine_is_probabilistic() {
    expect_ok(
        "probabilistic_quarantine",
        &[("TAGMALLOC_USE_SHADOW", "1"), ("TAGMALLOC_USE_TAG", "1")],
    );
}

#[test]
fn two_thread_stress_fires_scans() {
    expect_ok("threads_stress", &[]);
}

#[test]
fn release_thread_returns_pages() {
    expect_ok("release_to_os", &[("TAGMALLOC_RELEASE_FREQ", "1")]);
}
