//! Runtime feature switches, each sourced from an environment variable.
//! Read once during init (single-threaded), cached in atomics afterwards.

use core::sync::atomic::{AtomicU8, Ordering};

static PRINT_STATS: AtomicU8 = AtomicU8::new(0);
static PRINT_SP_ALLOC: AtomicU8 = AtomicU8::new(0);
static PRINT_SCAN: AtomicU8 = AtomicU8::new(0);
static LARGE_ALLOC_FENCE: AtomicU8 = AtomicU8::new(1);
static LARGE_ALLOC_VERBOSE: AtomicU8 = AtomicU8::new(0);
/// 0: no tag, 1: 4-bit tag, 2: 8-bit tag.
static USE_TAG: AtomicU8 = AtomicU8::new(0);
static USE_SHADOW: AtomicU8 = AtomicU8::new(0);
static USE_ALIASES: AtomicU8 = AtomicU8::new(0);
/// Quarantine growth over the last-scan baseline, in MiB. 0 disables.
static QUARANTINE_SIZE: AtomicU8 = AtomicU8::new(0);
static HANDLE_STOP_SIGNAL: AtomicU8 = AtomicU8::new(1);
/// Release-to-OS period in milliseconds. 0 disables the release thread.
static RELEASE_FREQ: AtomicU8 = AtomicU8::new(0);

/// Read all switches from the environment.
///
/// # Safety
/// Calls libc::getenv, so must run from a single-threaded context (init).
pub unsafe fn read_config() {
    PRINT_STATS.store(env_to_long(b"TAGMALLOC_PRINT_STATS\0", 0, 0, 1) as u8, Ordering::Relaxed);
    PRINT_SP_ALLOC.store(
        env_to_long(b"TAGMALLOC_PRINT_SP_ALLOC\0", 0, 0, 1) as u8,
        Ordering::Relaxed,
    );
    PRINT_SCAN.store(env_to_long(b"TAGMALLOC_PRINT_SCAN\0", 0, 0, 1) as u8, Ordering::Relaxed);
    LARGE_ALLOC_FENCE.store(
        env_to_long(b"TAGMALLOC_LARGE_ALLOC_FENCE\0", 1, 0, 1) as u8,
        Ordering::Relaxed,
    );
    LARGE_ALLOC_VERBOSE.store(
        env_to_long(b"TAGMALLOC_LARGE_ALLOC_VERBOSE\0", 0, 0, 1) as u8,
        Ordering::Relaxed,
    );
    USE_TAG.store(env_to_long(b"TAGMALLOC_USE_TAG\0", 0, 0, 2) as u8, Ordering::Relaxed);
    USE_SHADOW.store(env_to_long(b"TAGMALLOC_USE_SHADOW\0", 0, 0, 1) as u8, Ordering::Relaxed);
    USE_ALIASES.store(env_to_long(b"TAGMALLOC_USE_ALIASES\0", 0, 0, 1) as u8, Ordering::Relaxed);
    QUARANTINE_SIZE.store(
        env_to_long(b"TAGMALLOC_QUARANTINE_SIZE\0", 0, 0, 255) as u8,
        Ordering::Relaxed,
    );
    HANDLE_STOP_SIGNAL.store(
        env_to_long(b"TAGMALLOC_HANDLE_STOP_SIGNAL\0", 1, 0, 1) as u8,
        Ordering::Relaxed,
    );
    RELEASE_FREQ.store(
        env_to_long(b"TAGMALLOC_RELEASE_FREQ\0", 0, 0, 255) as u8,
        Ordering::Relaxed,
    );
}

pub fn print_stats() -> bool {
    PRINT_STATS.load(Ordering::Relaxed) != 0
}

pub fn print_sp_alloc() -> bool {
    PRINT_SP_ALLOC.load(Ordering::Relaxed) != 0
}

pub fn print_scan() -> bool {
    PRINT_SCAN.load(Ordering::Relaxed) != 0
}

pub fn large_alloc_fence() -> bool {
    LARGE_ALLOC_FENCE.load(Ordering::Relaxed) != 0
}

pub fn large_alloc_verbose() -> bool {
    LARGE_ALLOC_VERBOSE.load(Ordering::Relaxed) != 0
}

pub fn use_tag() -> u8 {
    USE_TAG.load(Ordering::Relaxed)
}

pub fn use_shadow() -> bool {
    USE_SHADOW.load(Ordering::Relaxed) != 0
}

pub fn use_aliases() -> bool {
    USE_ALIASES.load(Ordering::Relaxed) != 0
}

pub fn quarantine_size_mb() -> usize {
    QUARANTINE_SIZE.load(Ordering::Relaxed) as usize
}

pub fn handle_stop_signal() -> bool {
    HANDLE_STOP_SIGNAL.load(Ordering::Relaxed) != 0
}

pub fn release_freq_ms() -> usize {
    RELEASE_FREQ.load(Ordering::Relaxed) as usize
}

/// Parse an environment variable as a decimal integer, clamped to
/// [min, max]. Parses by hand: no allocation.
///
/// # Safety
/// Calls libc::getenv.
unsafe fn env_to_long(key: &[u8], default: i64, min: i64, max: i64) -> i64 {
    let val = libc::getenv(key.as_ptr() as *const libc::c_char);
    if val.is_null() {
        return default;
    }
    let mut result: i64 = 0;
    let mut ptr = val as *const u8;
    loop {
        let byte = *ptr;
        if !byte.is_ascii_digit() {
            break;
        }
        result = result.saturating_mul(10).saturating_add((byte - b'0') as i64);
        ptr = ptr.add(1);
    }
    result.clamp(min, max)
}
