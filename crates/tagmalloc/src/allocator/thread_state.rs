//! Per-thread allocator state: the PRNG for probe randomisation, the local
//! quarantine counter, and for each size class the favourite super-page
//! plus the rotating search hint. A pthread TSD destructor merges the
//! thread's statistics into the global table on exit.

use crate::size_class::NUM_SIZE_CLASSES;
use crate::stats::ThreadStats;
use crate::super_page::SuperPage;
use core::cell::RefCell;
use core::sync::atomic::{AtomicU8, Ordering};

#[derive(Clone, Copy)]
pub struct PerClass {
    /// Currently favoured super-page for this class.
    pub sp: Option<SuperPage>,
    /// Start position for the next state-array search.
    pub hint: usize,
}

pub struct ThreadState {
    /// Zero until the thread's first slow-path allocation.
    pub rand: u32,
    /// Bytes quarantined since the last flush into the global counter.
    pub local_quarantine: usize,
    pub per_class: [PerClass; NUM_SIZE_CLASSES],
    pub stats: ThreadStats,
}

impl ThreadState {
    pub const fn new() -> Self {
        const EMPTY: PerClass = PerClass { sp: None, hint: 0 };
        ThreadState {
            rand: 0,
            local_quarantine: 0,
            per_class: [EMPTY; NUM_SIZE_CLASSES],
            stats: ThreadStats::new(),
        }
    }
}

/// ANSI C linear congruential generator.
#[inline(always)]
pub fn rand_r(state: &mut u32) -> u32 {
    let new_state = state.wrapping_mul(1103515245).wrapping_add(12345);
    *state = new_state;
    new_state >> 16
}

thread_local! {
    static TLS: RefCell<ThreadState> = const { RefCell::new(ThreadState::new()) };
}

/// Run `f` against this thread's state. Falls back to a scratch state when
/// the TLS slot is unavailable (thread teardown, or re-entry during TLS
/// initialisation); the scratch state's statistics are merged immediately.
#[inline]
pub fn with_thread_state<R>(f: impl FnOnce(&mut ThreadState) -> R) -> R {
    let mut f = Some(f);
    let result = TLS.try_with(|cell| match cell.try_borrow_mut() {
        Ok(mut state) => Some((f.take().unwrap())(&mut state)),
        Err(_) => None,
    });
    match result {
        Ok(Some(r)) => r,
        _ => {
            let mut scratch = ThreadState::new();
            let r = (f.take().unwrap())(&mut scratch);
            crate::init::allocator().stats().merge_from(&scratch.stats);
            r
        }
    }
}

/// Bytes this thread has quarantined since its last flush into the global
/// counter. Exposed for the test suite.
pub fn local_quarantine_bytes() -> usize {
    with_thread_state(|t| t.local_quarantine)
}

static TSD_KEY_STATE: AtomicU8 = AtomicU8::new(0);
static mut TSD_KEY: libc::pthread_key_t = 0;

unsafe extern "C" fn on_thread_exit(_value: *mut libc::c_void) {
    // The TLS slot may already be gone; skip the merge in that case.
    let _ = TLS.try_with(|cell| {
        if let Ok(mut state) = cell.try_borrow_mut() {
            crate::init::allocator().stats().merge_from(&state.stats);
            state.stats.clear();
        }
    });
}

/// Register this thread for the exit-time statistics merge. Idempotent.
pub fn register_thread() {
    unsafe {
        match TSD_KEY_STATE.compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => {
                let key_ptr = core::ptr::addr_of_mut!(TSD_KEY);
                if libc::pthread_key_create(key_ptr, Some(on_thread_exit)) != 0 {
                    crate::util::report_and_abort("pthread_key_create failed");
                }
                TSD_KEY_STATE.store(2, Ordering::Release);
            }
            Err(1) => {
                while TSD_KEY_STATE.load(Ordering::Acquire) == 1 {
                    core::hint::spin_loop();
                }
            }
            Err(_) => {}
        }
        // Any non-null value arms the destructor for this thread.
        libc::pthread_setspecific(TSD_KEY, 32 as *mut libc::c_void);
    }
}
