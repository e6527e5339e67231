//! One-time process initialisation: configuration, descriptor tables, the
//! fixed reservations and shadows, the stop-signal handler, and the
//! release thread.

use crate::allocator::Allocator;
use crate::config;
use crate::platform::{self, tasks};
use crate::size_class;
use crate::super_page::{SecondRangeState, SuperPageMeta};
use crate::tags;
use crate::util::{self, ALLOCATOR_SIZE, ALLOCATOR_SPACE};
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU8, Ordering};

const UNINIT: u8 = 0;
const INITIALIZING: u8 = 1;
const READY: u8 = 2;

static INIT_STATE: AtomicU8 = AtomicU8::new(UNINIT);

struct AllocatorHolder(UnsafeCell<Allocator>);
unsafe impl Sync for AllocatorHolder {}

static ALLOCATOR: AllocatorHolder = AllocatorHolder(UnsafeCell::new(Allocator::new()));

/// Library constructor: initialise before main so the C ABI entry points
/// are ready for the first caller.
#[used]
#[cfg_attr(target_os = "linux", link_section = ".init_array")]
static CTOR: unsafe extern "C" fn() = {
    unsafe extern "C" fn init() {
        tagmalloc_init();
    }
    init
};

/// Initialise the allocator exactly once; concurrent callers spin until
/// the winner finishes.
pub unsafe fn tagmalloc_init() {
    match INIT_STATE.compare_exchange(UNINIT, INITIALIZING, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => {}
        Err(INITIALIZING) => {
            while INIT_STATE.load(Ordering::Acquire) == INITIALIZING {
                core::hint::spin_loop();
            }
            return;
        }
        Err(_) => return,
    }

    config::read_config();
    size_class::init_descriptors();

    // The whole reservation starts inaccessible; super-pages are remapped
    // read-write one by one. Shared when aliasing so mremap can duplicate
    // the backing.
    if !platform::map_fixed(
        ALLOCATOR_SPACE,
        ALLOCATOR_SIZE,
        libc::PROT_NONE,
        config::use_aliases(),
    ) {
        util::report_and_abort("cannot reserve the allocator address space");
    }
    SuperPageMeta::init();
    SecondRangeState::init();
    tags::init();

    if config::handle_stop_signal() {
        platform::install_signal_handler(tasks::STOP_SIGNAL, scan_signal_handler);
    }
    if config::print_stats() {
        libc::atexit(print_stats_at_exit);
    }

    INIT_STATE.store(READY, Ordering::Release);

    if config::release_freq_ms() > 0 && !platform::spawn_detached(release_thread_main) {
        util::report_and_abort("cannot spawn the release thread");
    }
}

#[inline(always)]
pub fn ensure_initialized() {
    if INIT_STATE.load(Ordering::Acquire) != READY {
        init_slow();
    }
}

#[cold]
#[inline(never)]
fn init_slow() {
    unsafe { tagmalloc_init() }
}

#[inline(always)]
pub fn allocator() -> &'static Allocator {
    unsafe { &*ALLOCATOR.0.get() }
}

#[inline(always)]
pub fn is_ready() -> bool {
    INIT_STATE.load(Ordering::Acquire) == READY
}

/// Runs in every peer when the scan coordinator signals it; only touches
/// atomic bytes and raw loads.
extern "C" fn scan_signal_handler(
    _signum: libc::c_int,
    _info: *mut libc::siginfo_t,
    _ctx: *mut libc::c_void,
) {
    if is_ready() {
        unsafe {
            allocator().scan_shard();
        }
    }
}

extern "C" fn release_thread_main(_arg: *mut libc::c_void) -> *mut libc::c_void {
    unsafe { allocator().release_loop() }
}

extern "C" fn print_stats_at_exit() {
    allocator().print_all();
}
