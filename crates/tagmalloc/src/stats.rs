//! Allocation statistics. Counters accumulate per thread without atomics
//! and merge into the process-wide table when the thread exits (or at
//! print time for the calling thread).

use crate::size_class::{self, NUM_SIZE_CLASSES};
use core::sync::atomic::{AtomicU64, Ordering};

pub struct GlobalStats {
    allocs_per_class: [AtomicU64; NUM_SIZE_CLASSES],
    accesses_per_class: [AtomicU64; NUM_SIZE_CLASSES],
    large_allocs: AtomicU64,
    access_other: AtomicU64,
}

impl GlobalStats {
    pub const fn new() -> Self {
        const ZERO: AtomicU64 = AtomicU64::new(0);
        GlobalStats {
            allocs_per_class: [ZERO; NUM_SIZE_CLASSES],
            accesses_per_class: [ZERO; NUM_SIZE_CLASSES],
            large_allocs: AtomicU64::new(0),
            access_other: AtomicU64::new(0),
        }
    }

    pub fn merge_from(&self, from: &ThreadStats) {
        for i in 0..NUM_SIZE_CLASSES {
            if from.allocs_per_class[i] != 0 {
                self.allocs_per_class[i].fetch_add(from.allocs_per_class[i], Ordering::Relaxed);
            }
            if from.accesses_per_class[i] != 0 {
                self.accesses_per_class[i].fetch_add(from.accesses_per_class[i], Ordering::Relaxed);
            }
        }
        self.large_allocs.fetch_add(from.large_allocs, Ordering::Relaxed);
        self.access_other.fetch_add(from.access_other, Ordering::Relaxed);
    }

    pub fn print(&self) {
        for i in 0..NUM_SIZE_CLASSES {
            let allocs = self.allocs_per_class[i].load(Ordering::Relaxed);
            if allocs != 0 {
                crate::diag!(
                    "stat.allocs sc {} size {} count {}",
                    i,
                    size_class::descr(i).chunk_size(),
                    allocs
                );
            }
        }
        let large = self.large_allocs.load(Ordering::Relaxed);
        if large != 0 {
            crate::diag!("stat.large_allocs {}", large);
        }
        for i in 0..NUM_SIZE_CLASSES {
            let accesses = self.accesses_per_class[i].load(Ordering::Relaxed);
            if accesses != 0 {
                crate::diag!(
                    "stat.accesses sc {} size {} count {}",
                    i,
                    size_class::descr(i).chunk_size(),
                    accesses
                );
            }
        }
        let other = self.access_other.load(Ordering::Relaxed);
        if other != 0 {
            crate::diag!("stat.access_other {}", other);
        }
    }
}

#[derive(Clone)]
pub struct ThreadStats {
    pub allocs_per_class: [u64; NUM_SIZE_CLASSES],
    pub accesses_per_class: [u64; NUM_SIZE_CLASSES],
    pub large_allocs: u64,
    pub access_other: u64,
}

impl ThreadStats {
    pub const fn new() -> Self {
        ThreadStats {
            allocs_per_class: [0; NUM_SIZE_CLASSES],
            accesses_per_class: [0; NUM_SIZE_CLASSES],
            large_allocs: 0,
            access_other: 0,
        }
    }

    pub fn clear(&mut self) {
        *self = ThreadStats::new();
    }
}
