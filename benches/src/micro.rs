//! Micro-benchmarks for the allocator hot paths: per-operation latency of
//! allocate/free cycles across the size-class spectrum, plus the
//! allocate-quarantine cycle that exercises the tag store.

use std::hint::black_box;
use std::time::Instant;

use tagmalloc::init;

fn bench_allocate_free(size: usize, iterations: usize) -> f64 {
    let a = init::allocator();
    unsafe {
        for _ in 0..1000 {
            let p = a.allocate(black_box(size));
            std::ptr::write_bytes(p, 0xAB, size.min(64));
            a.free(black_box(p));
        }
        let start = Instant::now();
        for _ in 0..iterations {
            let p = a.allocate(black_box(size));
            std::ptr::write_bytes(p, 0xAB, size.min(64));
            a.free(black_box(p));
        }
        start.elapsed().as_nanos() as f64 / iterations as f64
    }
}

fn bench_allocate_quarantine(size: usize, iterations: usize) -> f64 {
    let a = init::allocator();
    unsafe {
        let start = Instant::now();
        for _ in 0..iterations {
            let p = a.allocate(black_box(size));
            a.quarantine_and_maybe_scan(black_box(p), 1 << 28);
        }
        start.elapsed().as_nanos() as f64 / iterations as f64
    }
}

fn main() {
    init::ensure_initialized();

    println!("size,allocate_free_ns,allocate_quarantine_ns");
    for size in [16usize, 64, 256, 1024, 4096, 16384, 65536] {
        let af = bench_allocate_free(size, 200_000);
        let aq = bench_allocate_quarantine(size, 50_000);
        println!("{},{:.1},{:.1}", size, af, aq);
    }
}
