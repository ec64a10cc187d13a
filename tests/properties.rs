//! Property-style tests for invariants that are specific to this allocator's
//! design rather than general alloc/dealloc correctness (covered by
//! `stress.rs` and `alignment.rs`).

use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::alloc::{GlobalAlloc, Layout};
use tieralloc::TieredAlloc;

#[global_allocator]
static GLOBAL: TieredAlloc = TieredAlloc;

/// Boundary sizes: one below, at, and one above each size-class band edge.
#[test]
fn boundary_size_sweep() {
    let edges = [128usize, 1024, 8192, 65536, 262144];
    for &edge in &edges {
        for &size in &[edge - 1, edge, edge + 1] {
            if size == 0 {
                continue;
            }
            let layout = Layout::from_size_align(size, 8).unwrap();
            let ptr = unsafe { GLOBAL.alloc(layout) };
            assert!(!ptr.is_null(), "alloc failed at boundary size {size}");
            unsafe { ptr.write_bytes(0x5A, size) };
            unsafe { GLOBAL.dealloc(ptr, layout) };
        }
    }
}

/// Requests above the largest size class go straight through the page cache.
#[test]
fn large_allocation_path() {
    for &size in &[262145usize, 1 << 20, 4 << 20] {
        let layout = Layout::from_size_align(size, 8).unwrap();
        let ptr = unsafe { GLOBAL.alloc(layout) };
        assert!(!ptr.is_null(), "large alloc failed for size {size}");
        unsafe { ptr.write_bytes(0x7E, size) };
        for i in 0..size {
            assert_eq!(unsafe { *ptr.add(i) }, 0x7E);
        }
        unsafe { GLOBAL.dealloc(ptr, layout) };
    }
}

/// An object allocated on one thread and freed on another must return
/// cleanly to the central cache rather than corrupting either thread's
/// cache state.
#[test]
fn cross_thread_free() {
    use std::sync::mpsc;

    let (tx, rx) = mpsc::channel::<usize>();
    let layout = Layout::from_size_align(64, 8).unwrap();

    let producer = std::thread::spawn(move || {
        for _ in 0..2000 {
            let ptr = unsafe { GLOBAL.alloc(layout) };
            assert!(!ptr.is_null());
            unsafe { ptr.write_bytes(0x11, 64) };
            tx.send(ptr as usize).unwrap();
        }
    });

    let consumer = std::thread::spawn(move || {
        let mut freed = 0usize;
        for addr in rx {
            let ptr = addr as *mut u8;
            for i in 0..64 {
                assert_eq!(unsafe { *ptr.add(i) }, 0x11);
            }
            unsafe { GLOBAL.dealloc(ptr, layout) };
            freed += 1;
        }
        freed
    });

    producer.join().unwrap();
    let freed = consumer.join().unwrap();
    assert_eq!(freed, 2000);
}

/// Randomized mixed workload: a seeded PRNG drives a sequence of
/// allocate/free/reallocate operations across many size classes, checking
/// fill patterns at every step.
#[test]
fn seeded_random_mixed_workload() {
    let mut rng = ChaCha8Rng::seed_from_u64(0xC0FF_EE42);
    let sizes = [8usize, 24, 64, 130, 513, 2050, 9000, 70000];

    let mut live: Vec<(*mut u8, Layout, u8)> = Vec::new();

    for _ in 0..5000 {
        let op: u8 = rng.random_range(0..3);
        match op {
            0 | 1 if live.len() < 512 => {
                let size = sizes[rng.random_range(0..sizes.len())];
                let layout = Layout::from_size_align(size, 8).unwrap();
                let ptr = unsafe { GLOBAL.alloc(layout) };
                assert!(!ptr.is_null(), "alloc failed for size {size}");
                let pattern = rng.random();
                unsafe { ptr.write_bytes(pattern, size) };
                live.push((ptr, layout, pattern));
            }
            _ if !live.is_empty() => {
                let idx = rng.random_range(0..live.len());
                let (ptr, layout, pattern) = live.swap_remove(idx);
                for i in 0..layout.size() {
                    assert_eq!(unsafe { *ptr.add(i) }, pattern, "corruption at byte {i}");
                }
                unsafe { GLOBAL.dealloc(ptr, layout) };
            }
            _ => {}
        }
    }

    for (ptr, layout, pattern) in live {
        for i in 0..layout.size() {
            assert_eq!(unsafe { *ptr.add(i) }, pattern);
        }
        unsafe { GLOBAL.dealloc(ptr, layout) };
    }
}

/// Allocate enough small objects to populate many spans, then free them in
/// address order. The page cache should coalesce adjacent free spans back
/// toward larger contiguous runs rather than leaving them fragmented.
#[test]
fn coalescing_reclaims_contiguous_spans() {
    let size = 64;
    let layout = Layout::from_size_align(size, 8).unwrap();
    let count = 4000;

    let mut ptrs: Vec<*mut u8> = (0..count)
        .map(|_| {
            let ptr = unsafe { GLOBAL.alloc(layout) };
            assert!(!ptr.is_null());
            ptr
        })
        .collect();

    ptrs.sort_by_key(|p| *p as usize);

    for ptr in ptrs {
        unsafe { GLOBAL.dealloc(ptr, layout) };
    }

    // A subsequent large allocation should succeed, which it would even
    // without coalescing; the real assertion is that the process above
    // does not panic or corrupt adjacent spans (checked via fill patterns
    // in the other stress tests). This test exercises the coalesce path
    // under a realistic alloc/free shape.
    let big_layout = Layout::from_size_align(1 << 20, 8).unwrap();
    let big = unsafe { GLOBAL.alloc(big_layout) };
    assert!(!big.is_null());
    unsafe { GLOBAL.dealloc(big, big_layout) };
}
