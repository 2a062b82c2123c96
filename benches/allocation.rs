#![feature(test)]
extern crate test;
use test::Bencher;

use std::alloc::{GlobalAlloc as _, Layout};

mod repeated_allocation_deallocation {
    use super::*;

    /// Run a benchmark, which repeatedly allocates and deallocates the same
    /// block. The benchmark will allocate the given amount of blocks beforehand
    /// (before running the actual benchmark) in order to fill up the heap with
    /// unrelated allocations, so the free-list search has realistic class
    /// occupancy to work through.
    ///
    /// # Panics
    /// This will panic, if the requested pre-allocations will fill up the whole
    /// heap (so the actual benchmark cannot allocate blocks anymore).
    fn benchmark_with_preallocation(b: &mut Bencher, pre_allocations: usize) {
        let allocator = seglloc::Allocator::<{ 1024 * 1024 }>::new();
        // pre-allocate much memory to see the real impact of class occupancy
        for _ in 0..pre_allocations {
            unsafe { allocator.alloc(Layout::new::<u8>()) };
        }

        let layout = Layout::new::<u8>();

        // make sure, that there is enough room for the next allocation
        let ptr = unsafe { allocator.alloc(layout) };
        assert_ne!(ptr, std::ptr::null_mut::<u8>());
        unsafe { allocator.dealloc(ptr, layout) };

        // run actual benchmark: allocate & deallocate the same block repeatedly
        b.iter(|| {
            let ptr = unsafe { allocator.alloc(layout) };
            let ptr = test::black_box(ptr);
            unsafe { allocator.dealloc(ptr, layout) };
        });
    }

    #[bench]
    fn no_memory_usage(b: &mut Bencher) {
        benchmark_with_preallocation(b, 0);
    }

    #[bench]
    fn low_memory_usage(b: &mut Bencher) {
        benchmark_with_preallocation(b, 8);
    }

    #[bench]
    fn medium_memory_usage(b: &mut Bencher) {
        benchmark_with_preallocation(b, 5_000);
    }

    #[bench]
    fn high_memory_usage(b: &mut Bencher) {
        benchmark_with_preallocation(b, 20_000);
    }
}

mod split_and_coalesce {
    use super::*;

    /// Repeatedly allocate a large block, split a small block off of its
    /// tail by freeing the large one and reallocating a quarter of it, then
    /// free both remaining pieces so they coalesce back together. Exercises
    /// the splitting and coalescing paths on every iteration instead of the
    /// same-size alloc/dealloc pair above.
    #[bench]
    fn split_then_coalesce(b: &mut Bencher) {
        let allocator = seglloc::Allocator::<{ 1024 * 1024 }>::new();
        let big = Layout::from_size_align(2048, 16).unwrap();
        let small = Layout::from_size_align(64, 16).unwrap();

        b.iter(|| unsafe {
            let p = allocator.alloc(big);
            let p = test::black_box(p);
            let q = allocator.alloc(small);
            let q = test::black_box(q);
            allocator.dealloc(q, small);
            allocator.dealloc(p, big);
        });
    }

    /// Allocate and release three adjacent blocks in an order that forces a
    /// both-neighbors coalesce on the middle release.
    #[bench]
    fn coalesce_both_neighbors(b: &mut Bencher) {
        let allocator = seglloc::Allocator::<{ 1024 * 1024 }>::new();
        let layout = Layout::from_size_align(48, 16).unwrap();

        b.iter(|| unsafe {
            let a = allocator.alloc(layout);
            let c = allocator.alloc(layout);
            let m = allocator.alloc(layout);
            let (a, c, m) = (test::black_box(a), test::black_box(c), test::black_box(m));
            allocator.dealloc(a, layout);
            allocator.dealloc(c, layout);
            allocator.dealloc(m, layout);
        });
    }
}
