#[test]
fn is_usable_in_const_contexts() {
    const _ALLOCATOR1: seglloc::Allocator<64> = seglloc::Allocator::new();
    static _ALLOCATOR2: seglloc::Allocator<64> = seglloc::Allocator::new();
}

#[test]
fn supports_global_alloc() {
    fn assert<T: core::alloc::GlobalAlloc>(_: T) {}
    assert(seglloc::Allocator::<64>::new())
}

#[test]
#[should_panic(expected = "too small heap memory")]
fn min_heap_size_is_enforced() {
    let _allocator = seglloc::Allocator::<16>::new(); // panic here
}

#[test]
fn check_reports_a_healthy_fresh_heap() {
    let allocator = seglloc::Allocator::<256>::new();
    allocator.check(line!()).unwrap();
}
