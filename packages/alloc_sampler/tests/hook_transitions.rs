//! Allocation, reallocation and deallocation paths of `SamplingAllocator`, exercised against a
//! private profiler so that the test harness's own allocations do not interfere.

#![cfg(not(miri))] // Reads memory in front of client blocks, which Miri rejects.

use std::alloc::{GlobalAlloc, Layout, System};
use std::slice;
use std::sync::atomic::{AtomicBool, Ordering};

use alloc_sampler::{Forward, NoStackCapture, Profiler, ProfilerConfig, SamplingAllocator};

static NO_STACK: NoStackCapture = NoStackCapture;

/// Large enough that nothing in these tests gets sampled after switching to it.
const NEVER: usize = 1 << 40;

fn leaked_profiler(interval: usize) -> &'static Profiler {
    let profiler = Box::leak(Box::new(Profiler::with_config_and_capture(
        ProfilerConfig::new().with_sampling_interval(interval),
        &NO_STACK,
    )));

    profiler.force_deterministic_sampling_for_tests(true);
    profiler
}

/// Switches a running profiler so that the next allocations are not sampled.
fn stop_sampling_new_allocations(profiler: &Profiler) {
    profiler.set_sampling_interval(NEVER);
    profiler.force_deterministic_sampling_for_tests(true);
}

/// Switches a running profiler so that every next allocation is sampled.
fn sample_every_allocation(profiler: &Profiler) {
    profiler.set_sampling_interval(1);
    profiler.force_deterministic_sampling_for_tests(true);
}

fn layout(size: usize) -> Layout {
    Layout::from_size_align(size, 8).unwrap()
}

fn fill(ptr: *mut u8, len: usize) {
    for i in 0..len {
        // SAFETY: The caller passes a live block of at least `len` bytes.
        unsafe { ptr.add(i).write((i % 251) as u8) };
    }
}

fn assert_filled(ptr: *const u8, len: usize) {
    // SAFETY: The caller passes a live block of at least `len` bytes.
    let bytes = unsafe { slice::from_raw_parts(ptr, len) };

    for (i, byte) in bytes.iter().enumerate() {
        assert_eq!(*byte, (i % 251) as u8, "byte {i} was not preserved");
    }
}

#[test]
fn unsampled_to_unsampled_realloc() {
    let profiler = leaked_profiler(NEVER);
    profiler.start();
    let allocator = SamplingAllocator::system(profiler);

    // SAFETY: Non-zero layouts, every block freed with its current layout.
    unsafe {
        let ptr = allocator.alloc(layout(100));
        fill(ptr, 100);

        let grown = allocator.realloc(ptr, layout(100), 1000);
        assert!(!allocator.is_sampled(grown));
        assert_filled(grown, 100);

        allocator.dealloc(grown, layout(1000));
    }

    assert_eq!(profiler.live_sample_count(), 0);
}

#[test]
fn unsampled_to_sampled_realloc() {
    let profiler = leaked_profiler(NEVER);
    profiler.start();
    let allocator = SamplingAllocator::system(profiler);

    // SAFETY: Non-zero layouts, every block freed with its current layout.
    unsafe {
        let ptr = allocator.alloc(layout(100));
        assert!(!allocator.is_sampled(ptr));
        fill(ptr, 100);

        sample_every_allocation(profiler);

        let grown = allocator.realloc(ptr, layout(100), 5000);
        assert!(allocator.is_sampled(grown));
        assert_filled(grown, 100);

        let samples = profiler.get_samples();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples.first().unwrap().size(), 5000);
        assert_eq!(samples.first().unwrap().padding_offset(), 16);

        allocator.dealloc(grown, layout(5000));
    }

    assert_eq!(profiler.live_sample_count(), 0);
}

#[test]
fn sampled_to_unsampled_realloc() {
    let profiler = leaked_profiler(1);
    profiler.start();
    let allocator = SamplingAllocator::system(profiler);

    // SAFETY: Non-zero layouts, every block freed with its current layout.
    unsafe {
        let ptr = allocator.alloc(layout(300));
        assert!(allocator.is_sampled(ptr));
        fill(ptr, 300);

        stop_sampling_new_allocations(profiler);

        let grown = allocator.realloc(ptr, layout(300), 3000);
        assert!(!allocator.is_sampled(grown));
        assert_filled(grown, 300);
        assert_eq!(profiler.live_sample_count(), 0);

        allocator.dealloc(grown, layout(3000));
    }
}

#[test]
fn sampled_to_sampled_realloc() {
    let profiler = leaked_profiler(1);
    profiler.start();
    let allocator = SamplingAllocator::system(profiler);

    // SAFETY: Non-zero layouts, every block freed with its current layout.
    unsafe {
        let ptr = allocator.alloc(layout(64));
        assert!(allocator.is_sampled(ptr));
        fill(ptr, 64);

        let grown = allocator.realloc(ptr, layout(64), 100_000);
        assert!(allocator.is_sampled(grown));
        assert_filled(grown, 64);

        let samples = profiler.get_samples();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples.first().unwrap().size(), 100_000);

        allocator.dealloc(grown, layout(100_000));
    }

    assert_eq!(profiler.live_sample_count(), 0);
}

#[test]
fn shrinking_keeps_leading_bytes() {
    let profiler = leaked_profiler(1);
    profiler.start();
    let allocator = SamplingAllocator::system(profiler);

    // SAFETY: Non-zero layouts, every block freed with its current layout.
    unsafe {
        let ptr = allocator.alloc(layout(4096));
        fill(ptr, 4096);

        // Sampled to sampled.
        let shrunk = allocator.realloc(ptr, layout(4096), 1024);
        assert!(allocator.is_sampled(shrunk));
        assert_filled(shrunk, 1024);

        // Sampled to unsampled.
        stop_sampling_new_allocations(profiler);
        let shrunk_again = allocator.realloc(shrunk, layout(1024), 100);
        assert!(!allocator.is_sampled(shrunk_again));
        assert_filled(shrunk_again, 100);

        // Unsampled to sampled.
        sample_every_allocation(profiler);
        let shrunk_once_more = allocator.realloc(shrunk_again, layout(100), 50);
        assert!(allocator.is_sampled(shrunk_once_more));
        assert_filled(shrunk_once_more, 50);

        allocator.dealloc(shrunk_once_more, layout(50));
    }

    assert_eq!(profiler.live_sample_count(), 0);
}

#[test]
fn realloc_of_sampled_block_while_stopped_drops_header() {
    let profiler = leaked_profiler(1);
    profiler.start();
    let allocator = SamplingAllocator::system(profiler);

    // SAFETY: Non-zero layouts, every block freed with its current layout.
    unsafe {
        let ptr = allocator.alloc(layout(128));
        assert!(allocator.is_sampled(ptr));
        fill(ptr, 128);

        profiler.stop();

        let grown = allocator.realloc(ptr, layout(128), 256);
        assert!(!allocator.is_sampled(grown));
        assert_filled(grown, 128);
        assert_eq!(profiler.live_sample_count(), 0);

        allocator.dealloc(grown, layout(256));
    }
}

#[test]
fn sample_metadata_matches_request() {
    let profiler = leaked_profiler(1);
    profiler.start();
    let allocator = SamplingAllocator::system(profiler);

    let baseline = profiler.current_ordinal();
    let over_aligned = Layout::from_size_align(48, 64).unwrap();

    // SAFETY: Non-zero layouts, every block freed with its layout.
    unsafe {
        let small = allocator.alloc(layout(24));
        let aligned = allocator.alloc_zeroed(over_aligned);
        assert_eq!(aligned.addr() % 64, 0);

        let samples = profiler.samples_since(baseline);
        assert_eq!(samples.len(), 2);

        let first = samples.first().unwrap();
        assert_eq!(first.size(), 24);
        assert_eq!(first.padding_offset(), 16);
        assert!(first.weight() >= 1);
        assert!(first.stack().is_empty());

        let second = samples.get(1).unwrap();
        assert_eq!(second.size(), 48);
        assert_eq!(second.padding_offset(), 64);
        assert!(second.ordinal() > first.ordinal());

        let later = profiler.samples_since(second.ordinal());
        assert_eq!(later.len(), 1);

        allocator.dealloc(small, layout(24));
        allocator.dealloc(aligned, over_aligned);
    }

    assert_eq!(profiler.live_sample_count(), 0);
}

/// The system allocator, except that reallocation can be told to fail.
#[derive(Debug, Default)]
struct FlakyRealloc {
    fail_realloc: AtomicBool,
}

// SAFETY: Delegates to the system allocator; a failed reallocation leaves the block untouched
// as the `GlobalAlloc` contract requires.
unsafe impl GlobalAlloc for FlakyRealloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // SAFETY: Forwarding the caller's guarantees.
        unsafe { System.alloc(layout) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        // SAFETY: Forwarding the caller's guarantees.
        unsafe { System.dealloc(ptr, layout) }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if self.fail_realloc.load(Ordering::Relaxed) {
            return std::ptr::null_mut();
        }

        // SAFETY: Forwarding the caller's guarantees.
        unsafe { System.realloc(ptr, layout, new_size) }
    }
}

#[test]
fn failed_realloc_leaves_sampled_block_intact() {
    let profiler = leaked_profiler(1);
    profiler.start();
    let allocator = SamplingAllocator::new(Forward::new(FlakyRealloc::default()), profiler);

    // SAFETY: Non-zero layouts, every block freed with its current layout.
    unsafe {
        let ptr = allocator.alloc(layout(200));
        assert!(allocator.is_sampled(ptr));
        fill(ptr, 200);

        allocator
            .next()
            .inner()
            .fail_realloc
            .store(true, Ordering::Relaxed);

        // Sampled to unsampled.
        stop_sampling_new_allocations(profiler);
        assert!(allocator.realloc(ptr, layout(200), 400).is_null());
        assert!(allocator.is_sampled(ptr));
        assert_filled(ptr, 200);

        // Sampled to sampled.
        sample_every_allocation(profiler);
        assert!(allocator.realloc(ptr, layout(200), 400).is_null());
        assert!(allocator.is_sampled(ptr));
        assert_filled(ptr, 200);
        assert_eq!(profiler.live_sample_count(), 1);

        allocator
            .next()
            .inner()
            .fail_realloc
            .store(false, Ordering::Relaxed);

        allocator.dealloc(ptr, layout(200));
    }

    assert_eq!(profiler.live_sample_count(), 0);
}

#[test]
fn failed_realloc_of_unsampled_block_records_nothing() {
    let profiler = leaked_profiler(NEVER);
    profiler.start();
    let allocator = SamplingAllocator::new(Forward::new(FlakyRealloc::default()), profiler);

    // SAFETY: Non-zero layouts, every block freed with its current layout.
    unsafe {
        let ptr = allocator.alloc(layout(200));
        fill(ptr, 200);

        allocator
            .next()
            .inner()
            .fail_realloc
            .store(true, Ordering::Relaxed);

        sample_every_allocation(profiler);
        assert!(allocator.realloc(ptr, layout(200), 400).is_null());
        assert!(!allocator.is_sampled(ptr));
        assert_filled(ptr, 200);
        assert_eq!(profiler.live_sample_count(), 0);

        allocator.dealloc(ptr, layout(200));
    }
}

#[test]
fn chained_samplers_each_see_their_own_blocks() {
    let outer_profiler = leaked_profiler(1);
    let inner_profiler = leaked_profiler(1);
    outer_profiler.start();
    inner_profiler.start();

    let allocator =
        SamplingAllocator::new(SamplingAllocator::system(inner_profiler), outer_profiler);

    // SAFETY: Non-zero layouts, every block freed with its layout.
    unsafe {
        let ptr = allocator.alloc(layout(64));
        fill(ptr, 64);

        assert!(allocator.is_sampled(ptr));

        // The inner sampler skips its bookkeeping while the outer one records.
        assert_eq!(outer_profiler.live_sample_count(), 1);
        assert_eq!(inner_profiler.live_sample_count(), 0);

        allocator.dealloc(ptr, layout(64));
    }

    assert_eq!(outer_profiler.live_sample_count(), 0);
}

#[test]
fn chained_realloc_releases_inner_sample() {
    let outer_profiler = leaked_profiler(NEVER);
    let inner_profiler = leaked_profiler(1);
    outer_profiler.start();
    inner_profiler.start();

    let allocator =
        SamplingAllocator::new(SamplingAllocator::system(inner_profiler), outer_profiler);

    // SAFETY: Non-zero layouts, every block freed with its current layout.
    unsafe {
        let ptr = allocator.alloc(layout(64));
        fill(ptr, 64);

        assert!(allocator.next().is_sampled(ptr));
        assert_eq!(inner_profiler.live_sample_count(), 1);

        inner_profiler.stop();

        let grown = allocator.realloc(ptr, layout(64), 128);
        assert_filled(grown, 64);

        assert!(!allocator.next().is_sampled(grown));
        assert_eq!(inner_profiler.live_sample_count(), 0);

        allocator.dealloc(grown, layout(128));
    }

    assert_eq!(inner_profiler.live_sample_count(), 0);
    assert_eq!(outer_profiler.live_sample_count(), 0);
}

#[test]
fn chained_realloc_leaves_inner_blocks_to_the_inner_sampler() {
    let outer_profiler = leaked_profiler(1);
    let inner_profiler = leaked_profiler(1);
    inner_profiler.start();

    let allocator =
        SamplingAllocator::new(SamplingAllocator::system(inner_profiler), outer_profiler);

    // SAFETY: Non-zero layouts, every block freed with its current layout.
    unsafe {
        // The outer sampler is not installed yet, so only the inner one tags this block.
        let ptr = allocator.alloc(layout(64));
        fill(ptr, 64);
        assert_eq!(inner_profiler.live_sample_count(), 1);

        outer_profiler.start();

        let grown = allocator.realloc(ptr, layout(64), 128);
        assert_filled(grown, 64);

        assert!(allocator.next().is_sampled(grown));
        assert_eq!(inner_profiler.live_sample_count(), 1);
        assert_eq!(inner_profiler.get_samples().first().unwrap().size(), 128);
        assert_eq!(outer_profiler.live_sample_count(), 0);

        allocator.dealloc(grown, layout(128));
    }

    assert_eq!(inner_profiler.live_sample_count(), 0);
    assert_eq!(outer_profiler.live_sample_count(), 0);
}
