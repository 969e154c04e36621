//! Weighted samples estimate the live heap without bias.

#![cfg(not(miri))] // Reads memory in front of client blocks, which Miri rejects.

use std::alloc::{GlobalAlloc, Layout};

use alloc_sampler::{NoStackCapture, Profiler, ProfilerConfig, SamplingAllocator};

static NO_STACK: NoStackCapture = NoStackCapture;

fn leaked_profiler(interval: usize) -> &'static Profiler {
    Box::leak(Box::new(Profiler::with_config_and_capture(
        ProfilerConfig::new().with_sampling_interval(interval),
        &NO_STACK,
    )))
}

fn allocate_many(
    allocator: &SamplingAllocator<std::alloc::System>,
    layout: Layout,
    count: usize,
) -> Vec<*mut u8> {
    (0..count)
        .map(|_| {
            // SAFETY: Non-zero layout, freed by `free_all()` with the same layout.
            let ptr = unsafe { allocator.alloc(layout) };
            assert!(!ptr.is_null());
            ptr
        })
        .collect()
}

fn free_all(allocator: &SamplingAllocator<std::alloc::System>, layout: Layout, blocks: Vec<*mut u8>) {
    for ptr in blocks {
        // SAFETY: Each block is live and freed once, with its layout.
        unsafe { allocator.dealloc(ptr, layout) };
    }
}

#[test]
fn estimate_converges_to_live_bytes() {
    const SIZE: usize = 256;
    const COUNT: usize = 65_536;

    let profiler = leaked_profiler(4096);
    profiler.start();
    let allocator = SamplingAllocator::system(profiler);
    let layout = Layout::from_size_align(SIZE, 8).unwrap();

    let blocks = allocate_many(&allocator, layout, COUNT);

    let estimated: usize = profiler
        .get_samples()
        .iter()
        .map(alloc_sampler::Sample::estimated_bytes)
        .sum();
    let actual = SIZE * COUNT;

    // Weights account for every byte allocated up to the last sample, so only the bytes since
    // then and the rounding of each weight are missing.
    let error = estimated.abs_diff(actual) as f64 / actual as f64;
    assert!(error < 0.15, "estimated {estimated} bytes for {actual} live bytes");

    free_all(&allocator, layout, blocks);
    assert_eq!(profiler.live_sample_count(), 0);
}

#[test]
fn small_allocations_carry_large_weights() {
    let profiler = leaked_profiler(64 * 1024);
    profiler.start();
    let allocator = SamplingAllocator::system(profiler);
    let layout = Layout::from_size_align(64, 8).unwrap();

    let blocks = allocate_many(&allocator, layout, 50_000);

    let samples = profiler.get_samples();
    assert!(!samples.is_empty());

    let mean_weight = samples.iter().map(alloc_sampler::Sample::weight).sum::<usize>() as f64
        / samples.len() as f64;

    // Each sample stands in for roughly interval / size = 1024 allocations.
    assert!(
        (512.0..2048.0).contains(&mean_weight),
        "mean weight {mean_weight}"
    );

    free_all(&allocator, layout, blocks);
}

#[test]
fn allocations_beyond_the_largest_interval_are_always_sampled() {
    let profiler = leaked_profiler(1024);
    profiler.start();
    let allocator = SamplingAllocator::system(profiler);

    // Larger than the 20x interval cap on any threshold.
    let layout = Layout::from_size_align(64 * 1024, 8).unwrap();
    let blocks = allocate_many(&allocator, layout, 50);

    for ptr in &blocks {
        // SAFETY: Every block is live and comes from this allocator.
        assert!(unsafe { allocator.is_sampled(*ptr) });
    }

    let samples = profiler.get_samples();
    assert_eq!(samples.len(), 50);
    assert!(samples.iter().all(|sample| sample.weight() == 1));

    free_all(&allocator, layout, blocks);
    assert_eq!(profiler.live_sample_count(), 0);
}
