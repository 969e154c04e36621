//! The sampler installed as the process global allocator.
//!
//! Everything runs in one test function: the harness would otherwise run tests in parallel and
//! steal threshold crossings from each other.

#![cfg(not(miri))] // Miri replaces the global allocator, so cannot be used here.

use std::hint::black_box;

use alloc_sampler::{Profiler, ProfilerConfig, ProfilerState, SamplingAllocator};

static PROFILER: Profiler = Profiler::with_config(ProfilerConfig::new().with_sampling_interval(1024));

#[global_allocator]
static ALLOCATOR: SamplingAllocator<std::alloc::System> = SamplingAllocator::system(&PROFILER);

#[test]
fn sampling_through_global_allocator() {
    // Before start, nothing is recorded.
    let early = black_box(vec![0_u8; 100_000]);
    assert_eq!(PROFILER.state(), ProfilerState::Uninstalled);
    assert_eq!(PROFILER.live_sample_count(), 0);

    PROFILER.force_deterministic_sampling_for_tests(true);
    PROFILER.start();

    // With a 1024 byte interval the deterministic threshold is 709 bytes, so the first
    // 2000 byte allocation after the reset crosses it.
    let baseline = PROFILER.current_ordinal();
    PROFILER.force_deterministic_sampling_for_tests(true);

    let first = black_box(Box::new([7_u8; 2000]));

    let recent = PROFILER.samples_since(baseline);
    let sample = recent
        .iter()
        .find(|sample| sample.size() == 2000)
        .expect("the first 2000 byte allocation is sampled");

    assert!(sample.weight() >= 1);
    assert!(!sample.stack().is_empty());
    assert!(first.iter().all(|byte| *byte == 7));

    // SAFETY: `first` is a live block from the global allocator.
    assert!(unsafe { ALLOCATOR.is_sampled(first.as_ptr()) });

    // Growing a vector reallocates repeatedly, moving blocks in and out of the sampled set.
    // The contents must survive every move.
    let mut growing: Vec<u64> = Vec::new();
    for i in 0..50_000_u64 {
        growing.push(i);
    }
    assert!(growing.iter().copied().eq(0..50_000));

    growing.truncate(10);
    growing.shrink_to_fit();
    assert_eq!(growing, (0..10).collect::<Vec<_>>());

    // Dropping what was allocated before start is a plain passthrough.
    drop(early);

    // Stopping keeps the samples; freeing the block removes its sample.
    PROFILER.stop();
    assert_eq!(PROFILER.state(), ProfilerState::Stopped);

    let ordinal = sample.ordinal();
    assert!(
        PROFILER
            .get_samples()
            .iter()
            .any(|sample| sample.ordinal() == ordinal)
    );

    drop(first);
    assert!(
        !PROFILER
            .get_samples()
            .iter()
            .any(|sample| sample.ordinal() == ordinal)
    );

    // While stopped, new allocations are not sampled.
    let before = PROFILER.current_ordinal();
    let unsampled = black_box(vec![1_u8; 1_000_000]);
    assert_eq!(PROFILER.current_ordinal(), before);
    drop(unsampled);

    drop(growing);
    drop(recent);
}
