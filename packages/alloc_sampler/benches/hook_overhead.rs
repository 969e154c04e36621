//! Benchmarks to measure the compute overhead of the sampling hooks themselves.
//!
//! Each scenario allocates and frees one block through a private sampling allocator, with the
//! profiler in a different state, and compares against the system allocator alone.

#![allow(
    missing_docs,
    reason = "No need for API documentation in benchmark code"
)]

use std::alloc::{GlobalAlloc, Layout, System};
use std::hint::black_box;

use alloc_sampler::{NoStackCapture, Profiler, ProfilerConfig, SamplingAllocator};
use criterion::{Criterion, criterion_group, criterion_main};

static NO_STACK: NoStackCapture = NoStackCapture;

static UNINSTALLED: Profiler = Profiler::new();
static STOPPED: Profiler = Profiler::new();
static RUNNING: Profiler = Profiler::new();
static EVERY_ALLOCATION: Profiler =
    Profiler::with_config_and_capture(ProfilerConfig::new().with_sampling_interval(1), &NO_STACK);

criterion_group!(benches, entrypoint);
criterion_main!(benches);

fn alloc_free<A: GlobalAlloc>(allocator: &A, layout: Layout) {
    // SAFETY: Non-zero layout, freed right away with the same layout.
    unsafe {
        let ptr = allocator.alloc(layout);
        black_box(ptr);
        allocator.dealloc(ptr, layout);
    }
}

fn entrypoint(c: &mut Criterion) {
    let layout = Layout::from_size_align(64, 8).unwrap();

    STOPPED.start();
    STOPPED.stop();
    RUNNING.start();
    EVERY_ALLOCATION.start();

    let mut group = c.benchmark_group("alloc_sampler_overhead");

    group.bench_function("system", |b| {
        b.iter(|| alloc_free(&System, layout));
    });

    let allocator = SamplingAllocator::system(&UNINSTALLED);
    group.bench_function("uninstalled", |b| {
        b.iter(|| alloc_free(&allocator, layout));
    });

    let allocator = SamplingAllocator::system(&STOPPED);
    group.bench_function("stopped", |b| {
        b.iter(|| alloc_free(&allocator, layout));
    });

    let allocator = SamplingAllocator::system(&RUNNING);
    group.bench_function("running_default_interval", |b| {
        b.iter(|| alloc_free(&allocator, layout));
    });

    let allocator = SamplingAllocator::system(&EVERY_ALLOCATION);
    group.bench_function("sampling_every_allocation", |b| {
        b.iter(|| alloc_free(&allocator, layout));
    });

    group.finish();
}
