//! Installs the sampling profiler as the global allocator and prints what it saw.
//!
//! The sampling interval and stack depth can be overridden from the environment:
//!
//! ```text
//! ALLOC_SAMPLER_INTERVAL=4096 cargo run --example alloc_sampler_basic
//! ```
//!
//! Profiler lifecycle events are logged at `debug` and `info` level.

use std::collections::BTreeMap;
use std::hint::black_box;

use alloc_sampler::{Profiler, ProfilerConfig, SamplingAllocator};

static PROFILER: Profiler = Profiler::new();

#[global_allocator]
static ALLOCATOR: SamplingAllocator<std::alloc::System> = SamplingAllocator::system(&PROFILER);

fn main() -> Result<(), alloc_sampler::Error> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let config = ProfilerConfig::from_env()?.with_start_running(true);
    PROFILER.apply_config(&config);

    let baseline = PROFILER.current_ordinal();

    let words: Vec<String> = (0..20_000).map(|i| format!("word number {i}")).collect();
    let buffers: Vec<Vec<u8>> = (0..64).map(|i| vec![0_u8; 1024 * (i + 1)]).collect();

    let samples = PROFILER.samples_since(baseline);

    PROFILER.stop();

    let mut by_size: BTreeMap<usize, (usize, usize)> = BTreeMap::new();
    for sample in &samples {
        let entry = by_size.entry(sample.size()).or_default();
        entry.0 = entry.0.saturating_add(1);
        entry.1 = entry.1.saturating_add(sample.estimated_bytes());
    }

    let estimated: usize = samples.iter().map(alloc_sampler::Sample::estimated_bytes).sum();
    let actual: usize = words.iter().map(String::capacity).sum::<usize>()
        + buffers.iter().map(Vec::capacity).sum::<usize>();

    println!(
        "{} samples, ~{estimated} bytes estimated, {actual} bytes allocated by the workload",
        samples.len()
    );

    for (size, (count, bytes)) in by_size.iter().rev().take(10) {
        println!("{size:>8} bytes: {count} samples, ~{bytes} bytes");
    }

    if let Some(sample) = samples.first() {
        println!("first sample:\n{sample}");
    }

    black_box(words);
    black_box(buffers);

    Ok(())
}
