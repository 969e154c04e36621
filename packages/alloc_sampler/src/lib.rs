#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Statistical sampling heap profiler that sits in front of any global allocator.
//!
//! Instead of recording every allocation, the profiler picks allocations through a Poisson
//! process over allocated bytes: on average one allocation is sampled every
//! [`sampling interval`][Profiler::set_sampling_interval] bytes, with larger allocations being
//! proportionally more likely to be picked. Each picked allocation is recorded together with its
//! call stack and a weight that lets you reconstruct an unbiased estimate of total memory usage.
//!
//! The core functionality includes:
//! - [`SamplingAllocator`] - A [`GlobalAlloc`][std::alloc::GlobalAlloc] wrapper that consults the
//!   profiler on every allocation and tags sampled blocks in-band
//! - [`Profiler`] - The process-wide facade that owns the sampling state and the recorded samples
//! - [`Sample`] - One recorded live allocation
//! - [`ProfilerConfig`] - Sampling interval and stack depth, optionally loaded from the environment
//!
//! # Simple Usage
//!
//! ```
//! use std::alloc::System;
//!
//! use alloc_sampler::{Profiler, SamplingAllocator};
//!
//! static PROFILER: Profiler = Profiler::new();
//!
//! #[global_allocator]
//! static ALLOCATOR: SamplingAllocator<System> = SamplingAllocator::new(System, &PROFILER);
//!
//! fn main() {
//!     PROFILER.set_sampling_interval(4096);
//!     PROFILER.start();
//!
//!     let data: Vec<Vec<u8>> = (0..1000).map(|_| vec![0_u8; 1024]).collect();
//!
//!     let estimated_bytes: usize = PROFILER
//!         .get_samples()
//!         .iter()
//!         .map(|sample| sample.estimated_bytes())
//!         .sum();
//!
//!     println!("~{estimated_bytes} bytes live in sampled allocations");
//!     drop(data);
//! }
//! ```
//!
//! # Overhead
//!
//! An allocation that is not sampled costs one atomic add and one atomic load on top of the
//! wrapped allocator. Sampled allocations additionally capture a stack trace and take a mutex.
//! Every deallocation of a process that has started the profiler reads one word in front of the
//! freed block to recognize sampled blocks.
//!
//! # Chaining
//!
//! A [`SamplingAllocator`] forwards to any [`Dispatch`] implementation, including another
//! [`SamplingAllocator`]. Plain [`GlobalAlloc`][std::alloc::GlobalAlloc] implementations can be
//! wrapped with [`Forward`].
//!
//! # Miri compatibility
//!
//! Recognizing sampled blocks reads memory in front of the client-visible block, which Miri
//! reports as an out-of-bounds access. Do not use this package under Miri.

mod allocator;
mod config;
mod counter;
mod dispatch;
mod error;
mod interval;
mod profiler;
mod reentrancy;
mod sample;
mod stack;
mod store;
mod tag;

pub use allocator::*;
pub use config::*;
pub use dispatch::*;
pub use error::*;
pub use interval::{DEFAULT_SAMPLING_INTERVAL, FixedUniform, ThreadRngSource, UniformSource, next_interval};
pub use profiler::*;
pub use sample::*;
pub use stack::*;
