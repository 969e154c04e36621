//! The process-wide profiler facade.

use std::sync::Once;
use std::sync::atomic::{self, AtomicBool, AtomicU8, AtomicUsize};

use crate::counter::AllocationCounter;
use crate::interval::{DETERMINISTIC_UNIFORM, FixedUniform, ThreadRngSource, next_interval};
use crate::reentrancy::ReentrancyGuard;
use crate::store::SampleStore;
use crate::{BacktraceCapture, ProfilerConfig, Sample, StackCapture};

/// Lifecycle of a [`Profiler`].
///
/// `Uninstalled → Stopped → Running ⇄ Stopped`. A profiler never goes back to `Uninstalled`.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum ProfilerState {
    /// [`Profiler::start()`] was never called. Allocators in front of this profiler are a plain
    /// passthrough.
    Uninstalled,

    /// Installed but not sampling. Sampled blocks allocated earlier are still recognized when
    /// they are freed.
    Stopped,

    /// Sampling allocations.
    Running,
}

impl ProfilerState {
    const fn to_u8(self) -> u8 {
        match self {
            Self::Uninstalled => 0,
            Self::Stopped => 1,
            Self::Running => 2,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Uninstalled,
            1 => Self::Stopped,
            _ => Self::Running,
        }
    }
}

/// Owns the sampling state and the recorded samples of one or more [`SamplingAllocator`]s.
///
/// A profiler is meant to live in a `static` that the global allocator refers to. It starts out
/// [`Uninstalled`][ProfilerState::Uninstalled]; calling [`start()`][Self::start] installs it once
/// and begins sampling.
///
/// # Examples
///
/// ```rust
/// use alloc_sampler::{Profiler, ProfilerState, SamplingAllocator};
///
/// static PROFILER: Profiler = Profiler::new();
///
/// #[global_allocator]
/// static ALLOCATOR: SamplingAllocator<std::alloc::System> = SamplingAllocator::system(&PROFILER);
///
/// fn main() {
///     PROFILER.set_sampling_interval(1024);
///     PROFILER.start();
///     assert_eq!(PROFILER.state(), ProfilerState::Running);
///
///     let baseline = PROFILER.current_ordinal();
///     let buffers: Vec<Vec<u8>> = (0..100).map(|_| vec![1_u8; 4096]).collect();
///
///     let recent = PROFILER.samples_since(baseline);
///     assert!(!recent.is_empty());
///
///     PROFILER.stop();
///     drop(buffers);
/// }
/// ```
///
/// [`SamplingAllocator`]: crate::SamplingAllocator
#[derive(Debug)]
pub struct Profiler {
    state: AtomicU8,
    install: Once,
    sampling_interval: AtomicUsize,
    deterministic: AtomicBool,
    counter: AllocationCounter,
    store: SampleStore,
}

impl Profiler {
    /// Creates a profiler with the default configuration that walks stacks with the `backtrace`
    /// crate.
    #[must_use]
    pub const fn new() -> Self {
        Self::with_config(ProfilerConfig::new())
    }

    /// Creates a profiler with the given configuration that walks stacks with the `backtrace`
    /// crate.
    ///
    /// [`ProfilerConfig::start_running()`] has no effect here, as a `const` constructor cannot
    /// start anything. Use [`apply_config()`][Self::apply_config] for that.
    #[must_use]
    pub const fn with_config(config: ProfilerConfig) -> Self {
        Self::with_config_and_capture(config, &BacktraceCapture)
    }

    /// Creates a profiler with the given configuration and stack capture.
    #[must_use]
    pub const fn with_config_and_capture(
        config: ProfilerConfig,
        stack_capture: &'static dyn StackCapture,
    ) -> Self {
        Self {
            state: AtomicU8::new(ProfilerState::Uninstalled.to_u8()),
            install: Once::new(),
            sampling_interval: AtomicUsize::new(config.sampling_interval()),
            deterministic: AtomicBool::new(false),
            counter: AllocationCounter::new(config.sampling_interval()),
            store: SampleStore::new(stack_capture, config.max_stack_depth()),
        }
    }

    /// Installs the profiler (once) and starts sampling.
    pub fn start(&self) {
        self.install.call_once(|| {
            self.counter.reset(self.draw_interval());
            self.set_state(ProfilerState::Stopped);

            tracing::debug!("sampling heap profiler installed");
        });

        self.set_state(ProfilerState::Running);

        tracing::info!(
            sampling_interval = self.sampling_interval(),
            "sampling heap profiler started"
        );
    }

    /// Stops sampling. Samples recorded so far stay until their allocations are freed.
    ///
    /// Does nothing if the profiler was never started.
    pub fn stop(&self) {
        if !self.is_installed() {
            return;
        }

        self.set_state(ProfilerState::Stopped);

        tracing::info!("sampling heap profiler stopped");
    }

    /// The current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ProfilerState {
        ProfilerState::from_u8(self.state.load(atomic::Ordering::Acquire))
    }

    /// Sets the mean number of bytes between samples.
    ///
    /// The threshold already armed is kept, so the new interval takes effect from the next sample.
    pub fn set_sampling_interval(&self, bytes: usize) {
        self.sampling_interval
            .store(bytes, atomic::Ordering::Relaxed);

        tracing::debug!(sampling_interval = bytes, "sampling interval changed");
    }

    /// The mean number of bytes between samples.
    #[must_use]
    pub fn sampling_interval(&self) -> usize {
        self.sampling_interval.load(atomic::Ordering::Relaxed)
    }

    /// Sets the maximum number of frames captured per sample.
    pub fn set_max_stack_depth(&self, frames: usize) {
        self.store.set_max_stack_depth(frames);
    }

    /// Replaces every random draw with a fixed one, making sampling reproducible.
    ///
    /// Enabling it also restarts the byte count toward a freshly armed threshold, so that the
    /// first sample lands on a predictable allocation: with an interval of `m` bytes, the first
    /// sample is taken once `-ln(0.5) * m` bytes have been allocated.
    pub fn force_deterministic_sampling_for_tests(&self, deterministic: bool) {
        self.deterministic
            .store(deterministic, atomic::Ordering::Release);

        if deterministic {
            self.counter.reset(self.draw_interval());
        }

        tracing::debug!(deterministic, "deterministic sampling changed");
    }

    /// Applies the runtime-adjustable parts of a configuration and starts the profiler if the
    /// configuration asks for it.
    pub fn apply_config(&self, config: &ProfilerConfig) {
        self.set_sampling_interval(config.sampling_interval());
        self.set_max_stack_depth(config.max_stack_depth());

        if config.start_running() {
            self.start();
        }
    }

    /// Copies out every live sample, oldest first.
    #[must_use]
    pub fn get_samples(&self) -> Vec<Sample> {
        self.samples_since(0)
    }

    /// Copies out the live samples whose [ordinal][Sample::ordinal] is at least `ordinal`,
    /// oldest first.
    ///
    /// Returns nothing when called from a [`StackCapture`] implementation.
    #[must_use]
    pub fn samples_since(&self, ordinal: u64) -> Vec<Sample> {
        let Some(_guard) = ReentrancyGuard::enter() else {
            return Vec::new();
        };

        self.store.lock().samples_since(ordinal)
    }

    /// The ordinal the next recorded sample will receive.
    ///
    /// Returns 0 when called from a [`StackCapture`] implementation.
    #[must_use]
    pub fn current_ordinal(&self) -> u64 {
        let Some(_guard) = ReentrancyGuard::enter() else {
            return 0;
        };

        self.store.lock().next_ordinal()
    }

    /// Number of live samples.
    ///
    /// Returns 0 when called from a [`StackCapture`] implementation.
    #[must_use]
    pub fn live_sample_count(&self) -> usize {
        let Some(_guard) = ReentrancyGuard::enter() else {
            return 0;
        };

        self.store.lock().len()
    }

    pub(crate) fn is_running(&self) -> bool {
        self.state() == ProfilerState::Running
    }

    pub(crate) fn is_installed(&self) -> bool {
        self.state() != ProfilerState::Uninstalled
    }

    pub(crate) fn maybe_sample(&self, size: usize) -> Option<usize> {
        self.counter
            .maybe_sample(size, || self.draw_interval())
    }

    pub(crate) fn store(&self) -> &SampleStore {
        &self.store
    }

    fn draw_interval(&self) -> usize {
        let mean = self.sampling_interval();

        if self.deterministic.load(atomic::Ordering::Acquire) {
            next_interval(mean, &mut FixedUniform::new(DETERMINISTIC_UNIFORM))
        } else {
            next_interval(mean, &mut ThreadRngSource)
        }
    }

    fn set_state(&self, state: ProfilerState) {
        self.state.store(state.to_u8(), atomic::Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn counter(&self) -> &AllocationCounter {
        &self.counter
    }
}

impl Default for Profiler {
    fn default() -> Self {
        Self::new()
    }
}
