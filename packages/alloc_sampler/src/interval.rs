//! Draws the number of bytes between two consecutive samples.

use std::cell::RefCell;
use std::collections::hash_map::RandomState;
use std::fmt::Debug;
use std::hash::{BuildHasher, Hasher};
use std::sync::atomic::{self, AtomicU64};

use rand::distr::Open01;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// Mean number of bytes between samples used when nothing else is configured.
pub const DEFAULT_SAMPLING_INTERVAL: usize = 128 * 1024;

/// Upper clamp of a drawn interval, as a multiple of the mean. The chance of an exponential draw
/// exceeding this is `e^-20`.
const MAX_INTERVAL_MULTIPLIER: usize = 20;

/// Lower clamp of a drawn interval. Never zero, so the counter always makes progress.
const MIN_INTERVAL: usize = size_of::<usize>();

/// The uniform value used while deterministic sampling is forced.
pub(crate) const DETERMINISTIC_UNIFORM: f64 = 0.5;

/// Source of uniformly distributed values in the open interval `(0, 1)`.
///
/// The profiler uses [`ThreadRngSource`] in normal operation and [`FixedUniform`] while
/// deterministic sampling is forced. Implementations are called from inside the allocator, so they
/// must not panic.
#[cfg_attr(test, mockall::automock)]
pub trait UniformSource: Debug {
    /// Returns the next value, which should lie in `(0, 1)`.
    ///
    /// Values outside that range are tolerated by [`next_interval()`], which clamps the result.
    fn next_uniform(&mut self) -> f64;
}

/// Draws the number of bytes until the next sample from an exponential distribution with the
/// given mean.
///
/// The result is clamped to `[size_of::<usize>(), mean * 20]`.
///
/// # Examples
///
/// ```
/// use alloc_sampler::{FixedUniform, next_interval};
///
/// // -ln(0.5) * 1024 = 709.78...
/// assert_eq!(next_interval(1024, &mut FixedUniform::new(0.5)), 709);
/// ```
#[must_use]
#[expect(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    reason = "the draw is statistical, a few bits of precision do not matter and the value is clamped before use"
)]
pub fn next_interval(mean: usize, source: &mut impl UniformSource) -> usize {
    let upper = mean
        .saturating_mul(MAX_INTERVAL_MULTIPLIER)
        .max(MIN_INTERVAL);

    let draw = -source.next_uniform().ln() * mean as f64;

    // NaN comes from a zero mean meeting an infinite logarithm.
    if draw.is_nan() || draw >= upper as f64 {
        return upper;
    }

    // Negative draws (uniform values above 1) saturate to zero here and get clamped below.
    (draw as usize).clamp(MIN_INTERVAL, upper)
}

thread_local! {
    // No drop glue, so this stays accessible during thread teardown, when the allocator may
    // still be called by other thread-local destructors.
    static THREAD_RNG: RefCell<Option<SmallRng>> = const { RefCell::new(None) };
}

static SEED_SEQUENCE: AtomicU64 = AtomicU64::new(0);

fn fresh_seed() -> u64 {
    let mut hasher = RandomState::new().build_hasher();
    hasher.write_u64(SEED_SEQUENCE.fetch_add(1, atomic::Ordering::Relaxed));
    hasher.finish()
}

/// Draws from a small per-thread pseudo-random generator seeded once per thread.
///
/// Seeding does not allocate, so this is safe to call from inside an allocator.
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadRngSource;

impl UniformSource for ThreadRngSource {
    fn next_uniform(&mut self) -> f64 {
        THREAD_RNG.with(|cell| {
            cell.borrow_mut()
                .get_or_insert_with(|| SmallRng::seed_from_u64(fresh_seed()))
                .sample(Open01)
        })
    }
}

/// Always returns the same value. Used to make sampling deterministic in tests.
#[derive(Clone, Copy, Debug)]
pub struct FixedUniform {
    value: f64,
}

impl FixedUniform {
    /// Creates a source that returns `value` on every draw.
    #[must_use]
    pub const fn new(value: f64) -> Self {
        Self { value }
    }
}

impl UniformSource for FixedUniform {
    fn next_uniform(&mut self) -> f64 {
        self.value
    }
}
