//! Lock-free decision of which allocation gets sampled.

use std::sync::atomic::{AtomicIsize, Ordering};

/// Added to (and later removed from) the cumulative byte count by the thread that claims a sample.
///
/// While the offset is applied the cumulative count is hugely negative, so no other thread can
/// cross the threshold until the claiming thread has armed the next one.
const CLAIM_OFFSET: isize = isize::MAX / 2;

/// Process-wide running byte count and the value at which the next sample is taken.
///
/// Both values are only ever touched with atomic read-modify-write operations or plain atomic
/// loads/stores, never a load followed by a store of a derived value.
#[derive(Debug)]
pub(crate) struct AllocationCounter {
    cumulative: AtomicIsize,
    threshold: AtomicIsize,
}

impl AllocationCounter {
    pub(crate) const fn new(threshold: usize) -> Self {
        Self {
            cumulative: AtomicIsize::new(0),
            threshold: AtomicIsize::new(to_signed(threshold)),
        }
    }

    /// Accounts for an allocation of `size` bytes and decides whether this call must record a
    /// sample.
    ///
    /// Returns the weight of the sample if this call won the right to record it. `next_interval`
    /// is only called by the winning thread, to arm the next threshold.
    ///
    /// At most one caller wins per threshold crossing. Callers that lose the race return `None`
    /// and their bytes stay in the running count, so a later allocation retriggers.
    pub(crate) fn maybe_sample(
        &self,
        size: usize,
        next_interval: impl FnOnce() -> usize,
    ) -> Option<usize> {
        let size_signed = to_signed(size);

        let accumulated = self
            .cumulative
            .fetch_add(size_signed, Ordering::AcqRel)
            .wrapping_add(size_signed);

        if accumulated < self.threshold.load(Ordering::Acquire) {
            return None;
        }

        // A zero-size allocation cannot carry a meaningful weight. The next allocation will
        // observe the same crossing.
        if size == 0 {
            return None;
        }

        if self
            .cumulative
            .compare_exchange(
                accumulated,
                CLAIM_OFFSET.wrapping_neg(),
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_err()
        {
            return None;
        }

        self.threshold
            .store(to_signed(next_interval()), Ordering::Release);

        // Bytes allocated by other threads while we were claiming are kept.
        self.cumulative.fetch_add(CLAIM_OFFSET, Ordering::AcqRel);

        Some(weight(accumulated, size))
    }

    /// Starts counting from zero toward a fresh threshold.
    ///
    /// A claim in progress is left alone: its owner arms its own threshold and restores the
    /// count when it finishes.
    pub(crate) fn reset(&self, threshold: usize) {
        self.threshold.store(to_signed(threshold), Ordering::Release);

        // A negative count carries the claim offset.
        let mut current = self.cumulative.load(Ordering::Acquire);

        while current > 0 {
            match self.cumulative.compare_exchange_weak(
                current,
                0,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn cumulative(&self) -> isize {
        self.cumulative.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn threshold(&self) -> isize {
        self.threshold.load(Ordering::Acquire)
    }
}

/// How many samples of `size` bytes the `accumulated` bytes since the previous sample represent,
/// rounded to the nearest integer and never less than one.
#[expect(clippy::integer_division, reason = "halving for rounding, remainder is irrelevant")]
fn weight(accumulated: isize, size: usize) -> usize {
    let accumulated = accumulated.unsigned_abs();
    let rounded = accumulated
        .saturating_add(size / 2)
        .checked_div(size)
        .unwrap_or(1);

    rounded.max(1)
}

/// Allocation sizes and thresholds never exceed `isize::MAX` in practice (a `Layout` cannot).
/// Anything larger saturates rather than wrapping into a negative count.
const fn to_signed(value: usize) -> isize {
    if value > isize::MAX.unsigned_abs() {
        isize::MAX
    } else {
        #[expect(
            clippy::cast_possible_wrap,
            reason = "guarded by the range check above"
        )]
        let signed = value as isize;
        signed
    }
}
