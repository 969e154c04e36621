//! The record kept for each sampled allocation.

use std::fmt;

/// One sampled allocation that is still live.
///
/// A sample stands in for `weight` allocations of `size` bytes: larger allocations are more
/// likely to be picked by the sampling process, and the weight compensates for that. Summing
/// [`estimated_bytes()`][Self::estimated_bytes] over a set of samples gives an unbiased estimate
/// of the bytes held by the allocations they represent.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Sample {
    size: usize,
    weight: usize,
    padding_offset: usize,
    stack: Vec<usize>,
    ordinal: u64,
}

impl Sample {
    pub(crate) const fn new(
        size: usize,
        weight: usize,
        padding_offset: usize,
        stack: Vec<usize>,
        ordinal: u64,
    ) -> Self {
        Self {
            size,
            weight,
            padding_offset,
            stack,
            ordinal,
        }
    }

    /// The size the caller asked for, excluding the header the profiler put in front of it.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// How many allocations of this size this sample represents. Always at least 1.
    #[must_use]
    pub const fn weight(&self) -> usize {
        self.weight
    }

    /// Bytes between the address the wrapped allocator returned and the client-visible address.
    #[must_use]
    pub const fn padding_offset(&self) -> usize {
        self.padding_offset
    }

    /// Return addresses captured when the allocation was sampled, innermost frame first.
    #[must_use]
    pub fn stack(&self) -> &[usize] {
        &self.stack
    }

    /// Position of this sample in the order samples were recorded by its profiler.
    ///
    /// Use with [`Profiler::current_ordinal()`][crate::Profiler::current_ordinal] and
    /// [`Profiler::samples_since()`][crate::Profiler::samples_since] to collect only samples
    /// recorded after a point in time.
    #[must_use]
    pub const fn ordinal(&self) -> u64 {
        self.ordinal
    }

    /// `size * weight`, this sample's contribution to an estimate of total live bytes.
    #[must_use]
    pub const fn estimated_bytes(&self) -> usize {
        self.size.saturating_mul(self.weight)
    }
}

impl fmt::Display for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {} bytes x{} ({} frames)",
            self.ordinal,
            self.size,
            self.weight,
            self.stack.len()
        )?;

        for address in &self.stack {
            write!(f, "\n    {address:#x}")?;
        }

        Ok(())
    }
}
