//! Bookkeeping of live sampled allocations.

use std::collections::HashMap;
use std::sync::atomic::{self, AtomicUsize};
use std::sync::{LazyLock, Mutex, MutexGuard, PoisonError};

use foldhash::fast::RandomState;

use crate::tag::TaggedBlock;
use crate::{Sample, StackCapture};

#[derive(Debug, Default)]
struct StoreState {
    // Keyed by client-visible address.
    samples: HashMap<usize, Sample, RandomState>,
    next_ordinal: u64,
}

fn new_state() -> Mutex<StoreState> {
    Mutex::new(StoreState::default())
}

/// Owns every [`Sample`] of one profiler. A sample is present exactly while its allocation is
/// live and was picked by the sampling process.
///
/// All access goes through [`lock()`][Self::lock]. The caller must hold a
/// [`ReentrancyGuard`][crate::reentrancy::ReentrancyGuard] while holding the lock, so that
/// allocations made by the store itself do not try to take the lock again.
#[derive(Debug)]
pub(crate) struct SampleStore {
    state: LazyLock<Mutex<StoreState>>,
    stack_capture: &'static dyn StackCapture,
    max_stack_depth: AtomicUsize,
}

impl SampleStore {
    pub(crate) const fn new(stack_capture: &'static dyn StackCapture, max_stack_depth: usize) -> Self {
        Self {
            state: LazyLock::new(new_state),
            stack_capture,
            max_stack_depth: AtomicUsize::new(max_stack_depth),
        }
    }

    pub(crate) fn set_max_stack_depth(&self, depth: usize) {
        self.max_stack_depth.store(depth, atomic::Ordering::Relaxed);
    }

    pub(crate) fn max_stack_depth(&self) -> usize {
        self.max_stack_depth.load(atomic::Ordering::Relaxed)
    }

    pub(crate) fn lock(&self) -> StoreGuard<'_> {
        StoreGuard {
            store: self,
            // Every mutation below leaves the map consistent even if a stack capture panics.
            state: self.state.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }
}

/// Exclusive access to the sample store.
#[derive(Debug)]
pub(crate) struct StoreGuard<'a> {
    store: &'a SampleStore,
    state: MutexGuard<'a, StoreState>,
}

impl StoreGuard<'_> {
    /// Captures the stack, tags the block and records a sample for it.
    ///
    /// Returns the client-visible address, `block.raw() + block.offset()`.
    ///
    /// # Safety
    ///
    /// `block` must describe a live allocation whose header of `block.offset()` bytes (at least
    /// one `usize`) is not in use by anyone else.
    #[must_use]
    pub(crate) unsafe fn record(
        &mut self,
        size: usize,
        weight: usize,
        block: TaggedBlock,
        skip_frames: usize,
    ) -> *mut u8 {
        let stack = self
            .store
            .stack_capture
            .capture(skip_frames, self.store.max_stack_depth());

        // SAFETY: Forwarding the caller's guarantee about the header.
        let client = unsafe { block.tag() };

        let ordinal = self.state.next_ordinal;
        self.state.next_ordinal = ordinal.wrapping_add(1);

        self.state.samples.insert(
            client.addr(),
            Sample::new(size, weight, block.offset(), stack, ordinal),
        );

        client
    }

    /// The header size of the sampled block at `client`, if there is one.
    #[must_use]
    pub(crate) fn sampled_offset(&self, client: *const u8) -> Option<usize> {
        self.state
            .samples
            .get(&client.addr())
            .map(Sample::padding_offset)
    }

    /// Forgets the sample for `client` and clears its tag.
    ///
    /// Returns the block as the next allocator knows it. An address without a sample is returned
    /// unchanged with a zero offset: it was allocated before sampling started or was never picked.
    ///
    /// # Safety
    ///
    /// If `client` has a sample, its block must still be live.
    #[must_use]
    pub(crate) unsafe fn release(&mut self, client: *mut u8) -> TaggedBlock {
        match self.state.samples.remove(&client.addr()) {
            // SAFETY: Forwarding the caller's guarantee; the offset is the one used when tagging.
            Some(sample) => unsafe { TaggedBlock::untag(client, sample.padding_offset()) },
            None => TaggedBlock::untagged(client),
        }
    }

    /// Forgets the sample for `client` without touching its memory, which may already have been
    /// handed back to the next allocator.
    pub(crate) fn forget(&mut self, client: *mut u8) -> Option<Sample> {
        self.state.samples.remove(&client.addr())
    }

    /// Copies out every live sample recorded at or after `ordinal`, oldest first.
    #[must_use]
    pub(crate) fn samples_since(&self, ordinal: u64) -> Vec<Sample> {
        let mut samples: Vec<Sample> = self
            .state
            .samples
            .values()
            .filter(|sample| sample.ordinal() >= ordinal)
            .cloned()
            .collect();

        samples.sort_unstable_by_key(Sample::ordinal);
        samples
    }

    /// The ordinal the next recorded sample will receive.
    #[must_use]
    pub(crate) fn next_ordinal(&self) -> u64 {
        self.state.next_ordinal
    }

    /// Number of live samples.
    #[must_use]
    pub(crate) fn len(&self) -> usize {
        self.state.samples.len()
    }
}
