//! Allocator wrapper that samples allocations.

use std::alloc::{GlobalAlloc, Layout, System};
use std::{fmt, ptr};

use crate::reentrancy::ReentrancyGuard;
use crate::tag::{TaggedBlock, header_size, is_tagged, padded_layout};
use crate::{Dispatch, Profiler};

/// Innermost frames of a captured stack that belong to the profiler itself: the stack walker,
/// the store and the hook.
const SKIP_FRAMES: usize = 4;

/// A memory allocator that samples allocations into a [`Profiler`] and forwards everything to the
/// next allocator in the chain.
///
/// Unsampled allocations are forwarded unchanged. A sampled allocation is requested from the next
/// allocator with a small header in front of it; the header carries a tag that identifies the
/// block on deallocation and reallocation, and the client receives the address just past it.
///
/// While the profiler has never been started, every call is a plain passthrough. After it has been
/// started once, deallocation and reallocation keep recognizing sampled blocks even while the
/// profiler is stopped.
///
/// Chaining two sampling allocators is possible but the inner one skips its own bookkeeping
/// while the outer one is recording, as both share the per-thread re-entrancy guard. A block tagged
/// by the inner one is handed down to it untouched.
///
/// # Examples
///
/// ```rust
/// use alloc_sampler::{Profiler, SamplingAllocator};
///
/// static PROFILER: Profiler = Profiler::new();
///
/// #[global_allocator]
/// static ALLOCATOR: SamplingAllocator<std::alloc::System> = SamplingAllocator::system(&PROFILER);
/// ```
pub struct SamplingAllocator<N: Dispatch> {
    next: N,
    profiler: &'static Profiler,
}

impl<N: Dispatch> fmt::Debug for SamplingAllocator<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SamplingAllocator")
            .field("next", &"<allocator>")
            .field("profiler", &self.profiler)
            .finish()
    }
}

impl SamplingAllocator<System> {
    /// Creates a sampling allocator in front of the system allocator.
    #[must_use]
    #[inline]
    pub const fn system(profiler: &'static Profiler) -> Self {
        Self::new(System, profiler)
    }
}

impl<N: Dispatch> SamplingAllocator<N> {
    /// Creates a sampling allocator that records samples into `profiler` and forwards to `next`.
    #[must_use]
    #[inline]
    pub const fn new(next: N, profiler: &'static Profiler) -> Self {
        Self { next, profiler }
    }

    /// The next link of the chain.
    #[must_use]
    pub const fn next(&self) -> &N {
        &self.next
    }

    /// The profiler this allocator records into.
    #[must_use]
    pub const fn profiler(&self) -> &'static Profiler {
        self.profiler
    }

    /// Whether the live block at `ptr` is currently recorded as a sample.
    ///
    /// Returns `false` when called from inside profiler bookkeeping.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live block allocated by this allocator.
    #[must_use]
    pub unsafe fn is_sampled(&self, ptr: *const u8) -> bool {
        // SAFETY: Forwarding the caller's guarantee.
        if !self.profiler.is_installed() || !unsafe { is_tagged(ptr) } {
            return false;
        }

        let Some(_guard) = ReentrancyGuard::enter() else {
            return false;
        };

        self.profiler.store().lock().sampled_offset(ptr).is_some()
    }

    #[inline]
    unsafe fn hook_alloc(&self, layout: Layout, zeroed: bool) -> *mut u8 {
        if !self.profiler.is_running() || ReentrancyGuard::is_active() {
            // SAFETY: Forwarding the caller's guarantees.
            return unsafe { self.forward_alloc(layout, zeroed) };
        }

        // A request that cannot carry the header is declined before it can claim a crossing.
        let offset = header_size(layout.align());
        let Some(padded) = padded_layout(layout, offset) else {
            // SAFETY: Forwarding the caller's guarantees.
            return unsafe { self.forward_alloc(layout, zeroed) };
        };

        let Some(weight) = self.profiler.maybe_sample(layout.size()) else {
            // SAFETY: Forwarding the caller's guarantees.
            return unsafe { self.forward_alloc(layout, zeroed) };
        };

        // SAFETY: Forwarding the caller's guarantees.
        unsafe { self.alloc_sampled(layout, padded, offset, zeroed, weight) }
    }

    #[cold]
    unsafe fn alloc_sampled(
        &self,
        layout: Layout,
        padded: Layout,
        offset: usize,
        zeroed: bool,
        weight: usize,
    ) -> *mut u8 {
        let Some(_guard) = ReentrancyGuard::enter() else {
            // SAFETY: Forwarding the caller's guarantees.
            return unsafe { self.forward_alloc(layout, zeroed) };
        };

        // SAFETY: The padded layout is at least as large as the caller's non-zero layout.
        let raw = unsafe { self.forward_alloc(padded, zeroed) };
        if raw.is_null() {
            return raw;
        }

        let mut store = self.profiler.store().lock();

        // SAFETY: We just allocated the block with `offset` bytes of header in front.
        unsafe {
            store.record(
                layout.size(),
                weight,
                TaggedBlock::new(raw, offset),
                SKIP_FRAMES,
            )
        }
    }

    #[inline]
    unsafe fn forward_alloc(&self, layout: Layout, zeroed: bool) -> *mut u8 {
        if zeroed {
            // SAFETY: Forwarding the caller's guarantees.
            unsafe { self.next.alloc_zeroed(layout) }
        } else {
            // SAFETY: Forwarding the caller's guarantees.
            unsafe { self.next.alloc(layout) }
        }
    }

    #[inline]
    unsafe fn hook_dealloc(&self, ptr: *mut u8, layout: Layout) {
        // SAFETY: The caller guarantees the block is live and comes from us.
        if !self.profiler.is_installed() || !unsafe { is_tagged(ptr) } {
            // SAFETY: Forwarding the caller's guarantees.
            unsafe { self.next.dealloc(ptr, layout) };
            return;
        }

        let block = match ReentrancyGuard::enter() {
            // SAFETY: The block is live until we forward it below.
            Some(_guard) => unsafe { self.profiler.store().lock().release(ptr) },
            // SAFETY: The tag says the block carries the header its alignment implies.
            None => unsafe { TaggedBlock::untag(ptr, header_size(layout.align())) },
        };

        // SAFETY: Forwarding the block as the next allocator handed it out.
        unsafe { self.next.dealloc(block.raw(), raw_layout(layout, block)) };
    }

    #[inline]
    unsafe fn hook_realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        // SAFETY: The caller guarantees the block is live and comes from us.
        let tagged = self.profiler.is_installed() && unsafe { is_tagged(ptr) };

        if !tagged && (!self.profiler.is_running() || ReentrancyGuard::is_active()) {
            // SAFETY: Forwarding the caller's guarantees.
            return unsafe { self.next.realloc(ptr, layout, new_size) };
        }

        let Some(guard) = ReentrancyGuard::enter() else {
            // Only tagged blocks get here. The record stays behind because the store is not ours
            // to lock right now, but the block itself must shed its header.
            // SAFETY: Forwarding the caller's guarantees.
            return unsafe {
                self.realloc_unpadded(ptr, layout, header_size(layout.align()), new_size)
            };
        };

        let old_offset = if tagged {
            let old_offset = self.profiler.store().lock().sampled_offset(ptr);

            if old_offset.is_none() {
                // The tag belongs to a sampler further down the chain or is a coincidence.
                // The block goes on untouched and without our guard, so its owner can update
                // its own record.
                drop(guard);

                // SAFETY: Forwarding the caller's guarantees.
                return unsafe { self.next.realloc(ptr, layout, new_size) };
            }

            old_offset
        } else {
            None
        };

        let offset = header_size(layout.align());

        // A padded size that does not fit is declined before it can claim a crossing.
        let paddable = Layout::from_size_align(new_size, layout.align())
            .ok()
            .and_then(|new_layout| padded_layout(new_layout, offset))
            .is_some();

        let sampled = if paddable && self.profiler.is_running() {
            self.profiler.maybe_sample(new_size)
        } else {
            None
        };

        let Some(old_offset) = old_offset else {
            let Some(weight) = sampled else {
                drop(guard);

                // SAFETY: Forwarding the caller's guarantees.
                return unsafe { self.next.realloc(ptr, layout, new_size) };
            };

            // SAFETY: Forwarding the caller's guarantees, the padded size was validated above.
            let raw = unsafe { self.next.realloc(ptr, layout, new_size.wrapping_add(offset)) };
            if raw.is_null() {
                return raw;
            }

            // SAFETY: The block has room for the header plus `new_size` bytes and holds the
            // surviving bytes at its start. `ptr::copy` allows the regions to overlap.
            unsafe {
                ptr::copy(raw, raw.wrapping_add(offset), layout.size().min(new_size));
            }

            let mut store = self.profiler.store().lock();

            // SAFETY: The header in front of the moved bytes is ours.
            return unsafe {
                store.record(new_size, weight, TaggedBlock::new(raw, offset), SKIP_FRAMES)
            };
        };

        let mut store = self.profiler.store().lock();

        match sampled {
            None => {
                // SAFETY: Forwarding the caller's guarantees, the store confirmed the header.
                let new_ptr = unsafe { self.realloc_unpadded(ptr, layout, old_offset, new_size) };

                if !new_ptr.is_null() {
                    store.forget(ptr);
                }

                new_ptr
            }
            Some(weight) => {
                // The store confirmed the header, so this is the block the next allocator
                // handed out.
                let old_raw = TaggedBlock::new(ptr.wrapping_sub(old_offset), old_offset);

                // SAFETY: Forwarding the block as the next allocator knows it. The padded size
                // was validated above; `offset` equals `old_offset` because alignment is fixed.
                let raw = unsafe {
                    self.next.realloc(
                        old_raw.raw(),
                        raw_layout(layout, old_raw),
                        new_size.wrapping_add(old_offset),
                    )
                };
                if raw.is_null() {
                    return raw;
                }

                // The old address may now belong to someone else, so only the map is touched.
                store.forget(ptr);

                // SAFETY: Reallocation preserved the header along with the bytes behind it.
                unsafe {
                    store.record(
                        new_size,
                        weight,
                        TaggedBlock::new(raw, old_offset),
                        SKIP_FRAMES,
                    )
                }
            }
        }
    }

    /// Moves the bytes of a padded block down to its raw address and reallocates it without the
    /// header.
    ///
    /// On failure the block is restored exactly, tag included, and null is returned.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live tagged block of `layout` with `offset` bytes of header.
    unsafe fn realloc_unpadded(
        &self,
        ptr: *mut u8,
        layout: Layout,
        offset: usize,
        new_size: usize,
    ) -> *mut u8 {
        let surviving = layout.size().min(new_size);

        // SAFETY: The caller guarantees the header.
        let block = unsafe { TaggedBlock::untag(ptr, offset) };

        // SAFETY: Both ranges lie within the padded block. `ptr::copy` allows overlap.
        unsafe {
            ptr::copy(ptr, block.raw(), surviving);
        }

        // SAFETY: The block is still exactly what the next allocator handed out.
        let new_ptr = unsafe { self.next.realloc(block.raw(), raw_layout(layout, block), new_size) };

        if new_ptr.is_null() {
            // The next allocator left the block untouched, so undo the move and the untagging.
            // Bytes past `surviving` were never overwritten.
            // SAFETY: Same ranges as above, reversed.
            unsafe {
                ptr::copy(block.raw(), ptr, surviving);
            }

            // SAFETY: The header is still part of the live block.
            let _client = unsafe { block.tag() };
        }

        new_ptr
    }

    #[inline]
    unsafe fn hook_size_estimate(&self, ptr: *mut u8, layout: Layout) -> usize {
        // SAFETY: The caller guarantees the block is live and comes from us.
        let offset = if self.profiler.is_installed() && unsafe { is_tagged(ptr) } {
            match ReentrancyGuard::enter() {
                Some(_guard) => self.profiler.store().lock().sampled_offset(ptr),
                None => Some(header_size(layout.align())),
            }
        } else {
            None
        };

        match offset {
            Some(offset) => {
                let block = TaggedBlock::new(ptr.wrapping_sub(offset), offset);

                // SAFETY: Forwarding the block as the next allocator knows it.
                let padded_estimate =
                    unsafe { self.next.size_estimate(block.raw(), raw_layout(layout, block)) };

                padded_estimate.saturating_sub(offset)
            }
            // SAFETY: Forwarding the caller's guarantees.
            None => unsafe { self.next.size_estimate(ptr, layout) },
        }
    }
}

/// The layout the next allocator used for `block`, given the client layout.
fn raw_layout(layout: Layout, block: TaggedBlock) -> Layout {
    if !block.is_padded() {
        return layout;
    }

    // SAFETY: The same padded layout was validated with `padded_layout()` when the block was
    // sampled, and the client layout is unchanged since then.
    unsafe {
        Layout::from_size_align_unchecked(
            layout.size().wrapping_add(block.offset()),
            layout.align(),
        )
    }
}

// SAFETY: Every block we return is either the next allocator's block unchanged or an address
// inside a larger block of the next allocator, aligned as requested and followed by at least the
// requested size. Every block we are handed back is translated to the next allocator's view before
// forwarding.
unsafe impl<N: Dispatch> GlobalAlloc for SamplingAllocator<N> {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // SAFETY: Forwarding the caller's guarantees.
        unsafe { self.hook_alloc(layout, false) }
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        // SAFETY: Forwarding the caller's guarantees.
        unsafe { self.hook_dealloc(ptr, layout) }
    }

    #[inline]
    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        // SAFETY: Forwarding the caller's guarantees.
        unsafe { self.hook_alloc(layout, true) }
    }

    #[inline]
    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        // SAFETY: Forwarding the caller's guarantees.
        unsafe { self.hook_realloc(ptr, layout, new_size) }
    }
}

// SAFETY: Same reasoning as for `GlobalAlloc`. The prefix word of a sampled block is part of our
// header, so it is readable.
unsafe impl<N: Dispatch> Dispatch for SamplingAllocator<N> {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // SAFETY: Forwarding the caller's guarantees.
        unsafe { self.hook_alloc(layout, false) }
    }

    #[inline]
    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        // SAFETY: Forwarding the caller's guarantees.
        unsafe { self.hook_alloc(layout, true) }
    }

    #[inline]
    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        // SAFETY: Forwarding the caller's guarantees.
        unsafe { self.hook_realloc(ptr, layout, new_size) }
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        // SAFETY: Forwarding the caller's guarantees.
        unsafe { self.hook_dealloc(ptr, layout) }
    }

    #[inline]
    unsafe fn size_estimate(&self, ptr: *mut u8, layout: Layout) -> usize {
        // SAFETY: Forwarding the caller's guarantees.
        unsafe { self.hook_size_estimate(ptr, layout) }
    }
}
