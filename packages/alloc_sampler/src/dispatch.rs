//! The allocator capability set that a link of the hook chain forwards to.

use std::alloc::{GlobalAlloc, Layout, System};
use std::io::{self, Write};
use std::process;

/// One link of an allocator chain: the entry points a [`SamplingAllocator`][crate::SamplingAllocator]
/// forwards to once it has done its own bookkeeping.
///
/// The first four methods have the same contract as their [`GlobalAlloc`] counterparts.
/// [`size_estimate()`][Self::size_estimate] reports the usable size of a live block. The batch and
/// definite-size entry points cannot be intercepted with in-band headers, so by default they abort
/// the process instead of silently mis-accounting memory.
///
/// # Safety
///
/// Implementations must uphold the [`GlobalAlloc`] contract. In addition, the `usize` immediately
/// before every block they return must be readable for as long as the block is live, because
/// sampled blocks are recognized by a tag stored there.
pub unsafe trait Dispatch: Send + Sync {
    /// See [`GlobalAlloc::alloc()`].
    ///
    /// # Safety
    ///
    /// See [`GlobalAlloc::alloc()`].
    unsafe fn alloc(&self, layout: Layout) -> *mut u8;

    /// See [`GlobalAlloc::alloc_zeroed()`].
    ///
    /// # Safety
    ///
    /// See [`GlobalAlloc::alloc_zeroed()`].
    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8;

    /// See [`GlobalAlloc::realloc()`].
    ///
    /// # Safety
    ///
    /// See [`GlobalAlloc::realloc()`].
    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8;

    /// See [`GlobalAlloc::dealloc()`].
    ///
    /// # Safety
    ///
    /// See [`GlobalAlloc::dealloc()`].
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout);

    /// The number of bytes usable at `ptr`, at least `layout.size()`.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live block allocated by this allocator with `layout`.
    unsafe fn size_estimate(&self, ptr: *mut u8, layout: Layout) -> usize;

    /// Allocates several blocks of the same layout at once. Not supported, aborts the process.
    ///
    /// # Safety
    ///
    /// Never returns.
    unsafe fn batch_alloc(&self, _layout: Layout, _blocks: &mut [*mut u8]) -> usize {
        unsupported("batch_alloc")
    }

    /// Frees several blocks of the same layout at once. Not supported, aborts the process.
    ///
    /// # Safety
    ///
    /// Never returns.
    unsafe fn batch_free(&self, _blocks: &[*mut u8], _layout: Layout) {
        unsupported("batch_free")
    }

    /// Frees a block through a size-specialized path. Not supported, aborts the process.
    ///
    /// # Safety
    ///
    /// Never returns.
    unsafe fn free_definite_size(&self, _ptr: *mut u8, _layout: Layout) {
        unsupported("free_definite_size")
    }
}

#[cold]
#[cfg_attr(test, mutants::skip)] // Aborts the test process.
fn unsupported(operation: &str) -> ! {
    // Formatting machinery may allocate, so the message is written piecewise.
    let mut stderr = io::stderr();
    drop(stderr.write_all(b"alloc_sampler: unsupported allocator operation: "));
    drop(stderr.write_all(operation.as_bytes()));
    drop(stderr.write_all(b"\n"));

    process::abort();
}

// SAFETY: We delegate all allocation operations to the system allocator, which keeps its own
// bookkeeping in front of every block it returns.
unsafe impl Dispatch for System {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // SAFETY: Forwarding the caller's guarantees.
        unsafe { GlobalAlloc::alloc(self, layout) }
    }

    #[inline]
    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        // SAFETY: Forwarding the caller's guarantees.
        unsafe { GlobalAlloc::alloc_zeroed(self, layout) }
    }

    #[inline]
    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        // SAFETY: Forwarding the caller's guarantees.
        unsafe { GlobalAlloc::realloc(self, ptr, layout, new_size) }
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        // SAFETY: Forwarding the caller's guarantees.
        unsafe { GlobalAlloc::dealloc(self, ptr, layout) }
    }

    #[cfg(target_os = "linux")]
    #[inline]
    unsafe fn size_estimate(&self, ptr: *mut u8, layout: Layout) -> usize {
        // SAFETY: Every block the system allocator hands out on Linux comes from the C heap,
        // aligned or not, and the caller guarantees it is live.
        let usable = unsafe { libc::malloc_usable_size(ptr.cast()) };

        usable.max(layout.size())
    }

    #[cfg(not(target_os = "linux"))]
    #[inline]
    unsafe fn size_estimate(&self, _ptr: *mut u8, layout: Layout) -> usize {
        layout.size()
    }
}

/// Adapts any [`GlobalAlloc`] into a [`Dispatch`] link.
///
/// The size estimate is the requested size, as [`GlobalAlloc`] has no way to report more.
///
/// # Examples
///
/// ```rust
/// use std::alloc::System;
///
/// use alloc_sampler::{Forward, Profiler, SamplingAllocator};
///
/// static PROFILER: Profiler = Profiler::new();
///
/// #[global_allocator]
/// static ALLOCATOR: SamplingAllocator<Forward<System>> =
///     SamplingAllocator::new(Forward::new(System), &PROFILER);
/// ```
#[derive(Debug, Default)]
pub struct Forward<A: GlobalAlloc> {
    inner: A,
}

impl<A: GlobalAlloc> Forward<A> {
    /// Wraps `inner`.
    #[must_use]
    pub const fn new(inner: A) -> Self {
        Self { inner }
    }

    /// The wrapped allocator.
    #[must_use]
    pub const fn inner(&self) -> &A {
        &self.inner
    }
}

// SAFETY: We delegate all allocation operations to the wrapped allocator. The caller picked it as
// the next link, which includes the readable-prefix requirement of the trait.
unsafe impl<A: GlobalAlloc + Send + Sync> Dispatch for Forward<A> {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // SAFETY: Forwarding the caller's guarantees.
        unsafe { self.inner.alloc(layout) }
    }

    #[inline]
    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        // SAFETY: Forwarding the caller's guarantees.
        unsafe { self.inner.alloc_zeroed(layout) }
    }

    #[inline]
    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        // SAFETY: Forwarding the caller's guarantees.
        unsafe { self.inner.realloc(ptr, layout, new_size) }
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        // SAFETY: Forwarding the caller's guarantees.
        unsafe { self.inner.dealloc(ptr, layout) }
    }

    #[inline]
    unsafe fn size_estimate(&self, _ptr: *mut u8, layout: Layout) -> usize {
        layout.size()
    }
}
