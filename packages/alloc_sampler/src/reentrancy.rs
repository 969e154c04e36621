//! Per-thread guard that keeps the profiler from profiling itself.

use std::cell::Cell;
use std::marker::PhantomData;

thread_local! {
    // Const-initialized with no destructor, so it can be accessed at any point of the thread's
    // life, including while other thread-local destructors run and allocate.
    static INSIDE_PROFILER: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as being inside profiler bookkeeping for as long as it lives.
///
/// Bookkeeping allocates (stack buffers, map growth, snapshot copies). Those nested allocations
/// re-enter the hooks, which see the guard and fall back to plain passthrough instead of
/// recursing or trying to take the sample store mutex a second time.
#[derive(Debug)]
pub(crate) struct ReentrancyGuard {
    _not_send: PhantomData<*const ()>,
}

impl ReentrancyGuard {
    /// Enters bookkeeping, or returns `None` if this thread is already inside it.
    #[must_use]
    pub(crate) fn enter() -> Option<Self> {
        if INSIDE_PROFILER.replace(true) {
            return None;
        }

        Some(Self {
            _not_send: PhantomData,
        })
    }

    /// Whether the current thread is inside bookkeeping.
    #[must_use]
    pub(crate) fn is_active() -> bool {
        INSIDE_PROFILER.get()
    }
}

impl Drop for ReentrancyGuard {
    fn drop(&mut self) {
        INSIDE_PROFILER.set(false);
    }
}
