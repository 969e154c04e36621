//! Stack trace capture used when recording a sample.

use std::fmt::Debug;

/// Default number of frames kept per sample.
pub const DEFAULT_MAX_STACK_DEPTH: usize = 64;

/// Captures the return addresses of the current call stack.
///
/// Implementations are called while the sample store mutex is held and while the current thread
/// is marked as inside profiler bookkeeping, so they may allocate (those allocations are never
/// sampled) but must not call back into the profiler facade.
pub trait StackCapture: Debug + Send + Sync {
    /// Returns at most `max_depth` return addresses, innermost first, after dropping the
    /// `skip_frames` innermost frames.
    fn capture(&self, skip_frames: usize, max_depth: usize) -> Vec<usize>;
}

/// Walks the stack with the `backtrace` crate. Symbols are not resolved.
#[derive(Clone, Copy, Debug, Default)]
pub struct BacktraceCapture;

impl StackCapture for BacktraceCapture {
    #[cfg_attr(test, mutants::skip)] // Frame counts depend on inlining decisions.
    fn capture(&self, skip_frames: usize, max_depth: usize) -> Vec<usize> {
        let mut frames = Vec::with_capacity(max_depth);
        let mut remaining_skip = skip_frames;

        backtrace::trace(|frame| {
            if remaining_skip > 0 {
                remaining_skip = remaining_skip.saturating_sub(1);
                return true;
            }

            if frames.len() >= max_depth {
                return false;
            }

            frames.push(frame.ip().addr());
            true
        });

        frames
    }
}

/// Records samples without any stack. Useful when only sizes and weights matter.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoStackCapture;

impl StackCapture for NoStackCapture {
    fn capture(&self, _skip_frames: usize, _max_depth: usize) -> Vec<usize> {
        Vec::new()
    }
}
