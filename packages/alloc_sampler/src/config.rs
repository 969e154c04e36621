use crate::{DEFAULT_MAX_STACK_DEPTH, DEFAULT_SAMPLING_INTERVAL, Error, Result};

/// Environment variable holding the mean sampling interval in bytes.
pub const ENV_SAMPLING_INTERVAL: &str = "ALLOC_SAMPLER_INTERVAL";

/// Environment variable holding the maximum number of stack frames captured per sample.
pub const ENV_MAX_STACK_DEPTH: &str = "ALLOC_SAMPLER_MAX_STACK_DEPTH";

/// Environment variable that, when set to `1` or `true`, makes
/// [`Profiler::apply_config()`][crate::Profiler::apply_config] start the profiler.
pub const ENV_START: &str = "ALLOC_SAMPLER_START";

/// Settings of a [`Profiler`][crate::Profiler].
///
/// # Examples
///
/// ```rust
/// use alloc_sampler::{Profiler, ProfilerConfig};
///
/// static PROFILER: Profiler = Profiler::with_config(
///     ProfilerConfig::new()
///         .with_sampling_interval(64 * 1024)
///         .with_max_stack_depth(32),
/// );
///
/// assert_eq!(PROFILER.sampling_interval(), 64 * 1024);
/// ```
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ProfilerConfig {
    sampling_interval: usize,
    max_stack_depth: usize,
    start_running: bool,
}

impl ProfilerConfig {
    /// The default configuration: a 128 KiB interval, 64 frames, not started.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            sampling_interval: DEFAULT_SAMPLING_INTERVAL,
            max_stack_depth: DEFAULT_MAX_STACK_DEPTH,
            start_running: false,
        }
    }

    /// Sets the mean number of bytes between samples.
    #[must_use]
    pub const fn with_sampling_interval(mut self, bytes: usize) -> Self {
        self.sampling_interval = bytes;
        self
    }

    /// Sets the maximum number of frames captured per sample.
    #[must_use]
    pub const fn with_max_stack_depth(mut self, frames: usize) -> Self {
        self.max_stack_depth = frames;
        self
    }

    /// Sets whether applying this configuration starts the profiler.
    #[must_use]
    pub const fn with_start_running(mut self, start_running: bool) -> Self {
        self.start_running = start_running;
        self
    }

    /// The mean number of bytes between samples.
    #[must_use]
    pub const fn sampling_interval(&self) -> usize {
        self.sampling_interval
    }

    /// The maximum number of frames captured per sample.
    #[must_use]
    pub const fn max_stack_depth(&self) -> usize {
        self.max_stack_depth
    }

    /// Whether applying this configuration starts the profiler.
    #[must_use]
    pub const fn start_running(&self) -> bool {
        self.start_running
    }

    /// Reads the configuration from the process environment, falling back to the defaults for
    /// anything not set.
    ///
    /// Call this from regular code, not from inside an allocator.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if a variable is set to something that cannot be parsed,
    /// or to a zero sampling interval.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env()`][Self::from_env] but resolves variables through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if a variable is set to something that cannot be parsed,
    /// or to a zero sampling interval.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::new();

        if let Some(value) = lookup(ENV_SAMPLING_INTERVAL) {
            let bytes = parse_count(ENV_SAMPLING_INTERVAL, &value)?;

            if bytes == 0 {
                return Err(Error::InvalidConfig {
                    variable: ENV_SAMPLING_INTERVAL,
                    value,
                    problem: "the sampling interval must be at least one byte".to_string(),
                });
            }

            config.sampling_interval = bytes;
        }

        if let Some(value) = lookup(ENV_MAX_STACK_DEPTH) {
            config.max_stack_depth = parse_count(ENV_MAX_STACK_DEPTH, &value)?;
        }

        if let Some(value) = lookup(ENV_START) {
            config.start_running = parse_flag(ENV_START, &value)?;
        }

        tracing::debug!(?config, "profiler configuration loaded");

        Ok(config)
    }
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_count(variable: &'static str, value: &str) -> Result<usize> {
    value.trim().parse().map_err(|e| Error::InvalidConfig {
        variable,
        value: value.to_string(),
        problem: format!("not a non-negative integer: {e}"),
    })
}

fn parse_flag(variable: &'static str, value: &str) -> Result<bool> {
    match value.trim() {
        "1" | "true" => Ok(true),
        "0" | "false" | "" => Ok(false),
        _ => Err(Error::InvalidConfig {
            variable,
            value: value.to_string(),
            problem: "expected one of 1, true, 0, false".to_string(),
        }),
    }
}
