use thiserror::Error;

/// Errors that can occur when configuring a profiler.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A configuration value could not be interpreted.
    #[error("invalid profiler configuration: {variable}='{value}' is invalid: {problem}")]
    InvalidConfig {
        /// The name of the setting, as it appears in the environment.
        variable: &'static str,

        /// The value that was rejected.
        value: String,

        /// A human-readable description of the problem.
        problem: String,
    },
}

/// A specialized `Result` type for profiler operations, returning the crate's
/// [`Error`] type as the error value.
pub(crate) type Result<T> = std::result::Result<T, Error>;
