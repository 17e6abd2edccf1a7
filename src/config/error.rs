//! Error type shared by the configuration layer.

use thiserror::Error;

/// Failure while locating, reading, or validating configuration.
///
/// Loader failures (missing files, conflicting overrides) and semantic
/// failures (a value that parses but makes no sense, such as a zero
/// heartbeat interval) share this one type so callers get a single
/// `Result<Settings, ConfigError>` out of the whole layer.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required configuration file does not exist on disk.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// A file or override was read but could not be deserialized.
    #[error("failed to parse configuration: {0}")]
    ParseError(String),

    /// A value deserialized fine but fails a semantic check.
    #[error("invalid configuration value for {field}: {message}")]
    ValidationError {
        /// Dotted path of the offending setting, e.g. `queue.lock_lease_secs`.
        field: String,
        /// What the value must satisfy.
        message: String,
    },

    /// An environment variable held a value the loader cannot interpret.
    #[error("bad environment variable: {0}")]
    EnvVarError(String),

    /// Two override sources were supplied that cannot be combined.
    #[error("conflicting configuration sources: {0}")]
    MutualExclusivityError(String),

    /// Anything else bubbled up from the underlying `config` crate.
    #[error(transparent)]
    Other(#[from] config::ConfigError),
}

impl ConfigError {
    /// Build a [`ConfigError::ValidationError`] for `field`.
    pub fn validation<F, M>(field: F, message: M) -> Self
    where
        F: Into<String>,
        M: Into<String>,
    {
        ConfigError::ValidationError {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Build a [`ConfigError::FileNotFound`] for `path`.
    pub fn file_not_found<P: Into<String>>(path: P) -> Self {
        ConfigError::FileNotFound(path.into())
    }

    /// Build a [`ConfigError::MutualExclusivityError`] with `message`.
    pub fn mutual_exclusivity<M: Into<String>>(message: M) -> Self {
        ConfigError::MutualExclusivityError(message.into())
    }
}
