//! Startup configuration errors following panic-free policy.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading or validating the service configuration.
///
/// All of these are fatal: the daemon refuses to start.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file could not be read
    #[error("Failed to read config file {path}: {reason}")]
    Read { path: PathBuf, reason: String },

    /// Configuration file is not valid JSON for the expected schema
    #[error("Failed to parse config file {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    /// No modems defined
    #[error("No modems defined")]
    NoModems,

    /// Two modems share the same name
    #[error("Duplicate modem name '{name}'")]
    DuplicateModem { name: String },

    /// Modem has no executable configured
    #[error("Modem executable for '{name}' not defined")]
    MissingCommand { name: String },

    /// Executable could not be located on the search path
    #[error("Failed to find executable {path:?} for '{name}': {reason}")]
    ExecutableNotFound {
        name: String,
        path: String,
        reason: String,
    },

    /// Override ini file does not exist
    #[error("Failed to find config file {path} for '{name}'")]
    ConfigFileMissing { name: String, path: PathBuf },

    /// Invalid field value
    #[error("Invalid {field}: {value} (expected {expected})")]
    InvalidFieldValue {
        field: String,
        value: String,
        expected: String,
    },
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;
