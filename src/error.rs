//! Unified error types for Lookout

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for Lookout operations
#[derive(Error, Debug)]
pub enum Error {
    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // Config errors
    #[error("Failed to read config file '{path}': {source}")]
    ConfigRead { path: PathBuf, source: io::Error },

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Config validation failed: {0}")]
    ConfigValidation(String),

    #[error("Invalid duration '{input}': {message}")]
    InvalidDuration { input: String, message: String },

    // Compose discovery errors
    #[error("Failed to read compose file '{path}': {source}")]
    ComposeRead { path: PathBuf, source: io::Error },

    #[error("Failed to parse compose file '{path}': {source}")]
    ComposeParse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("Duplicate container_name '{container}': used by services '{first}' and '{second}'")]
    DuplicateContainerName {
        container: String,
        first: String,
        second: String,
    },

    // Docker errors
    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    /// Synthesized gateway failure, raised by the in-memory fakes
    #[cfg(test)]
    #[error("Docker operation failed: {0}")]
    Gateway(String),

    // Hook errors
    #[error("Hook failed: {command} - {message}")]
    HookFailed { command: String, message: String },

    #[error("Hook timeout after {0} seconds")]
    HookTimeout(u64),
}

/// Result type alias for Lookout operations
pub type Result<T> = std::result::Result<T, Error>;
