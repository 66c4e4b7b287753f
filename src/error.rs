//! Error types for the Sendgate daemon.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for Sendgate operations.
#[derive(Error, Debug)]
pub enum SendgateError {
    /// Configuration validation errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors raised while reading configuration sources
    #[error("Configuration error: {0}")]
    ConfigSource(#[from] config::ConfigError),

    /// A whitelist or domain-limit file could not be read
    #[error("Failed to load map file {}: {source}", .path.display())]
    MapFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The token snapshot could not be read or written
    #[error("Snapshot error for {}: {source}", .path.display())]
    Snapshot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Sendgate operations.
pub type Result<T> = std::result::Result<T, SendgateError>;
