//! Error handling module for the farct CLI.
//!
//! Archive failures come back as [`farc::ArchiveError`] and are wrapped with
//! `anyhow` context at the command level; this enum covers what the CLI
//! itself can get wrong.

use thiserror::Error;

/// Errors raised by the CLI layer.
#[derive(Error, Debug)]
pub enum FarctError {
    /// Configuration file missing or malformed.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Command-line value rejected after parsing.
    #[error("Validation error: {0}")]
    Validation(String),

    /// IO failure outside the archive library.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Report serialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias using FarctError.
pub type Result<T> = std::result::Result<T, FarctError>;
