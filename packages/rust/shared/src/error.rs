//! Error types for the item relationship engine.
//!
//! Library crates use [`IrsError`] via `thiserror`.
//! The `irs` binary wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

use crate::types::{JobId, OrderId};

/// Top-level error type for all engine operations.
#[derive(Debug, thiserror::Error)]
pub enum IrsError {
    /// Network/HTTP failure talking to any collaborator.
    #[error("transport error: {0}")]
    Transport(String),

    /// An identifier could not be resolved by a collaborator.
    #[error("not found: {0}")]
    NotFound(String),

    /// A payload did not match its schema, or could not be parsed.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Bad job parameters, batch order, or configuration file.
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// A job or order clock elapsed.
    #[error("timeout exceeded: {0}")]
    TimeoutExceeded(String),

    /// Externally requested cancellation.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// No job with the given id is registered.
    #[error("job {0} not found")]
    JobNotFound(JobId),

    /// No batch order with the given id is registered.
    #[error("batch order {0} not found")]
    OrderNotFound(OrderId),

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, IrsError>;

impl IrsError {
    /// Create a configuration error from any displayable message.
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Failures worth another attempt: the collaborator may answer next time.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
