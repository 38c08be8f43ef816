//! Error types for the Basalt runtime.

use basalt_config::ConfigError;
use basalt_types::ViewId;
use basalt_view::ViewError;
use thiserror::Error;

/// Result type for Basalt operations.
pub type Result<T> = std::result::Result<T, BasaltError>;

/// Errors that can occur while operating a Basalt database.
#[derive(Debug, Error)]
pub enum BasaltError {
    /// Schema, expression, bind or key-size error from the view engine.
    #[error(transparent)]
    View(#[from] ViewError),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error while reading or writing segments and bookkeeping files.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Segment or bookkeeping file could not be (de)serialized.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// No table with this name.
    #[error("table not found: {0}")]
    TableNotFound(String),

    /// No view with this name.
    #[error("view not found: {0}")]
    ViewNotFound(String),

    /// The request is well-formed but cannot be served.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A queued view update keeps failing. It stays at the head of the
    /// queue and is retried on the next drain.
    #[error("view {view_id} update failed after {attempts} attempts: {reason}")]
    PropagationStalled {
        view_id: ViewId,
        attempts: u32,
        reason: String,
    },

    /// Internal invariant broken.
    #[error("internal error: {0}")]
    Internal(String),
}

impl BasaltError {
    /// Creates an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Returns the view engine error, if this is one.
    pub fn as_view_error(&self) -> Option<&ViewError> {
        match self {
            Self::View(e) => Some(e),
            _ => None,
        }
    }
}
