//! Error types for the learning core.

use thiserror::Error;

/// Errors surfaced by the learning core.
///
/// Only [`BrainError::InvalidArgument`] is expected to reach a caller of
/// [`crate::rl::engine::LearningEngine::decide`]. Everything else is
/// produced by persistence or the background loop, where it is logged and
/// contained.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BrainError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed to {operation}: {source}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("training universe is inconsistent: state {0} has no target")]
    InconsistentUniverse(String),

    #[error("the learning engine must be started inside a tokio runtime")]
    NoRuntime,

    #[error("background task failed: {0}")]
    BackgroundTask(String),
}

impl BrainError {
    pub(crate) fn io(operation: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, BrainError>;
