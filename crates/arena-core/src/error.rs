//! Error taxonomy for test-run lifecycle operations.

use arena_state::{StorageError, StorageResult, TestRunStatus};
use uuid::Uuid;

/// Lifecycle errors. Every variant carries a stable [`ArenaError::code`].
#[derive(Debug, thiserror::Error)]
pub enum ArenaError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("{reason} (current status: {current})")]
    InvalidStatus { current: String, reason: String },

    #[error("cannot transition from {from} to {to}: {reason}")]
    InvalidTransition {
        from: TestRunStatus,
        to: TestRunStatus,
        reason: String,
    },

    #[error("iteration limit reached: {current} of {max}")]
    IterationLimitReached { current: u32, max: u32 },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("{entity} {id} was modified concurrently{}", expected_note(.expected))]
    ConcurrentModification {
        entity: &'static str,
        id: Uuid,
        /// Status the write was guarded on, when the race was seen by the guard.
        expected: Option<String>,
    },

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("storage error: {0}")]
    Storage(#[source] StorageError),
}

fn expected_note(expected: &Option<String>) -> String {
    expected
        .as_ref()
        .map(|status| format!(" (expected status {status})"))
        .unwrap_or_default()
}

impl From<StorageError> for ArenaError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Conflict { entity, id } => Self::ConcurrentModification {
                entity,
                id,
                expected: None,
            },
            other => Self::Storage(other),
        }
    }
}

/// Treat a backend write conflict like a failed status guard, so the caller
/// reports both the same way.
pub(crate) fn conflict_as_miss<T>(outcome: StorageResult<Option<T>>) -> Result<Option<T>> {
    match outcome {
        Err(StorageError::Conflict { .. }) => Ok(None),
        other => Ok(other?),
    }
}

impl ArenaError {
    pub fn run_not_found(id: Uuid) -> Self {
        Self::NotFound {
            entity: "test run",
            id,
        }
    }

    pub fn evaluation_not_found(id: Uuid) -> Self {
        Self::NotFound {
            entity: "evaluation",
            id,
        }
    }

    pub fn persona_not_found(id: Uuid) -> Self {
        Self::NotFound {
            entity: "persona",
            id,
        }
    }

    pub fn invalid_status(current: impl ToString, reason: impl Into<String>) -> Self {
        Self::InvalidStatus {
            current: current.to_string(),
            reason: reason.into(),
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NOT_FOUND",
            Self::InvalidStatus { .. } => "INVALID_STATUS",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::IterationLimitReached { .. } => "ITERATION_LIMIT_REACHED",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::ConcurrentModification { .. } => "CONCURRENT_MODIFICATION",
            Self::UpstreamUnavailable(_) => "UPSTREAM_UNAVAILABLE",
            Self::Storage(_) => "STORAGE_ERROR",
        }
    }

    /// Status the entity was in when the operation was refused, if any.
    pub fn current_status(&self) -> Option<String> {
        match self {
            Self::InvalidStatus { current, .. } => Some(current.clone()),
            Self::InvalidTransition { from, .. } => Some(from.to_string()),
            _ => None,
        }
    }
}

/// Result type for lifecycle operations.
pub type Result<T> = std::result::Result<T, ArenaError>;
