use thiserror::Error;

/// Error taxonomy for the orchestration core.
///
/// Idempotency collisions are deliberately not represented here: deduplicated
/// appends and enqueues report through their return values (`Ok(None)` /
/// `is_new = false`) because replays are part of the contract, not failures.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid phase transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("run was modified concurrently; re-read and retry")]
    OptimisticLockFailed,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("retryable external failure: {0}")]
    RetryableExternal(String),

    #[error("permanent external failure: {0}")]
    PermanentExternal(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;
