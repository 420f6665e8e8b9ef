use crate::FenceToken;
use uuid::Uuid;

/// A convenience `Result` alias using [`KeystoneError`].
pub type KeystoneResult<T> = Result<T, KeystoneError>;

/// Top-level error type for the Keystone core.
///
/// Callers decide whether to retry by asking [`KeystoneError::is_retryable`]
/// or [`KeystoneError::is_transient`]; the variant carries that information,
/// so message text never needs to be inspected.
#[derive(Debug, thiserror::Error)]
pub enum KeystoneError {
    /// The fairness queue did not grant the lock before the timeout elapsed.
    #[error("Contention timeout on '{resource}' after {waited_ms}ms")]
    ContentionTimeout {
        /// The contended resource key.
        resource: String,
        /// How long the caller waited.
        waited_ms: u64,
    },

    /// The presented fence token no longer matches the live lease.
    #[error("Lease lost on '{resource}' (fence {fence})")]
    LeaseLost {
        /// The resource whose lease was lost.
        resource: String,
        /// The fence token the caller presented.
        fence: FenceToken,
    },

    /// A backing service (lease store or repository) could not be reached.
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// The circuit breaker is open and rejecting attempts without contacting the backend.
    #[error("Circuit open, retry in {retry_in_ms}ms")]
    CircuitOpen {
        /// Remaining cooldown before a probe is admitted.
        retry_in_ms: u64,
    },

    /// Optimistic concurrency check failed at the repository boundary.
    #[error("Version conflict on session {id}: expected {expected}, found {actual}")]
    VersionConflict {
        /// The session id.
        id: Uuid,
        /// The version the writer loaded.
        expected: u64,
        /// The version currently stored.
        actual: u64,
    },

    /// A write was presented with a fence older than one already accepted.
    #[error("Stale fence on session {id}: presented {presented}, accepted {accepted}")]
    StaleFence {
        /// The session id.
        id: Uuid,
        /// The fence the writer presented.
        presented: FenceToken,
        /// The highest fence previously accepted.
        accepted: FenceToken,
    },

    /// The session does not exist.
    #[error("Session not found: {0}")]
    NotFound(Uuid),

    /// A session already exists with this id.
    #[error("Session already exists: {0}")]
    AlreadyExists(Uuid),

    /// The requested lifecycle transition is not permitted.
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl KeystoneError {
    /// Contention or lease loss: safe to retry because nothing was written.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            KeystoneError::ContentionTimeout { .. }
                | KeystoneError::LeaseLost { .. }
                | KeystoneError::VersionConflict { .. }
                | KeystoneError::StaleFence { .. }
        )
    }

    /// A backend failure that callers retry with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            KeystoneError::Unavailable(_)
                | KeystoneError::CircuitOpen { .. }
                | KeystoneError::Io(_)
        )
    }
}
