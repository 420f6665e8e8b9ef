use keystone_core::KeystoneError;
use keystone_session::SessionStatus;
use serde::{Deserialize, Serialize};

/// Result of one orchestration step.
///
/// Every failure leaves the persisted session unchanged, except for a
/// rehydration write that happened before the requested change was evaluated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    /// The change was persisted.
    Success {
        /// Status after the step.
        status: SessionStatus,
        /// Stored version after the step.
        version: u64,
    },
    /// The state machine refused the change.
    InvalidTransition {
        /// Why it was refused.
        reason: String,
    },
    /// Another holder won the lock, or the lease or version moved underneath us.
    Conflict {
        /// Whether trying again can succeed.
        retryable: bool,
        /// What conflicted.
        reason: String,
    },
    /// No session with that id.
    NotFound,
    /// A backend was unreachable.
    TransientError {
        /// The backend failure.
        reason: String,
    },
}

impl Outcome {
    /// The step was persisted.
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }

    /// Retrying the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Outcome::Conflict { retryable, .. } => *retryable,
            Outcome::TransientError { .. } => true,
            Outcome::Success { .. } | Outcome::InvalidTransition { .. } | Outcome::NotFound => {
                false
            }
        }
    }

    /// Status after a successful step.
    pub fn status(&self) -> Option<SessionStatus> {
        match self {
            Outcome::Success { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Short label, used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Outcome::Success { .. } => "success",
            Outcome::InvalidTransition { .. } => "invalid_transition",
            Outcome::Conflict { .. } => "conflict",
            Outcome::NotFound => "not_found",
            Outcome::TransientError { .. } => "transient_error",
        }
    }
}

impl From<&KeystoneError> for Outcome {
    fn from(err: &KeystoneError) -> Self {
        match err {
            KeystoneError::ContentionTimeout { .. }
            | KeystoneError::LeaseLost { .. }
            | KeystoneError::VersionConflict { .. }
            | KeystoneError::StaleFence { .. } => Outcome::Conflict {
                retryable: true,
                reason: err.to_string(),
            },
            KeystoneError::AlreadyExists(_) => Outcome::Conflict {
                retryable: false,
                reason: err.to_string(),
            },
            KeystoneError::NotFound(_) => Outcome::NotFound,
            KeystoneError::InvalidTransition(reason) => Outcome::InvalidTransition {
                reason: reason.clone(),
            },
            KeystoneError::Unavailable(_)
            | KeystoneError::CircuitOpen { .. }
            | KeystoneError::Io(_)
            | KeystoneError::Json(_)
            | KeystoneError::Config(_) => Outcome::TransientError {
                reason: err.to_string(),
            },
        }
    }
}

impl From<KeystoneError> for Outcome {
    fn from(err: KeystoneError) -> Self {
        Outcome::from(&err)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use keystone_core::FenceToken;
    use uuid::Uuid;

    #[test]
    fn test_error_mapping() {
        let lost = KeystoneError::LeaseLost {
            resource: "s".into(),
            fence: FenceToken(4),
        };
        assert!(matches!(
            Outcome::from(&lost),
            Outcome::Conflict {
                retryable: true,
                ..
            }
        ));
        assert_eq!(
            Outcome::from(KeystoneError::NotFound(Uuid::nil())),
            Outcome::NotFound
        );
        let down = Outcome::from(KeystoneError::Unavailable("store".into()));
        assert_eq!(down.kind(), "transient_error");
        assert!(down.is_retryable());
        let dup = Outcome::from(KeystoneError::AlreadyExists(Uuid::nil()));
        assert!(!dup.is_retryable());
    }

    #[test]
    fn test_terminal_outcomes_not_retryable() {
        let invalid = Outcome::from(KeystoneError::InvalidTransition("no".into()));
        assert!(!invalid.is_retryable());
        assert!(!Outcome::NotFound.is_retryable());
        let ok = Outcome::Success {
            status: SessionStatus::Running,
            version: 3,
        };
        assert!(ok.is_success());
        assert_eq!(ok.status(), Some(SessionStatus::Running));
    }

    #[test]
    fn test_outcome_json_shape() {
        let json = serde_json::to_value(Outcome::Success {
            status: SessionStatus::Queued,
            version: 2,
        })
        .unwrap();
        assert_eq!(json["outcome"], "success");
        assert_eq!(json["status"], "QUEUED");
        assert_eq!(json["version"], 2);
    }
}
