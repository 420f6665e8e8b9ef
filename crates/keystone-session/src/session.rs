use crate::status::{SessionEvent, SessionStatus};
use chrono::{DateTime, Utc};
use keystone_core::KeystoneError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// A rejected lifecycle change. The session is left exactly as it was.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    /// The target is not in the current status's permitted set.
    #[error("illegal transition {from} -> {to}")]
    Illegal {
        /// Status at the time of the request.
        from: SessionStatus,
        /// Requested status.
        to: SessionStatus,
    },
    /// Retry was requested from a status that cannot be reopened.
    #[error("cannot retry from {from}: not a recoverable status")]
    NotRecoverable {
        /// Status at the time of the request.
        from: SessionStatus,
    },
}

impl From<TransitionError> for KeystoneError {
    fn from(err: TransitionError) -> Self {
        KeystoneError::InvalidTransition(err.to_string())
    }
}

/// Recorded progress a later worker can resume from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// 1-based, gapless, strictly increasing per session.
    pub sequence_number: u64,
    /// Opaque progress data.
    pub payload: serde_json::Value,
    /// When the checkpoint was taken.
    pub created_at: DateTime<Utc>,
    /// Why it was taken.
    pub reason: String,
}

/// One applied status change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    /// Status before.
    pub from: SessionStatus,
    /// Status after.
    pub to: SessionStatus,
    /// When it was applied.
    pub at: DateTime<Utc>,
    /// Applied by the system as a correction rather than requested by a caller.
    #[serde(default)]
    pub forced: bool,
}

/// The durable record of a unit of work.
///
/// All mutation goes through [`Session::transition_to`],
/// [`Session::add_checkpoint`], and [`Session::force_transition`]; each either
/// applies completely or leaves the session untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Unique, immutable identifier.
    pub id: Uuid,
    /// Current lifecycle state.
    pub status: SessionStatus,
    /// Scheduling hint for external schedulers.
    pub priority: u8,
    /// Ordered progress records.
    pub checkpoints: Vec<Checkpoint>,
    /// Every applied status change, oldest first.
    pub history: Vec<TransitionRecord>,
    /// Bumped by the repository on every successful save.
    pub version: u64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Time of the last mutation.
    pub updated_at: DateTime<Utc>,
    /// Free-form caller data.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Session {
    /// A new `Pending` session created at `now`.
    pub fn new(priority: u8, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: SessionStatus::Pending,
            priority,
            checkpoints: Vec::new(),
            history: Vec::new(),
            version: 0,
            created_at: now,
            updated_at: now,
            metadata: HashMap::new(),
        }
    }

    /// Apply `event`, returning the new status.
    ///
    /// [`SessionEvent::Retry`] takes the separately gated reopen pathway; every
    /// other event must name a status in the current status's permitted set.
    pub fn transition_to(
        &mut self,
        event: SessionEvent,
        now: DateTime<Utc>,
    ) -> Result<SessionStatus, TransitionError> {
        if event == SessionEvent::Retry {
            return self.retry(now);
        }
        let target = event.target();
        if !self.status.can_transition_to(target) {
            return Err(TransitionError::Illegal {
                from: self.status,
                to: target,
            });
        }
        self.record_transition(target, now, false);
        Ok(target)
    }

    /// Reopen a recoverable terminal session as `Pending`.
    ///
    /// Appends a checkpoint marking the retry origin so the next worker can
    /// tell where the previous attempt ended.
    pub fn retry(&mut self, now: DateTime<Utc>) -> Result<SessionStatus, TransitionError> {
        let from = self.status;
        if !from.is_recoverable() {
            return Err(TransitionError::NotRecoverable { from });
        }
        let payload = serde_json::json!({
            "retry_of": from,
            "previous_checkpoint": self.last_checkpoint().map(|c| c.sequence_number),
            "previous_reason": self.last_checkpoint().map(|c| c.reason.clone()),
        });
        self.record_transition(SessionStatus::Pending, now, false);
        self.add_checkpoint(payload, format!("retry from {from}"), now);
        Ok(SessionStatus::Pending)
    }

    /// Apply a system-initiated correction such as orphaning an abandoned session.
    ///
    /// Still bound by the adjacency table; recorded with `forced = true`.
    pub fn force_transition(
        &mut self,
        target: SessionStatus,
        now: DateTime<Utc>,
    ) -> Result<SessionStatus, TransitionError> {
        if !self.status.can_transition_to(target) {
            return Err(TransitionError::Illegal {
                from: self.status,
                to: target,
            });
        }
        self.record_transition(target, now, true);
        Ok(target)
    }

    fn record_transition(&mut self, to: SessionStatus, at: DateTime<Utc>, forced: bool) {
        self.history.push(TransitionRecord {
            from: self.status,
            to,
            at,
            forced,
        });
        self.status = to;
        self.updated_at = at;
    }

    /// Append a checkpoint with the next sequence number. Does not change status.
    pub fn add_checkpoint(
        &mut self,
        payload: serde_json::Value,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> &Checkpoint {
        let sequence_number = self.last_checkpoint().map_or(1, |c| c.sequence_number + 1);
        self.checkpoints.push(Checkpoint {
            sequence_number,
            payload,
            created_at: now,
            reason: reason.into(),
        });
        self.updated_at = now;
        &self.checkpoints[self.checkpoints.len() - 1]
    }

    /// The most recent checkpoint, if any.
    pub fn last_checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoints.last()
    }

    /// Number of checkpoints taken.
    pub fn checkpoint_count(&self) -> usize {
        self.checkpoints.len()
    }

    /// The most recent sign of life: the later of the last checkpoint and the
    /// last transition, or creation time if neither exists.
    pub fn last_activity(&self) -> DateTime<Utc> {
        let checkpoint = self.last_checkpoint().map(|c| c.created_at);
        let transition = self.history.last().map(|t| t.at);
        match (checkpoint, transition) {
            (Some(c), Some(t)) => c.max(t),
            (Some(c), None) => c,
            (None, Some(t)) => t,
            (None, None) => self.created_at,
        }
    }

    /// Whether an active session has gone quiet for longer than `threshold`.
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: chrono::Duration) -> bool {
        self.status.is_active() && now - self.last_activity() > threshold
    }

    /// Replays `history` from `Pending` and checks every step is a legal edge.
    pub fn history_is_valid(&self) -> bool {
        let mut current = SessionStatus::Pending;
        for record in &self.history {
            if record.from != current {
                return false;
            }
            let legal = record.from.can_transition_to(record.to)
                || (record.to == SessionStatus::Pending && record.from.is_recoverable());
            if !legal {
                return false;
            }
            current = record.to;
        }
        current == self.status
    }

    /// Checkpoint sequence numbers run 1, 2, 3, … with no gaps.
    pub fn checkpoints_are_gapless(&self) -> bool {
        self.checkpoints
            .iter()
            .enumerate()
            .all(|(i, c)| c.sequence_number == i as u64 + 1)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_new_session_is_pending() {
        let session = Session::new(3, t0());
        assert_eq!(session.status, SessionStatus::Pending);
        assert_eq!(session.priority, 3);
        assert_eq!(session.version, 0);
        assert!(session.checkpoints.is_empty());
        assert!(session.history_is_valid());
    }

    #[test]
    fn test_legal_walk() {
        let mut session = Session::new(0, t0());
        let now = t0() + Duration::seconds(1);
        assert_eq!(
            session.transition_to(SessionEvent::Enqueue, now).unwrap(),
            SessionStatus::Queued
        );
        session.transition_to(SessionEvent::Start, now).unwrap();
        session.transition_to(SessionEvent::Degrade, now).unwrap();
        session.transition_to(SessionEvent::Recover, now).unwrap();
        session.transition_to(SessionEvent::Complete, now).unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.history.len(), 5);
        assert!(session.history_is_valid());
        assert_eq!(session.updated_at, now);
    }

    #[test]
    fn test_illegal_transition_mutates_nothing() {
        let mut session = Session::new(0, t0());
        session.transition_to(SessionEvent::Start, t0()).unwrap();
        session.transition_to(SessionEvent::Complete, t0()).unwrap();
        let before = serde_json::to_value(&session).unwrap();

        let later = t0() + Duration::minutes(5);
        let err = session
            .transition_to(SessionEvent::Start, later)
            .unwrap_err();
        assert_eq!(
            err,
            TransitionError::Illegal {
                from: SessionStatus::Completed,
                to: SessionStatus::Running
            }
        );
        assert_eq!(serde_json::to_value(&session).unwrap(), before);
    }

    #[test]
    fn test_exhaustive_transition_property() {
        for from in SessionStatus::ALL {
            for event in SessionEvent::ALL {
                let mut session = Session::new(0, t0());
                session.status = from;
                let version = session.version;
                match session.transition_to(event, t0()) {
                    Ok(to) => {
                        if event == SessionEvent::Retry {
                            assert!(from.is_recoverable());
                            assert_eq!(to, SessionStatus::Pending);
                        } else {
                            assert!(from.allowed_transitions().contains(&to));
                        }
                        assert_eq!(session.status, to);
                    }
                    Err(_) => {
                        assert_eq!(session.status, from);
                        assert!(session.history.is_empty());
                        assert!(session.checkpoints.is_empty());
                    }
                }
                assert_eq!(session.version, version);
            }
        }
    }

    #[test]
    fn test_retry_from_failed_marks_origin() {
        let mut session = Session::new(0, t0());
        session.transition_to(SessionEvent::Start, t0()).unwrap();
        session.add_checkpoint(serde_json::json!({"step": 4}), "progress", t0());
        session.transition_to(SessionEvent::Fail, t0()).unwrap();

        let status = session.transition_to(SessionEvent::Retry, t0()).unwrap();
        assert_eq!(status, SessionStatus::Pending);
        let cp = session.last_checkpoint().unwrap();
        assert_eq!(cp.sequence_number, 2);
        assert_eq!(cp.reason, "retry from FAILED");
        assert_eq!(cp.payload["retry_of"], "FAILED");
        assert_eq!(cp.payload["previous_checkpoint"], 1);
        assert!(session.history_is_valid());
    }

    #[test]
    fn test_retry_rejected_from_non_recoverable() {
        for status in [
            SessionStatus::Completed,
            SessionStatus::Cancelled,
            SessionStatus::Stopped,
            SessionStatus::Running,
        ] {
            let mut session = Session::new(0, t0());
            session.status = status;
            assert_eq!(
                session.retry(t0()).unwrap_err(),
                TransitionError::NotRecoverable { from: status }
            );
            assert!(session.checkpoints.is_empty());
        }
    }

    #[test]
    fn test_checkpoints_are_sequential() {
        let mut session = Session::new(0, t0());
        for i in 0..5 {
            let cp = session.add_checkpoint(serde_json::json!(i), "tick", t0());
            assert_eq!(cp.sequence_number, i + 1);
        }
        assert!(session.checkpoints_are_gapless());
        assert_eq!(session.status, SessionStatus::Pending);
    }

    #[test]
    fn test_force_transition_is_flagged() {
        let mut session = Session::new(0, t0());
        session.transition_to(SessionEvent::Start, t0()).unwrap();
        session
            .force_transition(SessionStatus::Orphaned, t0())
            .unwrap();
        assert!(session.history.last().unwrap().forced);
        assert!(session.history_is_valid());
        assert!(session
            .force_transition(SessionStatus::Running, t0())
            .is_err());
    }

    #[test]
    fn test_staleness_uses_latest_activity() {
        let mut session = Session::new(0, t0());
        session.transition_to(SessionEvent::Start, t0()).unwrap();
        session.add_checkpoint(serde_json::json!(null), "tick", t0() + Duration::seconds(30));

        let threshold = Duration::seconds(60);
        assert!(!session.is_stale(t0() + Duration::seconds(80), threshold));
        assert!(session.is_stale(t0() + Duration::seconds(91), threshold));

        session.transition_to(SessionEvent::Complete, t0() + Duration::seconds(95)).unwrap();
        assert!(!session.is_stale(t0() + Duration::hours(1), threshold));
    }

    #[test]
    fn test_tampered_history_detected() {
        let mut session = Session::new(0, t0());
        session.transition_to(SessionEvent::Start, t0()).unwrap();
        session.history.push(TransitionRecord {
            from: SessionStatus::Running,
            to: SessionStatus::Queued,
            at: t0(),
            forced: false,
        });
        session.status = SessionStatus::Queued;
        assert!(!session.history_is_valid());
    }

    #[test]
    fn test_transition_error_converts() {
        let err: KeystoneError = TransitionError::NotRecoverable {
            from: SessionStatus::Completed,
        }
        .into();
        assert!(matches!(err, KeystoneError::InvalidTransition(_)));
        assert!(!err.is_retryable());
    }
}
