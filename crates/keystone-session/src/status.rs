use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    /// Created, not yet scheduled.
    Pending,
    /// Waiting for a worker.
    Queued,
    /// A worker is executing it.
    Running,
    /// Execution suspended by request.
    Paused,
    /// Finished successfully.
    Completed,
    /// Finished with part of the work done.
    PartiallyCompleted,
    /// Finished with an error.
    Failed,
    /// Exceeded its time budget.
    Timeout,
    /// Halted by the system.
    Stopped,
    /// Cancelled by a user.
    Cancelled,
    /// Abandoned by a worker that stopped checkpointing.
    Orphaned,
    /// Running with reduced capability.
    Degraded,
}

/// Grouping of statuses by lifecycle role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusCategory {
    /// The creation state.
    Initial,
    /// Work in flight.
    Active,
    /// Terminal, work done.
    Success,
    /// Terminal, work not done.
    Failure,
    /// Terminal, ended by the system rather than the user.
    System,
}

impl SessionStatus {
    /// Every status, in declaration order.
    pub const ALL: [SessionStatus; 12] = [
        SessionStatus::Pending,
        SessionStatus::Queued,
        SessionStatus::Running,
        SessionStatus::Paused,
        SessionStatus::Completed,
        SessionStatus::PartiallyCompleted,
        SessionStatus::Failed,
        SessionStatus::Timeout,
        SessionStatus::Stopped,
        SessionStatus::Cancelled,
        SessionStatus::Orphaned,
        SessionStatus::Degraded,
    ];

    /// The category this status belongs to.
    pub fn category(self) -> StatusCategory {
        use SessionStatus::*;
        match self {
            Pending => StatusCategory::Initial,
            Queued | Running | Paused | Degraded => StatusCategory::Active,
            Completed | PartiallyCompleted => StatusCategory::Success,
            Failed | Timeout | Cancelled => StatusCategory::Failure,
            Stopped | Orphaned => StatusCategory::System,
        }
    }

    /// Statuses reachable by an ordinary transition.
    ///
    /// Terminal statuses return an empty slice; the retry pathway back to
    /// `Pending` is gated separately by [`SessionStatus::is_recoverable`].
    pub fn allowed_transitions(self) -> &'static [SessionStatus] {
        use SessionStatus::*;
        match self {
            Pending => &[Queued, Running, Cancelled, Failed],
            Queued => &[Running, Cancelled, Failed, Timeout, Stopped, Orphaned],
            Running => &[
                Paused,
                Degraded,
                Completed,
                PartiallyCompleted,
                Failed,
                Timeout,
                Stopped,
                Cancelled,
                Orphaned,
            ],
            Paused => &[Running, Failed, Timeout, Stopped, Cancelled, Orphaned],
            Degraded => &[
                Running,
                Paused,
                Completed,
                PartiallyCompleted,
                Failed,
                Timeout,
                Stopped,
                Cancelled,
                Orphaned,
            ],
            Completed | PartiallyCompleted | Failed | Timeout | Stopped | Cancelled | Orphaned => {
                &[]
            }
        }
    }

    /// Whether `target` is reachable from this status by an ordinary transition.
    pub fn can_transition_to(self, target: SessionStatus) -> bool {
        self.allowed_transitions().contains(&target)
    }

    /// Work in flight (`Queued`, `Running`, `Paused`, `Degraded`).
    pub fn is_active(self) -> bool {
        self.category() == StatusCategory::Active
    }

    /// No ordinary outgoing transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self.category(),
            StatusCategory::Success | StatusCategory::Failure | StatusCategory::System
        )
    }

    /// Terminal statuses that may be reopened through the retry pathway.
    pub fn is_recoverable(self) -> bool {
        matches!(
            self,
            SessionStatus::Failed | SessionStatus::Timeout | SessionStatus::Orphaned
        )
    }

    /// Canonical upper-case name.
    pub fn as_str(self) -> &'static str {
        use SessionStatus::*;
        match self {
            Pending => "PENDING",
            Queued => "QUEUED",
            Running => "RUNNING",
            Paused => "PAUSED",
            Completed => "COMPLETED",
            PartiallyCompleted => "PARTIALLY_COMPLETED",
            Failed => "FAILED",
            Timeout => "TIMEOUT",
            Stopped => "STOPPED",
            Cancelled => "CANCELLED",
            Orphaned => "ORPHANED",
            Degraded => "DEGRADED",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A requested lifecycle change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEvent {
    /// Hand the session to the scheduler.
    Enqueue,
    /// Begin execution.
    Start,
    /// Suspend execution.
    Pause,
    /// Continue a paused session.
    Resume,
    /// Report reduced capability.
    Degrade,
    /// Return from degraded to normal running.
    Recover,
    /// Finish successfully.
    Complete,
    /// Finish with part of the work done.
    CompletePartially,
    /// Finish with an error.
    Fail,
    /// Exceeded the time budget.
    TimeOut,
    /// Halt from the system side.
    Stop,
    /// Cancel on user request.
    Cancel,
    /// Declare the session abandoned.
    Orphan,
    /// Reopen a recoverable terminal session.
    Retry,
}

impl SessionEvent {
    /// Every event, in declaration order.
    pub const ALL: [SessionEvent; 14] = [
        SessionEvent::Enqueue,
        SessionEvent::Start,
        SessionEvent::Pause,
        SessionEvent::Resume,
        SessionEvent::Degrade,
        SessionEvent::Recover,
        SessionEvent::Complete,
        SessionEvent::CompletePartially,
        SessionEvent::Fail,
        SessionEvent::TimeOut,
        SessionEvent::Stop,
        SessionEvent::Cancel,
        SessionEvent::Orphan,
        SessionEvent::Retry,
    ];

    /// The status this event asks for.
    pub fn target(self) -> SessionStatus {
        use SessionEvent::*;
        match self {
            Enqueue => SessionStatus::Queued,
            Start | Resume | Recover => SessionStatus::Running,
            Pause => SessionStatus::Paused,
            Degrade => SessionStatus::Degraded,
            Complete => SessionStatus::Completed,
            CompletePartially => SessionStatus::PartiallyCompleted,
            Fail => SessionStatus::Failed,
            TimeOut => SessionStatus::Timeout,
            Stop => SessionStatus::Stopped,
            Cancel => SessionStatus::Cancelled,
            Orphan => SessionStatus::Orphaned,
            Retry => SessionStatus::Pending,
        }
    }

    /// Snake-case event name.
    pub fn as_str(self) -> &'static str {
        use SessionEvent::*;
        match self {
            Enqueue => "enqueue",
            Start => "start",
            Pause => "pause",
            Resume => "resume",
            Degrade => "degrade",
            Recover => "recover",
            Complete => "complete",
            CompletePartially => "complete_partially",
            Fail => "fail",
            TimeOut => "time_out",
            Stop => "stop",
            Cancel => "cancel",
            Orphan => "orphan",
            Retry => "retry",
        }
    }
}

impl std::fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionEvent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        SessionEvent::ALL
            .into_iter()
            .find(|e| e.as_str() == normalized)
            .ok_or_else(|| format!("unknown session event '{s}'"))
    }
}
