use crate::session::Session;
use crate::status::SessionStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tuning for [`health_score`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// How often an active session is expected to checkpoint.
    #[serde(default = "default_checkpoint_interval_ms")]
    pub expected_checkpoint_interval_ms: u64,
    /// Number of most recent transitions that count against the score.
    #[serde(default = "default_history_window")]
    pub history_window: usize,
}

fn default_checkpoint_interval_ms() -> u64 {
    60_000
}
fn default_history_window() -> usize {
    10
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            expected_checkpoint_interval_ms: default_checkpoint_interval_ms(),
            history_window: default_history_window(),
        }
    }
}

fn status_base(status: SessionStatus) -> f64 {
    match status {
        SessionStatus::Pending
        | SessionStatus::Queued
        | SessionStatus::Running
        | SessionStatus::Completed => 1.0,
        SessionStatus::Paused => 0.8,
        SessionStatus::PartiallyCompleted => 0.7,
        SessionStatus::Cancelled => 0.6,
        SessionStatus::Degraded => 0.5,
        SessionStatus::Stopped => 0.4,
        SessionStatus::Failed | SessionStatus::Timeout => 0.2,
        SessionStatus::Orphaned => 0.1,
    }
}

fn transition_penalty(to: SessionStatus, forced: bool) -> f64 {
    let base = match to {
        SessionStatus::Degraded => 0.1,
        SessionStatus::Failed | SessionStatus::Timeout | SessionStatus::Orphaned => 0.15,
        SessionStatus::Pending => 0.1,
        SessionStatus::Paused => 0.05,
        _ => 0.0,
    };
    if forced {
        base + 0.1
    } else {
        base
    }
}

/// Score in `[0.0, 1.0]` summarising how well a session is doing.
///
/// Combines the current status, troubled transitions (degradations, failures,
/// pauses, retries, forced corrections) in the recent history window, and for
/// active sessions the time since the last sign of life relative to the
/// expected checkpoint interval. Pure; never feeds back into transitions.
pub fn health_score(session: &Session, now: DateTime<Utc>, config: &HealthConfig) -> f64 {
    let mut score = status_base(session.status);

    let window = config.history_window.min(session.history.len());
    let recent = &session.history[session.history.len() - window..];
    score -= recent
        .iter()
        .map(|t| transition_penalty(t.to, t.forced))
        .sum::<f64>();

    if session.status.is_active() && config.expected_checkpoint_interval_ms > 0 {
        let quiet_ms = (now - session.last_activity()).num_milliseconds().max(0) as f64;
        let ratio = quiet_ms / config.expected_checkpoint_interval_ms as f64;
        if ratio > 1.0 {
            score /= ratio;
        }
    }

    score.clamp(0.0, 1.0)
}
