use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settings for [`crate::OrchestrationService`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Identity written into every lease this service acquires.
    #[serde(default = "default_holder_id")]
    pub holder_id: String,
    /// Quiet time after which an active session is considered abandoned.
    #[serde(default = "default_staleness_threshold_ms")]
    pub staleness_threshold_ms: u64,
}

fn default_holder_id() -> String {
    format!("keystone-{}", std::process::id())
}

fn default_staleness_threshold_ms() -> u64 {
    300_000
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            holder_id: default_holder_id(),
            staleness_threshold_ms: default_staleness_threshold_ms(),
        }
    }
}

impl OrchestratorConfig {
    /// [`Self::staleness_threshold_ms`] as a chrono duration.
    pub fn staleness_threshold(&self) -> chrono::Duration {
        chrono::Duration::from_std(Duration::from_millis(self.staleness_threshold_ms))
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100))
    }
}
