use crate::hooks::{OrchestrationEvent, OrchestrationHook};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Counters accumulated by [`OrchestrationMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationCounters {
    pub created: u64,
    pub applied: u64,
    pub checkpointed: u64,
    pub rejected: u64,
    pub conflicts: u64,
    pub not_found: u64,
    pub transient: u64,
    pub rehydrated: u64,
    /// Successful transitions keyed by the status they reached.
    pub by_status: HashMap<String, u64>,
}

impl OrchestrationCounters {
    /// Steps that did not persist anything the caller asked for.
    pub fn failures(&self) -> u64 {
        self.rejected + self.conflicts + self.not_found + self.transient
    }
}

/// Hook that counts orchestration outcomes.
pub struct OrchestrationMetrics {
    counters: Arc<RwLock<OrchestrationCounters>>,
}

impl OrchestrationMetrics {
    pub fn new() -> Self {
        Self {
            counters: Arc::new(RwLock::new(OrchestrationCounters::default())),
        }
    }

    /// Get a snapshot of the counters.
    pub async fn snapshot(&self) -> OrchestrationCounters {
        self.counters.read().await.clone()
    }

    /// Serialize the current counters as JSON.
    pub async fn to_json(&self) -> serde_json::Value {
        let counters = self.snapshot().await;
        let failures = counters.failures();
        serde_json::json!({
            "counters": counters,
            "failures": failures,
        })
    }
}

impl Default for OrchestrationMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OrchestrationHook for OrchestrationMetrics {
    async fn on_event(&self, event: &OrchestrationEvent) {
        let mut counters = self.counters.write().await;
        match event {
            OrchestrationEvent::Created { .. } => counters.created += 1,
            OrchestrationEvent::Applied { status, .. } => {
                counters.applied += 1;
                *counters.by_status.entry(status.to_string()).or_insert(0) += 1;
            }
            OrchestrationEvent::Checkpointed { .. } => counters.checkpointed += 1,
            OrchestrationEvent::Rejected { .. } => counters.rejected += 1,
            OrchestrationEvent::Conflict { .. } => counters.conflicts += 1,
            OrchestrationEvent::NotFound { .. } => counters.not_found += 1,
            OrchestrationEvent::Transient { .. } => counters.transient += 1,
            OrchestrationEvent::Rehydrated { .. } => counters.rehydrated += 1,
        }
    }
}
