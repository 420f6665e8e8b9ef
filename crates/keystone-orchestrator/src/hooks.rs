use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keystone_session::{SessionEvent, SessionStatus};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Events emitted by the orchestration service after each step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OrchestrationEvent {
    /// A new session was stored.
    Created {
        session_id: Uuid,
        timestamp: DateTime<Utc>,
    },
    /// A transition was persisted.
    Applied {
        session_id: Uuid,
        event: SessionEvent,
        status: SessionStatus,
        version: u64,
        timestamp: DateTime<Utc>,
    },
    /// A checkpoint was persisted.
    Checkpointed {
        session_id: Uuid,
        sequence_number: u64,
        version: u64,
        timestamp: DateTime<Utc>,
    },
    /// The state machine refused a transition.
    Rejected {
        session_id: Uuid,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    /// Lock contention, lease loss, or a version/fence conflict.
    Conflict {
        session_id: Uuid,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    /// The session did not exist.
    NotFound {
        session_id: Uuid,
        timestamp: DateTime<Utc>,
    },
    /// A backend was unreachable.
    Transient {
        session_id: Uuid,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    /// An abandoned session was force-moved to `ORPHANED`.
    Rehydrated {
        session_id: Uuid,
        previous: SessionStatus,
        quiet_ms: i64,
        timestamp: DateTime<Utc>,
    },
}

/// Observer of orchestration events. Hooks never influence outcomes.
#[async_trait]
pub trait OrchestrationHook: Send + Sync {
    async fn on_event(&self, event: &OrchestrationEvent);
}

/// Composite hook that dispatches events to multiple hooks.
#[derive(Clone)]
pub struct HookChain {
    hooks: Vec<Arc<dyn OrchestrationHook>>,
}

impl HookChain {
    pub fn new() -> Self {
        Self { hooks: Vec::new() }
    }

    /// Add a hook to the chain.
    pub fn add(&mut self, hook: Arc<dyn OrchestrationHook>) {
        self.hooks.push(hook);
    }

    /// Emit an event to all hooks in the chain.
    pub async fn emit(&self, event: OrchestrationEvent) {
        for hook in &self.hooks {
            hook.on_event(&event).await;
        }
    }

    /// Get the number of hooks in the chain.
    pub fn hook_count(&self) -> usize {
        self.hooks.len()
    }
}

impl Default for HookChain {
    fn default() -> Self {
        Self::new()
    }
}

/// Hook that writes every event to the tracing log.
pub struct TracingHook;

#[async_trait]
impl OrchestrationHook for TracingHook {
    async fn on_event(&self, event: &OrchestrationEvent) {
        match event {
            OrchestrationEvent::Rehydrated {
                session_id,
                previous,
                quiet_ms,
                ..
            } => {
                tracing::warn!(
                    session_id = %session_id,
                    previous = %previous,
                    quiet_ms,
                    "Session orphaned by rehydration"
                );
            }
            OrchestrationEvent::Transient {
                session_id, reason, ..
            } => {
                tracing::warn!(session_id = %session_id, reason = %reason, "Backend unavailable");
            }
            other => {
                tracing::debug!(event = ?other, "Orchestration event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(AtomicUsize);

    #[async_trait]
    impl OrchestrationHook for Counter {
        async fn on_event(&self, _event: &OrchestrationEvent) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_chain_dispatches_to_every_hook() {
        let a = Arc::new(Counter(AtomicUsize::new(0)));
        let b = Arc::new(Counter(AtomicUsize::new(0)));
        let mut chain = HookChain::new();
        chain.add(a.clone());
        chain.add(b.clone());
        chain.add(Arc::new(TracingHook));
        assert_eq!(chain.hook_count(), 3);

        chain
            .emit(OrchestrationEvent::NotFound {
                session_id: Uuid::new_v4(),
                timestamp: Utc::now(),
            })
            .await;
        assert_eq!(a.0.load(Ordering::SeqCst), 1);
        assert_eq!(b.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_chain_is_noop() {
        let chain = HookChain::default();
        chain
            .emit(OrchestrationEvent::Created {
                session_id: Uuid::new_v4(),
                timestamp: Utc::now(),
            })
            .await;
        assert_eq!(chain.hook_count(), 0);
    }
}
