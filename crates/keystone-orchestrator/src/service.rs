use crate::config::OrchestratorConfig;
use crate::hooks::{HookChain, OrchestrationEvent};
use crate::outcome::Outcome;
use keystone_core::{KeystoneResult, SharedClock};
use keystone_lock::{FairLock, LeaseGuard};
use keystone_session::{
    health_score, HealthConfig, Session, SessionEvent, SessionRepository, SessionStatus,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Checkpoint reason written when an abandoned session is orphaned.
pub const ORPHANED_BY_REHYDRATION: &str = "orphaned by rehydration";

enum Mutation {
    Transition {
        event: SessionEvent,
        payload: Option<serde_json::Value>,
    },
    Checkpoint {
        payload: serde_json::Value,
        reason: String,
    },
}

/// Composes the fair lock, the session state machine, and the repository.
///
/// Each step runs acquire, load, rehydrate, validate, mutate, persist, release.
/// The lease is renewed immediately before the write and the write carries
/// the lease's fence token, so a holder whose lease lapsed mid-step can never
/// overwrite its successor. The lease is released on every exit path.
pub struct OrchestrationService {
    lock: Arc<FairLock>,
    repo: Arc<dyn SessionRepository>,
    clock: SharedClock,
    hooks: HookChain,
    config: OrchestratorConfig,
    health: HealthConfig,
}

impl OrchestrationService {
    pub fn new(
        lock: Arc<FairLock>,
        repo: Arc<dyn SessionRepository>,
        clock: SharedClock,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            lock,
            repo,
            clock,
            hooks: HookChain::new(),
            config,
            health: HealthConfig::default(),
        }
    }

    /// Replace the hook chain.
    pub fn with_hooks(mut self, hooks: HookChain) -> Self {
        self.hooks = hooks;
        self
    }

    /// Replace the health scoring settings.
    pub fn with_health_config(mut self, health: HealthConfig) -> Self {
        self.health = health;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Create and store a new `PENDING` session.
    pub async fn create_session(
        &self,
        priority: u8,
        metadata: HashMap<String, serde_json::Value>,
    ) -> KeystoneResult<Session> {
        let now = self.clock.now();
        let mut session = Session::new(priority, now);
        session.metadata = metadata;
        session.version = self.repo.create(&session).await?;
        info!(session_id = %session.id, priority, "Session created");
        self.hooks
            .emit(OrchestrationEvent::Created {
                session_id: session.id,
                timestamp: now,
            })
            .await;
        Ok(session)
    }

    /// Apply a lifecycle event under the session's lock.
    ///
    /// If `payload` is given, a checkpoint named after the event is appended
    /// after the transition, in the same write.
    pub async fn apply(
        &self,
        session_id: Uuid,
        event: SessionEvent,
        payload: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Outcome {
        let mutation = Mutation::Transition { event, payload };
        self.execute(session_id, Some(mutation), timeout).await
    }

    /// Append a checkpoint under the session's lock.
    pub async fn checkpoint(
        &self,
        session_id: Uuid,
        payload: serde_json::Value,
        reason: impl Into<String>,
        timeout: Duration,
    ) -> Outcome {
        let mutation = Mutation::Checkpoint {
            payload,
            reason: reason.into(),
        };
        self.execute(session_id, Some(mutation), timeout).await
    }

    /// Take the lock and run only the rehydration check.
    pub async fn recover(&self, session_id: Uuid, timeout: Duration) -> Outcome {
        self.execute(session_id, None, timeout).await
    }

    /// Current stored state, without taking the lock.
    pub async fn get_snapshot(&self, session_id: Uuid) -> KeystoneResult<Option<Session>> {
        self.repo.load(session_id).await
    }

    /// Ids of every stored session.
    pub async fn list_sessions(&self) -> KeystoneResult<Vec<Uuid>> {
        self.repo.list().await
    }

    /// Health score of the stored session.
    pub async fn health(&self, session_id: Uuid) -> KeystoneResult<Option<f64>> {
        let now = self.clock.now();
        Ok(self
            .repo
            .load(session_id)
            .await?
            .map(|s| health_score(&s, now, &self.health)))
    }

    async fn execute(
        &self,
        session_id: Uuid,
        mutation: Option<Mutation>,
        timeout: Duration,
    ) -> Outcome {
        let key = session_id.to_string();
        let guard = match self
            .lock
            .acquire(
                &key,
                &self.config.holder_id,
                timeout,
                self.lock.config().lease_duration(),
            )
            .await
        {
            Ok(guard) => guard,
            Err(err) => {
                let outcome = Outcome::from(&err);
                debug!(session_id = %session_id, error = %err, "Lock not acquired");
                self.report(session_id, &outcome, None).await;
                return outcome;
            }
        };
        let fence = guard.fence();

        let result = self.execute_locked(session_id, &guard, mutation).await;

        if let Err(err) = self.lock.release_guard(guard).await {
            warn!(
                session_id = %session_id,
                fence = %fence,
                error = %err,
                "Release failed; lease will expire"
            );
        }

        let (outcome, detail) = match result {
            Ok(step) => step,
            Err(err) => {
                if err.is_retryable() {
                    warn!(session_id = %session_id, fence = %fence, error = %err, "Step discarded");
                }
                (Outcome::from(&err), None)
            }
        };
        self.report(session_id, &outcome, detail).await;
        outcome
    }

    async fn execute_locked(
        &self,
        session_id: Uuid,
        guard: &LeaseGuard,
        mutation: Option<Mutation>,
    ) -> KeystoneResult<(Outcome, Option<Detail>)> {
        let Some(mut session) = self.repo.load(session_id).await? else {
            return Ok((Outcome::NotFound, None));
        };
        let fence = guard.fence();

        self.rehydrate(guard, &mut session).await?;
        let Some(mutation) = mutation else {
            return Ok((
                Outcome::Success {
                    status: session.status,
                    version: session.version,
                },
                None,
            ));
        };

        self.renew(guard).await?;

        let loaded_version = session.version;
        let now = self.clock.now();
        let detail = match mutation {
            Mutation::Transition { event, payload } => {
                if let Err(err) = session.transition_to(event, now) {
                    debug!(session_id = %session_id, error = %err, "Transition rejected");
                    return Ok((
                        Outcome::InvalidTransition {
                            reason: err.to_string(),
                        },
                        None,
                    ));
                }
                if let Some(payload) = payload {
                    session.add_checkpoint(payload, event.as_str(), now);
                }
                Detail::Transition(event)
            }
            Mutation::Checkpoint { payload, reason } => {
                Detail::Checkpoint(session.add_checkpoint(payload, reason, now).sequence_number)
            }
        };

        self.renew(guard).await?;
        let version = self.repo.save(&session, loaded_version, fence).await?;
        info!(
            session_id = %session_id,
            fence = %fence,
            status = %session.status,
            version,
            "Session step persisted"
        );
        Ok((
            Outcome::Success {
                status: session.status,
                version,
            },
            Some(detail),
        ))
    }

    /// Orphan `session` if it is active and has gone quiet for longer than
    /// the staleness threshold. Persists the orphaning immediately.
    async fn rehydrate(&self, guard: &LeaseGuard, session: &mut Session) -> KeystoneResult<bool> {
        let now = self.clock.now();
        if !session.is_stale(now, self.config.staleness_threshold()) {
            return Ok(false);
        }
        let previous = session.status;
        let last_activity = session.last_activity();
        let quiet_ms = (now - last_activity).num_milliseconds();

        session.force_transition(SessionStatus::Orphaned, now)?;
        session.add_checkpoint(
            serde_json::json!({
                "previous_status": previous,
                "last_activity": last_activity,
                "quiet_ms": quiet_ms,
                "fence": guard.fence(),
            }),
            ORPHANED_BY_REHYDRATION,
            now,
        );

        self.renew(guard).await?;
        let version = self
            .repo
            .save(session, session.version, guard.fence())
            .await?;
        session.version = version;
        warn!(
            session_id = %session.id,
            previous = %previous,
            quiet_ms,
            "Abandoned session orphaned"
        );
        self.hooks
            .emit(OrchestrationEvent::Rehydrated {
                session_id: session.id,
                previous,
                quiet_ms,
                timestamp: now,
            })
            .await;
        Ok(true)
    }

    async fn renew(&self, guard: &LeaseGuard) -> KeystoneResult<()> {
        self.lock
            .renew(
                guard.resource_key(),
                guard.fence(),
                self.lock.config().lease_duration(),
            )
            .await?;
        Ok(())
    }

    async fn report(&self, session_id: Uuid, outcome: &Outcome, detail: Option<Detail>) {
        let timestamp = self.clock.now();
        let event = match (outcome, detail) {
            (Outcome::Success { status, version }, Some(Detail::Transition(event))) => {
                OrchestrationEvent::Applied {
                    session_id,
                    event,
                    status: *status,
                    version: *version,
                    timestamp,
                }
            }
            (Outcome::Success { version, .. }, Some(Detail::Checkpoint(sequence_number))) => {
                OrchestrationEvent::Checkpointed {
                    session_id,
                    sequence_number,
                    version: *version,
                    timestamp,
                }
            }
            (Outcome::Success { .. }, None) => return,
            (Outcome::InvalidTransition { reason }, _) => OrchestrationEvent::Rejected {
                session_id,
                reason: reason.clone(),
                timestamp,
            },
            (Outcome::Conflict { reason, .. }, _) => OrchestrationEvent::Conflict {
                session_id,
                reason: reason.clone(),
                timestamp,
            },
            (Outcome::NotFound, _) => OrchestrationEvent::NotFound {
                session_id,
                timestamp,
            },
            (Outcome::TransientError { reason }, _) => OrchestrationEvent::Transient {
                session_id,
                reason: reason.clone(),
                timestamp,
            },
        };
        self.hooks.emit(event).await;
    }
}

#[derive(Clone, Copy)]
enum Detail {
    Transition(SessionEvent),
    Checkpoint(u64),
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use keystone_core::ManualClock;
    use keystone_lock::{CircuitBreakerConfig, InMemoryLeaseStore, LockConfig};
    use keystone_session::InMemorySessionRepository;

    const WAIT: Duration = Duration::from_millis(200);

    fn service() -> (OrchestrationService, Arc<FairLock>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(InMemoryLeaseStore::new(clock.clone()));
        let lock = Arc::new(FairLock::new(
            store,
            clock.clone(),
            LockConfig {
                poll_interval_ms: 5,
                ..LockConfig::default()
            },
            CircuitBreakerConfig::default(),
        ));
        let service = OrchestrationService::new(
            lock.clone(),
            Arc::new(InMemorySessionRepository::new()),
            clock.clone(),
            OrchestratorConfig {
                holder_id: "test".into(),
                staleness_threshold_ms: 60_000,
            },
        );
        (service, lock, clock)
    }

    #[tokio::test]
    async fn test_apply_persists_and_releases() {
        let (service, lock, _) = service();
        let session = service.create_session(1, HashMap::new()).await.unwrap();
        assert_eq!(session.version, 1);

        let outcome = service
            .apply(session.id, SessionEvent::Start, None, WAIT)
            .await;
        assert_eq!(
            outcome,
            Outcome::Success {
                status: SessionStatus::Running,
                version: 2
            }
        );
        assert!(lock.holder(&session.id.to_string()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_payload_becomes_checkpoint() {
        let (service, _, _) = service();
        let session = service.create_session(0, HashMap::new()).await.unwrap();
        service
            .apply(
                session.id,
                SessionEvent::Start,
                Some(serde_json::json!({"cursor": 7})),
                WAIT,
            )
            .await;
        let stored = service.get_snapshot(session.id).await.unwrap().unwrap();
        let cp = stored.last_checkpoint().unwrap();
        assert_eq!(cp.reason, "start");
        assert_eq!(cp.payload["cursor"], 7);
    }

    #[tokio::test]
    async fn test_recover_leaves_fresh_session_alone() {
        let (service, _, _) = service();
        let session = service.create_session(0, HashMap::new()).await.unwrap();
        service
            .apply(session.id, SessionEvent::Start, None, WAIT)
            .await;
        let outcome = service.recover(session.id, WAIT).await;
        assert_eq!(
            outcome,
            Outcome::Success {
                status: SessionStatus::Running,
                version: 2
            }
        );
    }

    #[tokio::test]
    async fn test_stale_session_orphaned_before_event() {
        let (service, _, clock) = service();
        let session = service.create_session(0, HashMap::new()).await.unwrap();
        service
            .apply(session.id, SessionEvent::Start, None, WAIT)
            .await;
        clock.advance(Duration::from_secs(61));

        let outcome = service
            .apply(session.id, SessionEvent::Pause, None, WAIT)
            .await;
        assert!(matches!(outcome, Outcome::InvalidTransition { .. }));

        let stored = service.get_snapshot(session.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Orphaned);
        assert_eq!(stored.version, 3);
        assert_eq!(stored.last_checkpoint().unwrap().reason, ORPHANED_BY_REHYDRATION);
        assert!(stored.history.last().unwrap().forced);
    }

    #[tokio::test]
    async fn test_health_reports_stored_session() {
        let (service, _, _) = service();
        assert!(service.health(Uuid::new_v4()).await.unwrap().is_none());
        let session = service.create_session(0, HashMap::new()).await.unwrap();
        let score = service.health(session.id).await.unwrap().unwrap();
        assert!((0.0..=1.0).contains(&score));
    }
}
