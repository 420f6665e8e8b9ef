use crate::breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::store::{to_chrono, Lease, LeaseStore};
use chrono::{DateTime, Utc};
use keystone_core::{FenceToken, KeystoneError, KeystoneResult, SharedClock};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Wait bound used when the caller's timeout does not fit in an `Instant`.
const UNBOUNDED_WAIT: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Timing defaults for the fair lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// How often a queued waiter re-checks the store.
    pub poll_interval_ms: u64,
    /// Lease duration used when the caller does not supply one.
    pub lease_duration_ms: u64,
    /// Acquire timeout used when the caller does not supply one.
    pub acquire_timeout_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 20,
            lease_duration_ms: 30_000,
            acquire_timeout_ms: 5_000,
        }
    }
}

impl LockConfig {
    /// Poll interval as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Default lease duration as a [`Duration`].
    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms)
    }

    /// Default acquire timeout as a [`Duration`].
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

/// Proof of exclusive write access to a resource.
///
/// The guard is the capability a holder presents downstream: its fence token
/// conditions every privileged write. Dropping a guard does not release the
/// lease; an unreleased lease is reclaimed by TTL expiry, exactly as if the
/// holder had crashed.
#[derive(Debug)]
pub struct LeaseGuard {
    lease: Lease,
}

impl LeaseGuard {
    /// The protected resource.
    pub fn resource_key(&self) -> &str {
        &self.lease.resource_key
    }

    /// The holder this lease was granted to.
    pub fn holder_id(&self) -> &str {
        &self.lease.holder_id
    }

    /// Fence token of this acquisition.
    pub fn fence(&self) -> FenceToken {
        self.lease.fence_token
    }

    /// Expiry as of the last grant or renewal.
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.lease.expires_at
    }

    /// Queue position recorded when the holder enqueued.
    pub fn queue_position(&self) -> u64 {
        self.lease.queue_position
    }

    /// The underlying lease record.
    pub fn lease(&self) -> &Lease {
        &self.lease
    }
}

/// A queued ticket that is revoked if the waiter gives up or is dropped.
struct PendingTicket {
    store: Arc<dyn LeaseStore>,
    key: String,
    ticket_id: u64,
    armed: bool,
}

impl PendingTicket {
    fn new(store: Arc<dyn LeaseStore>, key: &str, ticket_id: u64) -> Self {
        Self {
            store,
            key: key.to_string(),
            ticket_id,
            armed: true,
        }
    }

    fn replace(&mut self, ticket_id: u64) {
        self.ticket_id = ticket_id;
        self.armed = true;
    }

    async fn revoke(&mut self) {
        if !self.armed {
            return;
        }
        self.armed = false;
        if let Err(e) = self.store.remove_ticket(&self.key, self.ticket_id).await {
            debug!(
                resource = %self.key,
                ticket = self.ticket_id,
                error = %e,
                "Ticket removal failed, relying on ticket deadline"
            );
        }
    }
}

impl Drop for PendingTicket {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // Cancelled mid-wait; the ticket deadline covers a missing runtime.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let store = self.store.clone();
            let key = std::mem::take(&mut self.key);
            let ticket_id = self.ticket_id;
            handle.spawn(async move {
                let _ = store.remove_ticket(&key, ticket_id).await;
            });
        }
    }
}

/// Fair, lease-bounded mutual exclusion over named resources.
///
/// Waiters are granted the lock in the order they joined the resource's
/// ticket queue. Grants are leases with a TTL and a fence token issued by
/// the [`LeaseStore`]; the store's atomic operations are the only thing that
/// decides who holds a resource.
pub struct FairLock {
    store: Arc<dyn LeaseStore>,
    clock: SharedClock,
    config: LockConfig,
    breaker: CircuitBreaker,
    waiters: Mutex<HashMap<String, Arc<Notify>>>,
}

impl FairLock {
    /// Create a lock over `store`.
    pub fn new(
        store: Arc<dyn LeaseStore>,
        clock: SharedClock,
        config: LockConfig,
        breaker: CircuitBreakerConfig,
    ) -> Self {
        Self {
            store,
            breaker: CircuitBreaker::new(breaker, clock.clone()),
            clock,
            config,
            waiters: Mutex::new(HashMap::new()),
        }
    }

    /// The lock's timing configuration.
    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// State of the breaker guarding the lease store.
    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// Run a store call through the circuit breaker.
    async fn guarded<T>(
        &self,
        call: impl Future<Output = KeystoneResult<T>>,
    ) -> KeystoneResult<T> {
        self.breaker.admit()?;
        self.observe(call.await)
    }

    fn observe<T>(&self, result: KeystoneResult<T>) -> KeystoneResult<T> {
        match &result {
            Ok(_) => self.breaker.record_success(),
            Err(e) if e.is_transient() => self.breaker.record_failure(),
            Err(_) => {}
        }
        result
    }

    fn notifier(&self, key: &str) -> Arc<Notify> {
        self.waiters
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    fn wake(&self, key: &str) {
        let mut waiters = self.waiters.lock();
        if let Some(notify) = waiters.get(key) {
            notify.notify_waiters();
            if Arc::strong_count(notify) == 1 {
                waiters.remove(key);
            }
        }
    }

    /// Acquire `resource_key` for `holder_id`.
    ///
    /// Waits until this caller's ticket reaches the head of the queue and the
    /// resource is free, or until `timeout` elapses. The ticket is removed on
    /// every exit path; if this future is dropped mid-wait the ticket is
    /// revoked in the background.
    pub async fn acquire(
        &self,
        resource_key: &str,
        holder_id: &str,
        timeout: Duration,
        lease_duration: Duration,
    ) -> KeystoneResult<LeaseGuard> {
        let started = Instant::now();
        let give_up = started
            .checked_add(timeout)
            .unwrap_or_else(|| started + UNBOUNDED_WAIT);
        // Ticket deadlines are read by other processes, so they are set from
        // the shared clock and the wait below also ends on that clock.
        let clock_give_up = self.clock.now() + to_chrono(timeout);
        let ticket_deadline = clock_give_up + to_chrono(self.config.poll_interval());

        let mut ticket = self
            .guarded(
                self.store
                    .enqueue_ticket(resource_key, holder_id, ticket_deadline),
            )
            .await?;
        let mut pending = PendingTicket::new(self.store.clone(), resource_key, ticket.id);
        debug!(
            resource = %resource_key,
            holder = %holder_id,
            ticket = ticket.id,
            position = ticket.position,
            "Enqueued for lock"
        );

        let notify = self.notifier(resource_key);
        loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self
                .guarded(self.store.ticket_position(resource_key, ticket.id))
                .await?
            {
                Some(0) => {
                    let granted = self
                        .guarded(self.store.compare_and_swap_with_ttl(
                            resource_key,
                            None,
                            holder_id,
                            ticket.position,
                            lease_duration,
                        ))
                        .await?;
                    if let Some(lease) = granted {
                        pending.revoke().await;
                        info!(
                            resource = %resource_key,
                            holder = %holder_id,
                            fence = %lease.fence_token,
                            waited_ms = started.elapsed().as_millis() as u64,
                            "Lock acquired"
                        );
                        return Ok(LeaseGuard { lease });
                    }
                }
                Some(_) => {}
                None if self.clock.now() >= clock_give_up => {}
                None => {
                    // Dropped by the store before our deadline; rejoin at the tail.
                    ticket = self
                        .guarded(
                            self.store
                                .enqueue_ticket(resource_key, holder_id, ticket_deadline),
                        )
                        .await?;
                    pending.replace(ticket.id);
                }
            }

            let now = Instant::now();
            if now >= give_up || self.clock.now() >= clock_give_up {
                pending.revoke().await;
                self.wake(resource_key);
                let waited_ms = started.elapsed().as_millis() as u64;
                warn!(
                    resource = %resource_key,
                    holder = %holder_id,
                    waited_ms,
                    "Lock acquisition timed out"
                );
                return Err(KeystoneError::ContentionTimeout {
                    resource: resource_key.to_string(),
                    waited_ms,
                });
            }

            let wait = give_up
                .saturating_duration_since(now)
                .min(self.config.poll_interval());
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Extend the lease to `now + extension` if `fence` still owns it.
    ///
    /// Returns [`KeystoneError::LeaseLost`] when the lease expired or was
    /// taken over; the caller must abandon whatever it was about to write.
    pub async fn renew(
        &self,
        resource_key: &str,
        fence: FenceToken,
        extension: Duration,
    ) -> KeystoneResult<Lease> {
        match self
            .guarded(self.store.extend_ttl_if_owner(resource_key, fence, extension))
            .await?
        {
            Some(lease) => {
                debug!(resource = %resource_key, fence = %fence, "Lease renewed");
                Ok(lease)
            }
            None => {
                warn!(resource = %resource_key, fence = %fence, "Lease lost on renewal");
                Err(KeystoneError::LeaseLost {
                    resource: resource_key.to_string(),
                    fence,
                })
            }
        }
    }

    /// Renew the lease behind `guard`, refreshing its recorded expiry.
    pub async fn renew_guard(
        &self,
        guard: &mut LeaseGuard,
        extension: Duration,
    ) -> KeystoneResult<()> {
        let lease = self
            .renew(&guard.lease.resource_key, guard.fence(), extension)
            .await?;
        guard.lease = lease;
        Ok(())
    }

    /// Release the lease if `fence` still owns it. Stale releases are no-ops.
    pub async fn release(&self, resource_key: &str, fence: FenceToken) -> KeystoneResult<()> {
        let removed = self.observe(self.store.delete_if_owner(resource_key, fence).await)?;
        if removed {
            debug!(resource = %resource_key, fence = %fence, "Lock released");
        } else {
            debug!(resource = %resource_key, fence = %fence, "Stale release ignored");
        }
        self.wake(resource_key);
        Ok(())
    }

    /// Release the lease behind `guard`.
    pub async fn release_guard(&self, guard: LeaseGuard) -> KeystoneResult<()> {
        self.release(&guard.lease.resource_key, guard.fence()).await
    }

    /// Confirm without side effects that `fence` still owns a live lease.
    pub async fn check(&self, resource_key: &str, fence: FenceToken) -> KeystoneResult<Lease> {
        match self.guarded(self.store.get(resource_key)).await? {
            Some(lease) if lease.fence_token == fence => Ok(lease),
            _ => Err(KeystoneError::LeaseLost {
                resource: resource_key.to_string(),
                fence,
            }),
        }
    }

    /// The current live lease on `resource_key`, if any.
    pub async fn holder(&self, resource_key: &str) -> KeystoneResult<Option<Lease>> {
        self.guarded(self.store.get(resource_key)).await
    }

    /// Number of callers queued on `resource_key`.
    pub async fn queue_len(&self, resource_key: &str) -> KeystoneResult<usize> {
        self.guarded(self.store.queue_len(resource_key)).await
    }
}
