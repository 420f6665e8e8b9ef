use crate::state::KeyState;
use crate::store::{Lease, LeaseStore, Ticket};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keystone_core::{FenceToken, KeystoneResult, SharedClock};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

/// Lease store held in process memory.
///
/// Satisfies the [`LeaseStore`] contract for workers sharing one process (tests,
/// simulations). Per-key state is kept after release so fence tokens keep
/// increasing.
pub struct InMemoryLeaseStore {
    clock: SharedClock,
    keys: Mutex<HashMap<String, KeyState>>,
}

impl InMemoryLeaseStore {
    /// Create an empty store reading time from `clock`.
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            keys: Mutex::new(HashMap::new()),
        }
    }

    /// Number of resources that currently have a live lease.
    pub fn live_lease_count(&self) -> usize {
        let now = self.clock.now();
        self.keys
            .lock()
            .values()
            .filter(|s| s.live_lease(now).is_some())
            .count()
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn compare_and_swap_with_ttl(
        &self,
        key: &str,
        expected: Option<FenceToken>,
        holder_id: &str,
        queue_position: u64,
        ttl: Duration,
    ) -> KeystoneResult<Option<Lease>> {
        let now = self.clock.now();
        let mut keys = self.keys.lock();
        let state = keys.entry(key.to_string()).or_default();
        Ok(state.compare_and_swap(key, now, expected, holder_id, queue_position, ttl))
    }

    async fn extend_ttl_if_owner(
        &self,
        key: &str,
        fence: FenceToken,
        ttl: Duration,
    ) -> KeystoneResult<Option<Lease>> {
        let now = self.clock.now();
        let mut keys = self.keys.lock();
        Ok(keys.get_mut(key).and_then(|s| s.extend(now, fence, ttl)))
    }

    async fn delete_if_owner(&self, key: &str, fence: FenceToken) -> KeystoneResult<bool> {
        let now = self.clock.now();
        let mut keys = self.keys.lock();
        Ok(keys.get_mut(key).is_some_and(|s| s.delete(now, fence)))
    }

    async fn get(&self, key: &str) -> KeystoneResult<Option<Lease>> {
        let now = self.clock.now();
        let keys = self.keys.lock();
        Ok(keys.get(key).and_then(|s| s.live_lease(now).cloned()))
    }

    async fn enqueue_ticket(
        &self,
        key: &str,
        holder_id: &str,
        deadline: DateTime<Utc>,
    ) -> KeystoneResult<Ticket> {
        let now = self.clock.now();
        let mut keys = self.keys.lock();
        let state = keys.entry(key.to_string()).or_default();
        Ok(state.enqueue(now, holder_id, deadline))
    }

    async fn ticket_position(&self, key: &str, ticket_id: u64) -> KeystoneResult<Option<usize>> {
        let now = self.clock.now();
        let mut keys = self.keys.lock();
        Ok(keys
            .get_mut(key)
            .and_then(|s| s.ticket_position(now, ticket_id)))
    }

    async fn remove_ticket(&self, key: &str, ticket_id: u64) -> KeystoneResult<bool> {
        let mut keys = self.keys.lock();
        Ok(keys.get_mut(key).is_some_and(|s| s.remove_ticket(ticket_id)))
    }

    async fn queue_len(&self, key: &str) -> KeystoneResult<usize> {
        let now = self.clock.now();
        let mut keys = self.keys.lock();
        Ok(keys.get_mut(key).map_or(0, |s| s.queue_len(now)))
    }
}
