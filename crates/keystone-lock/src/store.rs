use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keystone_core::{FenceToken, KeystoneResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A time-bounded grant of exclusive access to a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// The protected resource (a session id in the orchestrator).
    pub resource_key: String,
    /// Identity of the holding worker.
    pub holder_id: String,
    /// Token issued for this acquisition.
    pub fence_token: FenceToken,
    /// Instant after which the lease is void.
    pub expires_at: DateTime<Utc>,
    /// Number of tickets ahead of the holder when it joined the queue.
    pub queue_position: u64,
}

impl Lease {
    /// Whether the lease is still in force at `now`.
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// An entry in a resource's fairness queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    /// Store-assigned id, increasing per resource.
    pub id: u64,
    /// The waiting worker.
    pub holder_id: String,
    /// After this instant the ticket is dropped from the queue.
    pub deadline: DateTime<Utc>,
    /// Tickets ahead of this one when it was enqueued.
    pub position: u64,
}

/// Contract of the shared lease store the fair lock is built on.
///
/// Every method must be atomic with respect to every other method on the same
/// key; that atomicity is what guarantees at most one live lease per key.
/// Fence tokens must be strictly increasing per key and never reused, even
/// after a lease expires or is deleted.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Grant a new lease if the live lease's fence equals `expected`
    /// (`None` meaning there is no live lease). Returns the new lease, or
    /// `None` if the comparison failed.
    async fn compare_and_swap_with_ttl(
        &self,
        key: &str,
        expected: Option<FenceToken>,
        holder_id: &str,
        queue_position: u64,
        ttl: Duration,
    ) -> KeystoneResult<Option<Lease>>;

    /// Set the live lease's expiry to `now + ttl` if its fence matches.
    async fn extend_ttl_if_owner(
        &self,
        key: &str,
        fence: FenceToken,
        ttl: Duration,
    ) -> KeystoneResult<Option<Lease>>;

    /// Delete the lease if its fence matches. Returns whether a live lease was removed.
    async fn delete_if_owner(&self, key: &str, fence: FenceToken) -> KeystoneResult<bool>;

    /// The live lease for `key`, if any.
    async fn get(&self, key: &str) -> KeystoneResult<Option<Lease>>;

    /// Append a ticket to the key's fairness queue.
    async fn enqueue_ticket(
        &self,
        key: &str,
        holder_id: &str,
        deadline: DateTime<Utc>,
    ) -> KeystoneResult<Ticket>;

    /// Position of a ticket in the queue (0 is the head), after dropping
    /// tickets whose deadline has passed. `None` if the ticket is gone.
    async fn ticket_position(&self, key: &str, ticket_id: u64) -> KeystoneResult<Option<usize>>;

    /// Remove a ticket. Returns whether it was still queued.
    async fn remove_ticket(&self, key: &str, ticket_id: u64) -> KeystoneResult<bool>;

    /// Number of unexpired tickets waiting on `key`.
    async fn queue_len(&self, key: &str) -> KeystoneResult<usize>;
}

/// Converts a std duration to a chrono duration, saturating on overflow.
pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365 * 100))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_liveness_boundary() {
        let now = Utc::now();
        let lease = Lease {
            resource_key: "r".into(),
            holder_id: "w-1".into(),
            fence_token: FenceToken(1),
            expires_at: now + chrono::Duration::milliseconds(10),
            queue_position: 0,
        };
        assert!(lease.is_live_at(now));
        assert!(!lease.is_live_at(lease.expires_at));
    }

    #[test]
    fn test_to_chrono_saturates() {
        assert_eq!(to_chrono(Duration::from_millis(1500)).num_milliseconds(), 1500);
        assert!(to_chrono(Duration::MAX).num_days() > 365);
    }
}
