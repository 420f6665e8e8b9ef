use crate::store::{to_chrono, Lease, Ticket};
use chrono::{DateTime, Utc};
use keystone_core::FenceToken;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

/// Lease, fence high-water mark, and fairness queue of one resource.
///
/// Both lease stores apply these operations while holding their per-key
/// exclusion, so the rules for who holds a key live in one place. The state is
/// kept after release so `last_fence` keeps increasing.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub(crate) struct KeyState {
    lease: Option<Lease>,
    last_fence: FenceToken,
    tickets: VecDeque<Ticket>,
    next_ticket: u64,
}

impl KeyState {
    pub(crate) fn live_lease(&self, now: DateTime<Utc>) -> Option<&Lease> {
        self.lease.as_ref().filter(|l| l.is_live_at(now))
    }

    fn prune_tickets(&mut self, now: DateTime<Utc>) {
        self.tickets.retain(|t| t.deadline > now);
    }

    pub(crate) fn compare_and_swap(
        &mut self,
        key: &str,
        now: DateTime<Utc>,
        expected: Option<FenceToken>,
        holder_id: &str,
        queue_position: u64,
        ttl: Duration,
    ) -> Option<Lease> {
        let current = self.live_lease(now).map(|l| l.fence_token);
        if current != expected {
            return None;
        }

        let fence = self.last_fence.next();
        self.last_fence = fence;
        let lease = Lease {
            resource_key: key.to_string(),
            holder_id: holder_id.to_string(),
            fence_token: fence,
            expires_at: now + to_chrono(ttl),
            queue_position,
        };
        self.lease = Some(lease.clone());
        Some(lease)
    }

    pub(crate) fn extend(
        &mut self,
        now: DateTime<Utc>,
        fence: FenceToken,
        ttl: Duration,
    ) -> Option<Lease> {
        match self.lease.as_mut() {
            Some(lease) if lease.fence_token == fence && lease.is_live_at(now) => {
                lease.expires_at = now + to_chrono(ttl);
                Some(lease.clone())
            }
            _ => None,
        }
    }

    pub(crate) fn delete(&mut self, now: DateTime<Utc>, fence: FenceToken) -> bool {
        match self.lease.take() {
            Some(lease) if lease.fence_token == fence => lease.is_live_at(now),
            other => {
                self.lease = other;
                false
            }
        }
    }

    pub(crate) fn enqueue(
        &mut self,
        now: DateTime<Utc>,
        holder_id: &str,
        deadline: DateTime<Utc>,
    ) -> Ticket {
        self.prune_tickets(now);
        self.next_ticket += 1;
        let ticket = Ticket {
            id: self.next_ticket,
            holder_id: holder_id.to_string(),
            deadline,
            position: self.tickets.len() as u64,
        };
        self.tickets.push_back(ticket.clone());
        ticket
    }

    pub(crate) fn ticket_position(&mut self, now: DateTime<Utc>, ticket_id: u64) -> Option<usize> {
        self.prune_tickets(now);
        self.tickets.iter().position(|t| t.id == ticket_id)
    }

    pub(crate) fn remove_ticket(&mut self, ticket_id: u64) -> bool {
        let before = self.tickets.len();
        self.tickets.retain(|t| t.id != ticket_id);
        self.tickets.len() < before
    }

    pub(crate) fn queue_len(&mut self, now: DateTime<Utc>) -> usize {
        self.prune_tickets(now);
        self.tickets.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_millis(500);

    #[test]
    fn test_state_survives_serialization() {
        let now = Utc::now();
        let mut state = KeyState::default();
        let lease = state
            .compare_and_swap("s", now, None, "a", 0, TTL)
            .unwrap();
        state.enqueue(now, "b", now + chrono::Duration::seconds(5));

        let json = serde_json::to_string(&state).unwrap();
        let mut restored: KeyState = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.live_lease(now), Some(&lease));
        assert_eq!(restored.queue_len(now), 1);

        assert!(restored.delete(now, lease.fence_token));
        let next = restored
            .compare_and_swap("s", now, None, "b", 0, TTL)
            .unwrap();
        assert_eq!(next.fence_token, FenceToken(2));
    }
}
