use crate::outcome::Outcome;
use crate::service::OrchestrationService;
use keystone_session::SessionEvent;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Caller-side retry behaviour for retryable outcomes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub backoff_base_ms: u64,
    /// Maximum delay in milliseconds (cap for exponential backoff).
    pub backoff_max_ms: u64,
    /// Draw each delay uniformly from `[0, capped backoff]`.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_ms: 50,
            backoff_max_ms: 2_000,
            jitter: true,
        }
    }
}

/// Exponential backoff for `attempt` (0-based), capped at `backoff_max_ms`.
pub fn compute_backoff(policy: &RetryPolicy, attempt: u32) -> u64 {
    let delay = policy
        .backoff_base_ms
        .saturating_mul(2u64.saturating_pow(attempt));
    delay.min(policy.backoff_max_ms)
}

fn delay_for(policy: &RetryPolicy, attempt: u32) -> u64 {
    let cap = compute_backoff(policy, attempt);
    if policy.jitter && cap > 0 {
        rand::thread_rng().gen_range(0..=cap)
    } else {
        cap
    }
}

/// Run `op` until it returns a non-retryable outcome or retries run out.
///
/// `sleep` receives each backoff in milliseconds.
pub async fn retry_with<Op, Fut, Sleep, SleepFut>(
    policy: &RetryPolicy,
    mut op: Op,
    sleep: Sleep,
) -> Outcome
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Outcome>,
    Sleep: Fn(u64) -> SleepFut,
    SleepFut: Future<Output = ()>,
{
    let mut attempt = 0;
    loop {
        let outcome = op().await;
        if !outcome.is_retryable() || attempt >= policy.max_retries {
            return outcome;
        }
        let delay = delay_for(policy, attempt);
        debug!(attempt, delay_ms = delay, kind = outcome.kind(), "Retrying after backoff");
        sleep(delay).await;
        attempt += 1;
    }
}

/// [`OrchestrationService::apply`] with backoff on retryable outcomes.
pub async fn retry_apply(
    service: &OrchestrationService,
    policy: &RetryPolicy,
    session_id: Uuid,
    event: SessionEvent,
    payload: Option<serde_json::Value>,
    timeout: Duration,
) -> Outcome {
    retry_with(
        policy,
        move || service.apply(session_id, event, payload.clone(), timeout),
        |ms| tokio::time::sleep(Duration::from_millis(ms)),
    )
    .await
}
