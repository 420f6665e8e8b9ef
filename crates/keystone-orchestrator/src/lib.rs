//! Session orchestration for Keystone.
//!
//! Composes the fair lock, the session state machine, and the session
//! repository into one protocol that guarantees at most one active mutator
//! per session, even across processes and across holder crashes.
//!
//! # Main types
//!
//! - [`OrchestrationService`] — Acquire, load, rehydrate, validate, mutate, persist, release.
//! - [`Outcome`] — Explicit result distinguishing retryable from terminal failures.
//! - [`HookChain`] — Observers notified after each step.
//! - [`OrchestrationMetrics`] — Hook that counts outcomes.
//! - [`RetryPolicy`] — Caller-side backoff for retryable outcomes.

/// Service settings.
pub mod config;
/// Orchestration event hooks.
pub mod hooks;
/// Outcome counters.
pub mod monitor;
/// Step outcomes.
pub mod outcome;
/// Caller-side retry with backoff.
pub mod retry;
/// The orchestration service.
pub mod service;

pub use config::OrchestratorConfig;
pub use hooks::{HookChain, OrchestrationEvent, OrchestrationHook, TracingHook};
pub use monitor::{OrchestrationCounters, OrchestrationMetrics};
pub use outcome::Outcome;
pub use retry::{compute_backoff, retry_apply, retry_with, RetryPolicy};
pub use service::{OrchestrationService, ORPHANED_BY_REHYDRATION};
