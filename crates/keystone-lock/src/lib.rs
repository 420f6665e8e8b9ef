//! Distributed fair lock with leases and fencing tokens.
//!
//! Mutual exclusion over named resources across independent processes,
//! built on the atomic operations of a shared [`LeaseStore`].
//!
//! # Main types
//!
//! - [`FairLock`] — FIFO-fair acquire, renew, and release of leased resources.
//! - [`LeaseGuard`] — Capability proving the holder's exclusive write access.
//! - [`LeaseStore`] — Port to the shared key-value store (CAS with TTL).
//! - [`InMemoryLeaseStore`] — Single-process store for tests and simulations.
//! - [`FileLeaseStore`] — Directory-backed store shared by processes on one host.
//! - [`CircuitBreaker`] — Fails fast while the lease store is unreachable.

/// Circuit breaker over lease store failures.
pub mod breaker;
/// The fair lock itself.
pub mod fair_lock;
/// Lease store on the local filesystem.
pub mod file;
/// In-process lease store.
pub mod memory;
mod state;
/// Lease store port and lease records.
pub mod store;

pub use breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use fair_lock::{FairLock, LeaseGuard, LockConfig};
pub use file::FileLeaseStore;
pub use memory::InMemoryLeaseStore;
pub use store::{Lease, LeaseStore, Ticket};
