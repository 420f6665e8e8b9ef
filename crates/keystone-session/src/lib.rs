//! Session entity, lifecycle state machine, and persistence port.
//!
//! A [`Session`] is the durable record of a unit of work. Its status moves
//! only along the edges of a fixed adjacency table, its checkpoints form a
//! gapless sequence, and every applied change lands in its history.
//!
//! # Main types
//!
//! - [`Session`] — The entity, with validated transitions and checkpoints.
//! - [`SessionStatus`] — The twelve lifecycle states and their adjacency.
//! - [`SessionEvent`] — Requested lifecycle changes.
//! - [`SessionRepository`] — Versioned, fence-checked storage port.
//! - [`FileSessionRepository`] — JSON-file repository.
//! - [`health_score`] — Observability score derived from status and cadence.

/// Health scoring.
pub mod health;
/// Repository port and in-memory implementation.
pub mod repository;
/// The session entity.
pub mod session;
/// Statuses, categories, and events.
pub mod status;
/// File-backed repository.
pub mod store;

pub use health::{health_score, HealthConfig};
pub use repository::{InMemorySessionRepository, SessionRepository};
pub use session::{Checkpoint, Session, TransitionError, TransitionRecord};
pub use status::{SessionEvent, SessionStatus, StatusCategory};
pub use store::FileSessionRepository;
