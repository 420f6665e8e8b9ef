//! Core types and error definitions for the Keystone session orchestration core.
//!
//! This crate provides the foundational types shared across all Keystone crates,
//! including the unified error enum, fence tokens, and the injectable clock port.
//!
//! # Main types
//!
//! - [`KeystoneError`] — Unified error enum for all Keystone subsystems.
//! - [`KeystoneResult`] — Convenience alias for `Result<T, KeystoneError>`.
//! - [`FenceToken`] — Monotonic lease freshness token issued by the lease store.
//! - [`Clock`] — Time source port, with [`SystemClock`] and [`ManualClock`].

/// Time source port.
pub mod clock;
/// Unified error type.
pub mod error;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use error::{KeystoneError, KeystoneResult};

use serde::{Deserialize, Serialize};

/// A monotonically increasing number proving lease freshness.
///
/// The lease store issues a strictly larger token on every successful
/// acquisition of a resource. Downstream writers compare tokens to reject
/// writes from holders that have since been superseded.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct FenceToken(pub u64);

impl FenceToken {
    /// The token that precedes every issued token.
    pub const ZERO: FenceToken = FenceToken(0);

    /// Returns the raw token value.
    pub fn value(self) -> u64 {
        self.0
    }

    /// Returns the token issued after this one.
    pub fn next(self) -> FenceToken {
        FenceToken(self.0 + 1)
    }
}

impl std::fmt::Display for FenceToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fence_token_ordering() {
        let first = FenceToken::ZERO.next();
        let second = first.next();
        assert!(second > first);
        assert_eq!(second.value(), 2);
        assert_eq!(second.to_string(), "2");
    }

    #[test]
    fn test_fence_token_serializes_as_number() {
        let json = serde_json::to_string(&FenceToken(7)).unwrap();
        assert_eq!(json, "7");
        let parsed: FenceToken = serde_json::from_str("7").unwrap();
        assert_eq!(parsed, FenceToken(7));
    }
}
