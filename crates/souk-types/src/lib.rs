//! Shared types and constants for the Souk federation layer.
//!
//! This crate holds the vocabulary every other Souk crate speaks: trust
//! levels, data scopes, audit event classifications, and the protocol
//! constants that both sides of a federation link must agree on.
//!
//! It carries no I/O and no cryptography. Keeping it dependency-light lets
//! the storage, crypto and protocol crates share definitions without
//! depending on each other.

mod audit;
mod scope;

pub use audit::{AuditEventType, AuditOutcome};
pub use scope::{Scope, ScopePermissions};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Federation protocol version spoken by this build.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Maximum distance, in milliseconds, between a signed message's timestamp
/// and the receiving server's clock. Applies to past and future timestamps.
pub const REPLAY_WINDOW_MS: i64 = 5 * 60 * 1000;

/// Error returned when a stored or transmitted label does not name a known
/// variant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseLabelError {
    /// What was being parsed (e.g. "trust level").
    pub kind: &'static str,
    /// The offending input.
    pub value: String,
}

impl ParseLabelError {
    pub(crate) fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Administrative classification of a federated server.
///
/// `Pending` is the only level reachable from an unknown server: it means the
/// two servers have cryptographically introduced themselves but no operator
/// has graduated the link. `Blocked` may be entered from any level without
/// the remote's consent and is only left through a co-signed change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrustLevel {
    /// Introduced, not yet administratively trusted.
    Pending,
    /// Graduated, limited access.
    Partial,
    /// Full access within granted scopes.
    Full,
    /// All access denied.
    Blocked,
}

impl TrustLevel {
    /// Returns the canonical label stored in the database and signed over.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Partial => "PARTIAL",
            Self::Full => "FULL",
            Self::Blocked => "BLOCKED",
        }
    }

    /// Whether moving to this level requires a signature from the remote.
    pub fn requires_remote_consent(self) -> bool {
        !matches!(self, Self::Blocked)
    }
}

impl std::fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TrustLevel {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "PARTIAL" => Ok(Self::Partial),
            "FULL" => Ok(Self::Full),
            "BLOCKED" => Ok(Self::Blocked),
            _ => Err(ParseLabelError::new("trust level", s)),
        }
    }
}
