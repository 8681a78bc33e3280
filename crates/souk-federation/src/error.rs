//! Error type for federation operations.
//!
//! Only genuine failures live here. Policy refusals (stale timestamps, bad
//! signatures, missing scopes, blocked peers) are returned as
//! [`Rejection`](crate::Rejection) values inside a
//! [`Verdict`](crate::Verdict) and never as errors.

use souk_audit::AuditError;
use souk_crypto::CryptoError;
use thiserror::Error;

/// Errors that can occur during federation operations.
#[derive(Debug, Error)]
pub enum FederationError {
    /// No local identity exists yet; the server must be bootstrapped first.
    #[error("local server identity has not been initialized")]
    NotInitialized,
    #[error("federated server not found: {0}")]
    ServerNotFound(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("conflict: {0}")]
    Conflict(String),
    /// A peer's answer failed a cryptographic check.
    #[error("security check failed: {0}")]
    Security(String),
    /// Outbound call failed before a response arrived (timeout, refused).
    #[error("network error: {0}")]
    Network(String),
    /// The peer answered with an unusable response.
    #[error("remote server error: {0}")]
    RemoteServer(String),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("audit error: {0}")]
    Audit(#[from] AuditError),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    /// The storage pool or a blocking task was unavailable.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}
