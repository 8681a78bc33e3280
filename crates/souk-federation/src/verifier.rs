//! Verification of signed server-to-server calls.
//!
//! A signed call is accepted only if, in this order, its timestamp is
//! fresh, the caller is a known peer, the peer is active and not
//! `BLOCKED`, the signature verifies against the stored public key, and the
//! peer holds the scope the call needs. The first failing check produces a
//! [`Rejection`]; every rejection is audited.

use rusqlite::Connection;
use serde::Serialize;
use souk_audit::NewAuditEntry;
use souk_types::{AuditEventType, AuditOutcome, Scope, TrustLevel};

use crate::trust::{get_federated_server, FederatedServer};
use crate::FederationError;

/// Machine-readable cause of a refused request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectionReason {
    StaleTimestamp,
    InvalidSignature,
    MalformedRequest,
    UnknownServer,
    ServerInactive,
    ServerBlocked,
    ScopeNotGranted,
    MalformedAddress,
    CoSignatureRequired,
    PublicKeyMismatch,
    UrlConflict,
    BootstrapDisabled,
}

impl RejectionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StaleTimestamp => "STALE_TIMESTAMP",
            Self::InvalidSignature => "INVALID_SIGNATURE",
            Self::MalformedRequest => "MALFORMED_REQUEST",
            Self::UnknownServer => "UNKNOWN_SERVER",
            Self::ServerInactive => "SERVER_INACTIVE",
            Self::ServerBlocked => "SERVER_BLOCKED",
            Self::ScopeNotGranted => "SCOPE_NOT_GRANTED",
            Self::MalformedAddress => "MALFORMED_ADDRESS",
            Self::CoSignatureRequired => "CO_SIGNATURE_REQUIRED",
            Self::PublicKeyMismatch => "PUBLIC_KEY_MISMATCH",
            Self::UrlConflict => "URL_CONFLICT",
            Self::BootstrapDisabled => "BOOTSTRAP_DISABLED",
        }
    }

    /// Message safe to return to the caller. Deliberately coarse: an
    /// unauthenticated caller learns nothing about which check failed
    /// beyond authentication versus authorization.
    pub fn public_message(self) -> &'static str {
        match self {
            Self::StaleTimestamp
            | Self::InvalidSignature
            | Self::UnknownServer
            | Self::PublicKeyMismatch
            | Self::BootstrapDisabled => "request could not be authenticated",
            Self::ServerInactive | Self::ServerBlocked | Self::ScopeNotGranted => {
                "request is not permitted"
            }
            Self::MalformedRequest | Self::MalformedAddress => "request is malformed",
            Self::CoSignatureRequired => "change requires a valid co-signature from the remote server",
            Self::UrlConflict => "request conflicts with an existing federation",
        }
    }

    /// Whether the failure is about who the caller is rather than what it
    /// may do.
    pub fn is_authentication(self) -> bool {
        matches!(
            self,
            Self::StaleTimestamp
                | Self::InvalidSignature
                | Self::UnknownServer
                | Self::PublicKeyMismatch
                | Self::BootstrapDisabled
        )
    }
}

impl std::fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A refused request: the reason plus an internal detail for logs and
/// audit entries only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub reason: RejectionReason,
    pub detail: String,
}

impl Rejection {
    pub fn new(reason: RejectionReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }

    pub fn public_message(&self) -> &'static str {
        self.reason.public_message()
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.reason, self.detail)
    }
}

/// Outcome of a policy-checked operation.
#[derive(Debug, Clone, PartialEq)]
#[must_use]
pub enum Verdict<T> {
    Accepted(T),
    Rejected(Rejection),
}

impl<T> Verdict<T> {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Verdict<U> {
        match self {
            Self::Accepted(value) => Verdict::Accepted(f(value)),
            Self::Rejected(rejection) => Verdict::Rejected(rejection),
        }
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Self::Accepted(_) => None,
            Self::Rejected(rejection) => Some(rejection),
        }
    }
}

/// The authenticating parts of an inbound signed call.
#[derive(Debug, Clone)]
pub struct SignedCall<'a> {
    pub server_id: &'a str,
    pub timestamp_ms: i64,
    pub signature: &'a str,
    /// Canonical string the caller should have signed.
    pub canonical: String,
    pub required_scope: Scope,
}

/// How a rejection of a signed call is recorded.
#[derive(Debug, Clone, Copy)]
pub struct CallAudit<'a> {
    pub event_type: AuditEventType,
    pub action: &'a str,
    pub remote_ip: Option<&'a str>,
}

/// Runs the ordered check sequence and returns the caller's record when
/// every check passes.
///
/// Rejections are audited here. The caller audits the accepted call once it
/// knows the result.
pub fn verify_signed_call(
    conn: &Connection,
    call: &SignedCall<'_>,
    audit: &CallAudit<'_>,
    now_ms: i64,
) -> Result<Verdict<FederatedServer>, FederationError> {
    let verdict = check_signed_call(conn, call, now_ms)?;
    if let Verdict::Rejected(ref rejection) = verdict {
        tracing::warn!(
            server_id = %call.server_id,
            action = audit.action,
            reason = %rejection.reason,
            "rejected federated call: {}",
            rejection.detail
        );
        souk_audit::record(
            conn,
            NewAuditEntry::new(audit.event_type, audit.action, AuditOutcome::Rejected)
                .server(call.server_id)
                .detail("reason", rejection.reason)
                .error(rejection.detail.clone())
                .remote_ip(audit.remote_ip),
        );
    }
    Ok(verdict)
}

fn check_signed_call(
    conn: &Connection,
    call: &SignedCall<'_>,
    now_ms: i64,
) -> Result<Verdict<FederatedServer>, FederationError> {
    if !souk_crypto::is_fresh(call.timestamp_ms, now_ms) {
        return Ok(Verdict::Rejected(Rejection::new(
            RejectionReason::StaleTimestamp,
            format!("timestamp {} outside window at {}", call.timestamp_ms, now_ms),
        )));
    }

    let Some(server) = get_federated_server(conn, call.server_id)? else {
        return Ok(Verdict::Rejected(Rejection::new(
            RejectionReason::UnknownServer,
            format!("no federation record for {}", call.server_id),
        )));
    };

    if !server.active {
        return Ok(Verdict::Rejected(Rejection::new(
            RejectionReason::ServerInactive,
            "server is inactive",
        )));
    }

    if server.trust_level == TrustLevel::Blocked {
        return Ok(Verdict::Rejected(Rejection::new(
            RejectionReason::ServerBlocked,
            "server is blocked",
        )));
    }

    if !souk_crypto::verify(&call.canonical, call.signature, &server.public_key) {
        return Ok(Verdict::Rejected(Rejection::new(
            RejectionReason::InvalidSignature,
            "signature does not match stored public key",
        )));
    }

    if !server.scopes.allows(call.required_scope) {
        return Ok(Verdict::Rejected(Rejection::new(
            RejectionReason::ScopeNotGranted,
            format!("scope {} not granted", call.required_scope),
        )));
    }

    Ok(Verdict::Accepted(server))
}

/// Checks an identity-bootstrap request: `digest_hex` must equal
/// `hex(HMAC-SHA256(secret, timestamp))` and the timestamp must be fresh.
///
/// Returns the parsed timestamp on success.
pub fn verify_bootstrap(
    secret: &str,
    timestamp: &str,
    digest_hex: &str,
    now_ms: i64,
) -> Verdict<i64> {
    if secret.is_empty() {
        return Verdict::Rejected(Rejection::new(
            RejectionReason::BootstrapDisabled,
            "no bootstrap secret configured",
        ));
    }
    let Ok(timestamp_ms) = timestamp.trim().parse::<i64>() else {
        return Verdict::Rejected(Rejection::new(
            RejectionReason::MalformedRequest,
            "bootstrap timestamp is not an integer",
        ));
    };
    if !souk_crypto::is_fresh(timestamp_ms, now_ms) {
        return Verdict::Rejected(Rejection::new(
            RejectionReason::StaleTimestamp,
            "bootstrap timestamp outside window",
        ));
    }
    if !souk_crypto::verify_hmac_sha256_hex(secret.as_bytes(), timestamp.trim(), digest_hex) {
        return Verdict::Rejected(Rejection::new(
            RejectionReason::InvalidSignature,
            "bootstrap signature mismatch",
        ));
    }
    Verdict::Accepted(timestamp_ms)
}
