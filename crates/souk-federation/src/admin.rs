//! Operator-driven changes to federation links.
//!
//! Blocking and revoking are unilateral. Everything that widens what a peer
//! relationship permits (graduating trust, granting a scope) needs a fresh
//! co-signature from the remote server's key as stored in the trust store.
//! The remote operator produces that co-signature with [`issue_consent`].

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use souk_audit::NewAuditEntry;
use souk_types::{
    AuditEventType, AuditOutcome, Scope, ScopePermissions, TrustLevel, REPLAY_WINDOW_MS,
};
use std::time::Instant;

use crate::canonical;
use crate::identity::SigningIdentity;
use crate::trust::{
    delete_federated_server, get_federated_server, set_server_active, update_server_retention,
    update_server_scopes, update_server_trust_level, FederatedServer,
};
use crate::verifier::{Rejection, RejectionReason, Verdict};
use crate::FederationError;

/// Remote approval of a change: a timestamp and the remote's signature over
/// the matching consent string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoSignature {
    pub timestamp: i64,
    pub signature: String,
}

/// Who is asking and when.
#[derive(Debug, Clone, Copy)]
pub struct AdminContext<'a> {
    /// This server's id; needed whenever a co-signature must be checked.
    pub local_server_id: Option<&'a str>,
    pub remote_ip: Option<&'a str>,
    pub now_ms: i64,
}

fn require_server(conn: &Connection, server_id: &str) -> Result<FederatedServer, FederationError> {
    get_federated_server(conn, server_id)?
        .ok_or_else(|| FederationError::ServerNotFound(server_id.to_string()))
}

/// Checks a co-signature and, when it is good, marks it used so the same
/// consent cannot authorize a second change.
fn check_co_signature(
    conn: &Connection,
    server: &FederatedServer,
    co_signature: Option<&CoSignature>,
    canonical_for: impl FnOnce(i64) -> String,
    now_ms: i64,
) -> Result<Option<Rejection>, FederationError> {
    let Some(co_signature) = co_signature else {
        return Ok(Some(Rejection::new(
            RejectionReason::CoSignatureRequired,
            "no co-signature supplied",
        )));
    };
    if !souk_crypto::is_fresh(co_signature.timestamp, now_ms) {
        return Ok(Some(Rejection::new(
            RejectionReason::StaleTimestamp,
            "co-signature timestamp outside window",
        )));
    }
    let message = canonical_for(co_signature.timestamp);
    if !souk_crypto::verify(&message, &co_signature.signature, &server.public_key) {
        return Ok(Some(Rejection::new(
            RejectionReason::CoSignatureRequired,
            "co-signature does not verify against the stored public key",
        )));
    }
    if !claim_co_signature(conn, &server.server_id, co_signature, now_ms)? {
        return Ok(Some(Rejection::new(
            RejectionReason::CoSignatureRequired,
            "co-signature has already been used",
        )));
    }
    Ok(None)
}

/// Records a verified co-signature. Returns `false` if it was already
/// recorded.
fn claim_co_signature(
    conn: &Connection,
    server_id: &str,
    co_signature: &CoSignature,
    now_ms: i64,
) -> Result<bool, FederationError> {
    conn.execute(
        "DELETE FROM used_co_signatures WHERE timestamp_ms < ?1",
        [now_ms - REPLAY_WINDOW_MS],
    )?;
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO used_co_signatures (server_id, signature, timestamp_ms)
         VALUES (?1, ?2, ?3)",
        params![server_id, co_signature.signature, co_signature.timestamp],
    )?;
    Ok(inserted == 1)
}

/// Moves a peer to a new trust level.
///
/// `BLOCKED` is applied without a co-signature. Any other target requires
/// `co_signature` over `TRUST_CHANGE|localId|remoteId|level|timestamp`,
/// signed by the remote.
pub fn change_trust_level(
    conn: &Connection,
    remote_id: &str,
    level: TrustLevel,
    co_signature: Option<&CoSignature>,
    ctx: &AdminContext<'_>,
) -> Result<Verdict<FederatedServer>, FederationError> {
    let started = Instant::now();
    let server = require_server(conn, remote_id)?;
    let previous = server.trust_level;

    let entry = |outcome: AuditOutcome| {
        NewAuditEntry::new(AuditEventType::TrustLevelChange, "trust_level_change", outcome)
            .server(remote_id)
            .detail("from", previous)
            .detail("to", level)
            .detail("coSigned", co_signature.is_some())
            .remote_ip(ctx.remote_ip)
    };

    if level.requires_remote_consent() {
        let local_id = ctx.local_server_id.ok_or(FederationError::NotInitialized)?;
        let rejection = check_co_signature(
            conn,
            &server,
            co_signature,
            |ts| canonical::trust_change(local_id, remote_id, level, ts),
            ctx.now_ms,
        )?;
        if let Some(rejection) = rejection {
            tracing::warn!(server_id = remote_id, to = %level, "trust change refused: {}", rejection.detail);
            souk_audit::record(
                conn,
                entry(AuditOutcome::Rejected)
                    .detail("reason", rejection.reason)
                    .error(rejection.detail.clone())
                    .duration(started.elapsed()),
            );
            return Ok(Verdict::Rejected(rejection));
        }
    }

    if let Err(e) = update_server_trust_level(conn, remote_id, level) {
        souk_audit::record(
            conn,
            entry(AuditOutcome::Failure)
                .error(e.to_string())
                .duration(started.elapsed()),
        );
        return Err(e);
    }

    tracing::info!(server_id = remote_id, from = %previous, to = %level, "trust level changed");
    souk_audit::record(conn, entry(AuditOutcome::Success).duration(started.elapsed()));
    Ok(Verdict::Accepted(require_server(conn, remote_id)?))
}

/// Replaces a peer's scope set.
///
/// Revocations are unilateral. If any scope goes from false to true the
/// whole new set must be co-signed over
/// `SCOPE_CHANGE|localId|remoteId|scopes|timestamp`.
pub fn change_scopes(
    conn: &Connection,
    remote_id: &str,
    scopes: ScopePermissions,
    co_signature: Option<&CoSignature>,
    ctx: &AdminContext<'_>,
) -> Result<Verdict<FederatedServer>, FederationError> {
    let started = Instant::now();
    let server = require_server(conn, remote_id)?;
    let granted: Vec<Scope> = scopes.newly_granted(&server.scopes);

    let entry = |outcome: AuditOutcome| {
        NewAuditEntry::new(AuditEventType::ScopeUpdate, "scope_update", outcome)
            .server(remote_id)
            .detail("from", server.scopes.canonical())
            .detail("to", scopes.canonical())
            .detail("granted", &granted)
            .remote_ip(ctx.remote_ip)
    };

    if !granted.is_empty() {
        let local_id = ctx.local_server_id.ok_or(FederationError::NotInitialized)?;
        let rejection = check_co_signature(
            conn,
            &server,
            co_signature,
            |ts| canonical::scope_change(local_id, remote_id, &scopes, ts),
            ctx.now_ms,
        )?;
        if let Some(rejection) = rejection {
            tracing::warn!(server_id = remote_id, "scope change refused: {}", rejection.detail);
            souk_audit::record(
                conn,
                entry(AuditOutcome::Rejected)
                    .detail("reason", rejection.reason)
                    .error(rejection.detail.clone())
                    .duration(started.elapsed()),
            );
            return Ok(Verdict::Rejected(rejection));
        }
    }

    if let Err(e) = update_server_scopes(conn, remote_id, &scopes) {
        souk_audit::record(
            conn,
            entry(AuditOutcome::Failure)
                .error(e.to_string())
                .duration(started.elapsed()),
        );
        return Err(e);
    }

    tracing::info!(server_id = remote_id, scopes = %scopes.canonical(), "scopes updated");
    souk_audit::record(conn, entry(AuditOutcome::Success).duration(started.elapsed()));
    Ok(Verdict::Accepted(require_server(conn, remote_id)?))
}

/// Deletes a peer's record outright.
pub fn remove_server(
    conn: &Connection,
    remote_id: &str,
    ctx: &AdminContext<'_>,
) -> Result<(), FederationError> {
    let server = require_server(conn, remote_id)?;
    delete_federated_server(conn, remote_id)?;

    tracing::info!(server_id = remote_id, server_url = %server.server_url, "federated server removed");
    souk_audit::record(
        conn,
        NewAuditEntry::new(
            AuditEventType::ServerRemoved,
            "server_remove",
            AuditOutcome::Success,
        )
        .server(remote_id)
        .detail("serverUrl", &server.server_url)
        .detail("trustLevel", server.trust_level)
        .remote_ip(ctx.remote_ip),
    );
    Ok(())
}

/// Suspends or resumes a peer. Trust level and scopes are left alone, so
/// resuming restores exactly what was in force before.
pub fn set_active(
    conn: &Connection,
    remote_id: &str,
    active: bool,
    ctx: &AdminContext<'_>,
) -> Result<FederatedServer, FederationError> {
    let started = Instant::now();
    let server = require_server(conn, remote_id)?;
    let action = if active { "server_resume" } else { "server_suspend" };
    let entry = |outcome: AuditOutcome| {
        NewAuditEntry::new(AuditEventType::TrustLevelChange, action, outcome)
            .server(remote_id)
            .detail("trustLevel", server.trust_level)
            .detail("wasActive", server.active)
            .remote_ip(ctx.remote_ip)
    };

    if let Err(e) = set_server_active(conn, remote_id, active) {
        souk_audit::record(
            conn,
            entry(AuditOutcome::Failure)
                .error(e.to_string())
                .duration(started.elapsed()),
        );
        return Err(e);
    }

    tracing::info!(server_id = remote_id, active, "federated server activity changed");
    souk_audit::record(conn, entry(AuditOutcome::Success).duration(started.elapsed()));
    require_server(conn, remote_id)
}

/// Sets how long data received from a peer is kept. Local policy only; the
/// peer's consent is not involved.
pub fn set_retention(
    conn: &Connection,
    remote_id: &str,
    days: i64,
    ctx: &AdminContext<'_>,
) -> Result<FederatedServer, FederationError> {
    let server = require_server(conn, remote_id)?;
    update_server_retention(conn, remote_id, days)?;

    tracing::info!(server_id = remote_id, days, "data retention updated");
    souk_audit::record(
        conn,
        NewAuditEntry::new(
            AuditEventType::ScopeUpdate,
            "retention_update",
            AuditOutcome::Success,
        )
        .server(remote_id)
        .detail("from", server.data_retention_days)
        .detail("to", days)
        .remote_ip(ctx.remote_ip),
    );
    require_server(conn, remote_id)
}

/// What a consent approves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsentSubject {
    TrustLevel(TrustLevel),
    Scopes(ScopePermissions),
}

/// A consent this server signed for a peer's operator to present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Consent {
    pub signer_server_id: String,
    pub peer_server_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trust_level: Option<TrustLevel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scopes: Option<ScopePermissions>,
    pub timestamp: i64,
    pub signature: String,
}

impl Consent {
    pub fn co_signature(&self) -> CoSignature {
        CoSignature {
            timestamp: self.timestamp,
            signature: self.signature.clone(),
        }
    }
}

/// Signs approval for `peer_server_id` to apply `subject` to its record of
/// this server.
///
/// The consent string names the peer as the local side, since the peer is
/// the one applying the change.
pub fn issue_consent(
    conn: &Connection,
    identity: &SigningIdentity,
    peer_server_id: &str,
    subject: ConsentSubject,
    ctx: &AdminContext<'_>,
) -> Result<Consent, FederationError> {
    let peer = require_server(conn, peer_server_id)?;
    let signer_id = identity.server_id();
    let now = ctx.now_ms;

    let (message, trust_level, scopes, event_type, action) = match subject {
        ConsentSubject::TrustLevel(level) => (
            canonical::trust_change(peer_server_id, signer_id, level, now),
            Some(level),
            None,
            AuditEventType::TrustLevelChange,
            "trust_consent_issue",
        ),
        ConsentSubject::Scopes(scopes) => (
            canonical::scope_change(peer_server_id, signer_id, &scopes, now),
            None,
            Some(scopes),
            AuditEventType::ScopeUpdate,
            "scope_consent_issue",
        ),
    };

    let consent = Consent {
        signer_server_id: signer_id.to_string(),
        peer_server_id: peer.server_id.clone(),
        trust_level,
        scopes,
        timestamp: now,
        signature: identity.sign(&message),
    };

    tracing::info!(peer_server_id, action, "issued federation consent");
    souk_audit::record(
        conn,
        NewAuditEntry::new(event_type, action, AuditOutcome::Success)
            .server(peer_server_id)
            .detail("trustLevel", trust_level)
            .detail("scopes", scopes.map(|s| s.canonical()))
            .remote_ip(ctx.remote_ip),
    );
    Ok(consent)
}
