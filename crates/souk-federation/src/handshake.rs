//! The two-message handshake that introduces servers to each other.
//!
//! The initiator signs a [`HandshakeRequest`] with its key and embeds its
//! public key. The acceptor verifies it, grants the intersection of the
//! proposed scopes and its own policy, records the initiator as `PENDING`,
//! and answers with a signed [`HandshakeResponse`] carrying an agreement
//! hash over both ids, the granted scopes and the request timestamp. The
//! initiator verifies that response and records the acceptor the same way.
//! The HTTP leg sits in the server crate; both ends of it are here.

use rusqlite::Connection;
use souk_audit::NewAuditEntry;
use souk_types::{AuditEventType, AuditOutcome, ScopePermissions, TrustLevel, PROTOCOL_VERSION};
use std::time::Instant;

use crate::canonical;
use crate::identity::{IdentityHandle, SigningIdentity};
use crate::trust::{
    get_federated_server, get_federated_server_by_url, upsert_federated_server, FederatedServer,
    ServerRegistration,
};
use crate::types::{HandshakeRequest, HandshakeResponse};
use crate::verifier::{Rejection, RejectionReason, Verdict};
use crate::FederationError;

pub const REASON_STALE: &str = "request timestamp outside acceptable window";
pub const REASON_INVALID_SIGNATURE: &str = "invalid signature";
pub const REASON_BLOCKED: &str = "server is blocked";
pub const REASON_INACTIVE: &str = "server is suspended";
pub const REASON_URL_TAKEN: &str = "server url already registered";
pub const REASON_KEY_MISMATCH: &str = "public key mismatch";
pub const REASON_SELF: &str = "cannot federate with self";
pub const REASON_PROTOCOL: &str = "unsupported protocol version";

/// Builds and signs the opening message.
pub fn build_handshake_request(
    identity: &SigningIdentity,
    proposed_scopes: ScopePermissions,
    now_ms: i64,
) -> HandshakeRequest {
    let public = identity.public();
    let mut request = HandshakeRequest {
        server_id: public.server_id.clone(),
        server_url: public.server_url.clone(),
        server_name: public.server_name.clone(),
        public_key: public.public_key.clone(),
        protocol_version: public.protocol_version.clone(),
        proposed_scopes,
        timestamp: now_ms,
        signature: String::new(),
        previous_key_signature: None,
    };
    let message = canonical::handshake_request(&request);
    request.signature = identity.sign(&message);
    request.previous_key_signature = identity.sign_with_previous(&message);
    request
}

fn signed_response(
    identity: &SigningIdentity,
    accepted: bool,
    reason: Option<&str>,
    accepted_scopes: ScopePermissions,
    agreement_hash: Option<String>,
    now_ms: i64,
) -> HandshakeResponse {
    let public = identity.public();
    let mut response = HandshakeResponse {
        server_id: public.server_id.clone(),
        server_url: public.server_url.clone(),
        server_name: public.server_name.clone(),
        public_key: public.public_key.clone(),
        protocol_version: public.protocol_version.clone(),
        accepted,
        reason: reason.map(str::to_string),
        accepted_scopes,
        agreement_hash,
        timestamp: now_ms,
        signature: String::new(),
        previous_key_signature: None,
    };
    let message = canonical::handshake_response(&response);
    response.signature = identity.sign(&message);
    response.previous_key_signature = identity.sign_with_previous(&message);
    response
}

fn major_version(version: &str) -> &str {
    version.split('.').next().unwrap_or(version)
}

/// The identity a handshake message asks this server to record.
struct PeerClaim<'a> {
    server_id: &'a str,
    server_url: &'a str,
    public_key: &'a str,
    /// Canonical string both signatures on the message cover.
    message: String,
    previous_key_signature: Option<&'a str>,
}

impl<'a> PeerClaim<'a> {
    fn from_request(request: &'a HandshakeRequest) -> Self {
        Self {
            server_id: &request.server_id,
            server_url: &request.server_url,
            public_key: &request.public_key,
            message: canonical::handshake_request(request),
            previous_key_signature: request.previous_key_signature.as_deref(),
        }
    }

    fn from_response(response: &'a HandshakeResponse) -> Self {
        Self {
            server_id: &response.server_id,
            server_url: &response.server_url,
            public_key: &response.public_key,
            message: canonical::handshake_response(response),
            previous_key_signature: response.previous_key_signature.as_deref(),
        }
    }

    /// Whether the message is also signed by `stored_key`, i.e. the sender
    /// still holds the key this server has on record.
    fn proves_key(&self, stored_key: &str) -> bool {
        self.previous_key_signature
            .is_some_and(|signature| souk_crypto::verify(&self.message, signature, stored_key))
    }
}

/// Decides whether a handshake may write the claimed identity, returning
/// the record it would update.
///
/// A blocked or suspended peer stays that way, and a URL cannot move to a
/// different server id. A graduated peer may only change its key when the
/// message is also signed by the key on record; a `PENDING` peer may change
/// it freely.
fn admit(
    conn: &Connection,
    claim: &PeerClaim<'_>,
) -> Result<Verdict<Option<FederatedServer>>, FederationError> {
    let existing = get_federated_server(conn, claim.server_id)?;
    if let Some(existing) = &existing {
        if existing.trust_level == TrustLevel::Blocked {
            return Ok(Verdict::Rejected(Rejection::new(
                RejectionReason::ServerBlocked,
                REASON_BLOCKED,
            )));
        }
        if !existing.active {
            return Ok(Verdict::Rejected(Rejection::new(
                RejectionReason::ServerInactive,
                REASON_INACTIVE,
            )));
        }
        let graduated = matches!(existing.trust_level, TrustLevel::Partial | TrustLevel::Full);
        if graduated
            && existing.public_key != claim.public_key
            && !claim.proves_key(&existing.public_key)
        {
            return Ok(Verdict::Rejected(Rejection::new(
                RejectionReason::PublicKeyMismatch,
                REASON_KEY_MISMATCH,
            )));
        }
    }
    if let Some(by_url) = get_federated_server_by_url(conn, claim.server_url)? {
        if by_url.server_id != claim.server_id {
            return Ok(Verdict::Rejected(Rejection::new(
                RejectionReason::UrlConflict,
                REASON_URL_TAKEN,
            )));
        }
    }
    Ok(Verdict::Accepted(existing))
}

/// Settings the acceptor applies to every handshake.
#[derive(Debug, Clone, Copy)]
pub struct AcceptPolicy {
    /// Upper bound on the scopes this server grants.
    pub granted_scopes: ScopePermissions,
    /// Retention recorded for newly created peers.
    pub data_retention_days: i64,
}

/// Acceptor side: evaluates an inbound request and answers it.
///
/// Refusals are answered with a signed `accepted = false` response, never
/// with an error. The only error outcomes are a missing local identity and
/// storage failures.
pub fn accept_handshake(
    conn: &Connection,
    identity: &IdentityHandle,
    request: &HandshakeRequest,
    policy: &AcceptPolicy,
    remote_ip: Option<&str>,
    now_ms: i64,
) -> Result<HandshakeResponse, FederationError> {
    let started = Instant::now();
    let Some(signer) = identity.current() else {
        souk_audit::record(
            conn,
            NewAuditEntry::new(
                AuditEventType::Error,
                "handshake_accept",
                AuditOutcome::Failure,
            )
            .server(request.server_id.as_str())
            .error(FederationError::NotInitialized.to_string())
            .remote_ip(remote_ip),
        );
        return Err(FederationError::NotInitialized);
    };

    let refuse = |reason: &str, outcome: AuditOutcome| {
        tracing::warn!(
            server_id = %request.server_id,
            server_url = %request.server_url,
            reason,
            "handshake refused"
        );
        souk_audit::record(
            conn,
            NewAuditEntry::new(AuditEventType::HandshakeReject, "handshake_accept", outcome)
                .server(request.server_id.as_str())
                .detail("serverUrl", &request.server_url)
                .detail("proposedScopes", request.proposed_scopes.canonical())
                .error(reason)
                .remote_ip(remote_ip)
                .duration(started.elapsed()),
        );
        signed_response(
            &signer,
            false,
            Some(reason),
            ScopePermissions::default(),
            None,
            now_ms,
        )
    };

    if !souk_crypto::is_fresh(request.timestamp, now_ms) {
        return Ok(refuse(REASON_STALE, AuditOutcome::Rejected));
    }
    if !request.verify_signature() {
        return Ok(refuse(REASON_INVALID_SIGNATURE, AuditOutcome::Failure));
    }
    if request.server_id == signer.server_id() {
        return Ok(refuse(REASON_SELF, AuditOutcome::Rejected));
    }
    if major_version(&request.protocol_version) != major_version(PROTOCOL_VERSION) {
        return Ok(refuse(REASON_PROTOCOL, AuditOutcome::Rejected));
    }

    let tx = conn.unchecked_transaction()?;
    let existing = match admit(&tx, &PeerClaim::from_request(request))? {
        Verdict::Accepted(existing) => existing,
        Verdict::Rejected(conflict) => {
            drop(tx);
            return Ok(refuse(conflict.detail.as_str(), AuditOutcome::Rejected));
        }
    };

    // A repeated handshake never grants more than the record already
    // holds; widening an existing link goes through a co-signed scope change.
    let mut accepted_scopes = request.proposed_scopes.intersect(&policy.granted_scopes);
    if let Some(existing) = &existing {
        accepted_scopes = accepted_scopes.intersect(&existing.scopes);
    }
    let key_rotated = existing
        .as_ref()
        .is_some_and(|e| e.public_key != request.public_key);
    let hash = souk_crypto::agreement_hash(
        &request.server_id,
        signer.server_id(),
        &accepted_scopes,
        request.timestamp,
    );

    let server = upsert_federated_server(
        &tx,
        &ServerRegistration {
            server_id: &request.server_id,
            server_url: &request.server_url,
            server_name: &request.server_name,
            public_key: &request.public_key,
            protocol_version: &request.protocol_version,
            scopes: accepted_scopes,
            agreement_hash: &hash,
            data_retention_days: policy.data_retention_days,
        },
    )?;
    tx.commit()?;

    let response = signed_response(&signer, true, None, accepted_scopes, Some(hash), now_ms);

    if key_rotated {
        tracing::info!(
            server_id = %server.server_id,
            key = %crate::identity::key_fingerprint(&server.public_key),
            "federated server presented a new public key"
        );
    }
    tracing::info!(
        server_id = %server.server_id,
        server_url = %server.server_url,
        scopes = %accepted_scopes.canonical(),
        "accepted federation handshake"
    );
    souk_audit::record(
        conn,
        NewAuditEntry::new(
            AuditEventType::HandshakeAccept,
            "handshake_accept",
            AuditOutcome::Success,
        )
        .server(server.server_id.as_str())
        .detail("serverUrl", &server.server_url)
        .detail("proposedScopes", request.proposed_scopes.canonical())
        .detail("acceptedScopes", accepted_scopes.canonical())
        .detail("repeated", existing.is_some())
        .detail(
            "previousTrustLevel",
            existing.as_ref().map(|e| e.trust_level),
        )
        .detail("keyRotated", key_rotated)
        .remote_ip(remote_ip)
        .duration(started.elapsed()),
    );

    Ok(response)
}

/// Initiator side, before sending: refuses to dial a URL this server has
/// blocked or suspended.
pub fn check_handshake_target(
    conn: &Connection,
    target_url: &str,
) -> Result<Verdict<()>, FederationError> {
    if let Some(existing) = get_federated_server_by_url(conn, target_url)? {
        let rejection = if existing.trust_level == TrustLevel::Blocked {
            Some(Rejection::new(RejectionReason::ServerBlocked, REASON_BLOCKED))
        } else if !existing.active {
            Some(Rejection::new(RejectionReason::ServerInactive, REASON_INACTIVE))
        } else {
            None
        };
        if let Some(rejection) = rejection {
            souk_audit::record(
                conn,
                NewAuditEntry::new(
                    AuditEventType::HandshakeInitiate,
                    "handshake_initiate",
                    AuditOutcome::Rejected,
                )
                .server(existing.server_id.as_str())
                .detail("targetUrl", target_url)
                .detail("reason", rejection.reason)
                .error(rejection.detail.clone()),
            );
            return Ok(Verdict::Rejected(rejection));
        }
    }
    Ok(Verdict::Accepted(()))
}

/// Records an initiator-side failure that happened before a usable
/// response arrived (timeout, refused connection, bad status).
pub fn record_initiate_failure(
    conn: &Connection,
    target_url: &str,
    error: &FederationError,
    started: Instant,
) {
    tracing::warn!(target_url, "federation handshake failed: {}", error);
    souk_audit::record(
        conn,
        NewAuditEntry::new(
            AuditEventType::HandshakeInitiate,
            "handshake_initiate",
            AuditOutcome::Failure,
        )
        .detail("targetUrl", target_url)
        .error(error.to_string())
        .duration(started.elapsed()),
    );
}

fn verify_response(
    identity: &SigningIdentity,
    request: &HandshakeRequest,
    response: &HandshakeResponse,
) -> Result<(), FederationError> {
    if !response.verify_signature() {
        return Err(FederationError::Security(
            "handshake response signature is invalid".to_string(),
        ));
    }
    if !response.accepted {
        return Ok(());
    }
    if response.server_id == identity.server_id() {
        return Err(FederationError::Security(
            "handshake response names this server".to_string(),
        ));
    }
    if response.accepted_scopes.intersect(&request.proposed_scopes) != response.accepted_scopes {
        return Err(FederationError::Security(
            "acceptor granted scopes that were not proposed".to_string(),
        ));
    }
    let expected = souk_crypto::agreement_hash(
        identity.server_id(),
        &response.server_id,
        &response.accepted_scopes,
        request.timestamp,
    );
    if response.agreement_hash.as_deref() != Some(expected.as_str()) {
        return Err(FederationError::Security(
            "agreement hash does not match".to_string(),
        ));
    }
    Ok(())
}

/// Initiator side, after the response arrived: verifies it and records the
/// acceptor on success.
///
/// # Errors
///
/// `FederationError::Security` when the response fails verification; no
/// record is written in that case. `FederationError::Conflict` when the
/// acceptor may not be recorded (blocked, suspended, key changed, URL taken).
pub fn complete_initiated_handshake(
    conn: &Connection,
    identity: &SigningIdentity,
    request: &HandshakeRequest,
    response: &HandshakeResponse,
    data_retention_days: i64,
    started: Instant,
) -> Result<HandshakeResponse, FederationError> {
    let entry = |outcome: AuditOutcome| {
        NewAuditEntry::new(
            AuditEventType::HandshakeInitiate,
            "handshake_initiate",
            outcome,
        )
        .server(response.server_id.as_str())
        .detail("targetUrl", &response.server_url)
        .detail("proposedScopes", request.proposed_scopes.canonical())
    };

    if let Err(e) = verify_response(identity, request, response) {
        tracing::warn!(server_id = %response.server_id, "handshake response rejected: {}", e);
        souk_audit::record(
            conn,
            entry(AuditOutcome::Failure)
                .error(e.to_string())
                .duration(started.elapsed()),
        );
        return Err(e);
    }

    if !response.accepted {
        let reason = response.reason.as_deref().unwrap_or("unspecified");
        tracing::info!(server_id = %response.server_id, reason, "handshake declined by remote");
        souk_audit::record(
            conn,
            entry(AuditOutcome::Rejected)
                .error(reason)
                .duration(started.elapsed()),
        );
        return Ok(response.clone());
    }

    let hash = response.agreement_hash.clone().unwrap_or_default();
    let tx = conn.unchecked_transaction()?;
    if let Verdict::Rejected(conflict) = admit(&tx, &PeerClaim::from_response(response))? {
        drop(tx);
        let e = FederationError::Conflict(conflict.detail);
        souk_audit::record(
            conn,
            entry(AuditOutcome::Failure)
                .detail("reason", conflict.reason)
                .error(e.to_string())
                .duration(started.elapsed()),
        );
        return Err(e);
    }
    upsert_federated_server(
        &tx,
        &ServerRegistration {
            server_id: &response.server_id,
            server_url: &response.server_url,
            server_name: &response.server_name,
            public_key: &response.public_key,
            protocol_version: &response.protocol_version,
            scopes: response.accepted_scopes,
            agreement_hash: &hash,
            data_retention_days,
        },
    )?;
    tx.commit()?;

    tracing::info!(
        server_id = %response.server_id,
        server_url = %response.server_url,
        scopes = %response.accepted_scopes.canonical(),
        "federation handshake completed"
    );
    souk_audit::record(
        conn,
        entry(AuditOutcome::Success)
            .detail("acceptedScopes", response.accepted_scopes.canonical())
            .duration(started.elapsed()),
    );
    Ok(response.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::rotate_keys;
    use crate::test_support::{local_identity, test_db};
    use crate::trust::{
        list_federated_servers, set_server_active, update_server_scopes,
        update_server_trust_level,
    };
    use souk_types::REPLAY_WINDOW_MS;

    const NOW: i64 = 1_700_000_000_000;

    fn policy(granted: ScopePermissions) -> AcceptPolicy {
        AcceptPolicy {
            granted_scopes: granted,
            data_retention_days: 30,
        }
    }

    fn no_chat() -> ScopePermissions {
        ScopePermissions {
            chat: false,
            ..ScopePermissions::all()
        }
    }

    fn proposed() -> ScopePermissions {
        ScopePermissions {
            users: true,
            postings: true,
            chat: true,
            ..Default::default()
        }
    }

    struct Pair {
        a: Connection,
        b: Connection,
        a_id: IdentityHandle,
        b_id: IdentityHandle,
    }

    fn pair() -> Pair {
        let a = test_db();
        let b = test_db();
        let a_id = local_identity(&a, "https://a.example");
        let b_id = local_identity(&b, "https://b.example");
        Pair { a, b, a_id, b_id }
    }

    fn audit_outcomes(conn: &Connection, event_type: &str) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT outcome FROM federation_audit_log WHERE event_type = ?1 ORDER BY id")
            .unwrap();
        stmt.query_map([event_type], |r| r.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap()
    }

    #[test]
    fn full_handshake_records_both_sides() {
        let p = pair();
        let a_signer = p.a_id.require().unwrap();
        let request = build_handshake_request(&a_signer, proposed(), NOW);
        assert!(request.verify_signature());

        let response =
            accept_handshake(&p.b, &p.b_id, &request, &policy(no_chat()), Some("10.0.0.1"), NOW)
                .unwrap();
        assert!(response.accepted);
        assert!(response.verify_signature());
        assert!(response.accepted_scopes.users);
        assert!(!response.accepted_scopes.chat);

        let completed = complete_initiated_handshake(
            &p.a,
            &a_signer,
            &request,
            &response,
            30,
            Instant::now(),
        )
        .unwrap();
        assert!(completed.accepted);

        let b_view = get_federated_server(&p.b, a_signer.server_id()).unwrap().unwrap();
        let b_server_id = p.b_id.require().unwrap().server_id().to_string();
        let a_view = get_federated_server(&p.a, &b_server_id).unwrap().unwrap();

        for view in [&a_view, &b_view] {
            assert_eq!(view.trust_level, TrustLevel::Pending);
            assert!(!view.scopes.chat);
            assert_eq!(view.agreement_hash, response.agreement_hash);
        }
        assert_eq!(audit_outcomes(&p.b, "HANDSHAKE_ACCEPT"), vec!["SUCCESS"]);
        assert_eq!(audit_outcomes(&p.a, "HANDSHAKE_INITIATE"), vec!["SUCCESS"]);
    }

    #[test]
    fn repeated_accept_keeps_one_row() {
        let p = pair();
        let a_signer = p.a_id.require().unwrap();
        for offset in [0, 1_000] {
            let request = build_handshake_request(&a_signer, proposed(), NOW + offset);
            let response =
                accept_handshake(&p.b, &p.b_id, &request, &policy(no_chat()), None, NOW + offset)
                    .unwrap();
            assert!(response.accepted);
        }
        assert_eq!(list_federated_servers(&p.b, None).unwrap().len(), 1);
    }

    #[test]
    fn stale_request_is_refused_without_record() {
        let p = pair();
        let a_signer = p.a_id.require().unwrap();
        let request = build_handshake_request(&a_signer, proposed(), NOW - REPLAY_WINDOW_MS - 1);

        let response =
            accept_handshake(&p.b, &p.b_id, &request, &policy(no_chat()), None, NOW).unwrap();
        assert!(!response.accepted);
        assert_eq!(response.reason.as_deref(), Some(REASON_STALE));
        assert!(response.verify_signature());
        assert!(list_federated_servers(&p.b, None).unwrap().is_empty());
        assert_eq!(audit_outcomes(&p.b, "HANDSHAKE_REJECT"), vec!["REJECTED"]);
    }

    #[test]
    fn tampered_request_is_refused() {
        let p = pair();
        let a_signer = p.a_id.require().unwrap();
        let mut request = build_handshake_request(&a_signer, proposed(), NOW);
        request.proposed_scopes.geolocation = true;

        let response =
            accept_handshake(&p.b, &p.b_id, &request, &policy(no_chat()), None, NOW).unwrap();
        assert!(!response.accepted);
        assert_eq!(response.reason.as_deref(), Some(REASON_INVALID_SIGNATURE));
        assert_eq!(audit_outcomes(&p.b, "HANDSHAKE_REJECT"), vec!["FAILURE"]);
    }

    #[test]
    fn blocked_server_cannot_handshake_back_in() {
        let p = pair();
        let a_signer = p.a_id.require().unwrap();
        let request = build_handshake_request(&a_signer, proposed(), NOW);
        accept_handshake(&p.b, &p.b_id, &request, &policy(no_chat()), None, NOW).unwrap();
        update_server_trust_level(&p.b, a_signer.server_id(), TrustLevel::Blocked).unwrap();

        let again = build_handshake_request(&a_signer, proposed(), NOW + 10);
        let response =
            accept_handshake(&p.b, &p.b_id, &again, &policy(no_chat()), None, NOW + 10).unwrap();
        assert!(!response.accepted);
        assert_eq!(response.reason.as_deref(), Some(REASON_BLOCKED));
        let record = get_federated_server(&p.b, a_signer.server_id()).unwrap().unwrap();
        assert_eq!(record.trust_level, TrustLevel::Blocked);
    }

    fn last_accept_details(conn: &Connection) -> serde_json::Value {
        let raw: String = conn
            .query_row(
                "SELECT details_json FROM federation_audit_log
                 WHERE event_type = 'HANDSHAKE_ACCEPT' ORDER BY id DESC LIMIT 1",
                [],
                |r| r.get(0),
            )
            .unwrap();
        serde_json::from_str(&raw).unwrap()
    }

    #[test]
    fn suspended_peer_cannot_resume_itself_by_handshaking() {
        let p = pair();
        let a_signer = p.a_id.require().unwrap();
        let everything = policy(ScopePermissions::all());
        let request = build_handshake_request(&a_signer, proposed(), NOW);
        accept_handshake(&p.b, &p.b_id, &request, &everything, None, NOW).unwrap();

        set_server_active(&p.b, a_signer.server_id(), false).unwrap();
        update_server_scopes(&p.b, a_signer.server_id(), &ScopePermissions::default()).unwrap();

        let again = build_handshake_request(&a_signer, proposed(), NOW + 10);
        let response = accept_handshake(&p.b, &p.b_id, &again, &everything, None, NOW + 10).unwrap();
        assert!(!response.accepted);
        assert_eq!(response.reason.as_deref(), Some(REASON_INACTIVE));

        let record = get_federated_server(&p.b, a_signer.server_id()).unwrap().unwrap();
        assert!(!record.active);
        assert_eq!(record.scopes, ScopePermissions::default());
    }

    #[test]
    fn repeated_handshake_does_not_restore_revoked_scopes() {
        let p = pair();
        let a_signer = p.a_id.require().unwrap();
        let everything = policy(ScopePermissions::all());
        let request = build_handshake_request(&a_signer, proposed(), NOW);
        accept_handshake(&p.b, &p.b_id, &request, &everything, None, NOW).unwrap();

        let users_only = ScopePermissions {
            users: true,
            ..Default::default()
        };
        update_server_scopes(&p.b, a_signer.server_id(), &users_only).unwrap();

        let again = build_handshake_request(&a_signer, proposed(), NOW + 10);
        let response = accept_handshake(&p.b, &p.b_id, &again, &everything, None, NOW + 10).unwrap();
        assert!(response.accepted);
        assert_eq!(response.accepted_scopes, users_only);
        let record = get_federated_server(&p.b, a_signer.server_id()).unwrap().unwrap();
        assert_eq!(record.scopes, users_only);
        assert_eq!(last_accept_details(&p.b)["repeated"], true);
    }

    #[test]
    fn graduated_peer_may_change_key_only_with_proof_of_the_old_one() {
        let p = pair();
        let a_signer = p.a_id.require().unwrap();
        let request = build_handshake_request(&a_signer, proposed(), NOW);
        accept_handshake(&p.b, &p.b_id, &request, &policy(no_chat()), None, NOW).unwrap();
        update_server_trust_level(&p.b, a_signer.server_id(), TrustLevel::Full).unwrap();

        rotate_keys(&p.a).unwrap();
        p.a_id.refresh(&p.a).unwrap();
        let rotated = p.a_id.require().unwrap();

        let mut bare = build_handshake_request(&rotated, proposed(), NOW + 10);
        bare.previous_key_signature = None;
        let response =
            accept_handshake(&p.b, &p.b_id, &bare, &policy(no_chat()), None, NOW + 10).unwrap();
        assert!(!response.accepted);
        assert_eq!(response.reason.as_deref(), Some(REASON_KEY_MISMATCH));

        // Signed twice with the new key proves nothing about the old one.
        let mut self_vouched = build_handshake_request(&rotated, proposed(), NOW + 20);
        self_vouched.previous_key_signature =
            Some(rotated.sign(&canonical::handshake_request(&self_vouched)));
        let response =
            accept_handshake(&p.b, &p.b_id, &self_vouched, &policy(no_chat()), None, NOW + 20)
                .unwrap();
        assert!(!response.accepted);

        let record = get_federated_server(&p.b, rotated.server_id()).unwrap().unwrap();
        assert_eq!(record.trust_level, TrustLevel::Full);
        assert_eq!(record.public_key, a_signer.public().public_key);

        let proven = build_handshake_request(&rotated, proposed(), NOW + 30);
        assert!(proven.previous_key_signature.is_some());
        let response =
            accept_handshake(&p.b, &p.b_id, &proven, &policy(no_chat()), None, NOW + 30).unwrap();
        assert!(response.accepted);

        let record = get_federated_server(&p.b, rotated.server_id()).unwrap().unwrap();
        assert_eq!(record.public_key, rotated.public().public_key);
        assert_eq!(record.trust_level, TrustLevel::Pending);
        let details = last_accept_details(&p.b);
        assert_eq!(details["keyRotated"], true);
        assert_eq!(details["previousTrustLevel"], "FULL");
    }

    #[test]
    fn initiator_accepts_rotated_acceptor_that_proves_its_old_key() {
        let p = pair();
        let a_signer = p.a_id.require().unwrap();
        let b_server_id = p.b_id.require().unwrap().server_id().to_string();
        let request = build_handshake_request(&a_signer, proposed(), NOW);
        let response =
            accept_handshake(&p.b, &p.b_id, &request, &policy(no_chat()), None, NOW).unwrap();
        complete_initiated_handshake(&p.a, &a_signer, &request, &response, 30, Instant::now())
            .unwrap();
        update_server_trust_level(&p.a, &b_server_id, TrustLevel::Full).unwrap();

        rotate_keys(&p.b).unwrap();
        p.b_id.refresh(&p.b).unwrap();

        let request = build_handshake_request(&a_signer, proposed(), NOW + 10);
        let response =
            accept_handshake(&p.b, &p.b_id, &request, &policy(no_chat()), None, NOW + 10).unwrap();
        assert!(response.accepted);
        assert!(response.previous_key_signature.is_some());

        complete_initiated_handshake(&p.a, &a_signer, &request, &response, 30, Instant::now())
            .unwrap();
        let record = get_federated_server(&p.a, &b_server_id).unwrap().unwrap();
        assert_eq!(record.public_key, response.public_key);
        assert_eq!(record.trust_level, TrustLevel::Pending);
    }

    #[test]
    fn acceptor_without_identity_is_a_configuration_error() {
        let p = pair();
        let a_signer = p.a_id.require().unwrap();
        let request = build_handshake_request(&a_signer, proposed(), NOW);
        let result = accept_handshake(
            &p.b,
            &IdentityHandle::empty(),
            &request,
            &policy(no_chat()),
            None,
            NOW,
        );
        assert!(matches!(result, Err(FederationError::NotInitialized)));
    }

    #[test]
    fn forged_response_is_not_persisted() {
        let p = pair();
        let a_signer = p.a_id.require().unwrap();
        let request = build_handshake_request(&a_signer, proposed(), NOW);
        let mut response =
            accept_handshake(&p.b, &p.b_id, &request, &policy(no_chat()), None, NOW).unwrap();
        response.accepted_scopes.chat = true;

        let result =
            complete_initiated_handshake(&p.a, &a_signer, &request, &response, 30, Instant::now());
        assert!(matches!(result, Err(FederationError::Security(_))));
        assert!(list_federated_servers(&p.a, None).unwrap().is_empty());
        assert_eq!(audit_outcomes(&p.a, "HANDSHAKE_INITIATE"), vec!["FAILURE"]);
    }

    #[test]
    fn declined_response_is_returned_and_audited() {
        let p = pair();
        let a_signer = p.a_id.require().unwrap();
        let request = build_handshake_request(&a_signer, proposed(), NOW - REPLAY_WINDOW_MS * 2);
        let response =
            accept_handshake(&p.b, &p.b_id, &request, &policy(no_chat()), None, NOW).unwrap();

        let returned =
            complete_initiated_handshake(&p.a, &a_signer, &request, &response, 30, Instant::now())
                .unwrap();
        assert!(!returned.accepted);
        assert!(list_federated_servers(&p.a, None).unwrap().is_empty());
        assert_eq!(audit_outcomes(&p.a, "HANDSHAKE_INITIATE"), vec!["REJECTED"]);
    }

    #[test]
    fn blocked_or_suspended_target_url_is_not_dialled() {
        let conn = test_db();
        crate::test_support::register(&conn, "b1", "https://b.example", ScopePermissions::all());
        update_server_trust_level(&conn, "b1", TrustLevel::Blocked).unwrap();

        let verdict = check_handshake_target(&conn, "https://b.example").unwrap();
        assert_eq!(
            verdict.rejection().map(|r| r.reason),
            Some(RejectionReason::ServerBlocked)
        );
        assert!(check_handshake_target(&conn, "https://c.example")
            .unwrap()
            .is_accepted());

        crate::test_support::register(&conn, "d1", "https://d.example", ScopePermissions::all());
        set_server_active(&conn, "d1", false).unwrap();
        let verdict = check_handshake_target(&conn, "https://d.example").unwrap();
        assert_eq!(
            verdict.rejection().map(|r| r.reason),
            Some(RejectionReason::ServerInactive)
        );
    }
}
