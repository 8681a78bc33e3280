//! Federated marketplace queries: nearby users and posting search.
//!
//! The serving side verifies the signed query, asks the
//! [`MarketplaceDirectory`], and redacts each result to the caller's
//! scopes. The requesting side checks its own record of the target and
//! signs the query; the HTTP leg lives in the server crate.

use rusqlite::Connection;
use souk_audit::NewAuditEntry;
use souk_types::{AuditEventType, AuditOutcome, Scope, TrustLevel};
use std::time::Instant;

use crate::canonical;
use crate::directory::{redact_posting, redact_user, MarketplaceDirectory};
use crate::identity::{IdentityHandle, SigningIdentity};
use crate::trust::{get_federated_server, update_server_last_sync, FederatedServer};
use crate::types::{
    NearbyUsersQuery, NearbyUsersResponse, PostingSearchQuery, PostingSearchResponse,
    SignedNearbyUsersQuery, SignedPostingSearchQuery,
};
use crate::verifier::{verify_signed_call, CallAudit, Rejection, RejectionReason, SignedCall, Verdict};
use crate::FederationError;

pub const NEARBY_USERS_PATH: &str = "/federation/v1/users/nearby";
pub const POSTING_SEARCH_PATH: &str = "/federation/v1/postings/search";

/// Most results a single federated query returns.
pub const MAX_QUERY_LIMIT: u32 = 100;
const MAX_SEARCH_TEXT: usize = 200;

fn reject_audited(
    conn: &Connection,
    event_type: AuditEventType,
    action: &str,
    server_id: &str,
    remote_ip: Option<&str>,
    rejection: Rejection,
) -> Rejection {
    tracing::warn!(server_id, action, reason = %rejection.reason, "{}", rejection.detail);
    souk_audit::record(
        conn,
        NewAuditEntry::new(event_type, action, AuditOutcome::Rejected)
            .server(server_id)
            .detail("reason", rejection.reason)
            .error(rejection.detail.clone())
            .remote_ip(remote_ip),
    );
    rejection
}

fn validate_nearby(query: &NearbyUsersQuery) -> Option<Rejection> {
    let valid = query.latitude.is_finite()
        && query.longitude.is_finite()
        && query.radius_km.is_finite()
        && (-90.0..=90.0).contains(&query.latitude)
        && (-180.0..=180.0).contains(&query.longitude)
        && query.radius_km > 0.0;
    (!valid).then(|| Rejection::new(RejectionReason::MalformedRequest, "invalid coordinates or radius"))
}

fn validate_search(search: &PostingSearchQuery) -> Option<Rejection> {
    (search.query.chars().count() > MAX_SEARCH_TEXT).then(|| {
        Rejection::new(RejectionReason::MalformedRequest, "search text too long")
    })
}

/// Serves a signed nearby-user search from a federated peer.
pub fn serve_nearby_users(
    conn: &Connection,
    identity: &IdentityHandle,
    directory: &dyn MarketplaceDirectory,
    signed: &SignedNearbyUsersQuery,
    remote_ip: Option<&str>,
    now_ms: i64,
) -> Result<Verdict<NearbyUsersResponse>, FederationError> {
    let started = Instant::now();
    let local = identity.require()?;
    let query = signed.query();
    let audit = CallAudit {
        event_type: AuditEventType::UserSearch,
        action: "nearby_users_serve",
        remote_ip,
    };

    let call = SignedCall {
        server_id: &signed.server_id,
        timestamp_ms: signed.timestamp,
        signature: &signed.signature,
        canonical: canonical::nearby_users(&signed.server_id, &query, signed.timestamp),
        required_scope: Scope::Users,
    };
    let caller = match verify_signed_call(conn, &call, &audit, now_ms)? {
        Verdict::Accepted(server) => server,
        Verdict::Rejected(rejection) => return Ok(Verdict::Rejected(rejection)),
    };
    if let Some(rejection) = validate_nearby(&query) {
        let rejection =
            reject_audited(conn, audit.event_type, audit.action, &caller.server_id, remote_ip, rejection);
        return Ok(Verdict::Rejected(rejection));
    }

    let bounded = NearbyUsersQuery {
        limit: query.limit.clamp(1, MAX_QUERY_LIMIT),
        ..query
    };
    let users: Vec<_> = directory
        .nearby_users(&bounded)
        .into_iter()
        .take(bounded.limit as usize)
        .map(|u| redact_user(u, &caller.scopes))
        .collect();

    tracing::debug!(server_id = %caller.server_id, results = users.len(), "served nearby users");
    souk_audit::record(
        conn,
        NewAuditEntry::new(audit.event_type, audit.action, AuditOutcome::Success)
            .server(caller.server_id.as_str())
            .detail("radiusKm", bounded.radius_km)
            .detail("resultCount", users.len())
            .remote_ip(remote_ip)
            .duration(started.elapsed()),
    );
    Ok(Verdict::Accepted(NearbyUsersResponse {
        server_id: local.server_id().to_string(),
        users,
    }))
}

/// Serves a signed posting search from a federated peer.
pub fn serve_posting_search(
    conn: &Connection,
    identity: &IdentityHandle,
    directory: &dyn MarketplaceDirectory,
    signed: &SignedPostingSearchQuery,
    remote_ip: Option<&str>,
    now_ms: i64,
) -> Result<Verdict<PostingSearchResponse>, FederationError> {
    let started = Instant::now();
    let local = identity.require()?;
    let search = signed.search();
    let audit = CallAudit {
        event_type: AuditEventType::PostingSearch,
        action: "posting_search_serve",
        remote_ip,
    };

    let call = SignedCall {
        server_id: &signed.server_id,
        timestamp_ms: signed.timestamp,
        signature: &signed.signature,
        canonical: canonical::posting_search(&signed.server_id, &search, signed.timestamp),
        required_scope: Scope::Postings,
    };
    let caller = match verify_signed_call(conn, &call, &audit, now_ms)? {
        Verdict::Accepted(server) => server,
        Verdict::Rejected(rejection) => return Ok(Verdict::Rejected(rejection)),
    };
    if let Some(rejection) = validate_search(&search) {
        let rejection =
            reject_audited(conn, audit.event_type, audit.action, &caller.server_id, remote_ip, rejection);
        return Ok(Verdict::Rejected(rejection));
    }

    let bounded = PostingSearchQuery {
        limit: search.limit.clamp(1, MAX_QUERY_LIMIT),
        ..search
    };
    let postings: Vec<_> = directory
        .search_postings(&bounded)
        .into_iter()
        .take(bounded.limit as usize)
        .map(|p| redact_posting(p, &caller.scopes))
        .collect();

    souk_audit::record(
        conn,
        NewAuditEntry::new(audit.event_type, audit.action, AuditOutcome::Success)
            .server(caller.server_id.as_str())
            .detail("query", &bounded.query)
            .detail("category", &bounded.category)
            .detail("resultCount", postings.len())
            .remote_ip(remote_ip)
            .duration(started.elapsed()),
    );
    Ok(Verdict::Accepted(PostingSearchResponse {
        server_id: local.server_id().to_string(),
        postings,
    }))
}

/// Checks this server's own record of an outbound target: it must exist,
/// be active, not be `BLOCKED`, and grant `scope`.
pub(crate) fn check_outbound_target(
    conn: &Connection,
    server_id: &str,
    scope: Scope,
) -> Result<Result<FederatedServer, Rejection>, FederationError> {
    let Some(server) = get_federated_server(conn, server_id)? else {
        return Ok(Err(Rejection::new(
            RejectionReason::UnknownServer,
            format!("no federation record for {server_id}"),
        )));
    };
    if server.trust_level == TrustLevel::Blocked {
        return Ok(Err(Rejection::new(
            RejectionReason::ServerBlocked,
            "target server is blocked",
        )));
    }
    if !server.active {
        return Ok(Err(Rejection::new(
            RejectionReason::ServerInactive,
            "target server is inactive",
        )));
    }
    if !server.scopes.allows(scope) {
        return Ok(Err(Rejection::new(
            RejectionReason::ScopeNotGranted,
            format!("scope {scope} not granted by target server"),
        )));
    }
    Ok(Ok(server))
}

/// A signed query ready to send.
#[derive(Debug, Clone)]
pub struct PreparedQuery<Q> {
    pub server: FederatedServer,
    /// Full endpoint URL on the target.
    pub url: String,
    pub query: Q,
}

/// Signs a nearby-user search for `server_id`.
pub fn prepare_nearby_users(
    conn: &Connection,
    identity: &SigningIdentity,
    server_id: &str,
    query: NearbyUsersQuery,
    now_ms: i64,
) -> Result<Verdict<PreparedQuery<SignedNearbyUsersQuery>>, FederationError> {
    let server = match check_outbound_target(conn, server_id, Scope::Users)? {
        Ok(server) => server,
        Err(rejection) => {
            let rejection = reject_audited(
                conn,
                AuditEventType::UserSearch,
                "nearby_users_query",
                server_id,
                None,
                rejection,
            );
            return Ok(Verdict::Rejected(rejection));
        }
    };
    let local_id = identity.server_id();
    let signature = identity.sign(&canonical::nearby_users(local_id, &query, now_ms));
    Ok(Verdict::Accepted(PreparedQuery {
        url: format!("{}{}", server.server_url.trim_end_matches('/'), NEARBY_USERS_PATH),
        server,
        query: SignedNearbyUsersQuery {
            server_id: local_id.to_string(),
            latitude: query.latitude,
            longitude: query.longitude,
            radius_km: query.radius_km,
            limit: query.limit,
            timestamp: now_ms,
            signature,
        },
    }))
}

/// Signs a posting search for `server_id`.
pub fn prepare_posting_search(
    conn: &Connection,
    identity: &SigningIdentity,
    server_id: &str,
    search: PostingSearchQuery,
    now_ms: i64,
) -> Result<Verdict<PreparedQuery<SignedPostingSearchQuery>>, FederationError> {
    let server = match check_outbound_target(conn, server_id, Scope::Postings)? {
        Ok(server) => server,
        Err(rejection) => {
            let rejection = reject_audited(
                conn,
                AuditEventType::PostingSearch,
                "posting_search_query",
                server_id,
                None,
                rejection,
            );
            return Ok(Verdict::Rejected(rejection));
        }
    };
    let local_id = identity.server_id();
    let signature = identity.sign(&canonical::posting_search(local_id, &search, now_ms));
    Ok(Verdict::Accepted(PreparedQuery {
        url: format!("{}{}", server.server_url.trim_end_matches('/'), POSTING_SEARCH_PATH),
        server,
        query: SignedPostingSearchQuery {
            server_id: local_id.to_string(),
            query: search.query,
            category: search.category,
            limit: search.limit,
            timestamp: now_ms,
            signature,
        },
    }))
}

/// Records how an outbound query ended. A successful exchange stamps the
/// peer's `last_sync_at`.
pub fn record_query_outcome(
    conn: &Connection,
    event_type: AuditEventType,
    server_id: &str,
    outcome: Result<usize, &FederationError>,
    started: Instant,
) {
    let action = match event_type {
        AuditEventType::PostingSearch => "posting_search_query",
        _ => "nearby_users_query",
    };
    let entry = match outcome {
        Ok(count) => {
            if let Err(e) = update_server_last_sync(conn, server_id) {
                tracing::warn!(server_id, "failed to update last sync: {}", e);
            }
            NewAuditEntry::new(event_type, action, AuditOutcome::Success)
                .detail("resultCount", count)
        }
        Err(e) => {
            tracing::warn!(server_id, action, "federated query failed: {}", e);
            NewAuditEntry::new(event_type, action, AuditOutcome::Failure).error(e.to_string())
        }
    };
    souk_audit::record(conn, entry.server(server_id).duration(started.elapsed()));
}
