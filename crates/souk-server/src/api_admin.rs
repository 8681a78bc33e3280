//! Operator-facing federation API under `/admin/federation`.

use crate::{api::ApiError, client, middleware::ClientIp, run_blocking, AppState};
use axum::{
    extract::{Extension, Json, Path, Query},
    http::{HeaderMap, StatusCode},
};
use serde::{Deserialize, Serialize};
use souk_audit::{get_audit_logs, AuditFilter, AuditLogEntry, NewAuditEntry};
use souk_crypto::now_millis;
use souk_federation::types::{
    HandshakeResponse, NearbyUsersQuery, NearbyUsersResponse, PostingSearchQuery,
    PostingSearchResponse, BOOTSTRAP_SIGNATURE_HEADER, BOOTSTRAP_TIMESTAMP_HEADER,
};
use souk_federation::verifier::verify_bootstrap;
use souk_federation::{
    change_scopes, change_trust_level, get_federated_server, get_public_identity, initialize,
    issue_consent, list_federated_servers, remove_server, rotate_keys, set_active, set_retention,
    AdminContext, CoSignature,
    Consent, ConsentSubject, FederatedServer, FederationError, InitializeParams, OutboundMessage,
    PublicIdentity, Rejection, RejectionReason, SigningIdentity, Verdict,
};
use souk_types::{AuditEventType, AuditOutcome, ScopePermissions, TrustLevel};
use std::sync::Arc;

const DEFAULT_NEARBY_LIMIT: u32 = 20;
const DEFAULT_SEARCH_LIMIT: u32 = 20;

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

fn admin_context<'a>(
    local: &'a Option<Arc<SigningIdentity>>,
    remote_ip: &'a Option<String>,
) -> AdminContext<'a> {
    AdminContext {
        local_server_id: local.as_deref().map(SigningIdentity::server_id),
        remote_ip: remote_ip.as_deref(),
        now_ms: now_millis(),
    }
}

fn co_signature(
    timestamp: Option<i64>,
    signature: Option<String>,
) -> Result<Option<CoSignature>, ApiError> {
    match (timestamp, signature) {
        (Some(timestamp), Some(signature)) => Ok(Some(CoSignature {
            timestamp,
            signature,
        })),
        (None, None) => Ok(None),
        _ => Err(ApiError::BadRequest(
            "timestamp and signature must be supplied together".to_string(),
        )),
    }
}

/// Outbound refusals name our own record of the target, so an unknown
/// server is a missing resource rather than an authentication failure.
fn outbound_rejected(rejection: &Rejection) -> ApiError {
    match rejection.reason {
        RejectionReason::UnknownServer => {
            ApiError::NotFound("federated server not found".to_string())
        }
        _ => ApiError::rejected(rejection),
    }
}

/// Request body for identity initialization.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeIdentityRequest {
    /// Falls back to `federation.public_url` when absent.
    #[serde(default)]
    pub server_url: Option<String>,
    pub server_name: String,
    #[serde(default)]
    pub admin_contact: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub location_hint: Option<String>,
}

/// Handler for `POST /admin/federation/identity/initialize`.
///
/// Authenticated by `x-souk-bootstrap-signature`, the hex HMAC-SHA256 of
/// `x-souk-bootstrap-timestamp` under the configured bootstrap secret.
pub async fn initialize_identity_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(client_ip): Extension<ClientIp>,
    headers: HeaderMap,
    Json(payload): Json<InitializeIdentityRequest>,
) -> Result<Json<PublicIdentity>, ApiError> {
    let verdict = verify_bootstrap(
        &state.bootstrap_secret,
        header_str(&headers, BOOTSTRAP_TIMESTAMP_HEADER),
        header_str(&headers, BOOTSTRAP_SIGNATURE_HEADER),
        now_millis(),
    );
    if let Verdict::Rejected(rejection) = verdict {
        tracing::warn!(reason = %rejection.reason, "identity bootstrap refused: {}", rejection.detail);
        let response = ApiError::rejected(&rejection);
        let ip = client_ip.0;
        run_blocking(&state.pool, move |conn| {
            souk_audit::record(
                conn,
                NewAuditEntry::new(
                    AuditEventType::KeyRotation,
                    "identity_initialize",
                    AuditOutcome::Rejected,
                )
                .detail("reason", rejection.reason)
                .error(rejection.detail)
                .remote_ip(ip.as_deref()),
            );
            Ok(())
        })
        .await?;
        return Err(response);
    }

    let server_url = payload
        .server_url
        .or_else(|| state.public_url.clone())
        .ok_or_else(|| {
            ApiError::BadRequest(
                "serverUrl is required when no public url is configured".to_string(),
            )
        })?;
    let params = InitializeParams {
        server_url,
        server_name: payload.server_name,
        admin_contact: payload.admin_contact,
        description: payload.description,
        location_hint: payload.location_hint,
    };

    let identity = state.identity.clone();
    let public = run_blocking(&state.pool, move |conn| {
        let public = initialize(conn, &params)?;
        identity.refresh(conn)?;
        Ok(public)
    })
    .await?;

    Ok(Json(public))
}

/// Handler for `GET /admin/federation/identity`.
pub async fn get_identity_handler(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<PublicIdentity>, ApiError> {
    let public = run_blocking(&state.pool, |conn| {
        get_public_identity(conn)?.ok_or(FederationError::NotInitialized)
    })
    .await?;
    Ok(Json(public))
}

/// Handler for `POST /admin/federation/identity/rotate`.
pub async fn rotate_identity_handler(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<PublicIdentity>, ApiError> {
    let identity = state.identity.clone();
    let public = run_blocking(&state.pool, move |conn| {
        let public = rotate_keys(conn)?;
        identity.refresh(conn)?;
        Ok(public)
    })
    .await?;
    Ok(Json(public))
}

/// Request body for an outbound handshake.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateHandshakeRequest {
    pub target_url: String,
    /// Scopes to propose; defaults to what this server grants.
    #[serde(default)]
    pub scopes: Option<ScopePermissions>,
}

/// Handler for `POST /admin/federation/handshake`.
pub async fn initiate_handshake_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(payload): Json<InitiateHandshakeRequest>,
) -> Result<Json<HandshakeResponse>, ApiError> {
    let scopes = payload
        .scopes
        .unwrap_or(state.accept_policy.granted_scopes);
    match client::initiate_handshake(&state, &payload.target_url, scopes).await? {
        Verdict::Accepted(response) => Ok(Json(response)),
        Verdict::Rejected(rejection) => Err(ApiError::rejected(&rejection)),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListServersParams {
    #[serde(default)]
    pub trust_level: Option<String>,
}

/// Handler for `GET /admin/federation/servers`.
pub async fn list_servers_handler(
    Extension(state): Extension<Arc<AppState>>,
    Query(params): Query<ListServersParams>,
) -> Result<Json<Vec<FederatedServer>>, ApiError> {
    let level = params
        .trust_level
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<TrustLevel>())
        .transpose()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let servers = run_blocking(&state.pool, move |conn| list_federated_servers(conn, level)).await?;
    Ok(Json(servers))
}

/// Handler for `GET /admin/federation/servers/{serverId}`.
pub async fn get_server_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(server_id): Path<String>,
) -> Result<Json<FederatedServer>, ApiError> {
    let server = run_blocking(&state.pool, move |conn| {
        get_federated_server(conn, &server_id)?.ok_or(FederationError::ServerNotFound(server_id))
    })
    .await?;
    Ok(Json(server))
}

/// Handler for `DELETE /admin/federation/servers/{serverId}`.
pub async fn delete_server_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(client_ip): Extension<ClientIp>,
    Path(server_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let identity = state.identity.clone();
    run_blocking(&state.pool, move |conn| {
        let local = identity.current();
        remove_server(conn, &server_id, &admin_context(&local, &client_ip.0))
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Request body for suspending or resuming a peer.
#[derive(Debug, Deserialize)]
pub struct UpdateActiveRequest {
    pub active: bool,
}

/// Handler for `PUT /admin/federation/servers/{serverId}/active`.
pub async fn update_active_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(client_ip): Extension<ClientIp>,
    Path(server_id): Path<String>,
    Json(payload): Json<UpdateActiveRequest>,
) -> Result<Json<FederatedServer>, ApiError> {
    let identity = state.identity.clone();
    let server = run_blocking(&state.pool, move |conn| {
        let local = identity.current();
        set_active(
            conn,
            &server_id,
            payload.active,
            &admin_context(&local, &client_ip.0),
        )
    })
    .await?;
    Ok(Json(server))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRetentionRequest {
    pub data_retention_days: i64,
}

/// Handler for `PUT /admin/federation/servers/{serverId}/retention`.
pub async fn update_retention_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(client_ip): Extension<ClientIp>,
    Path(server_id): Path<String>,
    Json(payload): Json<UpdateRetentionRequest>,
) -> Result<Json<FederatedServer>, ApiError> {
    let identity = state.identity.clone();
    let server = run_blocking(&state.pool, move |conn| {
        let local = identity.current();
        set_retention(
            conn,
            &server_id,
            payload.data_retention_days,
            &admin_context(&local, &client_ip.0),
        )
    })
    .await?;
    Ok(Json(server))
}

/// Request body for a trust level change.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTrustRequest {
    pub trust_level: TrustLevel,
    /// Co-signature timestamp, required for changes the remote must consent to.
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub signature: Option<String>,
}

/// Handler for `PUT /admin/federation/servers/{serverId}/trust`.
pub async fn update_trust_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(client_ip): Extension<ClientIp>,
    Path(server_id): Path<String>,
    Json(payload): Json<UpdateTrustRequest>,
) -> Result<Json<FederatedServer>, ApiError> {
    let co_sig = co_signature(payload.timestamp, payload.signature)?;
    let identity = state.identity.clone();
    let verdict = run_blocking(&state.pool, move |conn| {
        let local = identity.current();
        change_trust_level(
            conn,
            &server_id,
            payload.trust_level,
            co_sig.as_ref(),
            &admin_context(&local, &client_ip.0),
        )
    })
    .await?;

    match verdict {
        Verdict::Accepted(server) => Ok(Json(server)),
        Verdict::Rejected(rejection) => Err(ApiError::rejected(&rejection)),
    }
}

/// Request body for a scope change.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateScopesRequest {
    pub scopes: ScopePermissions,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub signature: Option<String>,
}

/// Handler for `PUT /admin/federation/servers/{serverId}/scopes`.
pub async fn update_scopes_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(client_ip): Extension<ClientIp>,
    Path(server_id): Path<String>,
    Json(payload): Json<UpdateScopesRequest>,
) -> Result<Json<FederatedServer>, ApiError> {
    let co_sig = co_signature(payload.timestamp, payload.signature)?;
    let identity = state.identity.clone();
    let verdict = run_blocking(&state.pool, move |conn| {
        let local = identity.current();
        change_scopes(
            conn,
            &server_id,
            payload.scopes,
            co_sig.as_ref(),
            &admin_context(&local, &client_ip.0),
        )
    })
    .await?;

    match verdict {
        Verdict::Accepted(server) => Ok(Json(server)),
        Verdict::Rejected(rejection) => Err(ApiError::rejected(&rejection)),
    }
}

/// Request body for issuing a consent to a peer's change. Exactly one of
/// `trustLevel` and `scopes` must be present.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueConsentRequest {
    pub peer_server_id: String,
    #[serde(default)]
    pub trust_level: Option<TrustLevel>,
    #[serde(default)]
    pub scopes: Option<ScopePermissions>,
}

/// Handler for `POST /admin/federation/consents`.
pub async fn issue_consent_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(client_ip): Extension<ClientIp>,
    Json(payload): Json<IssueConsentRequest>,
) -> Result<Json<Consent>, ApiError> {
    let subject = match (payload.trust_level, payload.scopes) {
        (Some(level), None) => ConsentSubject::TrustLevel(level),
        (None, Some(scopes)) => ConsentSubject::Scopes(scopes),
        _ => {
            return Err(ApiError::BadRequest(
                "exactly one of trustLevel and scopes is required".to_string(),
            ))
        }
    };
    let signer = state.identity.require()?;
    let consent = run_blocking(&state.pool, move |conn| {
        let local = Some(Arc::clone(&signer));
        issue_consent(
            conn,
            &signer,
            &payload.peer_server_id,
            subject,
            &admin_context(&local, &client_ip.0),
        )
    })
    .await?;
    Ok(Json(consent))
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageResponse {
    pub delivered: bool,
    pub message_id: Option<String>,
}

/// Handler for `POST /admin/federation/messages`.
///
/// Always `200` once the local identity exists: an undelivered message
/// reports `delivered: false` and the cause is in the audit log.
pub async fn send_message_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(payload): Json<OutboundMessage>,
) -> Result<Json<SendMessageResponse>, ApiError> {
    let message_id = client::send_message_to_federated_user(&state, payload).await?;
    Ok(Json(SendMessageResponse {
        delivered: message_id.is_some(),
        message_id,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NearbyUsersParams {
    pub latitude: f64,
    pub longitude: f64,
    pub radius_km: f64,
    #[serde(default)]
    pub limit: Option<u32>,
}

/// Handler for `GET /admin/federation/servers/{serverId}/users/nearby`.
pub async fn nearby_users_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(server_id): Path<String>,
    Query(params): Query<NearbyUsersParams>,
) -> Result<Json<NearbyUsersResponse>, ApiError> {
    let query = NearbyUsersQuery {
        latitude: params.latitude,
        longitude: params.longitude,
        radius_km: params.radius_km,
        limit: params.limit.unwrap_or(DEFAULT_NEARBY_LIMIT),
    };
    match client::query_nearby_users(&state, server_id, query).await? {
        Verdict::Accepted(response) => Ok(Json(response)),
        Verdict::Rejected(rejection) => Err(outbound_rejected(&rejection)),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchPostingsParams {
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
}

/// Handler for `GET /admin/federation/servers/{serverId}/postings`.
pub async fn search_postings_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(server_id): Path<String>,
    Query(params): Query<SearchPostingsParams>,
) -> Result<Json<PostingSearchResponse>, ApiError> {
    let search = PostingSearchQuery {
        query: params.query,
        category: params.category.filter(|c| !c.is_empty()),
        limit: params.limit.unwrap_or(DEFAULT_SEARCH_LIMIT),
    };
    match client::search_federated_postings(&state, server_id, search).await? {
        Verdict::Accepted(response) => Ok(Json(response)),
        Verdict::Rejected(rejection) => Err(outbound_rejected(&rejection)),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditParams {
    #[serde(default)]
    pub server_id: Option<String>,
    #[serde(default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
}

/// Handler for `GET /admin/federation/audit`.
pub async fn audit_handler(
    Extension(state): Extension<Arc<AppState>>,
    Query(params): Query<AuditParams>,
) -> Result<Json<Vec<AuditLogEntry>>, ApiError> {
    let event_type = params
        .event_type
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<AuditEventType>())
        .transpose()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let filter = AuditFilter {
        server_id: params.server_id.filter(|s| !s.is_empty()),
        event_type,
        limit: params.limit,
    };
    let entries = run_blocking(&state.pool, move |conn| Ok(get_audit_logs(conn, &filter)?)).await?;
    Ok(Json(entries))
}
