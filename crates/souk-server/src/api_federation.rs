//! Server-to-server protocol endpoints under `/federation/v1`.
//!
//! Callers are other Souk servers. Every endpoint except the handshake and
//! the public identity requires a request signed with the caller's
//! registered key; failures return only a generic message.

use crate::{api::ApiError, middleware::ClientIp, run_blocking, AppState};
use axum::{
    extract::{Extension, Json, Query},
    http::HeaderMap,
};
use souk_crypto::now_millis;
use souk_federation::query::{serve_nearby_users, serve_posting_search};
use souk_federation::relay::receive_relay;
use souk_federation::types::{
    HandshakeRequest, HandshakeResponse, NearbyUsersResponse, PostingSearchResponse,
    RelayEnvelope, RelayReceipt, SignedHeaders, SignedNearbyUsersQuery, SignedPostingSearchQuery,
    SERVER_ID_HEADER, SIGNATURE_HEADER, TIMESTAMP_HEADER,
};
use souk_federation::{
    accept_handshake, get_public_identity, FederationError, PublicIdentity, RejectionReason,
    Verdict,
};
use std::sync::Arc;

/// Handler for `POST /federation/v1/handshake`.
///
/// Refusals are answered `200` with a signed `accepted: false` body so the
/// initiator can verify who declined.
pub async fn handshake_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(client_ip): Extension<ClientIp>,
    Json(request): Json<HandshakeRequest>,
) -> Result<Json<HandshakeResponse>, ApiError> {
    let identity = state.identity.clone();
    let policy = state.accept_policy;
    let response = run_blocking(&state.pool, move |conn| {
        accept_handshake(
            conn,
            &identity,
            &request,
            &policy,
            client_ip.as_deref(),
            now_millis(),
        )
    })
    .await
    .map_err(ApiError::from_peer)?;
    Ok(Json(response))
}

/// Handler for `GET /federation/v1/users/nearby`.
pub async fn nearby_users_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(client_ip): Extension<ClientIp>,
    Query(signed): Query<SignedNearbyUsersQuery>,
) -> Result<Json<NearbyUsersResponse>, ApiError> {
    let identity = state.identity.clone();
    let directory = Arc::clone(&state.directory);
    let verdict = run_blocking(&state.pool, move |conn| {
        serve_nearby_users(
            conn,
            &identity,
            directory.as_ref(),
            &signed,
            client_ip.as_deref(),
            now_millis(),
        )
    })
    .await
    .map_err(ApiError::from_peer)?;

    match verdict {
        Verdict::Accepted(response) => Ok(Json(response)),
        Verdict::Rejected(rejection) => Err(ApiError::rejected(&rejection)),
    }
}

/// Handler for `GET /federation/v1/postings/search`.
pub async fn posting_search_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(client_ip): Extension<ClientIp>,
    Query(signed): Query<SignedPostingSearchQuery>,
) -> Result<Json<PostingSearchResponse>, ApiError> {
    let identity = state.identity.clone();
    let directory = Arc::clone(&state.directory);
    let verdict = run_blocking(&state.pool, move |conn| {
        serve_posting_search(
            conn,
            &identity,
            directory.as_ref(),
            &signed,
            client_ip.as_deref(),
            now_millis(),
        )
    })
    .await
    .map_err(ApiError::from_peer)?;

    match verdict {
        Verdict::Accepted(response) => Ok(Json(response)),
        Verdict::Rejected(rejection) => Err(ApiError::rejected(&rejection)),
    }
}

fn signed_headers(headers: &HeaderMap) -> Option<SignedHeaders> {
    let get = |name: &str| headers.get(name)?.to_str().ok().map(str::to_string);
    Some(SignedHeaders {
        server_id: get(SERVER_ID_HEADER)?,
        timestamp: get(TIMESTAMP_HEADER)?.trim().parse().ok()?,
        signature: get(SIGNATURE_HEADER)?,
    })
}

/// Handler for `POST /federation/v1/messages/relay`.
pub async fn relay_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(client_ip): Extension<ClientIp>,
    headers: HeaderMap,
    Json(envelope): Json<RelayEnvelope>,
) -> Result<Json<RelayReceipt>, ApiError> {
    let Some(signed) = signed_headers(&headers) else {
        tracing::warn!("relay request missing signed headers");
        return Err(ApiError::Unauthorized(
            RejectionReason::InvalidSignature.public_message().to_string(),
        ));
    };

    let inbox = Arc::clone(&state.inbox);
    let verdict = run_blocking(&state.pool, move |conn| {
        receive_relay(
            conn,
            inbox.as_ref(),
            &signed,
            &envelope,
            client_ip.as_deref(),
            now_millis(),
        )
    })
    .await
    .map_err(ApiError::from_peer)?;

    match verdict {
        Verdict::Accepted(receipt) => Ok(Json(receipt)),
        Verdict::Rejected(rejection) => Err(ApiError::rejected(&rejection)),
    }
}

/// Handler for `GET /federation/v1/identity`.
pub async fn identity_handler(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<PublicIdentity>, ApiError> {
    let public = run_blocking(&state.pool, |conn| {
        get_public_identity(conn)?.ok_or(FederationError::NotInitialized)
    })
    .await
    .map_err(ApiError::from_peer)?;
    Ok(Json(public))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn signed_headers_require_all_three() {
        let mut headers = HeaderMap::new();
        headers.insert(SERVER_ID_HEADER, HeaderValue::from_static("a1"));
        headers.insert(TIMESTAMP_HEADER, HeaderValue::from_static("1700000000000"));
        assert!(signed_headers(&headers).is_none());

        headers.insert(SIGNATURE_HEADER, HeaderValue::from_static("c2ln"));
        let parsed = signed_headers(&headers).unwrap();
        assert_eq!(parsed.server_id, "a1");
        assert_eq!(parsed.timestamp, 1_700_000_000_000);

        headers.insert(TIMESTAMP_HEADER, HeaderValue::from_static("soon"));
        assert!(signed_headers(&headers).is_none());
    }
}
