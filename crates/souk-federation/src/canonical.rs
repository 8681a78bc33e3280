//! Canonical signing strings.
//!
//! Every signed message type has exactly one function here, shared by the
//! signing side and the verifying side. Fields are joined with `|` in a
//! fixed order; free-text fields escape `\` and `|` so that no two distinct
//! field lists render to the same string. Any change to a bound field after
//! signing invalidates the signature.

use souk_types::{ScopePermissions, TrustLevel};

use crate::types::{HandshakeRequest, HandshakeResponse, NearbyUsersQuery, PostingSearchQuery};

const SEPARATOR: &str = "|";

fn escape(field: &str) -> String {
    field.replace('\\', "\\\\").replace('|', "\\|")
}

fn join(fields: &[&str]) -> String {
    fields
        .iter()
        .map(|f| escape(f))
        .collect::<Vec<_>>()
        .join(SEPARATOR)
}

/// `HANDSHAKE_REQUEST|serverId|serverUrl|serverName|publicKey|protocolVersion|scopes|timestamp`
pub fn handshake_request(request: &HandshakeRequest) -> String {
    join(&[
        "HANDSHAKE_REQUEST",
        &request.server_id,
        &request.server_url,
        &request.server_name,
        &request.public_key,
        &request.protocol_version,
        &request.proposed_scopes.canonical(),
        &request.timestamp.to_string(),
    ])
}

/// `HANDSHAKE_RESPONSE|serverId|serverUrl|serverName|publicKey|protocolVersion|accepted|reason|scopes|agreementHash|timestamp`
pub fn handshake_response(response: &HandshakeResponse) -> String {
    join(&[
        "HANDSHAKE_RESPONSE",
        &response.server_id,
        &response.server_url,
        &response.server_name,
        &response.public_key,
        &response.protocol_version,
        if response.accepted { "1" } else { "0" },
        response.reason.as_deref().unwrap_or(""),
        &response.accepted_scopes.canonical(),
        response.agreement_hash.as_deref().unwrap_or(""),
        &response.timestamp.to_string(),
    ])
}

/// `serverId|latitude|longitude|radiusKm|limit|timestamp`
pub fn nearby_users(server_id: &str, query: &NearbyUsersQuery, timestamp_ms: i64) -> String {
    join(&[
        server_id,
        &query.latitude.to_string(),
        &query.longitude.to_string(),
        &query.radius_km.to_string(),
        &query.limit.to_string(),
        &timestamp_ms.to_string(),
    ])
}

/// `serverId|query|category|limit|timestamp`
pub fn posting_search(server_id: &str, search: &PostingSearchQuery, timestamp_ms: i64) -> String {
    join(&[
        server_id,
        &search.query,
        search.category.as_deref().unwrap_or(""),
        &search.limit.to_string(),
        &timestamp_ms.to_string(),
    ])
}

/// `serverId|recipientUserId|senderUserId|timestamp|encryptedPayload`
pub fn message_relay(
    server_id: &str,
    recipient_user_id: &str,
    sender_user_id: &str,
    timestamp_ms: i64,
    encrypted_payload: &str,
) -> String {
    join(&[
        server_id,
        recipient_user_id,
        sender_user_id,
        &timestamp_ms.to_string(),
        encrypted_payload,
    ])
}

/// `TRUST_CHANGE|localId|remoteId|level|timestamp`
///
/// `local_id` is the server applying the change to its record of
/// `remote_id`; `remote_id` is the server whose key signs the consent.
pub fn trust_change(local_id: &str, remote_id: &str, level: TrustLevel, timestamp_ms: i64) -> String {
    join(&[
        "TRUST_CHANGE",
        local_id,
        remote_id,
        level.as_str(),
        &timestamp_ms.to_string(),
    ])
}

/// `SCOPE_CHANGE|localId|remoteId|scopes|timestamp`
pub fn scope_change(
    local_id: &str,
    remote_id: &str,
    scopes: &ScopePermissions,
    timestamp_ms: i64,
) -> String {
    join(&[
        "SCOPE_CHANGE",
        local_id,
        remote_id,
        &scopes.canonical(),
        &timestamp_ms.to_string(),
    ])
}
