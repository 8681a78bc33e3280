//! Wire messages exchanged between federated servers.
//!
//! All payloads are camelCase JSON. Signatures are standard base64 and are
//! always computed over the canonical strings in [`crate::canonical`], never
//! over the JSON encoding.

use serde::{Deserialize, Serialize};
use souk_types::ScopePermissions;

use crate::canonical;

/// Header carrying the calling server's id on signed POST requests.
pub const SERVER_ID_HEADER: &str = "x-souk-server-id";
/// Header carrying the Unix millisecond timestamp bound into the signature.
pub const TIMESTAMP_HEADER: &str = "x-souk-timestamp";
/// Header carrying the base64 signature.
pub const SIGNATURE_HEADER: &str = "x-souk-signature";
/// Header carrying the timestamp of an identity bootstrap call.
pub const BOOTSTRAP_TIMESTAMP_HEADER: &str = "x-souk-bootstrap-timestamp";
/// Header carrying `hex(HMAC-SHA256(secret, timestamp))` for bootstrap.
pub const BOOTSTRAP_SIGNATURE_HEADER: &str = "x-souk-bootstrap-signature";

/// First message of the handshake, sent by the initiator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeRequest {
    pub server_id: String,
    pub server_url: String,
    pub server_name: String,
    /// Sender's SPKI PEM public key.
    pub public_key: String,
    pub protocol_version: String,
    pub proposed_scopes: ScopePermissions,
    /// Unix milliseconds.
    pub timestamp: i64,
    #[serde(default)]
    pub signature: String,
    /// Signature over the same canonical string by the key the sender used
    /// before its last rotation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_key_signature: Option<String>,
}

impl HandshakeRequest {
    /// Checks the signature against the public key embedded in the request.
    pub fn verify_signature(&self) -> bool {
        souk_crypto::verify(
            &canonical::handshake_request(self),
            &self.signature,
            &self.public_key,
        )
    }
}

/// Second message of the handshake, returned by the acceptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeResponse {
    pub server_id: String,
    pub server_url: String,
    pub server_name: String,
    pub public_key: String,
    pub protocol_version: String,
    pub accepted: bool,
    /// Generic refusal reason when `accepted` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub accepted_scopes: ScopePermissions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agreement_hash: Option<String>,
    pub timestamp: i64,
    #[serde(default)]
    pub signature: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_key_signature: Option<String>,
}

impl HandshakeResponse {
    /// Checks the signature against the public key embedded in the response.
    pub fn verify_signature(&self) -> bool {
        souk_crypto::verify(
            &canonical::handshake_response(self),
            &self.signature,
            &self.public_key,
        )
    }
}

/// Signed-request headers for server-to-server POST calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeaders {
    pub server_id: String,
    pub timestamp: i64,
    pub signature: String,
}

/// Body of a relayed chat message. The payload is end-to-end encrypted and
/// opaque to both servers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayEnvelope {
    pub message_id: String,
    pub recipient_user_id: String,
    pub sender_user_id: String,
    pub sender_name: String,
    pub encrypted_payload: String,
    /// Lets the recipient encrypt a reply to the sender.
    pub sender_public_key: String,
}

/// Answer of the relay endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayReceipt {
    pub delivered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

/// Parameters of a nearby-user search.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NearbyUsersQuery {
    pub latitude: f64,
    pub longitude: f64,
    pub radius_km: f64,
    pub limit: u32,
}

/// Nearby-user search as carried in a signed GET query string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedNearbyUsersQuery {
    pub server_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub radius_km: f64,
    pub limit: u32,
    pub timestamp: i64,
    pub signature: String,
}

impl SignedNearbyUsersQuery {
    pub fn query(&self) -> NearbyUsersQuery {
        NearbyUsersQuery {
            latitude: self.latitude,
            longitude: self.longitude,
            radius_km: self.radius_km,
            limit: self.limit,
        }
    }
}

/// Parameters of a posting search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostingSearchQuery {
    #[serde(default)]
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub limit: u32,
}

/// Posting search as carried in a signed GET query string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedPostingSearchQuery {
    pub server_id: String,
    #[serde(default)]
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub limit: u32,
    pub timestamp: i64,
    pub signature: String,
}

impl SignedPostingSearchQuery {
    pub fn search(&self) -> PostingSearchQuery {
        PostingSearchQuery {
            query: self.query.clone(),
            category: self.category.clone(),
            limit: self.limit,
        }
    }
}

/// A geographic point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

/// A local user as exposed to a federated peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FederatedUserSummary {
    pub user_id: String,
    pub display_name: String,
    /// Present only when the peer holds the geolocation scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance_km: Option<f64>,
    /// Present only when the peer holds the attributes scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<serde_json::Value>,
}

/// A local posting as exposed to a federated peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FederatedPostingSummary {
    pub posting_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_cents: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoPoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NearbyUsersResponse {
    pub server_id: String,
    pub users: Vec<FederatedUserSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostingSearchResponse {
    pub server_id: String,
    pub postings: Vec<FederatedPostingSummary>,
}
