//! Outbound federation calls.
//!
//! Every outbound operation follows the same shape: a blocking step that
//! checks policy and signs the request, the network leg on the shared
//! `reqwest` client, and a blocking step that records the outcome.

use reqwest::Response;
use serde::de::DeserializeOwned;
use souk_federation::handshake::{
    build_handshake_request, check_handshake_target, complete_initiated_handshake,
    record_initiate_failure,
};
use souk_federation::query::{
    prepare_nearby_users, prepare_posting_search, record_query_outcome, PreparedQuery,
};
use souk_federation::relay::{complete_relay, prepare_relay, PreparedRelay};
use souk_federation::types::{
    HandshakeRequest, HandshakeResponse, NearbyUsersQuery, NearbyUsersResponse,
    PostingSearchQuery, PostingSearchResponse, RelayReceipt, SignedNearbyUsersQuery,
    SignedPostingSearchQuery, SERVER_ID_HEADER, SIGNATURE_HEADER, TIMESTAMP_HEADER,
};
use souk_audit::NewAuditEntry;
use souk_federation::{
    FederationError, OutboundMessage, SigningIdentity, Verdict, HANDSHAKE_PATH,
};
use souk_types::{AuditEventType, AuditOutcome, ScopePermissions};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::{run_blocking, AppState};

/// HTTP client for calls to federated servers.
#[derive(Debug, Clone)]
pub struct FederationClient {
    http: reqwest::Client,
}

fn network_error(err: reqwest::Error) -> FederationError {
    if err.is_timeout() {
        FederationError::Network(format!("request timed out: {err}"))
    } else {
        FederationError::Network(err.to_string())
    }
}

async fn read_json<T: DeserializeOwned>(resp: Response) -> Result<T, FederationError> {
    let status = resp.status();
    if !status.is_success() {
        return Err(FederationError::RemoteServer(format!(
            "remote server returned {status}"
        )));
    }
    resp.json::<T>()
        .await
        .map_err(|e| FederationError::RemoteServer(format!("invalid response body: {e}")))
}

impl FederationClient {
    /// Builds a client whose requests give up after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http })
    }

    pub async fn handshake(
        &self,
        target_url: &str,
        request: &HandshakeRequest,
    ) -> Result<HandshakeResponse, FederationError> {
        let resp = self
            .http
            .post(format!("{target_url}{HANDSHAKE_PATH}"))
            .json(request)
            .send()
            .await
            .map_err(network_error)?;
        read_json(resp).await
    }

    pub async fn relay(&self, prepared: &PreparedRelay) -> Result<RelayReceipt, FederationError> {
        let resp = self
            .http
            .post(&prepared.url)
            .header(SERVER_ID_HEADER, &prepared.headers.server_id)
            .header(TIMESTAMP_HEADER, prepared.headers.timestamp.to_string())
            .header(SIGNATURE_HEADER, &prepared.headers.signature)
            .json(&prepared.envelope)
            .send()
            .await
            .map_err(network_error)?;
        read_json(resp).await
    }

    pub async fn nearby_users(
        &self,
        prepared: &PreparedQuery<SignedNearbyUsersQuery>,
    ) -> Result<NearbyUsersResponse, FederationError> {
        let resp = self
            .http
            .get(&prepared.url)
            .query(&prepared.query)
            .send()
            .await
            .map_err(network_error)?;
        let body: NearbyUsersResponse = read_json(resp).await?;
        expect_responder(&prepared.server.server_id, &body.server_id)?;
        Ok(body)
    }

    pub async fn search_postings(
        &self,
        prepared: &PreparedQuery<SignedPostingSearchQuery>,
    ) -> Result<PostingSearchResponse, FederationError> {
        let resp = self
            .http
            .get(&prepared.url)
            .query(&prepared.query)
            .send()
            .await
            .map_err(network_error)?;
        let body: PostingSearchResponse = read_json(resp).await?;
        expect_responder(&prepared.server.server_id, &body.server_id)?;
        Ok(body)
    }
}

fn expect_responder(expected: &str, actual: &str) -> Result<(), FederationError> {
    if expected == actual {
        Ok(())
    } else {
        Err(FederationError::RemoteServer(format!(
            "response claims server {actual}, expected {expected}"
        )))
    }
}

fn normalize_target_url(raw: &str) -> Result<String, FederationError> {
    let url = raw.trim().trim_end_matches('/');
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(FederationError::InvalidInput(format!(
            "target url must be http(s): {raw:?}"
        )));
    }
    Ok(url.to_string())
}

/// Returns the signing identity. An uninitialized server records the
/// refused call in the audit log before returning the error.
async fn require_signer(
    state: &AppState,
    action: &'static str,
    server_id: Option<String>,
) -> Result<Arc<SigningIdentity>, FederationError> {
    let err = match state.identity.require() {
        Ok(signer) => return Ok(signer),
        Err(err) => err,
    };
    tracing::warn!(action, "outbound federation call refused: {}", err);
    let err = run_blocking(&state.pool, move |conn| {
        let mut entry = NewAuditEntry::new(AuditEventType::Error, action, AuditOutcome::Failure)
            .error(err.to_string());
        if let Some(server_id) = server_id {
            entry = entry.server(server_id);
        }
        souk_audit::record(conn, entry);
        Ok(err)
    })
    .await?;
    Err(err)
}

/// Runs the initiator side of the handshake against `target_url`.
///
/// Returns the remote's signed response, accepted or declined. A target
/// this server has blocked is refused before any network call.
pub async fn initiate_handshake(
    state: &AppState,
    target_url: &str,
    proposed_scopes: ScopePermissions,
) -> Result<Verdict<HandshakeResponse>, FederationError> {
    let signer = require_signer(state, "handshake_initiate", None).await?;
    let target = normalize_target_url(target_url)?;

    let check_target = target.clone();
    if let Verdict::Rejected(rejection) = run_blocking(&state.pool, move |conn| {
        check_handshake_target(conn, &check_target)
    })
    .await?
    {
        return Ok(Verdict::Rejected(rejection));
    }

    let request = build_handshake_request(&signer, proposed_scopes, souk_crypto::now_millis());
    let started = Instant::now();
    tracing::info!(target_url = %target, "initiating federation handshake");

    match state.client.handshake(&target, &request).await {
        Ok(response) => {
            let retention = state.accept_policy.data_retention_days;
            let completed = run_blocking(&state.pool, move |conn| {
                complete_initiated_handshake(conn, &signer, &request, &response, retention, started)
            })
            .await?;
            Ok(Verdict::Accepted(completed))
        }
        Err(err) => {
            let err = run_blocking(&state.pool, move |conn| {
                record_initiate_failure(conn, &target, &err, started);
                Ok(err)
            })
            .await?;
            Err(err)
        }
    }
}

/// Relays an end-to-end encrypted chat message to a user on a federated
/// server.
///
/// Returns the message id on delivery and `None` on any failure; the
/// reason is in the audit log.
pub async fn send_message_to_federated_user(
    state: &AppState,
    message: OutboundMessage,
) -> Result<Option<String>, FederationError> {
    let signer = require_signer(state, "message_relay", None).await?;

    let prepared = match run_blocking(&state.pool, move |conn| {
        prepare_relay(conn, &signer, &message, souk_crypto::now_millis())
    })
    .await?
    {
        Verdict::Accepted(prepared) => prepared,
        Verdict::Rejected(_) => return Ok(None),
    };

    let started = Instant::now();
    let outcome = state.client.relay(&prepared).await;

    run_blocking(&state.pool, move |conn| {
        Ok(complete_relay(conn, &prepared, outcome, started))
    })
    .await
}

/// Signs and sends a nearby-user search to a federated server.
pub async fn query_nearby_users(
    state: &AppState,
    server_id: String,
    query: NearbyUsersQuery,
) -> Result<Verdict<NearbyUsersResponse>, FederationError> {
    let signer = require_signer(state, "user_search", Some(server_id.clone())).await?;

    let prepared = match run_blocking(&state.pool, move |conn| {
        prepare_nearby_users(conn, &signer, &server_id, query, souk_crypto::now_millis())
    })
    .await?
    {
        Verdict::Accepted(prepared) => prepared,
        Verdict::Rejected(rejection) => return Ok(Verdict::Rejected(rejection)),
    };

    let started = Instant::now();
    let outcome = state.client.nearby_users(&prepared).await;
    finish_query(state, AuditEventType::UserSearch, prepared.server.server_id, outcome, started, |r| {
        r.users.len()
    })
    .await
}

/// Signs and sends a posting search to a federated server.
pub async fn search_federated_postings(
    state: &AppState,
    server_id: String,
    search: PostingSearchQuery,
) -> Result<Verdict<PostingSearchResponse>, FederationError> {
    let signer = require_signer(state, "posting_search", Some(server_id.clone())).await?;

    let prepared = match run_blocking(&state.pool, move |conn| {
        prepare_posting_search(conn, &signer, &server_id, search, souk_crypto::now_millis())
    })
    .await?
    {
        Verdict::Accepted(prepared) => prepared,
        Verdict::Rejected(rejection) => return Ok(Verdict::Rejected(rejection)),
    };

    let started = Instant::now();
    let outcome = state.client.search_postings(&prepared).await;
    finish_query(
        state,
        AuditEventType::PostingSearch,
        prepared.server.server_id,
        outcome,
        started,
        |r| r.postings.len(),
    )
    .await
}

async fn finish_query<R: Send + 'static>(
    state: &AppState,
    event_type: AuditEventType,
    server_id: String,
    outcome: Result<R, FederationError>,
    started: Instant,
    count: fn(&R) -> usize,
) -> Result<Verdict<R>, FederationError> {
    let outcome = run_blocking(&state.pool, move |conn| {
        let counted = outcome.as_ref().map(count);
        record_query_outcome(conn, event_type, &server_id, counted, started);
        Ok(outcome)
    })
    .await?;
    outcome.map(Verdict::Accepted)
}
