//! Relay of end-to-end encrypted chat messages between servers.
//!
//! Messages are addressed `userId@serverId`. The sending server checks its
//! own record of the recipient's server, signs the relay string and posts
//! the envelope; the receiving server verifies the signature and its own
//! grant of the chat scope before handing the message to its inbox.
//! Neither server can read the payload.

use rusqlite::Connection;
use serde::Deserialize;
use souk_audit::NewAuditEntry;
use souk_types::{AuditEventType, AuditOutcome, Scope};
use std::str::FromStr;
use std::time::Instant;
use thiserror::Error;

use crate::canonical;
use crate::directory::{ChatInbox, InboundChatMessage};
use crate::identity::SigningIdentity;
use crate::query::check_outbound_target;
use crate::trust::update_server_last_sync;
use crate::types::{RelayEnvelope, RelayReceipt, SignedHeaders};
use crate::verifier::{verify_signed_call, CallAudit, Rejection, RejectionReason, SignedCall, Verdict};
use crate::FederationError;

pub const RELAY_PATH: &str = "/federation/v1/messages/relay";

/// A user on a federated server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FederatedAddress {
    pub user_id: String,
    pub server_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed federated address: {0:?}")]
pub struct AddressError(String);

impl FromStr for FederatedAddress {
    type Err = AddressError;

    /// Parses `userId@serverId`. Exactly one `@`, both sides non-empty, no
    /// whitespace.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || AddressError(s.to_string());
        let (user_id, server_id) = s.split_once('@').ok_or_else(malformed)?;
        if user_id.is_empty()
            || server_id.is_empty()
            || server_id.contains('@')
            || s.chars().any(char::is_whitespace)
        {
            return Err(malformed());
        }
        Ok(Self {
            user_id: user_id.to_string(),
            server_id: server_id.to_string(),
        })
    }
}

impl std::fmt::Display for FederatedAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.user_id, self.server_id)
    }
}

/// A local user's message to a federated user.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    /// `userId@serverId`.
    pub recipient: String,
    pub sender_user_id: String,
    pub sender_name: String,
    pub encrypted_payload: String,
    pub sender_public_key: String,
}

/// A relay that passed local checks and is signed, ready to post.
#[derive(Debug, Clone)]
pub struct PreparedRelay {
    pub server_id: String,
    /// Full relay endpoint URL on the recipient's server.
    pub url: String,
    pub headers: SignedHeaders,
    pub envelope: RelayEnvelope,
}

fn relay_entry(outcome: AuditOutcome) -> NewAuditEntry {
    NewAuditEntry::new(AuditEventType::MessageRelay, "message_relay", outcome)
}

/// Validates, resolves and signs an outbound message.
///
/// Every abort is audited with its own reason and comes back as a
/// rejection; the caller reports it as "not sent".
pub fn prepare_relay(
    conn: &Connection,
    identity: &SigningIdentity,
    message: &OutboundMessage,
    now_ms: i64,
) -> Result<Verdict<PreparedRelay>, FederationError> {
    let abort = |server_id: Option<&str>,
                 rejection: Rejection|
     -> Result<Verdict<PreparedRelay>, FederationError> {
        tracing::warn!(
            recipient = %message.recipient,
            reason = %rejection.reason,
            "message relay aborted: {}",
            rejection.detail
        );
        let mut entry = relay_entry(AuditOutcome::Failure)
            .detail("recipient", &message.recipient)
            .detail("reason", rejection.reason)
            .error(rejection.detail.clone());
        if let Some(server_id) = server_id {
            entry = entry.server(server_id);
        }
        souk_audit::record(conn, entry);
        Ok(Verdict::Rejected(rejection))
    };

    let address = match message.recipient.parse::<FederatedAddress>() {
        Ok(address) => address,
        Err(e) => {
            return abort(
                None,
                Rejection::new(RejectionReason::MalformedAddress, e.to_string()),
            )
        }
    };
    if message.sender_user_id.trim().is_empty() || message.encrypted_payload.is_empty() {
        return abort(
            Some(&address.server_id),
            Rejection::new(
                RejectionReason::MalformedRequest,
                "sender and payload are required",
            ),
        );
    }

    let server = match check_outbound_target(conn, &address.server_id, Scope::Chat)? {
        Ok(server) => server,
        Err(rejection) => return abort(Some(&address.server_id), rejection),
    };

    let local_id = identity.server_id();
    let envelope = RelayEnvelope {
        message_id: uuid::Uuid::new_v4().to_string(),
        recipient_user_id: address.user_id.clone(),
        sender_user_id: message.sender_user_id.clone(),
        sender_name: message.sender_name.clone(),
        encrypted_payload: message.encrypted_payload.clone(),
        sender_public_key: message.sender_public_key.clone(),
    };
    let signature = identity.sign(&canonical::message_relay(
        local_id,
        &envelope.recipient_user_id,
        &envelope.sender_user_id,
        now_ms,
        &envelope.encrypted_payload,
    ));

    Ok(Verdict::Accepted(PreparedRelay {
        server_id: server.server_id.clone(),
        url: format!("{}{}", server.server_url.trim_end_matches('/'), RELAY_PATH),
        headers: SignedHeaders {
            server_id: local_id.to_string(),
            timestamp: now_ms,
            signature,
        },
        envelope,
    }))
}

/// Records how a posted relay ended and returns the message id if the
/// recipient's server delivered it.
pub fn complete_relay(
    conn: &Connection,
    prepared: &PreparedRelay,
    outcome: Result<RelayReceipt, FederationError>,
    started: Instant,
) -> Option<String> {
    let entry = |outcome: AuditOutcome| {
        relay_entry(outcome)
            .server(prepared.server_id.as_str())
            .detail("messageId", &prepared.envelope.message_id)
            .detail("recipientUserId", &prepared.envelope.recipient_user_id)
            .duration(started.elapsed())
    };

    match outcome {
        Ok(receipt) if receipt.delivered => {
            if let Err(e) = update_server_last_sync(conn, &prepared.server_id) {
                tracing::warn!(server_id = %prepared.server_id, "failed to update last sync: {}", e);
            }
            tracing::info!(
                server_id = %prepared.server_id,
                message_id = %prepared.envelope.message_id,
                "relayed federated message"
            );
            souk_audit::record(conn, entry(AuditOutcome::Success));
            Some(prepared.envelope.message_id.clone())
        }
        Ok(_) => {
            tracing::warn!(server_id = %prepared.server_id, "recipient server did not deliver message");
            souk_audit::record(
                conn,
                entry(AuditOutcome::Failure).error("recipient server did not deliver message"),
            );
            None
        }
        Err(e) => {
            tracing::warn!(server_id = %prepared.server_id, "message relay failed: {}", e);
            souk_audit::record(conn, entry(AuditOutcome::Failure).error(e.to_string()));
            None
        }
    }
}

/// Verifies and delivers a message relayed in from a federated server.
pub fn receive_relay(
    conn: &Connection,
    inbox: &dyn ChatInbox,
    headers: &SignedHeaders,
    envelope: &RelayEnvelope,
    remote_ip: Option<&str>,
    now_ms: i64,
) -> Result<Verdict<RelayReceipt>, FederationError> {
    let started = Instant::now();
    let audit = CallAudit {
        event_type: AuditEventType::MessageReceive,
        action: "message_receive",
        remote_ip,
    };
    let call = SignedCall {
        server_id: &headers.server_id,
        timestamp_ms: headers.timestamp,
        signature: &headers.signature,
        canonical: canonical::message_relay(
            &headers.server_id,
            &envelope.recipient_user_id,
            &envelope.sender_user_id,
            headers.timestamp,
            &envelope.encrypted_payload,
        ),
        required_scope: Scope::Chat,
    };
    let sender = match verify_signed_call(conn, &call, &audit, now_ms)? {
        Verdict::Accepted(server) => server,
        Verdict::Rejected(rejection) => return Ok(Verdict::Rejected(rejection)),
    };

    let delivered = inbox.deliver(InboundChatMessage {
        message_id: envelope.message_id.clone(),
        recipient_user_id: envelope.recipient_user_id.clone(),
        sender_address: format!("{}@{}", envelope.sender_user_id, sender.server_id),
        sender_name: envelope.sender_name.clone(),
        encrypted_payload: envelope.encrypted_payload.clone(),
        sender_public_key: envelope.sender_public_key.clone(),
    });

    let outcome = if delivered {
        AuditOutcome::Success
    } else {
        AuditOutcome::Failure
    };
    let mut entry = NewAuditEntry::new(audit.event_type, audit.action, outcome)
        .server(sender.server_id.as_str())
        .detail("messageId", &envelope.message_id)
        .detail("recipientUserId", &envelope.recipient_user_id)
        .remote_ip(remote_ip)
        .duration(started.elapsed());
    if !delivered {
        entry = entry.error("recipient unavailable");
    }
    souk_audit::record(conn, entry);

    Ok(Verdict::Accepted(RelayReceipt {
        delivered,
        message_id: delivered.then(|| envelope.message_id.clone()),
    }))
}
