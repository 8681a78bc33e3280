//! Audit event classifications.

use serde::{Deserialize, Serialize};

use crate::ParseLabelError;

/// Kind of federation event recorded in the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEventType {
    /// This server sent a handshake to a peer.
    HandshakeInitiate,
    /// This server accepted an inbound handshake.
    HandshakeAccept,
    /// This server refused an inbound handshake.
    HandshakeReject,
    TrustLevelChange,
    ScopeUpdate,
    /// A federated server record was deleted by an operator.
    ServerRemoved,
    UserSearch,
    PostingSearch,
    /// Outbound chat relay to a peer.
    MessageRelay,
    /// Inbound chat relay from a peer.
    MessageReceive,
    /// Identity bootstrap and key rotation.
    KeyRotation,
    Error,
}

impl AuditEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HandshakeInitiate => "HANDSHAKE_INITIATE",
            Self::HandshakeAccept => "HANDSHAKE_ACCEPT",
            Self::HandshakeReject => "HANDSHAKE_REJECT",
            Self::TrustLevelChange => "TRUST_LEVEL_CHANGE",
            Self::ScopeUpdate => "SCOPE_UPDATE",
            Self::ServerRemoved => "SERVER_REMOVED",
            Self::UserSearch => "USER_SEARCH",
            Self::PostingSearch => "POSTING_SEARCH",
            Self::MessageRelay => "MESSAGE_RELAY",
            Self::MessageReceive => "MESSAGE_RECEIVE",
            Self::KeyRotation => "KEY_ROTATION",
            Self::Error => "ERROR",
        }
    }

    const ALL: [AuditEventType; 12] = [
        Self::HandshakeInitiate,
        Self::HandshakeAccept,
        Self::HandshakeReject,
        Self::TrustLevelChange,
        Self::ScopeUpdate,
        Self::ServerRemoved,
        Self::UserSearch,
        Self::PostingSearch,
        Self::MessageRelay,
        Self::MessageReceive,
        Self::KeyRotation,
        Self::Error,
    ];
}

impl std::fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AuditEventType {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|event| event.as_str() == s)
            .ok_or_else(|| ParseLabelError::new("audit event type", s))
    }
}

/// Result of an audited operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditOutcome {
    Success,
    /// The operation broke (bad signature, network error, storage error).
    Failure,
    /// The operation was refused by policy (stale, blocked, scope missing).
    Rejected,
    Partial,
}

impl AuditOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::Rejected => "REJECTED",
            Self::Partial => "PARTIAL",
        }
    }
}

impl std::fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AuditOutcome {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SUCCESS" => Ok(Self::Success),
            "FAILURE" => Ok(Self::Failure),
            "REJECTED" => Ok(Self::Rejected),
            "PARTIAL" => Ok(Self::Partial),
            _ => Err(ParseLabelError::new("audit outcome", s)),
        }
    }
}
