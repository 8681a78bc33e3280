//! Audit entry records.

use serde::Serialize;
use serde_json::{Map, Value};
use souk_types::{AuditEventType, AuditOutcome};
use std::time::Duration;

/// An audit entry about to be written.
///
/// Built with chained setters so call sites only mention what they know.
#[derive(Debug, Clone)]
pub struct NewAuditEntry {
    pub event_type: AuditEventType,
    pub server_id: Option<String>,
    pub action: String,
    pub outcome: AuditOutcome,
    pub details: Map<String, Value>,
    pub error_message: Option<String>,
    pub remote_ip: Option<String>,
    pub duration_ms: Option<i64>,
}

impl NewAuditEntry {
    pub fn new(event_type: AuditEventType, action: &str, outcome: AuditOutcome) -> Self {
        Self {
            event_type,
            server_id: None,
            action: action.to_string(),
            outcome,
            details: Map::new(),
            error_message: None,
            remote_ip: None,
            duration_ms: None,
        }
    }

    /// Sets the remote server the event concerns.
    pub fn server(mut self, server_id: impl Into<String>) -> Self {
        self.server_id = Some(server_id.into());
        self
    }

    /// Adds one structured detail. Values that fail to serialize are stored
    /// as `null`.
    pub fn detail(mut self, key: &str, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.details.insert(key.to_string(), value);
        self
    }

    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn remote_ip(mut self, ip: Option<&str>) -> Self {
        self.remote_ip = ip.map(str::to_string);
        self
    }

    pub fn duration(mut self, elapsed: Duration) -> Self {
        self.duration_ms = Some(i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX));
        self
    }
}

/// A persisted audit log entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogEntry {
    pub id: i64,
    pub event_type: AuditEventType,
    pub server_id: Option<String>,
    pub action: String,
    pub outcome: AuditOutcome,
    pub details: Value,
    pub error_message: Option<String>,
    pub remote_ip: Option<String>,
    pub duration_ms: Option<i64>,
    pub created_at: String,
}
