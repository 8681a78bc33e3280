//! Persistence operations for the federation audit log.
//!
//! All writes go through [`log_federation_event`], which serialises the
//! details map and inserts a single row. Reads go through
//! [`get_audit_logs`], newest first.

use rusqlite::{params, Connection};
use souk_types::{AuditEventType, AuditOutcome};

use crate::entry::{AuditLogEntry, NewAuditEntry};
use crate::error::AuditError;

/// Upper bound on the number of entries a single query returns.
pub const MAX_AUDIT_LIMIT: i64 = 1_000;

const DEFAULT_AUDIT_LIMIT: i64 = 100;

/// Appends one entry to the audit log.
///
/// # Errors
///
/// Returns `AuditError::Database` on SQL failure or
/// `AuditError::Serialization` if the details cannot be serialised.
pub fn log_federation_event(
    conn: &Connection,
    entry: &NewAuditEntry,
) -> Result<AuditLogEntry, AuditError> {
    let details_json = serde_json::to_string(&entry.details)?;

    let (id, created_at) = conn.query_row(
        "INSERT INTO federation_audit_log
            (event_type, server_id, action, outcome, details_json,
             error_message, remote_ip, duration_ms, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, datetime('now'))
         RETURNING id, created_at",
        params![
            entry.event_type.as_str(),
            entry.server_id,
            entry.action,
            entry.outcome.as_str(),
            details_json,
            entry.error_message,
            entry.remote_ip,
            entry.duration_ms,
        ],
        |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
    )?;

    Ok(AuditLogEntry {
        id,
        event_type: entry.event_type,
        server_id: entry.server_id.clone(),
        action: entry.action.clone(),
        outcome: entry.outcome,
        details: serde_json::Value::Object(entry.details.clone()),
        error_message: entry.error_message.clone(),
        remote_ip: entry.remote_ip.clone(),
        duration_ms: entry.duration_ms,
        created_at,
    })
}

/// Appends an entry without letting a write failure reach the caller.
///
/// The audited operation has already produced its result; a failed audit
/// write is reported through `tracing` instead.
pub fn record(conn: &Connection, entry: NewAuditEntry) {
    if let Err(e) = log_federation_event(conn, &entry) {
        tracing::warn!(
            event_type = entry.event_type.as_str(),
            action = %entry.action,
            outcome = entry.outcome.as_str(),
            server_id = entry.server_id.as_deref().unwrap_or("-"),
            "failed to write federation audit entry: {}",
            e
        );
    }
}

/// Filter criteria for reading the audit log.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    /// Only entries about this remote server.
    pub server_id: Option<String>,
    /// Only entries of this event type.
    pub event_type: Option<AuditEventType>,
    /// Maximum number of entries (default 100, capped at [`MAX_AUDIT_LIMIT`]).
    pub limit: Option<i64>,
}

/// Reads audit entries, newest first.
///
/// # Errors
///
/// Returns `AuditError::Database` on SQL failure, or
/// `AuditError::Serialization` if a stored details column is corrupt.
pub fn get_audit_logs(
    conn: &Connection,
    filter: &AuditFilter,
) -> Result<Vec<AuditLogEntry>, AuditError> {
    // WHERE clauses and bind parameters are collected separately so nothing
    // from the filter is interpolated into the SQL text.
    let mut clauses: Vec<String> = Vec::new();
    let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

    if let Some(ref server_id) = filter.server_id {
        param_values.push(Box::new(server_id.clone()));
        clauses.push(format!("server_id = ?{}", param_values.len()));
    }

    if let Some(event_type) = filter.event_type {
        param_values.push(Box::new(event_type.as_str()));
        clauses.push(format!("event_type = ?{}", param_values.len()));
    }

    let where_clause = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };

    let limit = filter
        .limit
        .unwrap_or(DEFAULT_AUDIT_LIMIT)
        .clamp(1, MAX_AUDIT_LIMIT);
    param_values.push(Box::new(limit));

    let sql = format!(
        "SELECT id, event_type, server_id, action, outcome, details_json,
                error_message, remote_ip, duration_ms, created_at
         FROM federation_audit_log
         {where_clause}
         ORDER BY id DESC
         LIMIT ?{}",
        param_values.len()
    );

    let params_refs: Vec<&dyn rusqlite::types::ToSql> =
        param_values.iter().map(|p| &**p).collect();

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_refs.as_slice(), |row| {
        let event_type: String = row.get(1)?;
        let outcome: String = row.get(4)?;
        let event_type = event_type.parse::<AuditEventType>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
        })?;
        let outcome = outcome.parse::<AuditOutcome>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
        })?;
        Ok((
            row.get::<_, i64>(0)?,
            event_type,
            row.get::<_, Option<String>>(2)?,
            row.get::<_, String>(3)?,
            outcome,
            row.get::<_, String>(5)?,
            row.get::<_, Option<String>>(6)?,
            row.get::<_, Option<String>>(7)?,
            row.get::<_, Option<i64>>(8)?,
            row.get::<_, String>(9)?,
        ))
    })?;

    let mut entries = Vec::new();
    for row in rows {
        let (
            id,
            event_type,
            server_id,
            action,
            outcome,
            details_json,
            error_message,
            remote_ip,
            duration_ms,
            created_at,
        ) = row?;
        entries.push(AuditLogEntry {
            id,
            event_type,
            server_id,
            action,
            outcome,
            details: serde_json::from_str(&details_json)?,
            error_message,
            remote_ip,
            duration_ms,
            created_at,
        });
    }

    Ok(entries)
}
