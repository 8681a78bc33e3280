//! Federation audit log for the Souk platform.
//!
//! Every federation operation (handshakes, trust and scope changes, data
//! queries, message relay, key management) appends one entry to the
//! `federation_audit_log` table, whatever the outcome. Entries are never
//! updated or deleted here; retention is an external housekeeping concern.
//!
//! Writes go straight to the local SQLite database, never through another
//! service, so an unreachable peer can never cause an event to be dropped.
//! Callers on a primary code path use [`record`], which logs a warning when
//! the write fails instead of failing the operation it describes.
//!
//! ```rust,ignore
//! use souk_audit::{record, NewAuditEntry};
//! use souk_types::{AuditEventType, AuditOutcome};
//!
//! record(
//!     &conn,
//!     NewAuditEntry::new(AuditEventType::HandshakeAccept, "handshake_accept", AuditOutcome::Success)
//!         .server("b1")
//!         .detail("acceptedScopes", scopes.canonical())
//!         .duration(started.elapsed()),
//! );
//! ```

mod entry;
mod error;
mod store;

pub use entry::{AuditLogEntry, NewAuditEntry};
pub use error::AuditError;
pub use store::{get_audit_logs, log_federation_event, record, AuditFilter, MAX_AUDIT_LIMIT};

#[cfg(test)]
mod tests;
