//! Unit tests for the federation audit log.

use rusqlite::Connection;
use souk_types::{AuditEventType, AuditOutcome};
use std::time::Duration;

use crate::entry::NewAuditEntry;
use crate::store::{get_audit_logs, log_federation_event, record, AuditFilter, MAX_AUDIT_LIMIT};

/// Creates an in-memory SQLite database with migrations applied.
fn test_db() -> Connection {
    let conn = Connection::open_in_memory().expect("should open in-memory db");
    souk_db::run_migrations(&conn).expect("migrations should succeed");
    conn
}

// ── log_federation_event ─────────────────────────────────────────────

#[test]
fn log_event_inserts_row_with_all_fields() {
    let conn = test_db();

    let entry = NewAuditEntry::new(
        AuditEventType::HandshakeAccept,
        "handshake_accept",
        AuditOutcome::Success,
    )
    .server("b1")
    .detail("acceptedScopes", "users=1,postings=1,chat=0,geolocation=0,attributes=0")
    .remote_ip(Some("10.0.0.7"))
    .duration(Duration::from_millis(42));

    let stored = log_federation_event(&conn, &entry).expect("log should succeed");
    assert!(stored.id > 0);

    let (event_type, server_id, outcome, details_json, remote_ip, duration_ms): (
        String,
        String,
        String,
        String,
        String,
        i64,
    ) = conn
        .query_row(
            "SELECT event_type, server_id, outcome, details_json, remote_ip, duration_ms
             FROM federation_audit_log WHERE id = ?1",
            [stored.id],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            },
        )
        .expect("should query inserted row");

    assert_eq!(event_type, "HANDSHAKE_ACCEPT");
    assert_eq!(server_id, "b1");
    assert_eq!(outcome, "SUCCESS");
    assert_eq!(remote_ip, "10.0.0.7");
    assert_eq!(duration_ms, 42);

    let details: serde_json::Value = serde_json::from_str(&details_json).unwrap();
    assert_eq!(
        details["acceptedScopes"],
        "users=1,postings=1,chat=0,geolocation=0,attributes=0"
    );
}

#[test]
fn optional_fields_stay_null() {
    let conn = test_db();

    let stored = log_federation_event(
        &conn,
        &NewAuditEntry::new(AuditEventType::Error, "sample", AuditOutcome::Failure)
            .error("local identity not initialized"),
    )
    .expect("log should succeed");

    assert_eq!(stored.server_id, None);
    assert_eq!(stored.remote_ip, None);
    assert_eq!(stored.duration_ms, None);
    assert_eq!(
        stored.error_message.as_deref(),
        Some("local identity not initialized")
    );
    assert_eq!(stored.details, serde_json::json!({}));
}

#[test]
fn record_swallows_write_failures() {
    // No migrations: the table does not exist, so the write must fail
    // without panicking or propagating.
    let conn = Connection::open_in_memory().unwrap();
    record(
        &conn,
        NewAuditEntry::new(AuditEventType::MessageRelay, "relay", AuditOutcome::Failure),
    );
}

// ── get_audit_logs ───────────────────────────────────────────────────

fn seed(conn: &Connection) {
    let rows = [
        (AuditEventType::HandshakeInitiate, "b1", AuditOutcome::Success),
        (AuditEventType::MessageRelay, "b1", AuditOutcome::Failure),
        (AuditEventType::HandshakeAccept, "c1", AuditOutcome::Success),
        (AuditEventType::MessageRelay, "c1", AuditOutcome::Success),
        (AuditEventType::TrustLevelChange, "b1", AuditOutcome::Rejected),
    ];
    for (event_type, server, outcome) in rows {
        log_federation_event(
            conn,
            &NewAuditEntry::new(event_type, "seed", outcome).server(server),
        )
        .unwrap();
    }
}

#[test]
fn logs_are_returned_newest_first() {
    let conn = test_db();
    seed(&conn);

    let entries = get_audit_logs(&conn, &AuditFilter::default()).unwrap();
    assert_eq!(entries.len(), 5);
    assert!(entries.windows(2).all(|w| w[0].id > w[1].id));
    assert_eq!(entries[0].event_type, AuditEventType::TrustLevelChange);
    assert_eq!(entries[0].outcome, AuditOutcome::Rejected);
}

#[test]
fn filters_combine() {
    let conn = test_db();
    seed(&conn);

    let by_server = get_audit_logs(
        &conn,
        &AuditFilter {
            server_id: Some("b1".to_string()),
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(by_server.len(), 3);
    assert!(by_server
        .iter()
        .all(|e| e.server_id.as_deref() == Some("b1")));

    let by_both = get_audit_logs(
        &conn,
        &AuditFilter {
            server_id: Some("c1".to_string()),
            event_type: Some(AuditEventType::MessageRelay),
            limit: None,
        },
    )
    .unwrap();
    assert_eq!(by_both.len(), 1);
    assert_eq!(by_both[0].outcome, AuditOutcome::Success);
}

#[test]
fn limit_is_applied_and_clamped() {
    let conn = test_db();
    seed(&conn);

    let two = get_audit_logs(
        &conn,
        &AuditFilter {
            limit: Some(2),
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(two.len(), 2);

    let zero = get_audit_logs(
        &conn,
        &AuditFilter {
            limit: Some(0),
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(zero.len(), 1, "limit is clamped to at least one entry");

    let huge = get_audit_logs(
        &conn,
        &AuditFilter {
            limit: Some(MAX_AUDIT_LIMIT * 10),
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(huge.len(), 5);
}
