//! Trust store: this server's records of its federated peers.
//!
//! These functions are plain persistence with no policy attached. The
//! co-signature rules for trust and scope changes live in
//! [`crate::admin`]; handshake rules live in [`crate::handshake`].

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use souk_types::{ScopePermissions, TrustLevel};

use crate::FederationError;

/// A remote server as recorded by this server.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FederatedServer {
    pub id: i64,
    pub server_id: String,
    pub server_url: String,
    pub server_name: String,
    /// SPKI PEM received during the handshake.
    pub public_key: String,
    pub trust_level: TrustLevel,
    pub scopes: ScopePermissions,
    pub agreement_hash: Option<String>,
    pub last_sync_at: Option<String>,
    pub protocol_version: String,
    pub active: bool,
    pub data_retention_days: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl FederatedServer {
    /// Whether calls from this server may be served at all.
    pub fn is_usable(&self) -> bool {
        self.active && self.trust_level != TrustLevel::Blocked
    }
}

/// Fields written by a successful handshake.
#[derive(Debug, Clone)]
pub struct ServerRegistration<'a> {
    pub server_id: &'a str,
    pub server_url: &'a str,
    pub server_name: &'a str,
    pub public_key: &'a str,
    pub protocol_version: &'a str,
    pub scopes: ScopePermissions,
    pub agreement_hash: &'a str,
    /// Only applied when the row is created.
    pub data_retention_days: i64,
}

const SERVER_COLUMNS: &str = "id, server_id, server_url, server_name, public_key_pem, trust_level,
     scope_users, scope_postings, scope_chat, scope_geolocation, scope_attributes,
     agreement_hash, last_sync_at, protocol_version, active, data_retention_days,
     created_at, updated_at";

fn row_to_server(row: &rusqlite::Row<'_>) -> rusqlite::Result<FederatedServer> {
    let trust_level: String = row.get(5)?;
    let trust_level = trust_level.parse::<TrustLevel>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(FederatedServer {
        id: row.get(0)?,
        server_id: row.get(1)?,
        server_url: row.get(2)?,
        server_name: row.get(3)?,
        public_key: row.get(4)?,
        trust_level,
        scopes: ScopePermissions {
            users: row.get(6)?,
            postings: row.get(7)?,
            chat: row.get(8)?,
            geolocation: row.get(9)?,
            attributes: row.get(10)?,
        },
        agreement_hash: row.get(11)?,
        last_sync_at: row.get(12)?,
        protocol_version: row.get(13)?,
        active: row.get(14)?,
        data_retention_days: row.get(15)?,
        created_at: row.get(16)?,
        updated_at: row.get(17)?,
    })
}

fn expect_one(changed: usize, server_id: &str) -> Result<(), FederationError> {
    if changed == 0 {
        return Err(FederationError::ServerNotFound(server_id.to_string()));
    }
    Ok(())
}

/// Lists federated servers ordered by name, optionally of one trust level.
pub fn list_federated_servers(
    conn: &Connection,
    trust_level: Option<TrustLevel>,
) -> Result<Vec<FederatedServer>, FederationError> {
    let servers = match trust_level {
        Some(level) => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SERVER_COLUMNS} FROM federated_servers
                 WHERE trust_level = ?1 ORDER BY server_name, id"
            ))?;
            let rows = stmt.query_map([level.as_str()], row_to_server)?;
            rows.collect::<Result<Vec<_>, _>>()?
        }
        None => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SERVER_COLUMNS} FROM federated_servers ORDER BY server_name, id"
            ))?;
            let rows = stmt.query_map([], row_to_server)?;
            rows.collect::<Result<Vec<_>, _>>()?
        }
    };
    Ok(servers)
}

pub fn get_federated_server(
    conn: &Connection,
    server_id: &str,
) -> Result<Option<FederatedServer>, FederationError> {
    let server = conn
        .query_row(
            &format!("SELECT {SERVER_COLUMNS} FROM federated_servers WHERE server_id = ?1"),
            [server_id],
            row_to_server,
        )
        .optional()?;
    Ok(server)
}

pub fn get_federated_server_by_url(
    conn: &Connection,
    server_url: &str,
) -> Result<Option<FederatedServer>, FederationError> {
    let server = conn
        .query_row(
            &format!("SELECT {SERVER_COLUMNS} FROM federated_servers WHERE server_url = ?1"),
            [server_url],
            row_to_server,
        )
        .optional()?;
    Ok(server)
}

/// Inserts or refreshes a peer after a successful handshake.
///
/// Keyed on `server_id`: a repeated handshake updates the one existing row,
/// resets it to `PENDING`, replaces scopes and agreement hash, and keeps
/// `created_at`, the retention setting and the active flag. Callers decide
/// beforehand whether the row may be written at all.
pub fn upsert_federated_server(
    conn: &Connection,
    registration: &ServerRegistration<'_>,
) -> Result<FederatedServer, FederationError> {
    let scopes = &registration.scopes;
    let server = conn.query_row(
        &format!(
            "INSERT INTO federated_servers (
                server_id, server_url, server_name, public_key_pem, trust_level,
                scope_users, scope_postings, scope_chat, scope_geolocation, scope_attributes,
                agreement_hash, protocol_version, active, data_retention_days
             ) VALUES (?1, ?2, ?3, ?4, 'PENDING', ?5, ?6, ?7, ?8, ?9, ?10, ?11, 1, ?12)
             ON CONFLICT(server_id) DO UPDATE SET
                server_url = excluded.server_url,
                server_name = excluded.server_name,
                public_key_pem = excluded.public_key_pem,
                trust_level = 'PENDING',
                scope_users = excluded.scope_users,
                scope_postings = excluded.scope_postings,
                scope_chat = excluded.scope_chat,
                scope_geolocation = excluded.scope_geolocation,
                scope_attributes = excluded.scope_attributes,
                agreement_hash = excluded.agreement_hash,
                protocol_version = excluded.protocol_version,
                updated_at = datetime('now')
             RETURNING {SERVER_COLUMNS}"
        ),
        params![
            registration.server_id,
            registration.server_url,
            registration.server_name,
            registration.public_key,
            scopes.users,
            scopes.postings,
            scopes.chat,
            scopes.geolocation,
            scopes.attributes,
            registration.agreement_hash,
            registration.protocol_version,
            registration.data_retention_days,
        ],
        row_to_server,
    )?;
    Ok(server)
}

pub fn update_server_trust_level(
    conn: &Connection,
    server_id: &str,
    trust_level: TrustLevel,
) -> Result<(), FederationError> {
    let changed = conn.execute(
        "UPDATE federated_servers SET trust_level = ?1, updated_at = datetime('now')
         WHERE server_id = ?2",
        params![trust_level.as_str(), server_id],
    )?;
    expect_one(changed, server_id)
}

pub fn update_server_scopes(
    conn: &Connection,
    server_id: &str,
    scopes: &ScopePermissions,
) -> Result<(), FederationError> {
    let changed = conn.execute(
        "UPDATE federated_servers
         SET scope_users = ?1, scope_postings = ?2, scope_chat = ?3,
             scope_geolocation = ?4, scope_attributes = ?5,
             updated_at = datetime('now')
         WHERE server_id = ?6",
        params![
            scopes.users,
            scopes.postings,
            scopes.chat,
            scopes.geolocation,
            scopes.attributes,
            server_id,
        ],
    )?;
    expect_one(changed, server_id)
}

pub fn delete_federated_server(conn: &Connection, server_id: &str) -> Result<(), FederationError> {
    let changed = conn.execute(
        "DELETE FROM federated_servers WHERE server_id = ?1",
        [server_id],
    )?;
    expect_one(changed, server_id)
}

/// Stamps a successful exchange with the peer.
pub fn update_server_last_sync(conn: &Connection, server_id: &str) -> Result<(), FederationError> {
    let changed = conn.execute(
        "UPDATE federated_servers SET last_sync_at = datetime('now') WHERE server_id = ?1",
        [server_id],
    )?;
    expect_one(changed, server_id)
}

pub fn update_server_retention(
    conn: &Connection,
    server_id: &str,
    days: i64,
) -> Result<(), FederationError> {
    if days < 1 {
        return Err(FederationError::InvalidInput(
            "data retention must be at least one day".to_string(),
        ));
    }
    let changed = conn.execute(
        "UPDATE federated_servers SET data_retention_days = ?1, updated_at = datetime('now')
         WHERE server_id = ?2",
        params![days, server_id],
    )?;
    expect_one(changed, server_id)
}

/// Suspends or resumes a peer without touching its trust level.
pub fn set_server_active(
    conn: &Connection,
    server_id: &str,
    active: bool,
) -> Result<(), FederationError> {
    let changed = conn.execute(
        "UPDATE federated_servers SET active = ?1, updated_at = datetime('now')
         WHERE server_id = ?2",
        params![active, server_id],
    )?;
    expect_one(changed, server_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{register, test_db};

    #[test]
    fn upsert_is_keyed_on_server_id() {
        let conn = test_db();
        let first = register(&conn, "b1", "https://b.example", ScopePermissions::all());
        assert_eq!(first.trust_level, TrustLevel::Pending);
        assert!(first.active);
        assert_eq!(first.data_retention_days, 30);

        update_server_trust_level(&conn, "b1", TrustLevel::Full).unwrap();
        update_server_retention(&conn, "b1", 90).unwrap();

        let scopes = ScopePermissions {
            users: true,
            ..Default::default()
        };
        let second = register(&conn, "b1", "https://b.example", scopes);
        assert_eq!(second.id, first.id);
        assert_eq!(second.created_at, first.created_at);
        assert_eq!(second.trust_level, TrustLevel::Pending);
        assert_eq!(second.scopes, scopes);
        assert_eq!(second.data_retention_days, 90);

        assert_eq!(list_federated_servers(&conn, None).unwrap().len(), 1);
    }

    #[test]
    fn upsert_leaves_a_suspended_row_suspended() {
        let conn = test_db();
        register(&conn, "b1", "https://b.example", ScopePermissions::all());
        set_server_active(&conn, "b1", false).unwrap();

        let again = register(&conn, "b1", "https://b.example", ScopePermissions::all());
        assert!(!again.active);
    }

    #[test]
    fn server_url_is_unique() {
        let conn = test_db();
        register(&conn, "b1", "https://b.example", ScopePermissions::all());
        let registration = ServerRegistration {
            server_id: "c1",
            server_url: "https://b.example",
            server_name: "Impostor",
            public_key: "key",
            protocol_version: "1.0",
            scopes: ScopePermissions::default(),
            agreement_hash: "hash",
            data_retention_days: 30,
        };
        assert!(matches!(
            upsert_federated_server(&conn, &registration),
            Err(FederationError::Database(_))
        ));
    }

    #[test]
    fn lookups_by_id_url_and_level() {
        let conn = test_db();
        register(&conn, "b1", "https://b.example", ScopePermissions::all());
        register(&conn, "c1", "https://c.example", ScopePermissions::all());
        update_server_trust_level(&conn, "c1", TrustLevel::Blocked).unwrap();

        assert_eq!(
            get_federated_server_by_url(&conn, "https://c.example")
                .unwrap()
                .unwrap()
                .server_id,
            "c1"
        );
        assert!(get_federated_server(&conn, "zz").unwrap().is_none());

        let blocked = list_federated_servers(&conn, Some(TrustLevel::Blocked)).unwrap();
        assert_eq!(blocked.len(), 1);
        assert_eq!(blocked[0].server_id, "c1");
        assert!(!blocked[0].is_usable());
    }

    #[test]
    fn updates_require_an_existing_row() {
        let conn = test_db();
        assert!(matches!(
            update_server_trust_level(&conn, "ghost", TrustLevel::Full),
            Err(FederationError::ServerNotFound(_))
        ));
        assert!(matches!(
            delete_federated_server(&conn, "ghost"),
            Err(FederationError::ServerNotFound(_))
        ));
        assert!(matches!(
            set_server_active(&conn, "ghost", false),
            Err(FederationError::ServerNotFound(_))
        ));
    }

    #[test]
    fn scopes_last_sync_and_active_flag_persist() {
        let conn = test_db();
        register(&conn, "b1", "https://b.example", ScopePermissions::default());

        let scopes = ScopePermissions {
            chat: true,
            geolocation: true,
            ..Default::default()
        };
        update_server_scopes(&conn, "b1", &scopes).unwrap();
        update_server_last_sync(&conn, "b1").unwrap();
        set_server_active(&conn, "b1", false).unwrap();

        let server = get_federated_server(&conn, "b1").unwrap().unwrap();
        assert_eq!(server.scopes, scopes);
        assert!(server.last_sync_at.is_some());
        assert!(!server.active);
        assert!(!server.is_usable());

        assert!(matches!(
            update_server_retention(&conn, "b1", 0),
            Err(FederationError::InvalidInput(_))
        ));
        delete_federated_server(&conn, "b1").unwrap();
        assert!(get_federated_server(&conn, "b1").unwrap().is_none());
    }
}
