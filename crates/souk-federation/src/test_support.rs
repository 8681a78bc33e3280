//! Fixtures shared by the unit tests in this crate.

use rusqlite::Connection;
use souk_crypto::SigningKey;
use souk_types::ScopePermissions;

use crate::identity::{initialize, IdentityHandle, InitializeParams};
use crate::trust::{upsert_federated_server, FederatedServer, ServerRegistration};

/// In-memory database with migrations applied.
pub fn test_db() -> Connection {
    let conn = Connection::open_in_memory().expect("should open in-memory db");
    souk_db::run_migrations(&conn).expect("migrations should succeed");
    conn
}

/// Initializes the local identity and returns a handle to it.
pub fn local_identity(conn: &Connection, url: &str) -> IdentityHandle {
    initialize(
        conn,
        &InitializeParams {
            server_url: url.to_string(),
            server_name: "Local".to_string(),
            admin_contact: None,
            description: None,
            location_hint: None,
        },
    )
    .expect("identity should initialize");
    IdentityHandle::load(conn).expect("identity should load")
}

/// Records a peer with a throwaway key.
pub fn register(
    conn: &Connection,
    server_id: &str,
    server_url: &str,
    scopes: ScopePermissions,
) -> FederatedServer {
    let keys = souk_crypto::generate_keypair().unwrap();
    upsert_federated_server(
        conn,
        &ServerRegistration {
            server_id,
            server_url,
            server_name: server_id,
            public_key: &keys.public_key_pem,
            protocol_version: souk_types::PROTOCOL_VERSION,
            scopes,
            agreement_hash: "test-agreement",
            data_retention_days: 30,
        },
    )
    .unwrap()
}

/// A remote server whose private key the test controls.
pub struct TestPeer {
    pub server_id: String,
    pub server_url: String,
    pub signing_key: SigningKey,
    pub public_key: String,
}

impl TestPeer {
    pub fn new(server_id: &str) -> Self {
        let keys = souk_crypto::generate_keypair().unwrap();
        Self {
            server_id: server_id.to_string(),
            server_url: format!("https://{server_id}.example"),
            signing_key: keys.signing_key,
            public_key: keys.public_key_pem,
        }
    }

    pub fn sign(&self, message: &str) -> String {
        souk_crypto::sign(message, &self.signing_key)
    }

    pub fn register(&self, conn: &Connection, scopes: ScopePermissions) -> FederatedServer {
        upsert_federated_server(
            conn,
            &ServerRegistration {
                server_id: &self.server_id,
                server_url: &self.server_url,
                server_name: &self.server_id,
                public_key: &self.public_key,
                protocol_version: souk_types::PROTOCOL_VERSION,
                scopes,
                agreement_hash: "test-agreement",
                data_retention_days: 30,
            },
        )
        .unwrap()
    }
}
