//! This server's own federation identity.
//!
//! The identity row is written once by [`initialize`] and afterwards only
//! touched by [`rotate_keys`]. The private key is read by
//! [`load_signing_identity`] and by nothing else; everything that leaves
//! this module carries [`PublicIdentity`].

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use souk_audit::NewAuditEntry;
use souk_crypto::SigningKey;
use souk_types::{AuditEventType, AuditOutcome, PROTOCOL_VERSION};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use crate::FederationError;

/// The public half of the local identity, safe to serve and to log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicIdentity {
    pub server_id: String,
    pub server_url: String,
    pub server_name: String,
    pub admin_contact: Option<String>,
    pub description: Option<String>,
    pub location_hint: Option<String>,
    /// SPKI PEM.
    pub public_key: String,
    pub key_algorithm: String,
    pub key_size: u32,
    pub protocol_version: String,
    pub key_generated_at: String,
    pub key_rotation_due_at: String,
    pub created_at: String,
}

/// Operator-supplied fields for [`initialize`].
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub server_url: String,
    pub server_name: String,
    #[serde(default)]
    pub admin_contact: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub location_hint: Option<String>,
}

/// The local identity together with its decoded signing key.
pub struct SigningIdentity {
    public: PublicIdentity,
    signing_key: SigningKey,
    /// Key replaced by the last rotation, if any.
    previous_key: Option<SigningKey>,
}

impl SigningIdentity {
    pub fn server_id(&self) -> &str {
        &self.public.server_id
    }

    pub fn public(&self) -> &PublicIdentity {
        &self.public
    }

    /// Signs a canonical string, returning a base64 signature.
    pub fn sign(&self, message: &str) -> String {
        souk_crypto::sign(message, &self.signing_key)
    }

    /// Signs with the key in force before the last rotation. Peers that
    /// still hold that key use this to accept the new one.
    pub fn sign_with_previous(&self, message: &str) -> Option<String> {
        self.previous_key
            .as_ref()
            .map(|key| souk_crypto::sign(message, key))
    }
}

impl std::fmt::Debug for SigningIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningIdentity")
            .field("server_id", &self.public.server_id)
            .finish_non_exhaustive()
    }
}

/// Shared holder of the current signing identity.
///
/// Cloning shares the same slot. [`IdentityHandle::replace`] swaps the whole
/// `Arc`, so a signer that already called [`IdentityHandle::current`] keeps
/// a consistent key for the rest of its operation.
#[derive(Debug, Clone, Default)]
pub struct IdentityHandle {
    slot: Arc<RwLock<Option<Arc<SigningIdentity>>>>,
}

impl IdentityHandle {
    /// A handle with no identity loaded.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds a handle from whatever identity is stored.
    pub fn load(conn: &Connection) -> Result<Self, FederationError> {
        let handle = Self::empty();
        handle.refresh(conn)?;
        Ok(handle)
    }

    pub fn current(&self) -> Option<Arc<SigningIdentity>> {
        self.slot
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Like [`current`](Self::current) but maps absence to
    /// [`FederationError::NotInitialized`].
    pub fn require(&self) -> Result<Arc<SigningIdentity>, FederationError> {
        self.current().ok_or(FederationError::NotInitialized)
    }

    pub fn replace(&self, identity: Option<SigningIdentity>) {
        let mut slot = self
            .slot
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = identity.map(Arc::new);
    }

    /// Reloads the stored identity into the handle.
    pub fn refresh(&self, conn: &Connection) -> Result<bool, FederationError> {
        let identity = load_signing_identity(conn)?;
        let present = identity.is_some();
        self.replace(identity);
        Ok(present)
    }
}

const PUBLIC_COLUMNS: &str = "server_id, server_url, server_name, admin_contact, description,
     location_hint, public_key_pem, key_algorithm, key_size, protocol_version,
     key_generated_at, key_rotation_due_at, created_at";

fn row_to_public(row: &rusqlite::Row<'_>) -> rusqlite::Result<PublicIdentity> {
    Ok(PublicIdentity {
        server_id: row.get(0)?,
        server_url: row.get(1)?,
        server_name: row.get(2)?,
        admin_contact: row.get(3)?,
        description: row.get(4)?,
        location_hint: row.get(5)?,
        public_key: row.get(6)?,
        key_algorithm: row.get(7)?,
        key_size: row.get(8)?,
        protocol_version: row.get(9)?,
        key_generated_at: row.get(10)?,
        key_rotation_due_at: row.get(11)?,
        created_at: row.get(12)?,
    })
}

/// Returns the public identity, or `None` before initialization.
pub fn get_public_identity(conn: &Connection) -> Result<Option<PublicIdentity>, FederationError> {
    let identity = conn
        .query_row(
            &format!("SELECT {PUBLIC_COLUMNS} FROM local_server_identity WHERE singleton = 1"),
            [],
            row_to_public,
        )
        .optional()?;
    Ok(identity)
}

/// Loads the identity with its private key decoded.
///
/// # Errors
///
/// Returns `FederationError::Crypto` if the stored private key is not a
/// valid PKCS#8 document.
pub fn load_signing_identity(
    conn: &Connection,
) -> Result<Option<SigningIdentity>, FederationError> {
    let row = conn
        .query_row(
            &format!(
                "SELECT {PUBLIC_COLUMNS}, private_key_pem, previous_private_key_pem
                 FROM local_server_identity WHERE singleton = 1"
            ),
            [],
            |row| {
                Ok((
                    row_to_public(row)?,
                    row.get::<_, String>(13)?,
                    row.get::<_, Option<String>>(14)?,
                ))
            },
        )
        .optional()?;

    let Some((public, private_key_pem, previous_pem)) = row else {
        return Ok(None);
    };
    let signing_key = souk_crypto::decode_private_key_pem(&private_key_pem)?;
    let previous_key = previous_pem
        .as_deref()
        .map(souk_crypto::decode_private_key_pem)
        .transpose()?;
    Ok(Some(SigningIdentity {
        public,
        signing_key,
        previous_key,
    }))
}

fn validate(params: &InitializeParams) -> Result<(), FederationError> {
    let url = params.server_url.trim();
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(FederationError::InvalidInput(
            "serverUrl must be an http(s) URL".to_string(),
        ));
    }
    if params.server_name.trim().is_empty() {
        return Err(FederationError::InvalidInput(
            "serverName must not be empty".to_string(),
        ));
    }
    Ok(())
}

/// Creates the local identity, or returns the existing one unchanged.
///
/// Concurrent calls are safe: the insert is conditional on the singleton
/// row being absent, and every caller reads back whichever row won.
pub fn initialize(
    conn: &Connection,
    params: &InitializeParams,
) -> Result<PublicIdentity, FederationError> {
    let started = Instant::now();

    if let Some(existing) = get_public_identity(conn)? {
        tracing::info!(server_id = %existing.server_id, "federation identity already initialized");
        souk_audit::record(
            conn,
            NewAuditEntry::new(
                AuditEventType::KeyRotation,
                "identity_initialize",
                AuditOutcome::Success,
            )
            .detail("serverId", &existing.server_id)
            .detail("alreadyInitialized", true)
            .duration(started.elapsed()),
        );
        return Ok(existing);
    }

    match create_identity(conn, params) {
        Ok((identity, inserted)) => {
            if inserted {
                tracing::info!(
                    server_id = %identity.server_id,
                    server_url = %identity.server_url,
                    "federation identity initialized"
                );
            }
            souk_audit::record(
                conn,
                NewAuditEntry::new(
                    AuditEventType::KeyRotation,
                    "identity_initialize",
                    AuditOutcome::Success,
                )
                .detail("serverId", &identity.server_id)
                .detail("alreadyInitialized", !inserted)
                .detail("keyAlgorithm", &identity.key_algorithm)
                .duration(started.elapsed()),
            );
            Ok(identity)
        }
        Err(e) => {
            tracing::error!("federation identity initialization failed: {}", e);
            souk_audit::record(
                conn,
                NewAuditEntry::new(
                    AuditEventType::KeyRotation,
                    "identity_initialize",
                    AuditOutcome::Failure,
                )
                .error(e.to_string())
                .duration(started.elapsed()),
            );
            Err(e)
        }
    }
}

fn create_identity(
    conn: &Connection,
    params: &InitializeParams,
) -> Result<(PublicIdentity, bool), FederationError> {
    validate(params)?;
    let keys = souk_crypto::generate_keypair()?;
    let server_id = uuid::Uuid::new_v4().to_string();

    let inserted = conn.execute(
        "INSERT INTO local_server_identity (
            singleton, server_id, server_url, server_name, admin_contact,
            description, location_hint, public_key_pem, private_key_pem,
            key_algorithm, key_size, protocol_version,
            key_generated_at, key_rotation_due_at
         ) VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11,
                   datetime('now'), datetime('now', '+365 days'))
         ON CONFLICT(singleton) DO NOTHING",
        params![
            server_id,
            params.server_url.trim().trim_end_matches('/'),
            params.server_name.trim(),
            params.admin_contact,
            params.description,
            params.location_hint,
            keys.public_key_pem,
            keys.private_key_pem,
            souk_crypto::KEY_ALGORITHM,
            souk_crypto::KEY_SIZE_BITS,
            PROTOCOL_VERSION,
        ],
    )?;

    let identity = get_public_identity(conn)?.ok_or(FederationError::NotInitialized)?;
    Ok((identity, inserted == 1))
}

/// Short, loggable fingerprint of a public key.
pub fn key_fingerprint(public_key_pem: &str) -> String {
    souk_crypto::sha256_hex(public_key_pem)[..16].to_string()
}

/// Replaces the keypair in place and pushes the rotation due date forward.
///
/// The replaced keypair is kept as the previous key. Peers keep the old
/// public key on record until this server handshakes with them again; that
/// handshake carries a signature from the previous key, which is what lets a
/// graduated peer accept the new one.
pub fn rotate_keys(conn: &Connection) -> Result<PublicIdentity, FederationError> {
    let started = Instant::now();
    let previous = get_public_identity(conn)?.ok_or(FederationError::NotInitialized)?;

    let result = (|| -> Result<PublicIdentity, FederationError> {
        let keys = souk_crypto::generate_keypair()?;
        let updated = conn.execute(
            "UPDATE local_server_identity
             SET previous_public_key_pem = public_key_pem,
                 previous_private_key_pem = private_key_pem,
                 public_key_pem = ?1,
                 private_key_pem = ?2,
                 key_algorithm = ?3,
                 key_size = ?4,
                 key_generated_at = datetime('now'),
                 key_rotation_due_at = datetime('now', '+365 days')
             WHERE singleton = 1",
            params![
                keys.public_key_pem,
                keys.private_key_pem,
                souk_crypto::KEY_ALGORITHM,
                souk_crypto::KEY_SIZE_BITS,
            ],
        )?;
        if updated == 0 {
            return Err(FederationError::NotInitialized);
        }
        get_public_identity(conn)?.ok_or(FederationError::NotInitialized)
    })();

    let entry = NewAuditEntry::new(AuditEventType::KeyRotation, "key_rotate", AuditOutcome::Success)
        .detail("serverId", &previous.server_id)
        .detail("previousKey", key_fingerprint(&previous.public_key));
    match result {
        Ok(rotated) => {
            tracing::info!(
                server_id = %rotated.server_id,
                key = %key_fingerprint(&rotated.public_key),
                "federation signing key rotated"
            );
            souk_audit::record(
                conn,
                entry
                    .detail("newKey", key_fingerprint(&rotated.public_key))
                    .duration(started.elapsed()),
            );
            Ok(rotated)
        }
        Err(e) => {
            let mut entry = entry.error(e.to_string()).duration(started.elapsed());
            entry.outcome = AuditOutcome::Failure;
            souk_audit::record(conn, entry);
            Err(e)
        }
    }
}
