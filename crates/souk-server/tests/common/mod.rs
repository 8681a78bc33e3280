#![allow(dead_code)]

use serde_json::{json, Value};
use souk_db::{create_pool, DbRuntimeSettings};
use souk_federation::types::{BOOTSTRAP_SIGNATURE_HEADER, BOOTSTRAP_TIMESTAMP_HEADER};
use souk_federation::{
    AcceptPolicy, ChatInbox, EmptyDirectory, IdentityHandle, MarketplaceDirectory, MemoryInbox,
};
use souk_server::{app, client::FederationClient, middleware::RateLimiter, AppState};
use souk_types::ScopePermissions;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;

pub const ADMIN_TOKEN: &str = "test-admin-token";
pub const BOOTSTRAP_SECRET: &str = "test-bootstrap-secret";

pub fn scopes(users: bool, postings: bool, chat: bool) -> ScopePermissions {
    ScopePermissions {
        users,
        postings,
        chat,
        ..ScopePermissions::default()
    }
}

pub struct Options {
    pub granted_scopes: ScopePermissions,
    pub directory: Arc<dyn MarketplaceDirectory>,
    pub inbox: Arc<dyn ChatInbox>,
    pub rate_limit_per_minute: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            granted_scopes: scopes(true, true, true),
            directory: Arc::new(EmptyDirectory),
            inbox: Arc::new(MemoryInbox::accept_all()),
            rate_limit_per_minute: 1_000,
        }
    }
}

/// Builds state over a fresh on-disk database in `dir`.
pub fn build_state(dir: &TempDir, options: Options) -> AppState {
    let path = dir.path().join("souk.db");
    let pool = create_pool(path.to_str().unwrap(), DbRuntimeSettings::default()).unwrap();
    {
        let conn = pool.get().unwrap();
        souk_db::run_migrations(&conn).unwrap();
    }
    AppState {
        pool,
        identity: IdentityHandle::empty(),
        client: FederationClient::new(Duration::from_secs(5)).unwrap(),
        directory: options.directory,
        inbox: options.inbox,
        accept_policy: AcceptPolicy {
            granted_scopes: options.granted_scopes,
            data_retention_days: 30,
        },
        admin_token: ADMIN_TOKEN.to_string(),
        bootstrap_secret: BOOTSTRAP_SECRET.to_string(),
        public_url: None,
        rate_limiter: RateLimiter::new(),
        rate_limit_per_minute: options.rate_limit_per_minute,
    }
}

/// A server listening on a real port.
pub struct TestServer {
    pub url: String,
    pub state: AppState,
    http: reqwest::Client,
    _dir: TempDir,
}

pub async fn spawn_server(options: Options) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let state = build_state(&dir, options);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = app(state.clone());
    tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    TestServer {
        url: format!("http://{addr}"),
        state,
        http: reqwest::Client::new(),
        _dir: dir,
    }
}

impl TestServer {
    /// Bootstraps the identity over HTTP and returns the new server id.
    pub async fn initialize(&self, name: &str) -> String {
        let resp = self.bootstrap(name, BOOTSTRAP_SECRET).await;
        let status = resp.status();
        let body: Value = resp.json().await.unwrap();
        assert_eq!(status, 200, "bootstrap failed: {body}");
        body["serverId"].as_str().unwrap().to_string()
    }

    pub async fn bootstrap(&self, name: &str, secret: &str) -> reqwest::Response {
        let timestamp = souk_crypto::now_millis().to_string();
        let digest = souk_crypto::hmac_sha256_hex(secret.as_bytes(), &timestamp);
        self.http
            .post(format!("{}/admin/federation/identity/initialize", self.url))
            .header(BOOTSTRAP_TIMESTAMP_HEADER, timestamp)
            .header(BOOTSTRAP_SIGNATURE_HEADER, digest)
            .json(&json!({ "serverUrl": self.url, "serverName": name }))
            .send()
            .await
            .unwrap()
    }

    pub fn with_conn<T>(&self, f: impl FnOnce(&rusqlite::Connection) -> T) -> T {
        let conn = self.state.pool.get().unwrap();
        f(&conn)
    }

    pub async fn admin_get(&self, path: &str) -> (u16, Value) {
        let resp = self
            .http
            .get(format!("{}{}", self.url, path))
            .bearer_auth(ADMIN_TOKEN)
            .send()
            .await
            .unwrap();
        read(resp).await
    }

    pub async fn admin_post(&self, path: &str, body: Value) -> (u16, Value) {
        let resp = self
            .http
            .post(format!("{}{}", self.url, path))
            .bearer_auth(ADMIN_TOKEN)
            .json(&body)
            .send()
            .await
            .unwrap();
        read(resp).await
    }

    pub async fn admin_put(&self, path: &str, body: Value) -> (u16, Value) {
        let resp = self
            .http
            .put(format!("{}{}", self.url, path))
            .bearer_auth(ADMIN_TOKEN)
            .json(&body)
            .send()
            .await
            .unwrap();
        read(resp).await
    }

    /// Handshakes from `self` to `other`, proposing `proposed`.
    pub async fn handshake_with(&self, other: &TestServer, proposed: ScopePermissions) -> Value {
        let (status, body) = self
            .admin_post(
                "/admin/federation/handshake",
                json!({ "targetUrl": other.url, "scopes": proposed }),
            )
            .await;
        assert_eq!(status, 200, "handshake failed: {body}");
        body
    }

    pub async fn audit(&self, query: &str) -> Vec<Value> {
        let (status, body) = self.admin_get(&format!("/admin/federation/audit?{query}")).await;
        assert_eq!(status, 200, "audit query failed: {body}");
        body.as_array().unwrap().clone()
    }
}

async fn read(resp: reqwest::Response) -> (u16, Value) {
    let status = resp.status().as_u16();
    let bytes = resp.bytes().await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| {
            Value::String(String::from_utf8_lossy(&bytes).into_owned())
        })
    };
    (status, body)
}
