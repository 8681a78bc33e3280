//! Souk federation server library.
//!
//! Serves two namespaces: the operator-facing admin API under
//! `/admin/federation` and the server-to-server protocol under
//! `/federation/v1`.

pub mod api;
pub mod api_admin;
pub mod api_federation;
pub mod client;
pub mod config;
pub mod middleware;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post, put},
    Extension, Json, Router,
};
use middleware::RateLimiter;
use rusqlite::Connection;
use serde_json::{json, Value};
use souk_db::DbPool;
use souk_federation::{AcceptPolicy, ChatInbox, FederationError, IdentityHandle, MarketplaceDirectory};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::client::FederationClient;

/// Largest accepted request body. Relayed payloads are the biggest thing
/// this server receives.
const MAX_REQUEST_BODY_BYTES: usize = 256 * 1024;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool.
    pub pool: DbPool,
    /// The local signing identity, swapped on initialization and rotation.
    pub identity: IdentityHandle,
    /// Outbound client for federated servers.
    pub client: FederationClient,
    /// Local marketplace data served to federated queries.
    pub directory: Arc<dyn MarketplaceDirectory>,
    /// Local delivery for relayed chat messages.
    pub inbox: Arc<dyn ChatInbox>,
    /// What this server grants to servers that handshake with it.
    pub accept_policy: AcceptPolicy,
    /// Bearer token for admin routes.
    pub admin_token: String,
    /// Shared secret for identity bootstrap.
    pub bootstrap_secret: String,
    /// Fallback URL for identity initialization.
    pub public_url: Option<String>,
    /// Rate limiter state for the server-to-server namespace.
    pub rate_limiter: RateLimiter,
    pub rate_limit_per_minute: u32,
}

/// Runs `f` on a pooled connection in a blocking task.
pub async fn run_blocking<T, F>(pool: &DbPool, f: F) -> Result<T, FederationError>
where
    F: FnOnce(&Connection) -> Result<T, FederationError> + Send + 'static,
    T: Send + 'static,
{
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || {
        let conn = pool
            .get()
            .map_err(|e| FederationError::Unavailable(format!("db connection failed: {e}")))?;
        f(&conn)
    })
    .await
    .map_err(|e| FederationError::Unavailable(format!("blocking task failed: {e}")))?
}

/// Health check handler.
///
/// Returns `200 OK` with server status and version.
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    let admin_routes = Router::new()
        .route(
            "/admin/federation/identity",
            get(api_admin::get_identity_handler),
        )
        .route(
            "/admin/federation/identity/rotate",
            post(api_admin::rotate_identity_handler),
        )
        .route(
            "/admin/federation/handshake",
            post(api_admin::initiate_handshake_handler),
        )
        .route(
            "/admin/federation/servers",
            get(api_admin::list_servers_handler),
        )
        .route(
            "/admin/federation/servers/{serverId}",
            get(api_admin::get_server_handler).delete(api_admin::delete_server_handler),
        )
        .route(
            "/admin/federation/servers/{serverId}/trust",
            put(api_admin::update_trust_handler),
        )
        .route(
            "/admin/federation/servers/{serverId}/scopes",
            put(api_admin::update_scopes_handler),
        )
        .route(
            "/admin/federation/servers/{serverId}/active",
            put(api_admin::update_active_handler),
        )
        .route(
            "/admin/federation/servers/{serverId}/retention",
            put(api_admin::update_retention_handler),
        )
        .route(
            "/admin/federation/servers/{serverId}/users/nearby",
            get(api_admin::nearby_users_handler),
        )
        .route(
            "/admin/federation/servers/{serverId}/postings",
            get(api_admin::search_postings_handler),
        )
        .route(
            "/admin/federation/consents",
            post(api_admin::issue_consent_handler),
        )
        .route(
            "/admin/federation/messages",
            post(api_admin::send_message_handler),
        )
        .route("/admin/federation/audit", get(api_admin::audit_handler))
        .layer(axum::middleware::from_fn(middleware::admin_auth_middleware));

    let federation_routes = Router::new()
        .route(
            "/federation/v1/handshake",
            post(api_federation::handshake_handler),
        )
        .route(
            "/federation/v1/users/nearby",
            get(api_federation::nearby_users_handler),
        )
        .route(
            "/federation/v1/postings/search",
            get(api_federation::posting_search_handler),
        )
        .route(
            "/federation/v1/messages/relay",
            post(api_federation::relay_handler),
        )
        .route(
            "/federation/v1/identity",
            get(api_federation::identity_handler),
        )
        .layer(axum::middleware::from_fn(middleware::rate_limit_middleware));

    Router::new()
        .route("/health", get(health))
        // Authenticated by the bootstrap HMAC, not the admin token.
        .route(
            "/admin/federation/identity/initialize",
            post(api_admin::initialize_identity_handler),
        )
        .merge(admin_routes)
        .merge(federation_routes)
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(axum::middleware::from_fn(middleware::client_ip_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(Extension(Arc::new(state)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use souk_federation::EmptyDirectory;
    use souk_federation::MemoryInbox;
    use tower::ServiceExt;

    fn state() -> AppState {
        let pool = souk_db::create_pool(
            ":memory:",
            souk_db::DbRuntimeSettings {
                pool_max_size: 1,
                ..Default::default()
            },
        )
        .unwrap();
        AppState {
            pool,
            identity: IdentityHandle::empty(),
            client: FederationClient::new(std::time::Duration::from_secs(1)).unwrap(),
            directory: Arc::new(EmptyDirectory),
            inbox: Arc::new(MemoryInbox::accept_all()),
            accept_policy: AcceptPolicy {
                granted_scopes: Default::default(),
                data_retention_days: 30,
            },
            admin_token: String::new(),
            bootstrap_secret: String::new(),
            public_url: None,
            rate_limiter: RateLimiter::new(),
            rate_limit_per_minute: 10,
        }
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let response = app(state())
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn admin_routes_refuse_when_no_token_configured() {
        let response = app(state())
            .oneshot(
                Request::builder()
                    .uri("/admin/federation/servers")
                    .header("Authorization", "Bearer ")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
