//! Souk server binary.
//!
//! Starts the federation HTTP server with structured logging, database
//! initialization, and graceful shutdown on SIGTERM/SIGINT.

use souk_federation::{AcceptPolicy, EmptyDirectory, IdentityHandle, MemoryInbox};
use souk_server::{app, client::FederationClient, config, middleware::RateLimiter, AppState};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

fn resolve_config_path() -> (Option<String>, &'static str) {
    if let Some(path) = std::env::args()
        .nth(1)
        .filter(|value| !value.trim().is_empty())
    {
        return (Some(path), "cli-arg");
    }

    if let Ok(path) = std::env::var("SOUK_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (Some(path), "env-var");
        }
    }

    (None, "default")
}

#[tokio::main]
async fn main() {
    let (resolved_config_path, config_source) = resolve_config_path();
    let selected_config_path = resolved_config_path.as_deref().or(Some("config.toml"));

    let config = config::load_config(selected_config_path)
        .expect("failed to load configuration: the server cannot start without valid config");

    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(
        source = config_source,
        path = selected_config_path.unwrap_or("<none>"),
        "resolved startup configuration path"
    );

    let pool = souk_db::create_pool(
        &config.database.path,
        souk_db::DbRuntimeSettings {
            busy_timeout_ms: config.database.busy_timeout_ms,
            pool_max_size: config.database.pool_max_size,
        },
    )
    .expect("failed to create database pool: check database.path in config");

    let identity = {
        let conn = pool
            .get()
            .expect("failed to get database connection for migrations");
        let applied = souk_db::run_migrations(&conn).expect("failed to run database migrations");
        if applied > 0 {
            tracing::info!(count = applied, "applied database migrations");
        }
        IdentityHandle::load(&conn).expect("failed to load local server identity")
    };

    match identity.current() {
        Some(local) => tracing::info!(
            server_id = %local.server_id(),
            server_url = %local.public().server_url,
            "loaded local server identity"
        ),
        None => tracing::warn!(
            "local server identity not initialized; federation is unavailable until \
             POST /admin/federation/identity/initialize succeeds"
        ),
    }
    if config.admin.token.is_empty() {
        tracing::warn!("admin.token is empty; all admin routes will be refused");
    }

    let client = FederationClient::new(Duration::from_secs(config.federation.request_timeout_secs))
        .expect("failed to build outbound HTTP client");

    // The marketplace plugs its own directory and inbox in here; a bare
    // federation node serves nothing and accepts relays for nobody.
    let state = AppState {
        pool,
        identity,
        client,
        directory: Arc::new(EmptyDirectory),
        inbox: Arc::new(MemoryInbox::for_recipients(Vec::<String>::new())),
        accept_policy: AcceptPolicy {
            granted_scopes: config.federation.granted_scopes,
            data_retention_days: config.federation.default_retention_days,
        },
        admin_token: config.admin.token.clone(),
        bootstrap_secret: config.federation.bootstrap_secret.clone(),
        public_url: config.federation.public_url.clone(),
        rate_limiter: RateLimiter::new(),
        rate_limit_per_minute: config.federation.rate_limit_per_minute,
    };

    let app = app(state);
    let addr = SocketAddr::new(config.server.host, config.server.port);

    tracing::info!(%addr, "starting souk server");

    let listener = TcpListener::bind(addr)
        .await
        .expect("failed to bind to address: is another process using this port?");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .expect("server error");

    tracing::info!("souk server shut down");
}

/// Waits for a SIGINT (Ctrl+C) or SIGTERM signal for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { tracing::info!("received SIGINT, initiating graceful shutdown"); }
        () = terminate => { tracing::info!("received SIGTERM, initiating graceful shutdown"); }
    }
}
