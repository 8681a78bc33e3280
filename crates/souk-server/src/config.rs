//! Server configuration loading from file and environment variables.

use serde::Deserialize;
use souk_types::ScopePermissions;
use std::net::{IpAddr, Ipv4Addr};
use thiserror::Error;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server network settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Database settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Admin API settings.
    #[serde(default)]
    pub admin: AdminConfig,

    /// Federation settings.
    #[serde(default)]
    pub federation: FederationConfig,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,

    /// SQLite busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Maximum number of pooled connections.
    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "souk_federation=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// Admin API configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AdminConfig {
    /// Bearer token required on `/admin/federation/...` routes. Empty
    /// refuses every admin request.
    #[serde(default)]
    pub token: String,
}

/// Federation configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// Externally reachable base URL, used when identity initialization
    /// does not name one.
    #[serde(default)]
    pub public_url: Option<String>,

    /// Timeout for outbound calls to federated servers.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Shared secret for the identity bootstrap HMAC. Empty disables
    /// bootstrap.
    #[serde(default)]
    pub bootstrap_secret: String,

    /// Scopes this server grants to servers that handshake with it.
    #[serde(default = "default_granted_scopes")]
    pub granted_scopes: ScopePermissions,

    /// Retention recorded for newly federated servers, in days.
    #[serde(default = "default_retention_days")]
    pub default_retention_days: i64,

    /// Requests per minute each client address may make to the
    /// server-to-server namespace.
    #[serde(default = "default_rate_limit_per_minute")]
    pub rate_limit_per_minute: u32,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    3000
}

fn default_db_path() -> String {
    "souk.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_pool_max_size() -> u32 {
    8
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_granted_scopes() -> ScopePermissions {
    ScopePermissions {
        users: true,
        postings: true,
        chat: true,
        ..ScopePermissions::default()
    }
}

fn default_retention_days() -> i64 {
    30
}

fn default_rate_limit_per_minute() -> u32 {
    120
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_max_size: default_pool_max_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            public_url: None,
            request_timeout_secs: default_request_timeout_secs(),
            bootstrap_secret: String::new(),
            granted_scopes: default_granted_scopes(),
            default_retention_days: default_retention_days(),
            rate_limit_per_minute: default_rate_limit_per_minute(),
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is present but unusable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `SOUK_HOST` overrides `server.host`
/// - `SOUK_PORT` overrides `server.port`
/// - `SOUK_DB_PATH` overrides `database.path`
/// - `SOUK_LOG_LEVEL` overrides `logging.level`
/// - `SOUK_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `SOUK_PUBLIC_URL` overrides `federation.public_url`
/// - `SOUK_ADMIN_TOKEN` overrides `admin.token`
/// - `SOUK_BOOTSTRAP_SECRET` overrides `federation.bootstrap_secret`
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed,
/// or if a federation setting is out of range.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    validate(&config)?;

    Ok(config)
}

fn apply_env_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(host) = var("SOUK_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Some(port) = var("SOUK_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Some(db_path) = var("SOUK_DB_PATH") {
        config.database.path = db_path;
    }
    if let Some(level) = var("SOUK_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = var("SOUK_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Some(url) = var("SOUK_PUBLIC_URL") {
        config.federation.public_url = Some(url).filter(|u| !u.trim().is_empty());
    }
    if let Some(token) = var("SOUK_ADMIN_TOKEN") {
        config.admin.token = token;
    }
    if let Some(secret) = var("SOUK_BOOTSTRAP_SECRET") {
        config.federation.bootstrap_secret = secret;
    }
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    let federation = &config.federation;
    if federation.request_timeout_secs == 0 {
        return Err(ConfigError::Invalid(
            "federation.request_timeout_secs must be at least 1".to_string(),
        ));
    }
    if federation.default_retention_days < 1 {
        return Err(ConfigError::Invalid(
            "federation.default_retention_days must be at least 1".to_string(),
        ));
    }
    if federation.rate_limit_per_minute == 0 {
        return Err(ConfigError::Invalid(
            "federation.rate_limit_per_minute must be at least 1".to_string(),
        ));
    }
    if let Some(ref url) = federation.public_url {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::Invalid(format!(
                "federation.public_url must be an http(s) URL, got {url:?}"
            )));
        }
    }
    Ok(())
}
