use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{header, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::Response,
};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::AppState;

/// Address of the calling client, recorded in audit entries.
///
/// `None` when the server was not built with connect info (in-process
/// router tests).
#[derive(Clone, Debug, Default)]
pub struct ClientIp(pub Option<String>);

impl ClientIp {
    pub fn as_deref(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

/// Stores the peer address in request extensions for handlers.
pub async fn client_ip_middleware(mut req: Request<Body>, next: Next) -> Response {
    let ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string());
    req.extensions_mut().insert(ClientIp(ip));
    next.run(req).await
}

/// Requires `Authorization: Bearer <admin.token>` on admin routes.
///
/// An empty configured token refuses every request.
pub async fn admin_auth_middleware(req: Request<Body>, next: Next) -> Result<Response, StatusCode> {
    let state = req
        .extensions()
        .get::<Arc<AppState>>()
        .ok_or(StatusCode::INTERNAL_SERVER_ERROR)?
        .clone();

    if state.admin_token.is_empty() {
        tracing::warn!(path = %req.uri().path(), "admin request refused: no admin token configured");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let presented = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(StatusCode::UNAUTHORIZED)?;

    if !souk_crypto::constant_time_eq(presented.as_bytes(), state.admin_token.as_bytes()) {
        tracing::warn!(path = %req.uri().path(), "admin request refused: bad token");
        return Err(StatusCode::UNAUTHORIZED);
    }

    Ok(next.run(req).await)
}

/// In-memory rate limiter state.
///
/// Uses a simple fixed window counter per client address.
#[derive(Clone, Debug)]
pub struct RateLimiter {
    state: Arc<Mutex<HashMap<IpAddr, (u32, Instant)>>>,
}

const RATE_WINDOW: Duration = Duration::from_secs(60);
const MAX_TRACKED_CLIENTS: usize = 10_000;

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Returns `true` if the request is allowed, `false` if the limit is
    /// exceeded.
    pub fn check(&self, key: IpAddr, limit: u32) -> bool {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("rate limiter lock poisoned, recovering with stale state");
                poisoned.into_inner()
            }
        };
        let now = Instant::now();

        // Evict only expired windows so active limits survive cleanup.
        if state.len() > MAX_TRACKED_CLIENTS {
            state.retain(|_, (_, start)| now.duration_since(*start) <= RATE_WINDOW);
        }

        let (count, start) = state.entry(key).or_insert((0, now));

        if now.duration_since(*start) > RATE_WINDOW {
            *count = 1;
            *start = now;
            true
        } else {
            *count += 1;
            *count <= limit
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Rate limiting for the server-to-server namespace, keyed by client
/// address.
pub async fn rate_limit_middleware(req: Request<Body>, next: Next) -> Result<Response, StatusCode> {
    let state = req
        .extensions()
        .get::<Arc<AppState>>()
        .ok_or(StatusCode::INTERNAL_SERVER_ERROR)?
        .clone();

    // Without connect info there is no key to limit on; misconfiguration
    // should be fixed rather than silently unlimited.
    let Some(ConnectInfo(addr)) = req.extensions().get::<ConnectInfo<SocketAddr>>() else {
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    };

    if !state.rate_limiter.check(addr.ip(), state.rate_limit_per_minute) {
        tracing::warn!(client = %addr.ip(), path = %req.uri().path(), "federation rate limit exceeded");
        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from_static("60"));
        return Ok(response);
    }

    Ok(next.run(req).await)
}
