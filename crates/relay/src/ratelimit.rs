// Fixed-window rate limiting.
//
// One counter per identity key per window. Windows reset lazily: the
// first call after expiry opens a fresh window, so a periodic purge
// only bounds memory and is not needed for correctness. Each traffic
// class gets its own independently configured limiter; counters are
// never shared across classes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Request, State},
    http::HeaderValue,
    middleware::Next,
    response::{IntoResponse, Response},
};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use crate::auth::middleware::AuthenticatedUser;
use crate::error::{ErrorCode, RelayError};

/// How often expired window entries are purged.
pub const CLEANUP_PERIOD: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window: Duration,
}

#[derive(Debug, Clone, Copy)]
struct WindowEntry {
    count: u32,
    window_reset_at: Instant,
}

/// A single fixed-window limiter for one traffic class.
#[derive(Debug)]
pub struct FixedWindowLimiter {
    config: RateLimitConfig,
    entries: RwLock<HashMap<String, WindowEntry>>,
}

impl FixedWindowLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self { config, entries: RwLock::new(HashMap::new()) }
    }

    pub fn max_requests(&self) -> u32 {
        self.config.max_requests
    }

    /// Returns true once the current window's budget is spent, without
    /// further mutation; otherwise counts this call and returns false.
    pub async fn is_limited(&self, key: &str) -> bool {
        self.is_limited_at(key, Instant::now()).await
    }

    pub async fn is_limited_at(&self, key: &str, now: Instant) -> bool {
        let mut entries = self.entries.write().await;
        match entries.get_mut(key) {
            Some(entry) if now < entry.window_reset_at => {
                if entry.count >= self.config.max_requests {
                    return true;
                }
                entry.count += 1;
                false
            }
            _ => {
                // Lazy reset: first call at or past the boundary opens
                // a new window with this call already counted.
                entries.insert(
                    key.to_string(),
                    WindowEntry { count: 1, window_reset_at: now + self.config.window },
                );
                false
            }
        }
    }

    /// Remaining budget in the current window. Non-mutating.
    pub async fn remaining(&self, key: &str) -> u32 {
        self.remaining_at(key, Instant::now()).await
    }

    pub async fn remaining_at(&self, key: &str, now: Instant) -> u32 {
        let entries = self.entries.read().await;
        match entries.get(key) {
            Some(entry) if now < entry.window_reset_at => {
                self.config.max_requests.saturating_sub(entry.count)
            }
            _ => self.config.max_requests,
        }
    }

    /// Time until the current window resets. Zero when no window is
    /// open for the key. Non-mutating.
    pub async fn reset_after(&self, key: &str) -> Duration {
        self.reset_after_at(key, Instant::now()).await
    }

    pub async fn reset_after_at(&self, key: &str, now: Instant) -> Duration {
        let entries = self.entries.read().await;
        match entries.get(key) {
            Some(entry) => entry.window_reset_at.saturating_duration_since(now),
            None => Duration::ZERO,
        }
    }

    /// Retry hint in whole seconds, rounded up, never less than 1.
    pub async fn retry_after_seconds(&self, key: &str) -> u64 {
        let reset_after = self.reset_after(key).await;
        let mut seconds = reset_after.as_secs();
        if reset_after.subsec_nanos() > 0 {
            seconds += 1;
        }
        seconds.max(1)
    }

    /// Drop expired windows. Returns how many entries were removed.
    pub async fn purge_expired(&self) -> usize {
        self.purge_expired_at(Instant::now()).await
    }

    pub async fn purge_expired_at(&self, now: Instant) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| now < entry.window_reset_at);
        before - entries.len()
    }
}

/// One limiter per traffic class. Same algorithm, distinct budgets,
/// never sharing counters. The classes are individually `Arc`ed so a
/// route layer can hold just the limiter it gates on.
#[derive(Debug)]
pub struct RateLimiterSet {
    pub general: Arc<FixedWindowLimiter>,
    pub auth: Arc<FixedWindowLimiter>,
    pub reads: Arc<FixedWindowLimiter>,
    pub writes: Arc<FixedWindowLimiter>,
    pub ws_messages: Arc<FixedWindowLimiter>,
}

impl Default for RateLimiterSet {
    fn default() -> Self {
        let minute = Duration::from_secs(60);
        Self {
            general: Arc::new(FixedWindowLimiter::new(RateLimitConfig {
                max_requests: 100,
                window: minute,
            })),
            auth: Arc::new(FixedWindowLimiter::new(RateLimitConfig {
                max_requests: 10,
                window: minute,
            })),
            reads: Arc::new(FixedWindowLimiter::new(RateLimitConfig {
                max_requests: 300,
                window: minute,
            })),
            writes: Arc::new(FixedWindowLimiter::new(RateLimitConfig {
                max_requests: 60,
                window: minute,
            })),
            ws_messages: Arc::new(FixedWindowLimiter::new(RateLimitConfig {
                max_requests: 100,
                window: Duration::from_secs(10),
            })),
        }
    }
}

impl RateLimiterSet {
    pub async fn purge_expired(&self) {
        let removed = self.general.purge_expired().await
            + self.auth.purge_expired().await
            + self.reads.purge_expired().await
            + self.writes.purge_expired().await
            + self.ws_messages.purge_expired().await;
        if removed > 0 {
            debug!(removed, "purged expired rate-limit windows");
        }
    }
}

/// Axum middleware gating a route on one traffic-class limiter.
///
/// Keys on the authenticated user when the auth middleware ran first,
/// falling back to the forwarded client address.
pub async fn rate_limit_middleware(
    State(limiter): State<Arc<FixedWindowLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let key = client_key(&request);

    if limiter.is_limited(&key).await {
        let retry_after = limiter.retry_after_seconds(&key).await;
        let mut response = RelayError::from_code(ErrorCode::RateLimited)
            .with_details(serde_json::json!({ "retryAfterSeconds": retry_after }))
            .into_response();
        if let Ok(header) = HeaderValue::from_str(&retry_after.to_string()) {
            response.headers_mut().insert("retry-after", header);
        }
        attach_rate_limit_headers(&mut response, &limiter, &key).await;
        return response;
    }

    let mut response = next.run(request).await;
    attach_rate_limit_headers(&mut response, &limiter, &key).await;
    response
}

fn client_key(request: &Request) -> String {
    if let Some(user) = request.extensions().get::<AuthenticatedUser>() {
        return user.user_id.to_string();
    }

    request
        .headers()
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| "anonymous".to_string())
}

async fn attach_rate_limit_headers(
    response: &mut Response,
    limiter: &FixedWindowLimiter,
    key: &str,
) {
    let remaining = limiter.remaining(key).await;
    let reset_seconds = limiter.reset_after(key).await.as_secs();

    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&limiter.max_requests().to_string()) {
        headers.insert("x-ratelimit-limit", value);
    }
    if let Ok(value) = HeaderValue::from_str(&remaining.to_string()) {
        headers.insert("x-ratelimit-remaining", value);
    }
    if let Ok(value) = HeaderValue::from_str(&reset_seconds.to_string()) {
        headers.insert("x-ratelimit-reset", value);
    }
}
