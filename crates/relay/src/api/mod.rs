// Authenticated HTTP surface of the relay.

use axum::{extract::State, middleware, response::IntoResponse, routing::get, Json, Router};
use std::sync::Arc;

use crate::auth::jwt::JwtTokenVerifier;
use crate::auth::middleware::require_bearer_auth;
use crate::ratelimit::{rate_limit_middleware, RateLimiterSet};
use crate::realtime::registry::ConnectionRegistry;

#[derive(Clone)]
pub struct ApiState {
    registry: Arc<ConnectionRegistry>,
}

pub fn router(
    registry: Arc<ConnectionRegistry>,
    limiters: &RateLimiterSet,
    verifier: Arc<JwtTokenVerifier>,
) -> Router {
    // Auth runs before the limiter so throttling keys on the user,
    // not the proxy address.
    Router::new()
        .route("/v1/realtime/stats", get(realtime_stats))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&limiters.reads),
            rate_limit_middleware,
        ))
        .route_layer(middleware::from_fn_with_state(verifier, require_bearer_auth))
        .with_state(ApiState { registry })
}

/// Registry snapshot: total connections, total rooms, and the member
/// count of each room.
async fn realtime_stats(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.registry.stats().await)
}
