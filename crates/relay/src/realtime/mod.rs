// Realtime layer: connection registry, room fan-out, liveness, and
// the WebSocket endpoint that ties them together.

pub mod handler;
pub mod liveness;
pub mod publisher;
pub mod registry;

use axum::{routing::get, Router};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::auth::jwt::JwtTokenVerifier;
use crate::ratelimit::{RateLimiterSet, CLEANUP_PERIOD};
use handler::ws_upgrade;
use liveness::LivenessMonitor;
use publisher::EventPublisher;
use registry::ConnectionRegistry;

#[derive(Clone)]
pub struct RealtimeState {
    pub registry: Arc<ConnectionRegistry>,
    pub limiters: Arc<RateLimiterSet>,
    pub verifier: Arc<JwtTokenVerifier>,
}

pub fn router(
    registry: Arc<ConnectionRegistry>,
    limiters: Arc<RateLimiterSet>,
    verifier: Arc<JwtTokenVerifier>,
) -> Router {
    let state = RealtimeState { registry, limiters, verifier };
    Router::new().route("/v1/realtime/ws", get(ws_upgrade)).with_state(state)
}

/// Owns the realtime layer's shared state and background tasks.
///
/// Construct one per process, `start` it alongside the HTTP server,
/// and `shutdown` it when the server drains. There is no global
/// instance; everything that publishes events holds a handle obtained
/// from [`RealtimeService::publisher`].
pub struct RealtimeService {
    registry: Arc<ConnectionRegistry>,
    limiters: Arc<RateLimiterSet>,
    monitor_task: Option<JoinHandle<()>>,
    cleanup_task: Option<JoinHandle<()>>,
}

impl Default for RealtimeService {
    fn default() -> Self {
        Self::new()
    }
}

impl RealtimeService {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(ConnectionRegistry::default()),
            limiters: Arc::new(RateLimiterSet::default()),
            monitor_task: None,
            cleanup_task: None,
        }
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn limiters(&self) -> Arc<RateLimiterSet> {
        Arc::clone(&self.limiters)
    }

    pub fn publisher(&self) -> EventPublisher {
        EventPublisher::new(self.registry())
    }

    /// Spawn the liveness monitor and the rate-limit purge task.
    /// Calling `start` twice leaves the original tasks running.
    pub fn start(&mut self) {
        if self.monitor_task.is_none() {
            self.monitor_task = Some(LivenessMonitor::new(self.registry()).spawn());
        }

        if self.cleanup_task.is_none() {
            let limiters = self.limiters();
            self.cleanup_task = Some(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(CLEANUP_PERIOD);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    limiters.purge_expired().await;
                }
            }));
        }

        info!("realtime service started");
    }

    /// Stop the background tasks and close every live connection.
    pub async fn shutdown(&mut self) {
        if let Some(task) = self.monitor_task.take() {
            task.abort();
        }
        if let Some(task) = self.cleanup_task.take() {
            task.abort();
        }

        self.registry.close_all().await;
        info!("realtime service stopped");
    }
}
