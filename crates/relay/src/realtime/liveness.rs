// Liveness monitoring: a periodic sweep over the registry that probes
// responsive connections and evicts silent ones.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::realtime::registry::ConnectionRegistry;

pub const SWEEP_PERIOD: Duration = Duration::from_secs(30);
pub const LIVENESS_TIMEOUT: Duration = Duration::from_secs(60);

/// Owns the sweep schedule; the eviction logic itself lives in the
/// registry so it runs under the registry's lock.
pub struct LivenessMonitor {
    registry: Arc<ConnectionRegistry>,
    period: Duration,
    timeout: Duration,
}

impl LivenessMonitor {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry, period: SWEEP_PERIOD, timeout: LIVENESS_TIMEOUT }
    }

    /// Run one sweep at the given instant. Returns the evicted ids.
    pub async fn sweep(&self, now: Instant) -> Vec<Uuid> {
        let evicted = self.registry.liveness_sweep(now, self.timeout).await;
        if !evicted.is_empty() {
            debug!(evicted = evicted.len(), "liveness sweep evicted connections");
        }
        evicted
    }

    /// Spawn the background sweep loop. The task runs until aborted by
    /// the owning service on shutdown.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.period);
            // The first tick fires immediately; skip it so a fresh
            // connection is not probed before it finishes its handshake.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.sweep(Instant::now()).await;
            }
        })
    }
}
