//! Readiness reporting.

use crate::config::Mode;
use crate::engine::Bouncer;
use std::sync::Arc;
use tracing::warn;

/// Loopback address used to check the decision source.
pub const HEALTH_CHECK_IP: &str = "127.0.0.1";

/// Answers readiness checks.
///
/// In stream mode readiness is the synchronizer's health flag. In the other
/// modes the decision source is asked about the loopback address directly,
/// never through the cache.
#[derive(Clone)]
pub struct HealthReporter {
    bouncer: Arc<Bouncer>,
}

impl HealthReporter {
    pub fn new(bouncer: Arc<Bouncer>) -> Self {
        Self { bouncer }
    }

    pub async fn is_healthy(&self) -> bool {
        if self.bouncer.mode() == Mode::Stream {
            let healthy = self.bouncer.sync_state().is_healthy();
            if !healthy {
                warn!(
                    last_success = ?self.bouncer.sync_state().last_success(),
                    "Health check failed: decision stream is not in sync"
                );
            }
            return healthy;
        }

        match self.bouncer.query_source(HEALTH_CHECK_IP).await {
            Ok(true) => true,
            Ok(false) => {
                warn!(ip = HEALTH_CHECK_IP, "Health check failed: loopback IP is banned");
                false
            }
            Err(e) => {
                warn!(ip = HEALTH_CHECK_IP, error = %e, "Health check failed: decision source error");
                false
            }
        }
    }
}
