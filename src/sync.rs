//! Stream synchronizer keeping the local cache in step with the decision
//! source.
//!
//! A single background task pulls incremental diffs on a fixed interval and
//! applies them to the shared [`DecisionCache`]. Failures never stop the
//! loop; they only flip the shared health flag, which the engine reads to
//! decide whether a cache miss can be trusted.

use crate::cache::DecisionCache;
use crate::decision::StreamDiff;
use crate::metrics::Metrics;
use crate::source::{DecisionSource, SourceError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Health of the mirrored decision set, shared with the engine and the
/// health reporter.
#[derive(Debug, Default)]
pub struct SyncState {
    healthy: AtomicBool,
    last_success: RwLock<Option<SystemTime>>,
}

impl SyncState {
    /// New state, unhealthy until the first successful poll.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Time of the last successful poll, if any.
    pub fn last_success(&self) -> Option<SystemTime> {
        *self
            .last_success
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn mark_healthy(&self, at: SystemTime) {
        *self
            .last_success
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(at);
        self.healthy.store(true, Ordering::Release);
    }

    fn mark_unhealthy(&self) {
        self.healthy.store(false, Ordering::Release);
    }
}

/// Lifecycle of the synchronizer loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Stopped,
    /// Loop started, full decision set not pulled yet.
    Priming,
    /// Pulling incremental diffs.
    Running,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("stream synchronizer is already running")]
    AlreadyRunning,
}

/// What one successful poll changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub added: usize,
    pub deleted: usize,
    /// Decisions in `new` that had already expired.
    pub skipped: usize,
    /// Bans the cache refused to store.
    pub failed: usize,
}

pub struct StreamSynchronizer {
    source: Arc<dyn DecisionSource>,
    cache: Arc<DecisionCache>,
    state: Arc<SyncState>,
    interval: Duration,
    fallback_ttl: Duration,
    running: AtomicBool,
    primed: AtomicBool,
    metrics: Option<Arc<Metrics>>,
}

impl StreamSynchronizer {
    pub fn new(
        source: Arc<dyn DecisionSource>,
        cache: Arc<DecisionCache>,
        state: Arc<SyncState>,
        interval: Duration,
        fallback_ttl: Duration,
    ) -> Self {
        Self {
            source,
            cache,
            state,
            interval,
            fallback_ttl,
            running: AtomicBool::new(false),
            primed: AtomicBool::new(false),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn state(&self) -> &Arc<SyncState> {
        &self.state
    }

    pub fn phase(&self) -> SyncPhase {
        if !self.running.load(Ordering::Acquire) {
            SyncPhase::Stopped
        } else if !self.primed.load(Ordering::Acquire) {
            SyncPhase::Priming
        } else {
            SyncPhase::Running
        }
    }

    /// Run one pull-and-apply cycle.
    ///
    /// The startup flag stays set until a pull is fully applied, so a failed
    /// pull never leaves the mirror without the full decision set. A pull
    /// whose bans could not all be cached leaves the state unhealthy and the
    /// next pull asks for the full set again.
    pub async fn poll_once(&self) -> Result<SyncReport, SourceError> {
        let startup = !self.primed.load(Ordering::Acquire);

        match self.source.stream(startup).await {
            Ok(diff) => {
                let report = self.apply(&diff);
                let complete = report.failed == 0;
                self.primed.store(complete, Ordering::Release);
                if complete {
                    self.state.mark_healthy(SystemTime::now());
                } else {
                    self.state.mark_unhealthy();
                    warn!(
                        startup = startup,
                        failed = report.failed,
                        "Some bans could not be cached, marking unhealthy"
                    );
                }
                if let Some(metrics) = &self.metrics {
                    metrics.record_stream_poll(complete);
                }

                debug!(
                    startup = startup,
                    added = report.added,
                    deleted = report.deleted,
                    skipped = report.skipped,
                    failed = report.failed,
                    cached = self.cache.len(),
                    "Decision stream applied"
                );
                Ok(report)
            }
            Err(e) => {
                self.state.mark_unhealthy();
                if let Some(metrics) = &self.metrics {
                    metrics.record_stream_poll(false);
                }

                warn!(startup = startup, error = %e, "Decision stream pull failed, marking unhealthy");
                Err(e)
            }
        }
    }

    /// Deletions go first so a ban replaced within one diff stays cached.
    fn apply(&self, diff: &StreamDiff) -> SyncReport {
        let mut report = SyncReport::default();

        for decision in &diff.deleted {
            self.cache.delete(&decision.value);
            report.deleted += 1;
        }

        for decision in &diff.new {
            match decision.ttl(self.fallback_ttl) {
                Some(ttl) => match self.cache.set(&decision.value, true, ttl) {
                    Ok(()) => report.added += 1,
                    Err(e) => {
                        warn!(value = %decision.value, error = %e, "Failed to cache decision");
                        report.failed += 1;
                    }
                },
                None => {
                    // Already run out on the source side
                    self.cache.delete(&decision.value);
                    report.skipped += 1;
                }
            }
        }

        self.cache.purge_expired();
        report
    }

    /// Start the periodic loop on the Tokio runtime.
    ///
    /// The loop stops rescheduling once `shutdown` fires or its sender is
    /// dropped; a pull already in flight is allowed to finish.
    pub fn spawn(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<()>,
    ) -> Result<JoinHandle<()>, SyncError> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(SyncError::AlreadyRunning);
        }

        let this = Arc::clone(self);
        Ok(tokio::spawn(async move {
            info!(interval = ?this.interval, "Stream synchronizer started");

            loop {
                // Errors are already reflected in the health flag
                let _ = this.poll_once().await;

                tokio::select! {
                    _ = tokio::time::sleep(this.interval) => {}
                    _ = shutdown.changed() => break,
                }
            }

            this.running.store(false, Ordering::Release);
            info!("Stream synchronizer stopped");
        }))
    }
}
