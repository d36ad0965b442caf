//! Authorization engine: decides whether a client IP may pass.
//!
//! The engine combines the decision cache, the decision source and the
//! stream synchronizer's health according to the configured [`Mode`]:
//!
//! - `none` asks the decision source on every call and never caches.
//! - `live` answers from the cache and fills it from the source on a miss.
//! - `stream` answers from the cache only; a miss counts as "not banned"
//!   while the synchronizer is healthy and as "banned" otherwise.
//!
//! Errors from the source are returned to the caller, which must deny the
//! request. The engine never turns a failure into an allow.

use crate::cache::DecisionCache;
use crate::config::Mode;
use crate::decision::Decision;
use crate::metrics::{Metrics, Outcome};
use crate::source::{DecisionSource, SourceError};
use crate::sync::SyncState;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Everything the engine needs, built once at startup.
pub struct BouncerDeps {
    pub mode: Mode,
    pub cache: Arc<DecisionCache>,
    pub source: Arc<dyn DecisionSource>,
    pub sync_state: Arc<SyncState>,
    /// TTL of clean verdicts cached in live mode.
    pub default_allow_ttl: Duration,
    /// TTL of bans whose duration cannot be parsed.
    pub ban_fallback_ttl: Duration,
    pub metrics: Arc<Metrics>,
}

pub struct Bouncer {
    mode: Mode,
    cache: Arc<DecisionCache>,
    source: Arc<dyn DecisionSource>,
    sync_state: Arc<SyncState>,
    default_allow_ttl: Duration,
    ban_fallback_ttl: Duration,
    metrics: Arc<Metrics>,
}

impl Bouncer {
    pub fn new(deps: BouncerDeps) -> Self {
        Self {
            mode: deps.mode,
            cache: deps.cache,
            source: deps.source,
            sync_state: deps.sync_state,
            default_allow_ttl: deps.default_allow_ttl,
            ban_fallback_ttl: deps.ban_fallback_ttl,
            metrics: deps.metrics,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn cache(&self) -> &Arc<DecisionCache> {
        &self.cache
    }

    pub fn sync_state(&self) -> &Arc<SyncState> {
        &self.sync_state
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Decide whether `ip` is allowed through.
    ///
    /// `Ok(false)` and `Err(_)` must both be answered with the ban response.
    pub async fn authorize(&self, ip: &str) -> Result<bool, SourceError> {
        let result = match self.mode {
            Mode::None => self.authorize_direct(ip).await,
            Mode::Live => self.authorize_live(ip).await,
            Mode::Stream => Ok(self.authorize_stream(ip)),
        };

        let outcome = match &result {
            Ok(true) => Outcome::Allowed,
            Ok(false) => Outcome::Banned,
            Err(_) => Outcome::Error,
        };
        self.metrics.record_decision(self.mode, outcome);

        result
    }

    /// Ask the decision source about `ip`, bypassing the cache and metrics.
    pub async fn query_source(&self, ip: &str) -> Result<bool, SourceError> {
        self.authorize_direct(ip).await
    }

    async fn authorize_direct(&self, ip: &str) -> Result<bool, SourceError> {
        let decisions = self.source.decisions_for_ip(ip).await?;
        Ok(decisions.is_empty())
    }

    async fn authorize_live(&self, ip: &str) -> Result<bool, SourceError> {
        if let Some(cached) = self.lookup(ip) {
            return Ok(!cached);
        }

        let decisions = self.source.decisions_for_ip(ip).await?;

        if decisions.is_empty() {
            debug!(ip = %ip, "No decision, caching allow");
            self.remember(ip, false, self.default_allow_ttl);
            return Ok(true);
        }

        match longest_ttl(&decisions, self.ban_fallback_ttl) {
            Some(ttl) => {
                debug!(ip = %ip, decisions = decisions.len(), ttl = ?ttl, "Ban decision, caching ban");
                self.remember(ip, true, ttl);
            }
            None => {
                debug!(ip = %ip, "Ban decisions report no time left, not caching");
            }
        }
        Ok(false)
    }

    fn authorize_stream(&self, ip: &str) -> bool {
        if let Some(banned) = self.lookup(ip) {
            return !banned;
        }

        // A miss is only meaningful while the mirror is in sync
        let healthy = self.sync_state.is_healthy();
        if !healthy {
            debug!(ip = %ip, "Cache miss while stream is unhealthy, denying");
        }
        healthy
    }

    /// Cached `banned` flag for `ip`, if any.
    fn lookup(&self, ip: &str) -> Option<bool> {
        let cached = self.cache.get(ip).map(|entry| entry.banned);
        self.metrics.record_cache_lookup(cached.is_some());
        cached
    }

    fn remember(&self, ip: &str, banned: bool, ttl: Duration) {
        if let Err(e) = self.cache.set(ip, banned, ttl) {
            warn!(ip = %ip, error = %e, "Failed to cache verdict");
        }
    }
}

/// Longest time any of `decisions` still has to run.
fn longest_ttl(decisions: &[Decision], fallback: Duration) -> Option<Duration> {
    decisions.iter().filter_map(|d| d.ttl(fallback)).max()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::StreamDiff;
    use crate::sync::StreamSynchronizer;
    use crate::test_support::{ban, Reply, ScriptedSource};

    const ALLOW_TTL: Duration = Duration::from_secs(300);
    const FALLBACK: Duration = Duration::from_secs(4 * 3600);

    fn bouncer(mode: Mode, source: &Arc<ScriptedSource>) -> Bouncer {
        Bouncer::new(BouncerDeps {
            mode,
            cache: Arc::new(DecisionCache::new(1000, 1024 * 1024, 4)),
            source: source.clone(),
            sync_state: Arc::new(SyncState::new()),
            default_allow_ttl: ALLOW_TTL,
            ban_fallback_ttl: FALLBACK,
            metrics: Arc::new(Metrics::new()),
        })
    }

    fn assert_ttl_close(actual: Duration, expected: Duration) {
        assert!(actual <= expected, "{:?} > {:?}", actual, expected);
        assert!(
            actual > expected - Duration::from_secs(5),
            "{:?} too far below {:?}",
            actual,
            expected
        );
    }

    #[tokio::test]
    async fn test_none_mode_queries_source_every_time() {
        let source = Arc::new(ScriptedSource::new());
        source.push_point(Reply::Ok(vec![ban("1.2.3.4", "4h0m0s")]));
        source.push_point(Reply::Ok(vec![]));
        let bouncer = bouncer(Mode::None, &source);

        assert!(!bouncer.authorize("1.2.3.4").await.unwrap());
        assert!(bouncer.authorize("1.2.3.4").await.unwrap());
        assert!(bouncer.authorize("1.2.3.4").await.unwrap());

        assert_eq!(source.point_calls(), 3);
        assert!(bouncer.cache().is_empty());
    }

    #[tokio::test]
    async fn test_none_mode_error_is_returned() {
        let source = Arc::new(ScriptedSource::new());
        source.push_point(Reply::Forbidden);
        let bouncer = bouncer(Mode::None, &source);

        let err = bouncer.authorize("1.2.3.4").await.unwrap_err();
        assert!(matches!(err, SourceError::Rejected { .. }));
        assert_eq!(bouncer.metrics().decisions(Mode::None, Outcome::Error), 1);
    }

    #[tokio::test]
    async fn test_live_mode_clean_ip_cached_with_default_ttl() {
        let source = Arc::new(ScriptedSource::new());
        let bouncer = bouncer(Mode::Live, &source);

        assert!(bouncer.authorize("8.8.8.8").await.unwrap());

        let entry = bouncer.cache().get("8.8.8.8").unwrap();
        assert!(!entry.banned);
        assert_ttl_close(entry.remaining(), ALLOW_TTL);

        // Second call is served from cache
        assert!(bouncer.authorize("8.8.8.8").await.unwrap());
        assert_eq!(source.point_calls(), 1);
        assert_eq!(bouncer.metrics().cache_hits(), 1);
    }

    #[tokio::test]
    async fn test_live_mode_ban_cached_with_decision_duration() {
        let source = Arc::new(ScriptedSource::new());
        source.push_point(Reply::Ok(vec![ban("1.2.3.4", "4h0m0s")]));
        let bouncer = bouncer(Mode::Live, &source);

        assert!(!bouncer.authorize("1.2.3.4").await.unwrap());

        let entry = bouncer.cache().get("1.2.3.4").unwrap();
        assert!(entry.banned);
        assert_ttl_close(entry.remaining(), Duration::from_secs(14_400));

        assert!(!bouncer.authorize("1.2.3.4").await.unwrap());
        assert_eq!(source.point_calls(), 1);
    }

    #[tokio::test]
    async fn test_live_mode_uses_longest_decision() {
        let source = Arc::new(ScriptedSource::new());
        source.push_point(Reply::Ok(vec![ban("1.2.3.4", "10m"), ban("1.2.3.4", "2h")]));
        let bouncer = bouncer(Mode::Live, &source);

        assert!(!bouncer.authorize("1.2.3.4").await.unwrap());
        assert_ttl_close(
            bouncer.cache().get("1.2.3.4").unwrap().remaining(),
            Duration::from_secs(7200),
        );
    }

    #[tokio::test]
    async fn test_live_mode_unparsable_duration_uses_fallback() {
        let source = Arc::new(ScriptedSource::new());
        source.push_point(Reply::Ok(vec![ban("1.2.3.4", "")]));
        let bouncer = bouncer(Mode::Live, &source);

        assert!(!bouncer.authorize("1.2.3.4").await.unwrap());
        assert_ttl_close(bouncer.cache().get("1.2.3.4").unwrap().remaining(), FALLBACK);
    }

    #[tokio::test]
    async fn test_live_mode_expired_decision_still_denies() {
        let source = Arc::new(ScriptedSource::new());
        source.push_point(Reply::Ok(vec![ban("1.2.3.4", "-1s")]));
        let bouncer = bouncer(Mode::Live, &source);

        assert!(!bouncer.authorize("1.2.3.4").await.unwrap());
        assert!(bouncer.cache().get("1.2.3.4").is_none());
    }

    #[tokio::test]
    async fn test_live_mode_error_not_cached() {
        let source = Arc::new(ScriptedSource::new());
        source.push_point(Reply::Malformed);
        let bouncer = bouncer(Mode::Live, &source);

        assert!(matches!(
            bouncer.authorize("1.2.3.4").await,
            Err(SourceError::MalformedResponse(_))
        ));
        assert!(bouncer.cache().is_empty());

        // Next call asks the source again
        assert!(bouncer.authorize("1.2.3.4").await.unwrap());
        assert_eq!(source.point_calls(), 2);
    }

    #[tokio::test]
    async fn test_stream_mode_fails_closed_until_healthy() {
        let source = Arc::new(ScriptedSource::new());
        source.push_stream(Reply::Ok(StreamDiff {
            new: vec![ban("1.2.3.4", "1h")],
            deleted: vec![],
        }));
        let bouncer = bouncer(Mode::Stream, &source);

        // Unhealthy: a miss cannot be trusted
        assert!(!bouncer.authorize("9.9.9.9").await.unwrap());

        let sync = StreamSynchronizer::new(
            source.clone(),
            bouncer.cache().clone(),
            bouncer.sync_state().clone(),
            Duration::from_secs(60),
            FALLBACK,
        );
        sync.poll_once().await.unwrap();

        assert!(bouncer.authorize("9.9.9.9").await.unwrap());
        assert!(!bouncer.authorize("1.2.3.4").await.unwrap());

        // Next pull fails: misses deny again, cached bans still hold
        assert!(sync.poll_once().await.is_err());
        assert!(!bouncer.authorize("9.9.9.9").await.unwrap());
        assert!(!bouncer.authorize("1.2.3.4").await.unwrap());

        assert_eq!(source.point_calls(), 0);
    }

    #[tokio::test]
    async fn test_stream_mode_cached_allow_honoured_while_unhealthy() {
        let source = Arc::new(ScriptedSource::new());
        let bouncer = bouncer(Mode::Stream, &source);
        bouncer.cache().set("10.0.0.1", false, Duration::from_secs(60)).unwrap();

        assert!(bouncer.authorize("10.0.0.1").await.unwrap());
        assert_eq!(source.point_calls(), 0);
    }

    #[test]
    fn test_longest_ttl() {
        assert_eq!(longest_ttl(&[], FALLBACK), None);
        assert_eq!(
            longest_ttl(&[ban("a", "1m"), ban("a", "-1m"), ban("a", "30s")], FALLBACK),
            Some(Duration::from_secs(60))
        );
    }
}
