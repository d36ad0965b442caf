//! Prometheus metrics for the bouncer.

use crate::config::Mode;
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

const PREFIX: &str = "crowdsec_traefik_bouncer";

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct DecisionLabels {
    mode: String,
    outcome: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct PollLabels {
    result: String,
}

/// Final outcome of one authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Allowed,
    Banned,
    Error,
}

impl Outcome {
    fn as_str(&self) -> &'static str {
        match self {
            Outcome::Allowed => "allowed",
            Outcome::Banned => "banned",
            Outcome::Error => "error",
        }
    }
}

#[derive(Debug)]
pub struct Metrics {
    registry: Registry,
    processed_ips: Counter,
    decisions: Family<DecisionLabels, Counter>,
    cache_hits: Counter,
    cache_misses: Counter,
    stream_polls: Family<PollLabels, Counter>,
    cache_entries: Gauge,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix(PREFIX);

        let processed_ips = Counter::default();
        registry.register(
            "processed_ip",
            "The total number of processed IP",
            processed_ips.clone(),
        );

        let decisions = Family::<DecisionLabels, Counter>::default();
        registry.register(
            "decisions",
            "Authorization verdicts by mode and outcome",
            decisions.clone(),
        );

        let cache_hits = Counter::default();
        registry.register("cache_hits", "Lookups answered by the local cache", cache_hits.clone());

        let cache_misses = Counter::default();
        registry.register(
            "cache_misses",
            "Lookups not found in the local cache",
            cache_misses.clone(),
        );

        let stream_polls = Family::<PollLabels, Counter>::default();
        registry.register(
            "stream_polls",
            "Decision stream pulls by result",
            stream_polls.clone(),
        );

        let cache_entries = Gauge::default();
        registry.register(
            "cache_entries",
            "Entries currently held in the decision cache",
            cache_entries.clone(),
        );

        Self {
            registry,
            processed_ips,
            decisions,
            cache_hits,
            cache_misses,
            stream_polls,
            cache_entries,
        }
    }

    pub fn record_processed_ip(&self) {
        self.processed_ips.inc();
    }

    pub fn record_decision(&self, mode: Mode, outcome: Outcome) {
        self.decisions
            .get_or_create(&DecisionLabels {
                mode: mode.as_str().to_string(),
                outcome: outcome.as_str().to_string(),
            })
            .inc();
    }

    pub fn record_cache_lookup(&self, hit: bool) {
        if hit {
            self.cache_hits.inc();
        } else {
            self.cache_misses.inc();
        }
    }

    pub fn record_stream_poll(&self, success: bool) {
        let result = if success { "success" } else { "failure" };
        self.stream_polls
            .get_or_create(&PollLabels {
                result: result.to_string(),
            })
            .inc();
    }

    pub fn set_cache_entries(&self, entries: usize) {
        self.cache_entries.set(entries as i64);
    }

    pub fn processed_ips(&self) -> u64 {
        self.processed_ips.get()
    }

    pub fn decisions(&self, mode: Mode, outcome: Outcome) -> u64 {
        self.decisions
            .get_or_create(&DecisionLabels {
                mode: mode.as_str().to_string(),
                outcome: outcome.as_str().to_string(),
            })
            .get()
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.get()
    }

    pub fn cache_misses(&self) -> u64 {
        self.cache_misses.get()
    }

    /// Encode all metrics in the Prometheus text exposition format.
    pub fn render(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}
