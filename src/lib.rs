//! Forward-auth bouncer for reverse proxies.
//!
//! Tells the proxy whether a client IP must be blocked, based on ban
//! decisions published by a CrowdSec-compatible decision source.
//!
//! # Features
//!
//! - **Three modes** - `none` (ask the source every time), `live` (cache
//!   verdicts from point queries) and `stream` (mirror the whole decision
//!   set through periodic incremental pulls)
//! - **Sharded TTL cache** - bounded by entry count and memory, evicting the
//!   entries closest to expiry first
//! - **Fail-closed** - any error talking to the source denies the request;
//!   in stream mode a cache miss denies while the mirror is out of sync
//! - **Health and metrics** - readiness check and Prometheus counters
//!
//! # Example Configuration
//!
//! ```yaml
//! bouncer:
//!   mode: stream
//!   stream_interval_seconds: 60
//!
//! source:
//!   host: "crowdsec:8080"
//!   api_key: "${CROWDSEC_BOUNCER_API_KEY}"
//!
//! response:
//!   ban_status_code: 403
//! ```

pub mod cache;
pub mod config;
pub mod decision;
pub mod duration;
pub mod engine;
pub mod health;
pub mod metrics;
pub mod server;
pub mod source;
pub mod sync;

#[cfg(test)]
pub(crate) mod test_support;

pub use cache::DecisionCache;
pub use config::{Config, Mode};
pub use engine::{Bouncer, BouncerDeps};
pub use health::HealthReporter;
pub use source::{DecisionSource, LapiClient, SourceError};
pub use sync::{StreamSynchronizer, SyncState};
