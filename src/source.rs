//! Client for the decision source's HTTP API.

use crate::config::SourceConfig;
use crate::decision::{parse_decisions, Decision, StreamDiff};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Header carrying the bouncer API key.
pub const API_KEY_HEADER: &str = "X-Api-Key";

const DECISIONS_PATH: &str = "v1/decisions";
const STREAM_PATH: &str = "v1/decisions/stream";

const MAX_IDLE_CONNECTIONS: usize = 10;
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Error talking to the decision source.
#[derive(Debug, Error)]
pub enum SourceError {
    /// Transport failure or timeout.
    #[error("decision source unreachable: {0}")]
    Unreachable(#[source] reqwest::Error),

    /// The source answered with a non-2xx status (403 for a bad API key).
    #[error("decision source rejected the request: HTTP {status}")]
    Rejected { status: StatusCode },

    /// Body could not be read or decoded.
    #[error("malformed response from decision source: {0}")]
    MalformedResponse(String),

    /// The HTTP client could not be built.
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

impl From<reqwest::Error> for SourceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            SourceError::Unreachable(e)
        } else if e.is_decode() || e.is_body() {
            SourceError::MalformedResponse(e.to_string())
        } else {
            SourceError::Unreachable(e)
        }
    }
}

/// Point and stream queries against the decision source.
#[async_trait]
pub trait DecisionSource: Send + Sync {
    /// Active ban decisions for a single IP.
    async fn decisions_for_ip(&self, ip: &str) -> Result<Vec<Decision>, SourceError>;

    /// Changes since the last stream call. `startup` asks for the full set.
    async fn stream(&self, startup: bool) -> Result<StreamDiff, SourceError>;
}

/// `DecisionSource` backed by the CrowdSec-compatible local API.
pub struct LapiClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl LapiClient {
    pub fn new(config: &SourceConfig) -> Result<Self, SourceError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .pool_max_idle_per_host(MAX_IDLE_CONNECTIONS)
            .pool_idle_timeout(IDLE_TIMEOUT)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(SourceError::Client)?;

        Ok(Self {
            client,
            base_url: format!("{}://{}", config.scheme, config.host.trim_end_matches('/')),
            api_key: config.api_key.clone(),
        })
    }

    async fn get(&self, path: &str, query: &[(&str, &str)]) -> Result<Vec<u8>, SourceError> {
        let url = format!("{}/{}", self.base_url, path);

        debug!(url = %url, query = ?query, "Querying decision source");

        let response = self
            .client
            .get(&url)
            .query(query)
            .header(API_KEY_HEADER, &self.api_key)
            .header("Accept", "application/json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Rejected { status });
        }

        let body = response.bytes().await?;
        Ok(body.to_vec())
    }
}

#[async_trait]
impl DecisionSource for LapiClient {
    async fn decisions_for_ip(&self, ip: &str) -> Result<Vec<Decision>, SourceError> {
        let body = self
            .get(DECISIONS_PATH, &[("type", "ban"), ("ip", ip)])
            .await?;

        let decisions = parse_decisions(&body)
            .map_err(|e| SourceError::MalformedResponse(format!("decision list: {}", e)))?;

        debug!(ip = %ip, decisions = decisions.len(), "Decision source answered");
        Ok(decisions)
    }

    async fn stream(&self, startup: bool) -> Result<StreamDiff, SourceError> {
        let startup = if startup { "true" } else { "false" };
        let body = self.get(STREAM_PATH, &[("startup", startup)]).await?;

        let diff: StreamDiff = serde_json::from_slice(&body)
            .map_err(|e| SourceError::MalformedResponse(format!("stream: {}", e)))?;

        debug!(
            new = diff.new.len(),
            deleted = diff.deleted.len(),
            startup = %startup,
            "Decision stream received"
        );
        Ok(diff)
    }
}
