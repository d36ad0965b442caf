//! Configuration types for the bouncer.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Decision engine settings.
    #[serde(default)]
    pub bouncer: BouncerSettings,

    /// Decision source connection.
    pub source: SourceConfig,

    /// Local decision cache bounds.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Response sent to the proxy for banned clients.
    #[serde(default)]
    pub response: ResponseConfig,

    /// Client IP extraction from forwarded headers.
    #[serde(default)]
    pub ip_extraction: IpExtractionConfig,

    /// HTTP listener.
    #[serde(default)]
    pub server: ServerConfig,
}

/// How the engine sources its decisions.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Query the decision source on every request, no cache.
    #[default]
    None,
    /// Query on cache miss and cache the verdict.
    Live,
    /// Mirror the decision set through periodic stream pulls.
    Stream,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::None => "none",
            Mode::Live => "live",
            Mode::Stream => "stream",
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decision engine settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BouncerSettings {
    #[serde(default)]
    pub mode: Mode,

    /// How long a clean verdict is cached in live mode.
    #[serde(default = "default_allow_ttl")]
    pub default_allow_ttl_seconds: u64,

    /// Delay between two stream pulls.
    #[serde(default = "default_stream_interval")]
    pub stream_interval_seconds: u64,

    /// TTL applied to bans whose duration cannot be parsed.
    #[serde(default = "default_ban_fallback_ttl")]
    pub ban_fallback_ttl_seconds: u64,
}

impl Default for BouncerSettings {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            default_allow_ttl_seconds: default_allow_ttl(),
            stream_interval_seconds: default_stream_interval(),
            ban_fallback_ttl_seconds: default_ban_fallback_ttl(),
        }
    }
}

impl BouncerSettings {
    pub fn default_allow_ttl(&self) -> Duration {
        Duration::from_secs(self.default_allow_ttl_seconds)
    }

    pub fn stream_interval(&self) -> Duration {
        Duration::from_secs(self.stream_interval_seconds)
    }

    pub fn ban_fallback_ttl(&self) -> Duration {
        Duration::from_secs(self.ban_fallback_ttl_seconds)
    }
}

fn default_allow_ttl() -> u64 {
    300
}

fn default_stream_interval() -> u64 {
    60
}

// Default CrowdSec ban duration.
fn default_ban_fallback_ttl() -> u64 {
    4 * 3600
}

/// Decision source connection settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceConfig {
    /// `http` or `https`.
    #[serde(default = "default_scheme")]
    pub scheme: String,

    /// Host and optional port, e.g. `crowdsec:8080`.
    pub host: String,

    /// Bouncer API key (supports ${ENV_VAR} syntax).
    pub api_key: String,

    /// Request timeout in milliseconds.
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,
}

fn default_scheme() -> String {
    "http".to_string()
}

fn default_timeout() -> u64 {
    5000
}

/// Cache bounds.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    #[serde(default = "default_max_memory")]
    pub max_memory_bytes: usize,

    /// Number of independently locked partitions.
    #[serde(default = "default_shards")]
    pub shards: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            max_memory_bytes: default_max_memory(),
            shards: default_shards(),
        }
    }
}

fn default_max_entries() -> usize {
    100_000
}

fn default_max_memory() -> usize {
    100 * 1024 * 1024
}

fn default_shards() -> usize {
    16
}

/// Ban response settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResponseConfig {
    #[serde(default = "default_ban_status")]
    pub ban_status_code: u16,

    #[serde(default = "default_ban_body")]
    pub ban_body: String,
}

impl Default for ResponseConfig {
    fn default() -> Self {
        Self {
            ban_status_code: default_ban_status(),
            ban_body: default_ban_body(),
        }
    }
}

fn default_ban_status() -> u16 {
    403
}

fn default_ban_body() -> String {
    "Forbidden".to_string()
}

/// IP extraction configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IpExtractionConfig {
    /// Headers to check for client IP, in order of preference.
    #[serde(default = "default_ip_headers")]
    pub headers: Vec<String>,

    /// Use first IP from X-Forwarded-For (true) or last IP (false).
    #[serde(default = "default_true")]
    pub use_first_ip: bool,
}

impl Default for IpExtractionConfig {
    fn default() -> Self {
        Self {
            headers: default_ip_headers(),
            use_first_ip: true,
        }
    }
}

fn default_ip_headers() -> Vec<String> {
    vec!["x-real-ip".to_string(), "x-forwarded-for".to_string()]
}

fn default_true() -> bool {
    true
}

/// HTTP listener settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML text, expanding ${VAR} references.
    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let expanded = expand_env_vars(content)?;
        let config: Config = serde_yaml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.source.host.trim().is_empty() {
            anyhow::bail!("source.host must not be empty");
        }

        if self.source.api_key.is_empty() {
            anyhow::bail!("source.api_key must not be empty");
        }

        if !matches!(self.source.scheme.as_str(), "http" | "https") {
            anyhow::bail!(
                "source.scheme must be 'http' or 'https', got '{}'",
                self.source.scheme
            );
        }

        if self.source.timeout_ms == 0 {
            anyhow::bail!("source.timeout_ms must be greater than 0");
        }

        if !(100..=599).contains(&self.response.ban_status_code) {
            anyhow::bail!(
                "response.ban_status_code ({}) must be a valid HTTP status between 100 and 599",
                self.response.ban_status_code
            );
        }

        let durations = [
            ("bouncer.default_allow_ttl_seconds", self.bouncer.default_allow_ttl_seconds),
            ("bouncer.stream_interval_seconds", self.bouncer.stream_interval_seconds),
            ("bouncer.ban_fallback_ttl_seconds", self.bouncer.ban_fallback_ttl_seconds),
        ];
        for (name, value) in durations {
            if value == 0 {
                anyhow::bail!("{} must be greater than 0", name);
            }
        }

        if self.cache.max_entries == 0 {
            anyhow::bail!("cache.max_entries must be greater than 0");
        }

        let min_memory = crate::cache::min_memory_bytes(self.cache.shards);
        if self.cache.max_memory_bytes < min_memory {
            anyhow::bail!(
                "cache.max_memory_bytes ({}) must be at least {} for {} shards",
                self.cache.max_memory_bytes,
                min_memory,
                self.cache.shards
            );
        }

        if self.ip_extraction.headers.is_empty() {
            anyhow::bail!("ip_extraction.headers must list at least one header");
        }

        Ok(())
    }

    /// Generate example configuration YAML.
    pub fn example() -> String {
        r#"# CrowdSec Traefik Bouncer Configuration

bouncer:
  mode: live                     # none, live or stream
  default_allow_ttl_seconds: 300 # live mode: how long a clean IP stays cached
  stream_interval_seconds: 60    # stream mode: delay between two pulls
  ban_fallback_ttl_seconds: 14400

# Decision source (CrowdSec local API)
source:
  scheme: http
  host: "crowdsec:8080"
  api_key: "${CROWDSEC_BOUNCER_API_KEY}"  # Use environment variable
  timeout_ms: 5000

cache:
  max_entries: 100000
  max_memory_bytes: 104857600
  shards: 16

# Response returned to the proxy for banned or unverifiable clients
response:
  ban_status_code: 403
  ban_body: "Forbidden"

ip_extraction:
  headers:
    - "x-real-ip"
    - "x-forwarded-for"
  use_first_ip: true             # Use first IP from X-Forwarded-For

server:
  listen: "0.0.0.0:8080"
"#
        .to_string()
    }
}

/// Expand environment variables in the format ${VAR_NAME}.
fn expand_env_vars(content: &str) -> anyhow::Result<String> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}")?;

    let expanded = re.replace_all(content, |caps: &regex::Captures<'_>| {
        std::env::var(&caps[1]).unwrap_or_default()
    });

    Ok(expanded.into_owned())
}
