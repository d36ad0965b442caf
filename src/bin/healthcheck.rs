//! Container health check: pings the bouncer's liveness route.
//!
//! Exits 0 when `GET http://127.0.0.1:$PORT/api/v1/ping` answers 200,
//! 1 otherwise. `PORT` defaults to 8080 and the request timeout to
//! `HEALTH_CHECKER_TIMEOUT_DURATION` (duration text, default `2s`).

use anyhow::{anyhow, Context, Result};
use crowdsec_traefik_bouncer::duration::parse_duration;
use std::process::ExitCode;
use std::time::Duration;

const DEFAULT_PORT: &str = "8080";
const DEFAULT_TIMEOUT: &str = "2s";
const TIMEOUT_VAR: &str = "HEALTH_CHECKER_TIMEOUT_DURATION";

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_timeout(text: &str) -> Result<Duration> {
    let parsed = parse_duration(text)
        .with_context(|| format!("parsing {} value {:?}", TIMEOUT_VAR, text))?;
    parsed
        .to_positive()
        .ok_or_else(|| anyhow!("{} must be positive, got {:?}", TIMEOUT_VAR, text))
}

async fn check() -> Result<bool> {
    let port = env_or("PORT", DEFAULT_PORT);
    let timeout = parse_timeout(&env_or(TIMEOUT_VAR, DEFAULT_TIMEOUT))?;

    let client = reqwest::Client::builder().timeout(timeout).build()?;

    let url = format!("http://127.0.0.1:{}/api/v1/ping", port);
    let response = client
        .get(&url)
        .send()
        .await
        .with_context(|| format!("requesting {}", url))?;

    Ok(response.status() == reqwest::StatusCode::OK)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    match check().await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("health check failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
