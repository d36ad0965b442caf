//! HTTP surface consumed by the reverse proxy.
//!
//! Routes:
//! - `GET /api/v1/forwardAuth` - forward-auth check for the client IP
//! - `GET /api/v1/healthz` - readiness check
//! - `GET /api/v1/ping` - liveness check
//! - `GET /api/v1/metrics` - Prometheus metrics

use crate::config::{IpExtractionConfig, ResponseConfig};
use crate::engine::Bouncer;
use crate::health::HealthReporter;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

const METRICS_CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

#[derive(Clone)]
pub struct AppState {
    bouncer: Arc<Bouncer>,
    health: HealthReporter,
    ip_extraction: Arc<IpExtractionConfig>,
    ban_status: StatusCode,
    ban_body: Arc<str>,
}

impl AppState {
    pub fn new(
        bouncer: Arc<Bouncer>,
        response: &ResponseConfig,
        ip_extraction: IpExtractionConfig,
    ) -> Self {
        let ban_status = StatusCode::from_u16(response.ban_status_code).unwrap_or_else(|_| {
            warn!(
                code = response.ban_status_code,
                "Invalid ban status code, falling back to 403"
            );
            StatusCode::FORBIDDEN
        });

        Self {
            health: HealthReporter::new(bouncer.clone()),
            bouncer,
            ip_extraction: Arc::new(ip_extraction),
            ban_status,
            ban_body: Arc::from(response.ban_body.as_str()),
        }
    }

    fn ban_response(&self) -> Response {
        (self.ban_status, self.ban_body.to_string()).into_response()
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/forwardAuth", get(forward_auth))
        .route("/api/v1/healthz", get(healthz))
        .route("/api/v1/ping", get(ping))
        .route("/api/v1/metrics", get(metrics))
        .with_state(state)
}

/// Extract client IP from request headers.
pub fn extract_client_ip(headers: &HeaderMap, config: &IpExtractionConfig) -> Option<IpAddr> {
    for header_name in &config.headers {
        let Some(value) = headers
            .get(header_name.as_str())
            .and_then(|v| v.to_str().ok())
        else {
            continue;
        };

        let ip_str = if config.use_first_ip {
            // X-Forwarded-For: client, proxy1, proxy2
            value.split(',').next()
        } else {
            // Use the last IP (closest proxy)
            value.split(',').last()
        };

        if let Some(Ok(ip)) = ip_str.map(|s| s.trim().parse::<IpAddr>()) {
            return Some(ip);
        }
    }
    None
}

async fn forward_auth(State(state): State<AppState>, headers: HeaderMap) -> Response {
    state.bouncer.metrics().record_processed_ip();

    let Some(ip) = extract_client_ip(&headers, &state.ip_extraction) else {
        debug!(headers = ?state.ip_extraction.headers, "No valid client IP in request headers");
        return state.ban_response();
    };
    let ip = ip.to_string();

    match state.bouncer.authorize(&ip).await {
        Ok(true) => {
            debug!(ip = %ip, "Allowing request");
            StatusCode::OK.into_response()
        }
        Ok(false) => {
            info!(ip = %ip, mode = %state.bouncer.mode(), "Blocking request");
            state.ban_response()
        }
        Err(e) => {
            warn!(ip = %ip, error = %e, "Decision lookup failed, blocking request");
            state.ban_response()
        }
    }
}

async fn healthz(State(state): State<AppState>) -> StatusCode {
    if state.health.is_healthy().await {
        StatusCode::OK
    } else {
        StatusCode::FORBIDDEN
    }
}

async fn ping() -> &'static str {
    "pong"
}

async fn metrics(State(state): State<AppState>) -> Response {
    let metrics = state.bouncer.metrics();
    metrics.set_cache_entries(state.bouncer.cache().len());

    match metrics.render() {
        Ok(body) => ([(header::CONTENT_TYPE, METRICS_CONTENT_TYPE)], body).into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::DecisionCache;
    use crate::config::Mode;
    use crate::engine::BouncerDeps;
    use crate::metrics::Metrics;
    use crate::sync::SyncState;
    use crate::test_support::{ban, Reply, ScriptedSource};
    use axum::http::{HeaderName, HeaderValue};
    use axum_test::TestServer;
    use std::time::Duration;

    fn x_real_ip() -> HeaderName {
        HeaderName::from_static("x-real-ip")
    }

    fn test_server(mode: Mode, source: &Arc<ScriptedSource>, response: ResponseConfig) -> TestServer {
        let bouncer = Arc::new(Bouncer::new(BouncerDeps {
            mode,
            cache: Arc::new(DecisionCache::new(100, 64 * 1024, 1)),
            source: source.clone(),
            sync_state: Arc::new(SyncState::new()),
            default_allow_ttl: Duration::from_secs(300),
            ban_fallback_ttl: Duration::from_secs(3600),
            metrics: Arc::new(Metrics::new()),
        }));
        let state = AppState::new(bouncer, &response, IpExtractionConfig::default());
        TestServer::new(create_router(state)).unwrap()
    }

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn test_extract_client_ip_xff() {
        let config = IpExtractionConfig {
            headers: vec!["x-forwarded-for".to_string()],
            use_first_ip: true,
        };
        let headers = headers(&[("x-forwarded-for", "1.2.3.4, 5.6.7.8, 9.10.11.12")]);

        let ip = extract_client_ip(&headers, &config);
        assert_eq!(ip, Some("1.2.3.4".parse().unwrap()));
    }

    #[test]
    fn test_extract_client_ip_xff_last() {
        let config = IpExtractionConfig {
            headers: vec!["x-forwarded-for".to_string()],
            use_first_ip: false,
        };
        let headers = headers(&[("x-forwarded-for", "1.2.3.4, 5.6.7.8, 9.10.11.12")]);

        let ip = extract_client_ip(&headers, &config);
        assert_eq!(ip, Some("9.10.11.12".parse().unwrap()));
    }

    #[test]
    fn test_extract_client_ip_priority() {
        let config = IpExtractionConfig::default();
        let headers = headers(&[("x-forwarded-for", "1.2.3.4"), ("x-real-ip", "5.6.7.8")]);

        // x-real-ip is first in the default list
        let ip = extract_client_ip(&headers, &config);
        assert_eq!(ip, Some("5.6.7.8".parse().unwrap()));
    }

    #[test]
    fn test_extract_client_ip_falls_through_invalid() {
        let config = IpExtractionConfig::default();
        let headers = headers(&[("x-real-ip", "not-an-ip"), ("x-forwarded-for", "2001:db8::1")]);

        let ip = extract_client_ip(&headers, &config);
        assert_eq!(ip, Some("2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn test_extract_client_ip_none() {
        let ip = extract_client_ip(&HeaderMap::new(), &IpExtractionConfig::default());
        assert!(ip.is_none());
    }

    #[tokio::test]
    async fn test_ping() {
        let server = test_server(Mode::None, &Arc::new(ScriptedSource::new()), ResponseConfig::default());

        let response = server.get("/api/v1/ping").await;
        response.assert_status_ok();
        assert_eq!(response.text(), "pong");
    }

    #[tokio::test]
    async fn test_forward_auth_missing_ip() {
        let source = Arc::new(ScriptedSource::new());
        let server = test_server(Mode::None, &source, ResponseConfig::default());

        let response = server.get("/api/v1/forwardAuth").await;
        response.assert_status(StatusCode::FORBIDDEN);
        assert_eq!(response.text(), "Forbidden");
        assert_eq!(source.point_calls(), 0);
    }

    #[tokio::test]
    async fn test_forward_auth_banned_ip() {
        let source = Arc::new(ScriptedSource::new());
        source.push_point(Reply::Ok(vec![ban("1.2.3.4", "4h0m0s")]));
        let server = test_server(Mode::Live, &source, ResponseConfig::default());

        let response = server
            .get("/api/v1/forwardAuth")
            .add_header(x_real_ip(), HeaderValue::from_static("1.2.3.4"))
            .await;
        response.assert_status(StatusCode::FORBIDDEN);
        assert_eq!(response.text(), "Forbidden");
    }

    #[tokio::test]
    async fn test_forward_auth_valid_ip() {
        let source = Arc::new(ScriptedSource::new());
        let server = test_server(Mode::Live, &source, ResponseConfig::default());

        let response = server
            .get("/api/v1/forwardAuth")
            .add_header(x_real_ip(), HeaderValue::from_static("127.0.0.1"))
            .await;
        response.assert_status_ok();
    }

    #[tokio::test]
    async fn test_forward_auth_source_error_uses_ban_response() {
        let source = Arc::new(ScriptedSource::new());
        source.push_point(Reply::Forbidden);
        let response_config = ResponseConfig {
            ban_status_code: 429,
            ban_body: "Too many attacks".to_string(),
        };
        let server = test_server(Mode::None, &source, response_config);

        let response = server
            .get("/api/v1/forwardAuth")
            .add_header(x_real_ip(), HeaderValue::from_static("1.2.3.4"))
            .await;
        response.assert_status(StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.text(), "Too many attacks");
    }

    #[tokio::test]
    async fn test_healthz() {
        let source = Arc::new(ScriptedSource::new());
        source.push_point(Reply::Ok(vec![]));
        source.push_point(Reply::Malformed);
        let server = test_server(Mode::None, &source, ResponseConfig::default());

        server.get("/api/v1/healthz").await.assert_status_ok();
        server
            .get("/api/v1/healthz")
            .await
            .assert_status(StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_healthz_stream_unhealthy() {
        let source = Arc::new(ScriptedSource::new());
        let server = test_server(Mode::Stream, &source, ResponseConfig::default());

        server
            .get("/api/v1/healthz")
            .await
            .assert_status(StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let source = Arc::new(ScriptedSource::new());
        let server = test_server(Mode::Live, &source, ResponseConfig::default());

        server
            .get("/api/v1/forwardAuth")
            .add_header(x_real_ip(), HeaderValue::from_static("8.8.8.8"))
            .await
            .assert_status_ok();

        let response = server.get("/api/v1/metrics").await;
        response.assert_status_ok();
        let body = response.text();
        assert!(body.contains("crowdsec_traefik_bouncer_processed_ip_total 1"));
        assert!(body.contains("crowdsec_traefik_bouncer_cache_entries 1"));
    }
}
