//! Health, readiness, version and metrics endpoints
//!
//! - `/health`: liveness, 200 whenever the process is serving
//! - `/ready`: readiness, 200 only while the store answers a ping

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use serde::Serialize;
use tracing::warn;

use super::{error_response, json_response};
use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub service: String,
    pub version: &'static str,
    pub backend: &'static str,
    /// Uptime in seconds
    pub uptime: u64,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub ready: bool,
    pub backend: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct VersionResponse {
    pub version: &'static str,
    pub git_commit: &'static str,
    pub git_commit_full: &'static str,
    pub build_timestamp: &'static str,
}

/// GET /health
pub fn health_check(state: &AppState) -> Response<Full<Bytes>> {
    json_response(
        StatusCode::OK,
        &HealthResponse {
            healthy: true,
            service: state.config.service_name.clone(),
            version: env!("CARGO_PKG_VERSION"),
            backend: state.db.backend().as_str(),
            uptime: state.started_at.elapsed().as_secs(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        },
    )
}

/// GET /ready
pub async fn readiness_check(state: &AppState) -> Response<Full<Bytes>> {
    let backend = state.db.backend().as_str();
    match state.db.ping().await {
        Ok(()) => json_response(
            StatusCode::OK,
            &ReadyResponse {
                ready: true,
                backend,
                error: None,
            },
        ),
        Err(e) => {
            warn!(backend, error = %e, "Readiness check failed");
            json_response(
                StatusCode::SERVICE_UNAVAILABLE,
                &ReadyResponse {
                    ready: false,
                    backend,
                    error: Some(e.class().to_string()),
                },
            )
        }
    }
}

/// GET /version
pub fn version_info() -> Response<Full<Bytes>> {
    json_response(
        StatusCode::OK,
        &VersionResponse {
            version: env!("CARGO_PKG_VERSION"),
            git_commit: env!("GIT_COMMIT_SHORT"),
            git_commit_full: env!("GIT_COMMIT_FULL"),
            build_timestamp: env!("BUILD_TIMESTAMP"),
        },
    )
}

/// GET /metrics
pub fn metrics(state: &AppState) -> Response<Full<Bytes>> {
    let Some(handle) = &state.metrics else {
        return error_response(StatusCode::NOT_FOUND, "metrics recorder not installed");
    };

    let mut response = Response::new(Full::new(Bytes::from(handle.render())));
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4"),
    );
    response
}

#[cfg(test)]
mod tests {
    use crate::server::http::tests::{send, test_state};
    use bytes::Bytes;
    use http_body_util::Full;
    use hyper::{Method, Request, StatusCode};

    fn get(uri: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Full::new(Bytes::new()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_backend() {
        let state = test_state().await;
        let (status, body) = send(&state, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["healthy"], true);
        assert_eq!(body["backend"], "sql");
        assert_eq!(body["service"], "portcullis");
    }

    #[tokio::test]
    async fn test_ready_follows_store() {
        let state = test_state().await;
        let (status, body) = send(&state, get("/ready")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ready"], true);

        state.db.disconnect().await.unwrap();
        let (status, body) = send(&state, get("/ready")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["ready"], false);
    }

    #[tokio::test]
    async fn test_version_info() {
        let state = test_state().await;
        let (status, body) = send(&state, get("/version")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
        assert!(body["git_commit"].is_string());
    }

    #[tokio::test]
    async fn test_metrics_without_recorder_is_404() {
        let state = test_state().await;
        let (status, _) = send(&state, get("/metrics")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
