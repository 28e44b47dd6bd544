//! HTTP server loop and request dispatch
//!
//! One task per connection (hyper http1). Every request is routed by method
//! and path and runs under the configured request timeout, so a stalled store
//! call is abandoned rather than leaked.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Body;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use super::rate_limit::{spawn_cleanup_task, RateLimiter};
use crate::config::ServiceConfig;
use crate::db::DbClient;
use crate::routes::{auth_routes, error_response, health};
use crate::services::UserService;
use crate::types::PortcullisError;

const LIMITER_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Shared application state
pub struct AppState {
    pub config: ServiceConfig,
    pub db: Arc<dyn DbClient>,
    pub users: Arc<UserService>,
    pub login_limiter: Arc<RateLimiter>,
    /// Present when the Prometheus recorder was installed
    pub metrics: Option<PrometheusHandle>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        config: ServiceConfig,
        db: Arc<dyn DbClient>,
        users: Arc<UserService>,
        metrics: Option<PrometheusHandle>,
    ) -> Self {
        let login_limiter = Arc::new(RateLimiter::new(
            Duration::from_millis(config.rate_limiter.interval_ms),
            config.rate_limiter.limit,
        ));
        Self {
            config,
            db,
            users,
            login_limiter,
            metrics,
            started_at: Instant::now(),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.config.request_timeout_ms)
    }
}

/// Bind the configured address and serve until `shutdown` resolves.
pub async fn run<F>(state: Arc<AppState>, shutdown: F) -> Result<(), PortcullisError>
where
    F: Future<Output = ()>,
{
    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("portcullis listening on http://{}", listener.local_addr()?);

    spawn_cleanup_task(Arc::clone(&state.login_limiter), LIMITER_CLEANUP_INTERVAL);

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown signal received, no longer accepting connections");
                break;
            }
            accepted = listener.accept() => {
                let (stream, remote) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        continue;
                    }
                };

                let io = TokioIo::new(stream);
                let state = Arc::clone(&state);

                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { Ok::<_, Infallible>(handle_request(state, remote, req).await) }
                    });

                    if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                        debug!(%remote, error = %e, "Connection closed with error");
                    }
                });
            }
        }
    }

    Ok(())
}

/// Route one request, bounded by the request timeout.
pub async fn handle_request<B>(
    state: Arc<AppState>,
    remote: SocketAddr,
    req: Request<B>,
) -> Response<Full<Bytes>>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let limit = state.request_timeout();

    match tokio::time::timeout(limit, route(state, remote, req)).await {
        Ok(response) => {
            debug!(%method, %path, status = response.status().as_u16(), "Request handled");
            response
        }
        Err(_) => {
            warn!(%method, %path, timeout_ms = limit.as_millis() as u64, "Request timed out");
            error_response(StatusCode::SERVICE_UNAVAILABLE, "request timed out")
        }
    }
}

async fn route<B>(state: Arc<AppState>, remote: SocketAddr, req: Request<B>) -> Response<Full<Bytes>>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    match (&method, path.as_str()) {
        (&Method::POST, "/signup") => auth_routes::handle_signup(req, &state).await,
        (&Method::POST, "/login") => auth_routes::handle_login(req, &state, remote.ip()).await,
        (&Method::GET, "/me") => auth_routes::handle_me(&req, &state),
        (&Method::GET, "/health") => health::health_check(&state),
        (&Method::GET, "/ready") => health::readiness_check(&state).await,
        (&Method::GET, "/version") => health::version_info(),
        (&Method::GET, "/metrics") => health::metrics(&state),
        (_, known) if allowed_method(known).is_some() => {
            error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
        }
        _ => error_response(StatusCode::NOT_FOUND, "not found"),
    }
}

fn allowed_method(path: &str) -> Option<Method> {
    match path {
        "/signup" | "/login" => Some(Method::POST),
        "/me" | "/health" | "/ready" | "/version" | "/metrics" => Some(Method::GET),
        _ => None,
    }
}
