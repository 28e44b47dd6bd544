//! Authentication routes
//!
//! - `POST /signup`: create a user
//! - `POST /login`: verify credentials, issue a session token and cookie
//! - `GET /me`: describe the session behind a presented token
//!
//! Login failures never say whether the username or the password was wrong.

use std::net::IpAddr;
use std::time::Instant;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http_body_util::Full;
use hyper::body::Body;
use hyper::header::{HeaderValue, AUTHORIZATION, COOKIE, SET_COOKIE};
use hyper::{Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::{error_from, error_response, json_response, parse_json_body};
use crate::auth::jwt::TOKEN_LIFETIME_SECS;
use crate::auth::{extract_token_from_cookie, extract_token_from_header};
use crate::metrics;
use crate::server::AppState;
use crate::types::{ErrorClass, PortcullisError};

/// Name of the cookie carrying the session token.
pub const SESSION_COOKIE: &str = "session_token";

const MAX_USERNAME_CHARS: usize = 64;
const MAX_PASSWORD_CHARS: usize = 128;
const INVALID_CREDENTIALS: &str = "invalid username or password";

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Deserialize)]
pub struct SignupRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct SignupResponse {
    pub message: String,
    pub user_id: String,
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub authenticated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl LoginResponse {
    fn rejected() -> Self {
        Self {
            authenticated: false,
            message: None,
            token: None,
            expires_at: None,
            error: Some(INVALID_CREDENTIALS.to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MeResponse {
    pub username: String,
    pub issued_at: String,
    pub expires_at: String,
}

// =============================================================================
// Helpers
// =============================================================================

fn validate_credentials(username: &str, password: &str) -> Result<(), PortcullisError> {
    let username_len = username.chars().count();
    if username.trim().is_empty() || username_len > MAX_USERNAME_CHARS {
        return Err(PortcullisError::BadRequest(format!(
            "username must be 1 to {} characters",
            MAX_USERNAME_CHARS
        )));
    }
    if username.chars().any(char::is_control) {
        return Err(PortcullisError::BadRequest(
            "username must not contain control characters".into(),
        ));
    }

    let password_len = password.chars().count();
    if password_len == 0 || password_len > MAX_PASSWORD_CHARS {
        return Err(PortcullisError::BadRequest(format!(
            "password must be 1 to {} characters",
            MAX_PASSWORD_CHARS
        )));
    }
    Ok(())
}

fn rfc3339(secs: u64) -> String {
    i64::try_from(secs)
        .ok()
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .map(|t| t.to_rfc3339())
        .unwrap_or_default()
}

fn session_cookie(token: &str) -> String {
    format!(
        "{}={}; Path=/; HttpOnly; SameSite=Strict; Max-Age={}",
        SESSION_COOKIE, token, TOKEN_LIFETIME_SECS
    )
}

fn header<'a, B>(req: &'a Request<B>, name: hyper::header::HeaderName) -> Option<&'a str> {
    req.headers().get(name).and_then(|v| v.to_str().ok())
}

// =============================================================================
// Route Handlers
// =============================================================================

/// POST /signup
pub async fn handle_signup<B>(req: Request<B>, state: &AppState) -> Response<Full<Bytes>>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let started = Instant::now();
    metrics::record_signup_request();

    let body: SignupRequest = match parse_json_body(req).await {
        Ok(body) => body,
        Err(e) => {
            metrics::record_signup_error(ErrorClass::Validation, started.elapsed());
            return error_from(&e);
        }
    };

    if let Err(e) = validate_credentials(&body.username, &body.password) {
        metrics::record_signup_error(ErrorClass::Validation, started.elapsed());
        return error_from(&e);
    }

    match state.users.register_user(&body.username, &body.password).await {
        Ok(user_id) => {
            metrics::record_signup_success(started.elapsed());
            json_response(
                StatusCode::CREATED,
                &SignupResponse {
                    message: "user created".to_string(),
                    user_id,
                },
            )
        }
        Err(e) => {
            let class = e.class();
            metrics::record_signup_error(class, started.elapsed());
            if class == ErrorClass::AlreadyExists {
                info!(username = %body.username, "Signup rejected: username taken");
            } else {
                error!(error = %e, class = %class, "Signup failed");
            }
            error_from(&PortcullisError::from(e))
        }
    }
}

/// POST /login
pub async fn handle_login<B>(req: Request<B>, state: &AppState, client: IpAddr) -> Response<Full<Bytes>>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let started = Instant::now();
    metrics::record_login_request();

    if !state.login_limiter.check_and_record(client) {
        metrics::record_login_rate_limited();
        warn!(%client, "Login rate limited");
        return error_from(&PortcullisError::TooManyRequests(
            "too many login attempts".into(),
        ));
    }

    let body: LoginRequest = match parse_json_body(req).await {
        Ok(body) => body,
        Err(e) => {
            metrics::record_login_failure(ErrorClass::Validation, started.elapsed());
            return error_from(&e);
        }
    };

    if let Err(e) = validate_credentials(&body.username, &body.password) {
        metrics::record_login_failure(ErrorClass::Validation, started.elapsed());
        return error_from(&e);
    }

    match state.users.login(&body.username, &body.password).await {
        Ok(issued) => {
            metrics::record_login_success(started.elapsed());

            let mut response = json_response(
                StatusCode::OK,
                &LoginResponse {
                    authenticated: true,
                    message: Some("login successful".to_string()),
                    token: Some(issued.token.clone()),
                    expires_at: Some(rfc3339(issued.claims.exp)),
                    error: None,
                },
            );
            match HeaderValue::from_str(&session_cookie(&issued.token)) {
                Ok(cookie) => {
                    response.headers_mut().insert(SET_COOKIE, cookie);
                }
                Err(e) => warn!(error = %e, "Session cookie not representable as a header"),
            }
            response
        }
        Err(e) if e.is_credential_failure() => {
            metrics::record_login_failure(e.class(), started.elapsed());
            json_response(StatusCode::UNAUTHORIZED, &LoginResponse::rejected())
        }
        Err(e) => {
            let class = e.class();
            metrics::record_login_failure(class, started.elapsed());
            error!(error = %e, class = %class, "Login failed");
            error_from(&PortcullisError::from(e))
        }
    }
}

/// GET /me
///
/// Accepts the token as `Authorization: Bearer ...` or the session cookie.
pub fn handle_me<B>(req: &Request<B>, state: &AppState) -> Response<Full<Bytes>> {
    let token = extract_token_from_header(header(req, AUTHORIZATION))
        .or_else(|| extract_token_from_cookie(header(req, COOKIE), SESSION_COOKIE));

    let Some(token) = token else {
        return error_response(StatusCode::UNAUTHORIZED, "missing session token");
    };

    match state.users.verify_session(token) {
        Ok(claims) => json_response(
            StatusCode::OK,
            &MeResponse {
                username: claims.username,
                issued_at: rfc3339(claims.iat),
                expires_at: rfc3339(claims.exp),
            },
        ),
        Err(e) => {
            debug!(error = %e, "Session token rejected");
            error_response(StatusCode::UNAUTHORIZED, "invalid or expired session token")
        }
    }
}
