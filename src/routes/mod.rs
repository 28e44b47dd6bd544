//! HTTP routes for portcullis

pub mod auth_routes;
pub mod health;

use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Body;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Request, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::types::PortcullisError;

/// Largest JSON body accepted by any route.
pub const MAX_BODY_BYTES: usize = 16 * 1024;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
}

pub fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    let json = serde_json::to_vec(body).unwrap_or_else(|_| b"{}".to_vec());
    let mut response = Response::new(Full::new(Bytes::from(json)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

pub fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    json_response(
        status,
        &ErrorResponse {
            error: message.to_string(),
            code: None,
        },
    )
}

/// Render a crate error with its status and a stable code.
pub fn error_from(err: &PortcullisError) -> Response<Full<Bytes>> {
    let code = match err {
        PortcullisError::BadRequest(_) | PortcullisError::Http(_) => "bad_request",
        PortcullisError::Unauthorized(_) => "unauthorized",
        PortcullisError::Conflict(_) => "conflict",
        PortcullisError::TooManyRequests(_) => "rate_limited",
        PortcullisError::Database(_) => "unavailable",
        PortcullisError::Internal(_) | PortcullisError::Config(_) => "internal",
    };
    // Store and internal details stay in the logs.
    let message = match err {
        PortcullisError::Database(_) => "store unavailable".to_string(),
        PortcullisError::Internal(_) | PortcullisError::Config(_) => "internal error".to_string(),
        other => other.to_string(),
    };
    json_response(
        err.status_code(),
        &ErrorResponse {
            error: message,
            code: Some(code),
        },
    )
}

/// Read a JSON body, enforcing the content type and [`MAX_BODY_BYTES`].
pub async fn parse_json_body<T, B>(req: Request<B>) -> Result<T, PortcullisError>
where
    T: DeserializeOwned,
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let is_json = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(|v| v.trim().eq_ignore_ascii_case("application/json"))
        .unwrap_or(false);
    if !is_json {
        return Err(PortcullisError::BadRequest(
            "Content-Type must be application/json".into(),
        ));
    }

    let body = Limited::new(req.into_body(), MAX_BODY_BYTES)
        .collect()
        .await
        .map_err(|e| {
            if e.downcast_ref::<LengthLimitError>().is_some() {
                PortcullisError::BadRequest("request body too large".into())
            } else {
                PortcullisError::Http(format!("failed to read body: {}", e))
            }
        })?;

    serde_json::from_slice(&body.to_bytes())
        .map_err(|e| PortcullisError::BadRequest(format!("invalid JSON: {}", e)))
}
