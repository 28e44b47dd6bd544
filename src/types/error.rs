//! Error types for portcullis
//!
//! Each layer owns a `thiserror` enum; this module holds the crate-level error
//! that the HTTP layer maps to status codes, plus the coarse classification used
//! for metric labels.

use hyper::StatusCode;

use crate::auth::TokenError;
use crate::db::StoreError;
use crate::repository::RepositoryError;
use crate::services::ServiceError;

/// Coarse error classification reported to logs and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    NotFound,
    AlreadyExists,
    Connectivity,
    Validation,
    Unauthorized,
    Internal,
}

impl ErrorClass {
    /// Stable label value for metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::AlreadyExists => "already_exists",
            Self::Connectivity => "connectivity",
            Self::Validation => "validation",
            Self::Unauthorized => "unauthorized",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for portcullis operations
#[derive(Debug, thiserror::Error)]
pub enum PortcullisError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Too many requests: {0}")]
    TooManyRequests(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl PortcullisError {
    /// Convert error to HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::TooManyRequests(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::Database(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Http(_) => StatusCode::BAD_REQUEST,
            Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<std::io::Error> for PortcullisError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<serde_yaml::Error> for PortcullisError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Config(format!("YAML error: {}", err))
    }
}

impl From<StoreError> for PortcullisError {
    fn from(err: StoreError) -> Self {
        match err.class() {
            ErrorClass::Validation => Self::BadRequest(err.to_string()),
            ErrorClass::AlreadyExists => Self::Conflict(err.to_string()),
            _ => Self::Database(err.to_string()),
        }
    }
}

impl From<RepositoryError> for PortcullisError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::AlreadyExists(username) => {
                Self::Conflict(format!("username '{}' already exists", username))
            }
            RepositoryError::WrongBackend { .. } => Self::Config(err.to_string()),
            RepositoryError::Store(store) => store.into(),
            RepositoryError::Decode(msg) => Self::Internal(msg),
        }
    }
}

impl From<TokenError> for PortcullisError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Signing(_) => Self::Internal(err.to_string()),
            _ => Self::Unauthorized(err.to_string()),
        }
    }
}

impl From<ServiceError> for PortcullisError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::UserNotFound(_) | ServiceError::InvalidPassword(_) => {
                Self::Unauthorized("invalid username or password".into())
            }
            ServiceError::Repository(repo) => repo.into(),
            ServiceError::Token(token) => token.into(),
            ServiceError::Hashing(msg) => Self::Internal(msg),
        }
    }
}

/// Result type alias for portcullis operations
pub type Result<T> = std::result::Result<T, PortcullisError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            PortcullisError::Conflict("x".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            PortcullisError::Database("x".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            PortcullisError::TooManyRequests("x".into()).status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[test]
    fn test_credential_failures_collapse_to_unauthorized() {
        let not_found: PortcullisError = ServiceError::UserNotFound("alice01".into()).into();
        let bad_password: PortcullisError = ServiceError::InvalidPassword("alice01".into()).into();

        assert_eq!(not_found.to_string(), bad_password.to_string());
        assert_eq!(not_found.status_code(), StatusCode::UNAUTHORIZED);
        assert!(!not_found.to_string().contains("alice01"));
    }

    #[test]
    fn test_store_errors_map_by_class() {
        let empty: PortcullisError = StoreError::EmptyFilter.into();
        assert_eq!(empty.status_code(), StatusCode::BAD_REQUEST);

        let down: PortcullisError = StoreError::NotConnected(crate::db::DbBackend::Sql).into();
        assert_eq!(down.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_duplicate_user_maps_to_conflict() {
        let err: PortcullisError = RepositoryError::AlreadyExists("alice01".into()).into();
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
    }
}
