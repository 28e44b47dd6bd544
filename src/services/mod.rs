//! Application services

pub mod user_service;

pub use user_service::UserService;

use crate::auth::TokenError;
use crate::repository::RepositoryError;
use crate::types::ErrorClass;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("user '{0}' not found")]
    UserNotFound(String),

    #[error("invalid password for user '{0}'")]
    InvalidPassword(String),

    #[error("password hashing failed: {0}")]
    Hashing(String),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Token(#[from] TokenError),
}

impl ServiceError {
    /// Unknown user or wrong password.
    pub fn is_credential_failure(&self) -> bool {
        matches!(self, Self::UserNotFound(_) | Self::InvalidPassword(_))
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::UserNotFound(_) => ErrorClass::NotFound,
            Self::InvalidPassword(_) => ErrorClass::Unauthorized,
            Self::Hashing(_) => ErrorClass::Internal,
            Self::Repository(err) => err.class(),
            Self::Token(TokenError::Signing(_)) => ErrorClass::Internal,
            Self::Token(_) => ErrorClass::Unauthorized,
        }
    }
}
