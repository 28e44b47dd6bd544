//! Authentication primitives
//!
//! Provides:
//! - Password hashing with Argon2
//! - P-256 signing key loading
//! - ES256 session token issuance and verification

pub mod jwt;
pub mod keys;
pub mod password;

pub use jwt::{
    extract_token_from_cookie, extract_token_from_header, verify_token, Claims, IssuedToken,
    TokenError, TokenIssuer,
};
pub use keys::SigningKeys;
pub use password::{hash_password, verify_password};

/// Key loading and hashing failures.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("signing key error: {0}")]
    Key(String),

    #[error("password hash error: {0}")]
    Hash(String),
}
