//! Session token issuance and verification
//!
//! Tokens are ES256-signed JWTs with a fixed 15 minute lifetime. They are
//! never stored server-side: verification is the signature plus the claim
//! checks below.
//!
//! Verification order:
//! 1. the header must parse and advertise ES256 (algorithm substitution is
//!    rejected before any key is touched)
//! 2. the signature must verify against the public key
//! 3. `exp`, `nbf`, `iss`, `sub` and `aud` must all be present and valid

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{
    decode, decode_header, encode, get_current_timestamp, Algorithm, DecodingKey, Header,
    Validation,
};
use serde::{Deserialize, Serialize};

use super::SigningKeys;

pub const ISSUER: &str = "portcullis";
pub const SUBJECT: &str = "AUTHENTICATION";
pub const AUDIENCE: &str = "api.portcullis";

/// Token lifetime in seconds.
pub const TOKEN_LIFETIME_SECS: u64 = 15 * 60;

/// Allowed clock skew when checking `exp`/`nbf`.
pub const CLOCK_SKEW_SECS: u64 = 30;

/// Claims carried by a session token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub iss: String,
    pub sub: String,
    pub aud: Vec<String>,
    /// Unique token id
    pub jti: String,
    pub iat: u64,
    pub nbf: u64,
    pub exp: u64,
    /// Authenticated username
    pub username: String,
}

/// Why a token was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("token expired")]
    Expired,

    #[error("token not yet valid")]
    NotYetValid,

    #[error("token signature is invalid")]
    InvalidSignature,

    #[error("token is malformed")]
    Malformed,

    #[error("token signed with unexpected algorithm {0}")]
    WrongAlgorithm(String),

    #[error("token claims rejected: {0}")]
    InvalidClaims(String),

    #[error("failed to sign token: {0}")]
    Signing(String),
}

impl From<jsonwebtoken::errors::Error> for TokenError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            ErrorKind::ExpiredSignature => Self::Expired,
            ErrorKind::ImmatureSignature => Self::NotYetValid,
            ErrorKind::InvalidSignature => Self::InvalidSignature,
            ErrorKind::InvalidAlgorithm => Self::WrongAlgorithm("mismatch".into()),
            ErrorKind::InvalidIssuer => Self::InvalidClaims("issuer".into()),
            ErrorKind::InvalidAudience => Self::InvalidClaims("audience".into()),
            ErrorKind::InvalidSubject => Self::InvalidClaims("subject".into()),
            ErrorKind::MissingRequiredClaim(claim) => {
                Self::InvalidClaims(format!("missing {}", claim))
            }
            _ => Self::Malformed,
        }
    }
}

/// A freshly signed token and the claims inside it.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub claims: Claims,
}

/// Issues and verifies session tokens with one key pair.
#[derive(Debug, Clone)]
pub struct TokenIssuer {
    keys: SigningKeys,
}

impl TokenIssuer {
    pub fn new(keys: SigningKeys) -> Self {
        Self { keys }
    }

    /// Sign a token for `username`, valid from now for the fixed lifetime.
    pub fn issue(&self, username: &str) -> Result<IssuedToken, TokenError> {
        self.issue_at(username, get_current_timestamp())
    }

    pub(crate) fn issue_at(&self, username: &str, now: u64) -> Result<IssuedToken, TokenError> {
        let claims = Claims {
            iss: ISSUER.to_string(),
            sub: SUBJECT.to_string(),
            aud: vec![AUDIENCE.to_string()],
            jti: uuid::Uuid::new_v4().to_string(),
            iat: now,
            nbf: now,
            exp: now + TOKEN_LIFETIME_SECS,
            username: username.to_string(),
        };

        let token = encode(
            &Header::new(Algorithm::ES256),
            &claims,
            self.keys.encoding_key(),
        )
        .map_err(|e| TokenError::Signing(e.to_string()))?;

        Ok(IssuedToken { token, claims })
    }

    /// Verify a token against this issuer's public key.
    pub fn verify(&self, token: &str) -> Result<Claims, TokenError> {
        verify_token(token, self.keys.decoding_key())
    }
}

/// Verify `token` against `key`, returning its claims.
pub fn verify_token(token: &str, key: &DecodingKey) -> Result<Claims, TokenError> {
    let header = decode_header(token).map_err(|_| TokenError::Malformed)?;
    if header.alg != Algorithm::ES256 {
        return Err(TokenError::WrongAlgorithm(format!("{:?}", header.alg)));
    }

    let mut validation = Validation::new(Algorithm::ES256);
    validation.set_issuer(&[ISSUER]);
    validation.set_audience(&[AUDIENCE]);
    validation.sub = Some(SUBJECT.to_string());
    validation.validate_nbf = true;
    validation.leeway = CLOCK_SKEW_SECS;
    validation.set_required_spec_claims(&["exp", "nbf", "iss", "sub", "aud"]);

    let data = decode::<Claims>(token, key, &validation)?;
    Ok(data.claims)
}

/// Extract token from Authorization header.
/// Supports "Bearer <token>" format and raw tokens.
pub fn extract_token_from_header(auth_header: Option<&str>) -> Option<&str> {
    let header = auth_header?;

    if let Some(token) = header.strip_prefix("Bearer ") {
        let token = token.trim();
        return (!token.is_empty()).then_some(token);
    }

    let token = header.trim();
    (!token.is_empty() && !token.contains(' ')).then_some(token)
}

/// Extract a named cookie value from a `Cookie` header.
pub fn extract_token_from_cookie<'a>(cookie_header: Option<&'a str>, name: &str) -> Option<&'a str> {
    cookie_header?
        .split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.trim())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::keys::tests::generate;
    use jsonwebtoken::EncodingKey;

    fn test_issuer() -> TokenIssuer {
        TokenIssuer::new(generate())
    }

    #[test]
    fn test_issue_and_verify() {
        let issuer = test_issuer();
        let before = get_current_timestamp();

        let issued = issuer.issue("alice01").unwrap();
        let claims = issuer.verify(&issued.token).unwrap();

        assert_eq!(claims, issued.claims);
        assert_eq!(claims.username, "alice01");
        assert_eq!(claims.iss, ISSUER);
        assert_eq!(claims.sub, SUBJECT);
        assert_eq!(claims.aud, vec![AUDIENCE.to_string()]);
        assert!(claims.iat >= before && claims.iat <= before + 5);
        assert_eq!(claims.nbf, claims.iat);
        assert_eq!(claims.exp, claims.iat + TOKEN_LIFETIME_SECS);
    }

    #[test]
    fn test_token_ids_are_unique() {
        let issuer = test_issuer();
        let first = issuer.issue("alice01").unwrap();
        let second = issuer.issue("alice01").unwrap();
        assert_ne!(first.claims.jti, second.claims.jti);
    }

    #[test]
    fn test_other_key_pair_rejected() {
        let issuer = test_issuer();
        let stranger = generate();

        let issued = issuer.issue("alice01").unwrap();
        let result = verify_token(&issued.token, stranger.decoding_key());
        assert_eq!(result, Err(TokenError::InvalidSignature));
    }

    #[test]
    fn test_expired_token() {
        let issuer = test_issuer();
        let long_ago = get_current_timestamp() - 2 * 60 * 60;

        let issued = issuer.issue_at("alice01", long_ago).unwrap();
        assert_eq!(issuer.verify(&issued.token), Err(TokenError::Expired));
    }

    #[test]
    fn test_future_token_not_yet_valid() {
        let issuer = test_issuer();
        let later = get_current_timestamp() + 10 * 60;

        let issued = issuer.issue_at("alice01", later).unwrap();
        assert_eq!(issuer.verify(&issued.token), Err(TokenError::NotYetValid));
    }

    #[test]
    fn test_hs256_token_rejected_before_signature_check() {
        let issuer = test_issuer();
        let claims = issuer.issue("alice01").unwrap().claims;
        let forged = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"public-key-bytes-as-hmac-secret"),
        )
        .unwrap();

        assert!(matches!(
            issuer.verify(&forged),
            Err(TokenError::WrongAlgorithm(_))
        ));
    }

    #[test]
    fn test_malformed_token() {
        let issuer = test_issuer();
        assert_eq!(issuer.verify("not-a-token"), Err(TokenError::Malformed));
        assert_eq!(issuer.verify(""), Err(TokenError::Malformed));
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let issuer = test_issuer();
        let token = issuer.issue("alice01").unwrap().token;
        let other = issuer.issue("mallory").unwrap().token;

        let parts: Vec<&str> = token.split('.').collect();
        let other_parts: Vec<&str> = other.split('.').collect();
        let spliced = format!("{}.{}.{}", parts[0], other_parts[1], parts[2]);

        assert_eq!(issuer.verify(&spliced), Err(TokenError::InvalidSignature));
    }

    #[test]
    fn test_extract_token_from_header() {
        assert_eq!(extract_token_from_header(Some("Bearer abc123")), Some("abc123"));
        assert_eq!(extract_token_from_header(Some("abc123")), Some("abc123"));
        assert_eq!(extract_token_from_header(None), None);
        assert_eq!(extract_token_from_header(Some("")), None);
        assert_eq!(extract_token_from_header(Some("Bearer ")), None);
        assert_eq!(extract_token_from_header(Some("Basic abc123")), None);
    }

    #[test]
    fn test_extract_token_from_cookie() {
        assert_eq!(
            extract_token_from_cookie(Some("theme=dark; session_token=abc.def.ghi"), "session_token"),
            Some("abc.def.ghi")
        );
        assert_eq!(extract_token_from_cookie(Some("theme=dark"), "session_token"), None);
        assert_eq!(extract_token_from_cookie(Some("session_token="), "session_token"), None);
        assert_eq!(extract_token_from_cookie(None, "session_token"), None);
    }
}
