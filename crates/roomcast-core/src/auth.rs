//! Bearer token validation for the connection handshake.
//!
//! Tokens are HMAC-signed JWTs issued by the external credential service.
//! Validation is a pure function of the token, the shared secret and the
//! current time, so a single [`TokenValidator`] can be shared by every
//! connection task.
//!
//! ## Example
//! ```
//! use roomcast_core::auth::{validate, AuthError};
//!
//! assert!(matches!(validate(None, b"secret", 0), Err(AuthError::MissingToken)));
//! ```

use jsonwebtoken::{decode, errors::ErrorKind, Algorithm, DecodingKey, Validation};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Accepted signing algorithms, all from the symmetric HMAC family.
pub const HMAC_ALGORITHMS: [Algorithm; 3] = [Algorithm::HS256, Algorithm::HS384, Algorithm::HS512];

/// Authentication errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// No token was supplied.
    #[error("Missing token")]
    MissingToken,

    /// The token cannot be parsed or uses a non-HMAC algorithm.
    #[error("Malformed token: {0}")]
    MalformedToken(String),

    /// The signature does not match the shared secret.
    #[error("Invalid token signature")]
    InvalidSignature,

    /// The expiry claim is at or before the current time.
    #[error("Token expired")]
    ExpiredToken,

    /// A required claim is absent or has the wrong type.
    #[error("Invalid claims: {0}")]
    InvalidClaims(&'static str),
}

impl AuthError {
    /// Short label used for metrics and logs.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            AuthError::MissingToken => "missing_token",
            AuthError::MalformedToken(_) => "malformed_token",
            AuthError::InvalidSignature => "invalid_signature",
            AuthError::ExpiredToken => "expired_token",
            AuthError::InvalidClaims(_) => "invalid_claims",
        }
    }
}

/// Validate `token` against `secret` at unix time `now` (seconds).
///
/// Returns the `sub` claim unchanged.
///
/// # Errors
///
/// Returns an [`AuthError`] describing why the token was rejected.
pub fn validate(token: Option<&str>, secret: &[u8], now: i64) -> Result<String, AuthError> {
    let token = token
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(AuthError::MissingToken)?;

    // Expiry is checked below against the caller's clock.
    let mut validation = Validation::new(Algorithm::HS256);
    validation.algorithms = HMAC_ALGORITHMS.to_vec();
    validation.validate_exp = false;
    validation.validate_nbf = false;
    validation.validate_aud = false;
    validation.required_spec_claims = HashSet::new();

    let data = decode::<Map<String, Value>>(token, &DecodingKey::from_secret(secret), &validation)
        .map_err(|e| match e.kind() {
            ErrorKind::InvalidSignature => AuthError::InvalidSignature,
            _ => AuthError::MalformedToken(e.to_string()),
        })?;
    let claims = data.claims;

    // A token without `exp` never expires.
    if let Some(exp) = claims.get("exp") {
        let exp = exp
            .as_f64()
            .ok_or(AuthError::InvalidClaims("exp claim is not numeric"))?;
        if exp <= now as f64 {
            return Err(AuthError::ExpiredToken);
        }
    }

    match claims.get("sub") {
        Some(Value::String(sub)) => Ok(sub.clone()),
        Some(_) => Err(AuthError::InvalidClaims("sub claim is not a string")),
        None => Err(AuthError::InvalidClaims("sub claim missing")),
    }
}

/// Validator bound to the gateway's shared secret.
#[derive(Clone)]
pub struct TokenValidator {
    secret: Arc<[u8]>,
}

impl TokenValidator {
    /// Create a validator for `secret`.
    #[must_use]
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: Arc::from(secret.as_ref()),
        }
    }

    /// Validate a token against the current wall clock.
    ///
    /// # Errors
    ///
    /// See [`validate`].
    pub fn validate(&self, token: Option<&str>) -> Result<String, AuthError> {
        self.validate_at(token, chrono::Utc::now().timestamp())
    }

    /// Validate a token at a fixed unix time.
    ///
    /// # Errors
    ///
    /// See [`validate`].
    pub fn validate_at(&self, token: Option<&str>, now: i64) -> Result<String, AuthError> {
        validate(token, &self.secret, now)
    }
}

impl fmt::Debug for TokenValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenValidator").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    const SECRET: &[u8] = b"test-secret";
    const NOW: i64 = 1_700_000_000;

    fn sign(claims: Value, secret: &[u8], alg: Algorithm) -> String {
        encode(&Header::new(alg), &claims, &EncodingKey::from_secret(secret)).unwrap()
    }

    #[test]
    fn test_valid_token_returns_subject() {
        let token = sign(json!({"sub": "user-1", "exp": NOW + 60}), SECRET, Algorithm::HS256);
        assert_eq!(validate(Some(&token), SECRET, NOW).unwrap(), "user-1");
    }

    #[test]
    fn test_other_hmac_algorithms_accepted() {
        let token = sign(json!({"sub": "user-1", "exp": NOW + 60}), SECRET, Algorithm::HS512);
        assert_eq!(validate(Some(&token), SECRET, NOW).unwrap(), "user-1");
    }

    #[test]
    fn test_missing_token() {
        assert_eq!(validate(None, SECRET, NOW), Err(AuthError::MissingToken));
        assert_eq!(validate(Some("  "), SECRET, NOW), Err(AuthError::MissingToken));
    }

    #[test]
    fn test_expired_one_second_ago() {
        let token = sign(json!({"sub": "user-1", "exp": NOW - 1}), SECRET, Algorithm::HS256);
        assert_eq!(validate(Some(&token), SECRET, NOW), Err(AuthError::ExpiredToken));
    }

    #[test]
    fn test_expiry_at_now_is_rejected() {
        let token = sign(json!({"sub": "user-1", "exp": NOW}), SECRET, Algorithm::HS256);
        assert_eq!(validate(Some(&token), SECRET, NOW), Err(AuthError::ExpiredToken));
    }

    #[test]
    fn test_token_without_expiry_accepted() {
        let token = sign(json!({"sub": "user-1"}), SECRET, Algorithm::HS256);
        assert_eq!(validate(Some(&token), SECRET, NOW).unwrap(), "user-1");
    }

    #[test]
    fn test_non_numeric_expiry_rejected() {
        let token = sign(json!({"sub": "user-1", "exp": "tomorrow"}), SECRET, Algorithm::HS256);
        // jsonwebtoken may flag the claim format before we look at it.
        assert!(matches!(
            validate(Some(&token), SECRET, NOW),
            Err(AuthError::InvalidClaims(_) | AuthError::MalformedToken(_))
        ));
    }

    #[test]
    fn test_different_secret_rejected() {
        let token = sign(json!({"sub": "user-1", "exp": NOW + 60}), b"other", Algorithm::HS256);
        assert_eq!(validate(Some(&token), SECRET, NOW), Err(AuthError::InvalidSignature));
    }

    #[test]
    fn test_malformed_token() {
        for token in ["not-a-token", "abc.def.ghi"] {
            assert!(matches!(
                validate(Some(token), SECRET, NOW),
                Err(AuthError::MalformedToken(_))
            ));
        }
    }

    #[test]
    fn test_invalid_subject_claims() {
        let missing = sign(json!({"exp": NOW + 60}), SECRET, Algorithm::HS256);
        assert!(matches!(
            validate(Some(&missing), SECRET, NOW),
            Err(AuthError::InvalidClaims(_))
        ));

        let numeric = sign(json!({"sub": 42, "exp": NOW + 60}), SECRET, Algorithm::HS256);
        assert!(matches!(
            validate(Some(&numeric), SECRET, NOW),
            Err(AuthError::InvalidClaims(_))
        ));
    }

    #[test]
    fn test_validator_uses_wall_clock() {
        let validator = TokenValidator::new(SECRET);
        let exp = chrono::Utc::now().timestamp() + 3600;
        let token = sign(json!({"sub": "user-9", "exp": exp}), SECRET, Algorithm::HS256);
        assert_eq!(validator.validate(Some(&token)).unwrap(), "user-9");
        assert_eq!(
            validator.validate_at(Some(&token), exp),
            Err(AuthError::ExpiredToken)
        );
    }
}
