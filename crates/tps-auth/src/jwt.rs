//! JWT encoding and decoding with the HS256 algorithm.
//!
//! Session tokens are signed with a shared HMAC secret. Decoding pins the
//! algorithm list to HS256 so a token whose header names any other
//! algorithm is rejected before its signature is even considered.

use crate::claims::{SessionClaims, SESSION_AUDIENCE, SESSION_ISSUER};
use crate::error::AuthError;
use jsonwebtoken::{
    decode, encode, Algorithm, DecodingKey, EncodingKey, Header, TokenData, Validation,
};

/// Configuration for JWT validation.
#[derive(Debug, Clone)]
pub struct ValidationConfig {
    /// Leeway in seconds applied to exp/nbf checks.
    pub leeway: u64,
    /// Expected issuer (if set, tokens with different issuer are rejected).
    pub issuer: Option<String>,
    /// Expected audience (if set, tokens without matching audience are rejected).
    pub audience: Option<String>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            leeway: 0,
            issuer: Some(SESSION_ISSUER.to_string()),
            audience: Some(SESSION_AUDIENCE.to_string()),
        }
    }
}

/// Encode session claims into a signed HS256 token string.
///
/// # Errors
///
/// Returns `AuthError::InvalidKey` if the secret is empty.
///
/// # Example
///
/// ```rust
/// use tps_auth::{decode_token, encode_token, SessionClaims};
///
/// let token = encode_token(&SessionClaims::new_session(), b"secret").unwrap();
/// let claims = decode_token(&token, b"secret").unwrap();
/// assert_eq!(claims.aud, "caddy");
/// ```
pub fn encode_token(claims: &SessionClaims, secret: &[u8]) -> Result<String, AuthError> {
    if secret.is_empty() {
        return Err(AuthError::InvalidKey("signing secret is empty".to_string()));
    }

    let key = EncodingKey::from_secret(secret);
    let header = Header::new(Algorithm::HS256);

    encode(&header, claims, &key)
        .map_err(|e| AuthError::InvalidToken(format!("Encoding failed: {e}")))
}

/// Decode and validate a session token with the default validation config.
///
/// # Errors
///
/// - `AuthError::TokenExpired` - Token has expired
/// - `AuthError::TokenNotYetValid` - Token's nbf is in the future
/// - `AuthError::InvalidSignature` - Signature verification failed
/// - `AuthError::InvalidAlgorithm` - Token is not HS256
/// - `AuthError::InvalidToken` - Token format is invalid
pub fn decode_token(token: &str, secret: &[u8]) -> Result<SessionClaims, AuthError> {
    decode_token_with_config(token, secret, &ValidationConfig::default())
}

/// Decode and validate a session token with custom validation config.
pub fn decode_token_with_config(
    token: &str,
    secret: &[u8],
    config: &ValidationConfig,
) -> Result<SessionClaims, AuthError> {
    if secret.is_empty() {
        return Err(AuthError::InvalidKey("signing secret is empty".to_string()));
    }

    let key = DecodingKey::from_secret(secret);

    let mut validation = Validation::new(Algorithm::HS256);
    validation.leeway = config.leeway;
    validation.validate_exp = true;
    validation.validate_nbf = true;

    // Only accept HS256
    validation.algorithms = vec![Algorithm::HS256];
    validation.set_required_spec_claims(&["exp", "nbf"]);

    if let Some(ref iss) = config.issuer {
        validation.set_issuer(&[iss]);
    }

    if let Some(ref aud) = config.audience {
        validation.set_audience(&[aud]);
    } else {
        validation.validate_aud = false;
    }

    let token_data: TokenData<SessionClaims> =
        decode(token, &key, &validation).map_err(map_jwt_error)?;

    Ok(token_data.claims)
}

/// Map jsonwebtoken errors to AuthError.
fn map_jwt_error(err: jsonwebtoken::errors::Error) -> AuthError {
    use jsonwebtoken::errors::ErrorKind;

    match err.kind() {
        ErrorKind::ExpiredSignature => AuthError::TokenExpired,
        ErrorKind::ImmatureSignature => AuthError::TokenNotYetValid,
        ErrorKind::InvalidSignature => AuthError::InvalidSignature,
        ErrorKind::InvalidAlgorithm | ErrorKind::InvalidAlgorithmName => {
            AuthError::InvalidAlgorithm
        }
        ErrorKind::InvalidIssuer => AuthError::InvalidIssuer,
        ErrorKind::InvalidAudience => AuthError::InvalidAudience,
        ErrorKind::InvalidToken => AuthError::InvalidToken("Malformed token".to_string()),
        ErrorKind::Base64(_) => AuthError::InvalidToken("Invalid base64 encoding".to_string()),
        ErrorKind::Json(_) => AuthError::InvalidToken("Invalid JSON in token".to_string()),
        ErrorKind::MissingRequiredClaim(claim) => AuthError::MissingClaim(claim.to_string()),
        _ => AuthError::InvalidToken(format!("Token validation failed: {err}")),
    }
}
