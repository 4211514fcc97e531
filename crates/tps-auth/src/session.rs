//! Session token codec bound to one signing secret.

use std::fmt;

use crate::claims::SessionClaims;
use crate::error::AuthError;
use crate::jwt::{decode_token_with_config, encode_token, ValidationConfig};

/// Issues and verifies session tokens with a fixed HMAC secret.
///
/// Tokens are stateless: nothing is remembered between `issue` and
/// `verify`, so there is no revocation short of rotating the secret.
#[derive(Clone)]
pub struct SessionTokens {
    secret: Vec<u8>,
    validation: ValidationConfig,
}

impl SessionTokens {
    /// Create a codec for the given secret.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::InvalidKey` if the secret is empty.
    pub fn new(secret: impl Into<Vec<u8>>) -> Result<Self, AuthError> {
        let secret = secret.into();
        if secret.is_empty() {
            return Err(AuthError::InvalidKey("signing secret is empty".to_string()));
        }
        Ok(Self {
            secret,
            validation: ValidationConfig::default(),
        })
    }

    /// Issue a token for a session starting now.
    pub fn issue(&self) -> Result<String, AuthError> {
        encode_token(&SessionClaims::new_session(), &self.secret)
    }

    /// Verify a token and return its claims.
    ///
    /// Malformed input, a foreign algorithm, a bad signature and a time
    /// outside `[nbf, exp]` all come back as `Err`; nothing panics.
    pub fn verify(&self, token: &str) -> Result<SessionClaims, AuthError> {
        decode_token_with_config(token, &self.secret, &self.validation)
    }
}

impl fmt::Debug for SessionTokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionTokens")
            .field("secret", &"<redacted>")
            .field("validation", &self.validation)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_new_rejects_empty_secret() {
        assert!(matches!(
            SessionTokens::new(Vec::new()).unwrap_err(),
            AuthError::InvalidKey(_)
        ));
    }

    #[test]
    fn test_issue_then_verify() {
        let tokens = SessionTokens::new("s3cret").unwrap();
        let token = tokens.issue().unwrap();

        let claims = tokens.verify(&token).unwrap();
        assert_eq!(claims.iss, "tps");
        assert_eq!(claims.aud, "caddy");
        assert!(tokens.verify(&token).is_ok());
    }

    #[test]
    fn test_verify_with_other_secret_fails() {
        let issuer = SessionTokens::new("one").unwrap();
        let verifier = SessionTokens::new("two").unwrap();
        let token = issuer.issue().unwrap();

        assert!(matches!(
            verifier.verify(&token).unwrap_err(),
            AuthError::InvalidSignature
        ));
    }

    #[test]
    fn test_verify_expired_token() {
        let tokens = SessionTokens::new("s3cret").unwrap();
        let claims = SessionClaims::builder()
            .issued_at(Utc::now().timestamp() - 90_000)
            .not_before(Utc::now().timestamp() - 90_000)
            .expiration(Utc::now().timestamp() - 3_600)
            .build();
        let token = encode_token(&claims, b"s3cret").unwrap();

        assert!(tokens.verify(&token).unwrap_err().is_time_window_error());
    }

    #[test]
    fn test_verify_garbage() {
        let tokens = SessionTokens::new("s3cret").unwrap();
        assert!(tokens.verify("garbage").is_err());
        assert!(tokens.verify("").is_err());
    }

    #[test]
    fn test_debug_redacts_secret() {
        let tokens = SessionTokens::new("very-private").unwrap();
        let rendered = format!("{tokens:?}");
        assert!(!rendered.contains("very-private"));
    }
}
