//! Error types for session token operations.
//!
//! Every variant is a reason a token is not accepted. Callers on the
//! request path treat all of them the same way (the client is simply
//! unauthenticated); the variants exist for logging.

use thiserror::Error;

/// Session token error types.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// Token has expired (exp claim is in the past).
    #[error("Token has expired")]
    TokenExpired,

    /// Token is not valid yet (nbf claim is in the future).
    #[error("Token is not valid yet")]
    TokenNotYetValid,

    /// Token signature does not match the signing secret.
    #[error("Invalid token signature")]
    InvalidSignature,

    /// Token format is malformed or invalid.
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    /// Token was signed with something other than HS256.
    #[error("Unsupported algorithm: only HS256 is allowed")]
    InvalidAlgorithm,

    /// Token was issued by someone else.
    #[error("Invalid token issuer")]
    InvalidIssuer,

    /// Token was issued for a different audience.
    #[error("Invalid token audience")]
    InvalidAudience,

    /// Required claim is missing from token.
    #[error("Missing required claim: {0}")]
    MissingClaim(String),

    /// Signing secret is unusable.
    #[error("Invalid key: {0}")]
    InvalidKey(String),
}

impl AuthError {
    /// Check if this error came from the token's time window.
    #[must_use]
    pub fn is_time_window_error(&self) -> bool {
        matches!(self, AuthError::TokenExpired | AuthError::TokenNotYetValid)
    }
}
