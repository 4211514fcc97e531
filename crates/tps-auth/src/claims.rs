//! Session claims carried by the `tps-jwt` cookie.
//!
//! A session token proves that the holder completed a challenge. It names
//! no user: the claim set is fixed (issuer, audience and the validity
//! window) and only the timestamps vary between tokens.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Issuer written into every session token.
pub const SESSION_ISSUER: &str = "tps";

/// Audience written into every session token.
pub const SESSION_AUDIENCE: &str = "caddy";

/// How long a freshly issued session stays valid.
pub const SESSION_LIFETIME_SECS: i64 = 24 * 60 * 60;

/// Claims of a session token.
///
/// # Example
///
/// ```rust
/// use tps_auth::SessionClaims;
///
/// let claims = SessionClaims::builder().expires_in_secs(3600).build();
///
/// assert_eq!(claims.iss, "tps");
/// assert_eq!(claims.nbf, claims.iat);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionClaims {
    /// Issuer.
    pub iss: String,

    /// Audience.
    pub aud: String,

    /// Issued at as Unix timestamp.
    pub iat: i64,

    /// Not valid before this Unix timestamp.
    pub nbf: i64,

    /// Expiration time as Unix timestamp.
    pub exp: i64,
}

impl SessionClaims {
    /// Claims for a new session starting now with the standard lifetime.
    #[must_use]
    pub fn new_session() -> Self {
        Self::builder().build()
    }

    /// Create a new builder for constructing session claims.
    #[must_use]
    pub fn builder() -> SessionClaimsBuilder {
        SessionClaimsBuilder::default()
    }
}

/// Builder for constructing session claims.
///
/// Unset fields fall back to the fixed session values: issuer
/// [`SESSION_ISSUER`], audience [`SESSION_AUDIENCE`], `iat`/`nbf` now,
/// `exp` now plus [`SESSION_LIFETIME_SECS`].
#[derive(Debug, Default)]
pub struct SessionClaimsBuilder {
    iss: Option<String>,
    aud: Option<String>,
    iat: Option<i64>,
    nbf: Option<i64>,
    exp: Option<i64>,
}

impl SessionClaimsBuilder {
    /// Set the issuer.
    #[must_use]
    pub fn issuer(mut self, iss: impl Into<String>) -> Self {
        self.iss = Some(iss.into());
        self
    }

    /// Set the audience.
    #[must_use]
    pub fn audience(mut self, aud: impl Into<String>) -> Self {
        self.aud = Some(aud.into());
        self
    }

    /// Set the issued at time.
    #[must_use]
    pub fn issued_at(mut self, iat: i64) -> Self {
        self.iat = Some(iat);
        self
    }

    /// Set the not-before time.
    #[must_use]
    pub fn not_before(mut self, nbf: i64) -> Self {
        self.nbf = Some(nbf);
        self
    }

    /// Set expiration time as Unix timestamp.
    #[must_use]
    pub fn expiration(mut self, exp: i64) -> Self {
        self.exp = Some(exp);
        self
    }

    /// Set expiration time as seconds from now.
    #[must_use]
    pub fn expires_in_secs(mut self, secs: i64) -> Self {
        self.exp = Some(Utc::now().timestamp() + secs);
        self
    }

    /// Build the claims.
    #[must_use]
    pub fn build(self) -> SessionClaims {
        let now = Utc::now().timestamp();
        SessionClaims {
            iss: self.iss.unwrap_or_else(|| SESSION_ISSUER.to_string()),
            aud: self.aud.unwrap_or_else(|| SESSION_AUDIENCE.to_string()),
            iat: self.iat.unwrap_or(now),
            nbf: self.nbf.unwrap_or(now),
            exp: self.exp.unwrap_or(now + SESSION_LIFETIME_SECS),
        }
    }
}
