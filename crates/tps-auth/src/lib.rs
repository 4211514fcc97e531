//! Session tokens for the turnstile proxy server.
//!
//! A session token is an HS256-signed JWT held by the client in the
//! `tps-jwt` cookie. It proves the client passed a challenge within the
//! last 24 hours.
//!
//! # Example
//!
//! ```rust
//! use tps_auth::SessionTokens;
//!
//! let tokens = SessionTokens::new("a-long-random-secret").unwrap();
//! let token = tokens.issue().unwrap();
//!
//! assert!(tokens.verify(&token).is_ok());
//! assert!(tokens.verify("not-a-token").is_err());
//! ```

mod claims;
mod error;
mod jwt;
mod session;

// Re-export public API
pub use claims::{
    SessionClaims, SessionClaimsBuilder, SESSION_AUDIENCE, SESSION_ISSUER, SESSION_LIFETIME_SECS,
};
pub use error::AuthError;
pub use jwt::{decode_token, decode_token_with_config, encode_token, ValidationConfig};
pub use session::SessionTokens;
