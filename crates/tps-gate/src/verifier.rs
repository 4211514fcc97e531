//! Server-side verification of challenge responses.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use thiserror::Error;

/// Errors reaching or understanding the verification authority.
///
/// Neither variant means the user failed the challenge; that outcome is a
/// successful call returning `success: false`.
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("verification provider unreachable: {0}")]
    ProviderUnreachable(String),

    #[error("verification provider returned a malformed response: {0}")]
    ProviderMalformedResponse(String),
}

/// Decoded siteverify response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct VerifyOutcome {
    pub success: bool,
    #[serde(rename = "error-codes", default)]
    pub error_codes: Vec<String>,
    #[serde(default)]
    pub challenge_ts: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
}

/// Capability to check a client's challenge proof.
#[async_trait]
pub trait Verifier: Send + Sync {
    async fn verify(&self, secret_key: &str, response: &str) -> Result<VerifyOutcome, VerifyError>;
}

/// Verifier backed by the Turnstile siteverify endpoint.
#[derive(Debug, Clone)]
pub struct TurnstileVerifier {
    client: Client,
    url: Url,
}

impl TurnstileVerifier {
    /// Create a verifier posting to `url`, giving up after `timeout`.
    pub fn new(url: Url, timeout: Duration) -> Result<Self, VerifyError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| VerifyError::ProviderUnreachable(e.to_string()))?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl Verifier for TurnstileVerifier {
    async fn verify(&self, secret_key: &str, response: &str) -> Result<VerifyOutcome, VerifyError> {
        let reply = self
            .client
            .post(self.url.clone())
            .form(&[("secret", secret_key), ("response", response)])
            .send()
            .await
            .map_err(|e| VerifyError::ProviderUnreachable(e.to_string()))?;

        let status = reply.status();
        if !status.is_success() {
            return Err(VerifyError::ProviderUnreachable(format!(
                "unexpected status {status}"
            )));
        }

        let body = reply
            .bytes()
            .await
            .map_err(|e| VerifyError::ProviderUnreachable(e.to_string()))?;

        serde_json::from_slice(&body)
            .map_err(|e| VerifyError::ProviderMalformedResponse(e.to_string()))
    }
}
