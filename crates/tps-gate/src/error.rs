use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tps_auth::AuthError;

use crate::dispatch::DispatchError;
use crate::templates::TemplateError;
use crate::verifier::VerifyError;

/// Errors that end request handling with a plain error response.
///
/// Challenge failures and invalid sessions are not errors: they render
/// pages or fall through to a new challenge.
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("malformed challenge submission: {0}")]
    BadRequest(String),

    #[error("request body exceeds the configured limit")]
    PayloadTooLarge,

    #[error("challenge verification failed: {0}")]
    Verification(#[from] VerifyError),

    #[error("no pending request for id {0}")]
    PendingRequestMissing(String),

    #[error("session token error: {0}")]
    Session(#[from] AuthError),

    #[error("template error: {0}")]
    Template(#[from] TemplateError),

    #[error("upstream error: {0}")]
    Upstream(#[from] DispatchError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GateError {
    /// Returns the appropriate HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Upstream(DispatchError::Timeout) => StatusCode::GATEWAY_TIMEOUT,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::Verification(_)
            | Self::PendingRequestMissing(_)
            | Self::Session(_)
            | Self::Template(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns a sanitized message safe to return to clients.
    ///
    /// `Display` carries request ids and provider detail for logs; this
    /// does not.
    pub fn client_message(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "malformed challenge submission",
            Self::PayloadTooLarge => "request body too large",
            Self::Verification(_) => "failed to verify challenge",
            Self::PendingRequestMissing(_) => "original request not found or expired",
            Self::Upstream(DispatchError::Timeout) => "upstream timed out",
            Self::Upstream(_) => "upstream unavailable",
            Self::Session(_) | Self::Template(_) | Self::Internal(_) => "internal error",
        }
    }

    /// Returns a machine-readable error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::PayloadTooLarge => "payload_too_large",
            Self::Verification(VerifyError::ProviderUnreachable(_)) => "provider_unreachable",
            Self::Verification(VerifyError::ProviderMalformedResponse(_)) => {
                "provider_malformed_response"
            }
            Self::PendingRequestMissing(_) => "pending_request_missing",
            Self::Session(_) => "session_error",
            Self::Template(_) => "template_error",
            Self::Upstream(DispatchError::Timeout) => "upstream_timeout",
            Self::Upstream(_) => "upstream_unavailable",
            Self::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for GateError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, code = self.error_code(), "request failed");
        } else {
            tracing::warn!(error = %self, code = self.error_code(), "request rejected");
        }
        (status, self.client_message()).into_response()
    }
}

pub type GateResult<T> = Result<T, GateError>;
