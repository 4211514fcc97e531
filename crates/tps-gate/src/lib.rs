//! Challenge gate for the turnstile proxy server.
//!
//! Every inbound request either carries a valid session cookie and is
//! forwarded upstream, or is captured and answered with a challenge page.
//! Solving the challenge issues a session cookie and replays the captured
//! request.

pub mod audit;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod gate;
pub mod pending;
pub mod request;
pub mod templates;
pub mod verifier;

pub use audit::{PgRequestLogger, RequestLogger, RequestRecord, TracingRequestLogger};
pub use config::{ConfigError, GateConfig};
pub use dispatch::{DispatchError, Dispatcher, OutboundRequest, UpstreamDispatcher};
pub use error::{GateError, GateResult};
pub use gate::{router, Gate, SESSION_COOKIE};
pub use pending::{CapturedRequest, PendingRequests};
pub use templates::{PageContext, TemplateError, TemplateResolver};
pub use verifier::{TurnstileVerifier, VerifyError, VerifyOutcome, Verifier};
