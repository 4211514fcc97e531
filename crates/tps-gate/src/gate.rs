//! Per-request gating: session check, challenge, verification and replay.

use std::error::Error as StdError;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::CACHE_CONTROL;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::Router;
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use bytes::Bytes;
use http_body_util::LengthLimitError;
use tower_http::trace::TraceLayer;
use tps_auth::{SessionTokens, SESSION_LIFETIME_SECS};

use crate::audit::{RequestLogger, RequestRecord};
use crate::config::GateConfig;
use crate::dispatch::{append_forwarded_for, Dispatcher, OutboundRequest, UpstreamDispatcher};
use crate::error::{GateError, GateResult};
use crate::pending::{CapturedRequest, PendingRequests};
use crate::request::{client_ip, parse_submission, public_host, ChallengeSubmission};
use crate::templates::{PageContext, TemplateResolver, CHALLENGE_TEMPLATE, FAILED_TEMPLATE};
use crate::verifier::{TurnstileVerifier, Verifier};

/// Cookie holding the session token.
pub const SESSION_COOKIE: &str = "tps-jwt";

/// Everything one inbound request needs, owned by the router state.
pub struct Gate {
    config: GateConfig,
    sessions: SessionTokens,
    pending: PendingRequests,
    templates: TemplateResolver,
    verifier: Arc<dyn Verifier>,
    dispatcher: Arc<dyn Dispatcher>,
    audit: Arc<dyn RequestLogger>,
}

/// Request facts needed after the request itself has been moved.
struct RequestInfo {
    client_ip: String,
    peer: Option<SocketAddr>,
    host: String,
    path: String,
    url: String,
}

impl Gate {
    pub fn new(
        config: GateConfig,
        templates: TemplateResolver,
        verifier: Arc<dyn Verifier>,
        dispatcher: Arc<dyn Dispatcher>,
        audit: Arc<dyn RequestLogger>,
    ) -> GateResult<Self> {
        let sessions = SessionTokens::new(config.jwt_signing_key.as_bytes())?;
        let pending = PendingRequests::new(config.pending_ttl, config.pending_max_bytes);

        Ok(Self {
            config,
            sessions,
            pending,
            templates,
            verifier,
            dispatcher,
            audit,
        })
    }

    /// Build a gate talking to the real verification authority and upstream.
    pub fn from_config(config: GateConfig, audit: Arc<dyn RequestLogger>) -> GateResult<Self> {
        let templates = TemplateResolver::load(&config.template_path)?;
        let verifier = TurnstileVerifier::new(config.verify_url.clone(), config.verify_timeout)?;
        let dispatcher =
            UpstreamDispatcher::new(config.proxy_target.clone(), config.upstream_timeout)?;

        Self::new(
            config,
            templates,
            Arc::new(verifier),
            Arc::new(dispatcher),
            audit,
        )
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    pub fn sessions(&self) -> &SessionTokens {
        &self.sessions
    }

    pub fn pending(&self) -> &PendingRequests {
        &self.pending
    }

    /// Run one request through the gate.
    pub async fn handle(&self, request: Request) -> Response {
        self.process(request)
            .await
            .unwrap_or_else(IntoResponse::into_response)
    }

    async fn process(&self, request: Request) -> GateResult<Response> {
        let peer = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        let (parts, body) = request.into_parts();

        let info = RequestInfo {
            client_ip: client_ip(&parts.headers, peer, self.config.trust_forwarded_headers),
            peer,
            host: public_host(&parts.uri, &parts.headers),
            path: parts.uri.path().to_string(),
            url: parts
                .uri
                .path_and_query()
                .map_or_else(|| parts.uri.path().to_string(), ToString::to_string),
        };

        if self.config.is_exempt_path(&info.path) {
            tracing::debug!(path = %info.path, "exempt path, forwarding");
            let request = OutboundRequest::new(parts.method, parts.uri, parts.headers, body);
            return self.forward(request, info.peer).await;
        }

        if self.has_valid_session(&parts.headers) {
            tracing::info!(url = %info.url, "valid session token, forwarding");
            self.audit
                .log_request(RequestRecord::authenticated(&info.client_ip, &info.url));
            let request = OutboundRequest::new(parts.method, parts.uri, parts.headers, body);
            return self.forward(request, info.peer).await;
        }

        // Only requests held back for a challenge are buffered.
        let body = buffer_body(body, self.config.max_body_size).await?;
        let request = CapturedRequest::new(parts.method, parts.uri, parts.headers, body);

        if let Some(submission) =
            parse_submission(&request.method, &request.headers, &request.body)?
        {
            return self.complete_challenge(submission, &info).await;
        }

        self.issue_challenge(request, &info).await
    }

    /// Whether the request carries a session cookie that verifies.
    ///
    /// Bad tokens are logged and otherwise treated like no token.
    fn has_valid_session(&self, headers: &HeaderMap) -> bool {
        let jar = CookieJar::from_headers(headers);
        let Some(cookie) = jar.get(SESSION_COOKIE) else {
            return false;
        };

        match self.sessions.verify(cookie.value()) {
            Ok(_) => true,
            Err(e) if e.is_time_window_error() => {
                tracing::debug!(error = %e, "session cookie outside its validity window");
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, "ignoring invalid session cookie");
                false
            }
        }
    }

    async fn complete_challenge(
        &self,
        submission: ChallengeSubmission,
        info: &RequestInfo,
    ) -> GateResult<Response> {
        tracing::info!(request_id = %submission.request_id, "received challenge response, verifying");

        let outcome = self
            .verifier
            .verify(&self.config.secret_key, &submission.response)
            .await?;

        if !outcome.success {
            tracing::warn!(
                request_id = %submission.request_id,
                error_codes = ?outcome.error_codes,
                "challenge verification failed"
            );
            self.audit
                .log_request(RequestRecord::challenge(&info.client_ip, &info.url, false));

            let context = PageContext {
                site_key: self.config.site_key.clone(),
                request_id: String::new(),
                post_action: info.path.clone(),
            };
            let page = self
                .templates
                .render_for(&info.host, &info.path, FAILED_TEMPLATE, &context)?;
            return Ok(page_response(StatusCode::UNAUTHORIZED, page));
        }

        tracing::info!(request_id = %submission.request_id, "challenge verification succeeded");
        self.audit
            .log_request(RequestRecord::challenge(&info.client_ip, &info.url, true));

        let token = self.sessions.issue()?;
        let jar = CookieJar::new().add(session_cookie(token));

        let original = self.pending.take(&submission.request_id).await;
        let replayed = match original {
            Some(original) => {
                tracing::info!(
                    request_id = %submission.request_id,
                    method = %original.method,
                    url = %original.path_and_query(),
                    "replaying original request"
                );
                self.forward(original.into(), info.peer).await
            }
            None => Err(GateError::PendingRequestMissing(submission.request_id)),
        };

        // The client did pass the challenge, so it keeps the session even
        // when the replay itself fails.
        Ok(match replayed {
            Ok(response) => (jar, response).into_response(),
            Err(e) => (jar, e).into_response(),
        })
    }

    async fn issue_challenge(
        &self,
        request: CapturedRequest,
        info: &RequestInfo,
    ) -> GateResult<Response> {
        let request_id = self.pending.put(request).await;
        tracing::info!(request_id = %request_id, url = %info.url, "no valid session, serving challenge");

        let context = PageContext {
            site_key: self.config.site_key.clone(),
            request_id,
            post_action: info.path.clone(),
        };
        let page = self
            .templates
            .render_for(&info.host, &info.path, CHALLENGE_TEMPLATE, &context)?;
        Ok(page_response(StatusCode::OK, page))
    }

    async fn forward(
        &self,
        mut request: OutboundRequest,
        peer: Option<SocketAddr>,
    ) -> GateResult<Response> {
        if let Some(peer) = peer {
            append_forwarded_for(&mut request.headers, &peer.ip().to_string());
        }
        Ok(self.dispatcher.dispatch(request).await?)
    }
}

/// Router sending every path and method through the gate.
pub fn router(gate: Arc<Gate>) -> Router {
    Router::new()
        .fallback(handle_request)
        .with_state(gate)
        .layer(TraceLayer::new_for_http())
}

async fn handle_request(State(gate): State<Arc<Gate>>, request: Request) -> Response {
    gate.handle(request).await
}

fn session_cookie(token: String) -> Cookie<'static> {
    Cookie::build((SESSION_COOKIE, token))
        .http_only(true)
        .secure(true)
        .path("/")
        .same_site(SameSite::Lax)
        .max_age(time::Duration::seconds(SESSION_LIFETIME_SECS))
        .build()
}

fn page_response(status: StatusCode, page: String) -> Response {
    (
        status,
        [(CACHE_CONTROL, HeaderValue::from_static("no-store"))],
        Html(page),
    )
        .into_response()
}

async fn buffer_body(body: Body, limit: usize) -> GateResult<Bytes> {
    axum::body::to_bytes(body, limit).await.map_err(|e| {
        if exceeds_limit(&e) {
            GateError::PayloadTooLarge
        } else {
            GateError::Internal(format!("failed to read request body: {e}"))
        }
    })
}

fn exceeds_limit(error: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(error);
    while let Some(e) = current {
        if e.is::<LengthLimitError>() {
            return true;
        }
        current = e.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::http::{Method, Request as HttpRequest};
    use reqwest::Url;
    use tower::ServiceExt;

    use crate::dispatch::DispatchError;
    use crate::verifier::{VerifyError, VerifyOutcome};

    struct FixedVerifier(Result<bool, ()>);

    #[async_trait]
    impl Verifier for FixedVerifier {
        async fn verify(&self, _: &str, _: &str) -> Result<VerifyOutcome, VerifyError> {
            match self.0 {
                Ok(success) => Ok(VerifyOutcome {
                    success,
                    ..VerifyOutcome::default()
                }),
                Err(()) => Err(VerifyError::ProviderUnreachable("down".into())),
            }
        }
    }

    /// Answers with the request line and remembers each forwarded body.
    #[derive(Default)]
    struct EchoDispatcher {
        seen: Mutex<Vec<Bytes>>,
    }

    #[async_trait]
    impl Dispatcher for EchoDispatcher {
        async fn dispatch(&self, request: OutboundRequest) -> Result<Response, DispatchError> {
            let line = format!("{} {}", request.method, request.path_and_query());
            let body = axum::body::to_bytes(request.body, usize::MAX)
                .await
                .map_err(|e| DispatchError::InvalidRequest(e.to_string()))?;
            self.seen.lock().unwrap().push(body);
            Ok((StatusCode::OK, line).into_response())
        }
    }

    #[derive(Default)]
    struct MemoryLogger(Mutex<Vec<RequestRecord>>);

    impl RequestLogger for MemoryLogger {
        fn log_request(&self, record: RequestRecord) {
            self.0.lock().unwrap().push(record);
        }
    }

    fn config() -> GateConfig {
        GateConfig::from_reader(|key| match key {
            "BIND_ADDR" => Ok("127.0.0.1:0".into()),
            "TURNSTILE_SECRET_KEY" => Ok("secret".into()),
            "TURNSTILE_SITE_KEY" => Ok("site-key".into()),
            "JWT_SIGNING_KEY" => Ok("signing-key".into()),
            "PROXY_TARGET" => Ok("http://upstream.invalid".into()),
            "MAX_BODY_SIZE_BYTES" => Ok("64".into()),
            "EXEMPT_PATHS" => Ok("/health".into()),
            _ => Err(std::env::VarError::NotPresent),
        })
        .unwrap()
    }

    fn gate_with(
        verdict: Result<bool, ()>,
    ) -> (Arc<Gate>, Arc<EchoDispatcher>, Arc<MemoryLogger>) {
        let dispatcher = Arc::new(EchoDispatcher::default());
        let logger = Arc::new(MemoryLogger::default());
        let gate = Gate::new(
            config(),
            TemplateResolver::core_only().unwrap(),
            Arc::new(FixedVerifier(verdict)),
            dispatcher.clone(),
            logger.clone(),
        )
        .unwrap();
        (Arc::new(gate), dispatcher, logger)
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn extract_request_id(page: &str) -> String {
        let marker = r#"name="request_id" value=""#;
        let start = page.find(marker).unwrap() + marker.len();
        page[start..start + 32].to_string()
    }

    #[test]
    fn test_session_cookie_attributes() {
        let cookie = session_cookie("tok".into());
        assert_eq!(cookie.name(), SESSION_COOKIE);
        assert_eq!(cookie.http_only(), Some(true));
        assert_eq!(cookie.secure(), Some(true));
        assert_eq!(cookie.path(), Some("/"));
        assert_eq!(cookie.max_age(), Some(time::Duration::hours(24)));
    }

    #[tokio::test]
    async fn test_unauthenticated_request_gets_challenge() {
        let (gate, dispatcher, logger) = gate_with(Ok(true));

        let response = router(gate.clone())
            .oneshot(
                HttpRequest::get("/docs?page=2")
                    .header("host", "example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get(CACHE_CONTROL).unwrap(), "no-store");
        let page = body_text(response).await;
        assert!(page.contains(r#"action="/docs""#));

        let id = extract_request_id(&page);
        assert!(gate.pending().contains(&id).await);
        assert!(dispatcher.seen.lock().unwrap().is_empty());
        assert!(logger.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_valid_session_is_forwarded() {
        let (gate, dispatcher, logger) = gate_with(Err(()));
        let token = gate.sessions().issue().unwrap();

        let response = router(gate)
            .oneshot(
                HttpRequest::delete("/items/1")
                    .header("cookie", format!("{SESSION_COOKIE}={token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "DELETE /items/1");
        assert_eq!(dispatcher.seen.lock().unwrap().len(), 1);
        assert!(logger.0.lock().unwrap()[0].had_valid_token);
    }

    #[tokio::test]
    async fn test_submission_success_replays_original() {
        let (gate, dispatcher, logger) = gate_with(Ok(true));
        let id = gate
            .pending()
            .put(CapturedRequest::new(
                Method::PATCH,
                "/orig?x=1".parse().unwrap(),
                HeaderMap::new(),
                Bytes::from_static(b"data"),
            ))
            .await;

        let response = router(gate.clone())
            .oneshot(
                HttpRequest::post("/orig")
                    .header("content-type", "application/x-www-form-urlencoded")
                    .body(Body::from(format!(
                        "request_id={id}&cf-turnstile-response=proof"
                    )))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let cookie = response.headers().get("set-cookie").unwrap().to_str().unwrap();
        assert!(cookie.starts_with("tps-jwt="));
        assert!(cookie.contains("HttpOnly"));
        assert_eq!(body_text(response).await, "PATCH /orig?x=1");

        assert_eq!(dispatcher.seen.lock().unwrap()[0], Bytes::from_static(b"data"));
        assert!(!gate.pending().contains(&id).await);
        let records = logger.0.lock().unwrap();
        assert!(records[0].was_presented_challenge && records[0].challenge_succeeded);
    }

    #[tokio::test]
    async fn test_submission_failure_renders_failed_page() {
        let (gate, dispatcher, logger) = gate_with(Ok(false));

        let response = router(gate)
            .oneshot(
                HttpRequest::post("/orig")
                    .header("content-type", "application/x-www-form-urlencoded")
                    .body(Body::from("request_id=abc&cf-turnstile-response=bad"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().get("set-cookie").is_none());
        assert!(body_text(response).await.contains("Verification failed"));
        assert!(dispatcher.seen.lock().unwrap().is_empty());
        assert!(!logger.0.lock().unwrap()[0].challenge_succeeded);
    }

    #[tokio::test]
    async fn test_provider_error_is_internal_error() {
        let (gate, _, logger) = gate_with(Err(()));

        let response = router(gate)
            .oneshot(
                HttpRequest::post("/orig")
                    .header("content-type", "application/x-www-form-urlencoded")
                    .body(Body::from("request_id=abc&cf-turnstile-response=x"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(response.headers().get("set-cookie").is_none());
        assert_eq!(body_text(response).await, "failed to verify challenge");
        assert!(logger.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_pending_entry_keeps_cookie() {
        let (gate, _, _) = gate_with(Ok(true));

        let response = router(gate)
            .oneshot(
                HttpRequest::post("/orig")
                    .header("content-type", "application/x-www-form-urlencoded")
                    .body(Body::from("request_id=unknown&cf-turnstile-response=x"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(response.headers().get("set-cookie").is_some());
    }

    #[tokio::test]
    async fn test_body_over_limit_is_rejected() {
        let (gate, _, _) = gate_with(Ok(true));

        let response = router(gate)
            .oneshot(
                HttpRequest::post("/upload")
                    .body(Body::from(vec![b'a'; 65]))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_authenticated_body_over_limit_is_streamed_upstream() {
        let (gate, dispatcher, logger) = gate_with(Ok(true));
        let token = gate.sessions().issue().unwrap();

        let response = router(gate)
            .oneshot(
                HttpRequest::put("/upload")
                    .header("cookie", format!("{SESSION_COOKIE}={token}"))
                    .body(Body::from(vec![b'a'; 65]))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "PUT /upload");
        assert_eq!(dispatcher.seen.lock().unwrap()[0].len(), 65);
        assert!(logger.0.lock().unwrap()[0].had_valid_token);
    }

    #[tokio::test]
    async fn test_exempt_path_body_is_not_limited() {
        let (gate, dispatcher, _) = gate_with(Ok(true));

        let response = router(gate)
            .oneshot(
                HttpRequest::post("/health")
                    .body(Body::from(vec![b'a'; 100]))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(dispatcher.seen.lock().unwrap()[0].len(), 100);
    }

    #[tokio::test]
    async fn test_exempt_path_bypasses_gate() {
        let (gate, dispatcher, _) = gate_with(Ok(true));

        let response = router(gate)
            .oneshot(HttpRequest::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(body_text(response).await, "GET /health");
        assert_eq!(dispatcher.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_from_config_uses_core_templates_when_root_missing() {
        let mut config = config();
        config.template_path = std::env::temp_dir().join("tps-no-such-template-dir");
        config.verify_url = Url::parse("http://127.0.0.1:9/siteverify").unwrap();
        config.verify_timeout = Duration::from_secs(1);

        let gate = Gate::from_config(config, Arc::new(MemoryLogger::default()));
        assert!(gate.is_ok());
    }

    #[tokio::test]
    async fn test_exceeds_limit_walks_sources() {
        let err = axum::body::to_bytes(Body::from("too long"), 3)
            .await
            .unwrap_err();
        assert!(exceeds_limit(&err));

        let err = std::io::Error::other("boom");
        assert!(!exceeds_limit(&err));
    }
}
