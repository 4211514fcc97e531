//! Forwarding of captured or passthrough requests to the upstream.

use std::time::Duration;

use async_trait::async_trait;
use axum::body::{Body, HttpBody};
use axum::http::header::{CONNECTION, CONTENT_LENGTH, HOST};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, Uri};
use axum::response::Response;
use reqwest::redirect::Policy;
use reqwest::{Client, Url};
use thiserror::Error;

use crate::pending::CapturedRequest;

/// Headers that describe one connection and never cross a proxy.
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("upstream unavailable: {0}")]
    Unavailable(String),

    #[error("upstream timed out")]
    Timeout,

    #[error("invalid upstream request: {0}")]
    InvalidRequest(String),
}

/// A request on its way upstream.
///
/// Replayed captures carry their buffered body. Passthrough requests
/// stream the client's body as it arrives.
pub struct OutboundRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Body,
}

impl OutboundRequest {
    pub fn new(method: Method, uri: Uri, headers: HeaderMap, body: Body) -> Self {
        Self {
            method,
            uri,
            headers,
            body,
        }
    }

    pub fn path_and_query(&self) -> &str {
        self.uri.path_and_query().map_or("/", |pq| pq.as_str())
    }
}

impl From<CapturedRequest> for OutboundRequest {
    fn from(captured: CapturedRequest) -> Self {
        Self::new(
            captured.method,
            captured.uri,
            captured.headers,
            Body::from(captured.body),
        )
    }
}

/// Capability to forward a request and hand back the upstream response.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, request: OutboundRequest) -> Result<Response, DispatchError>;
}

/// Forwards to a single upstream base URL.
///
/// Only scheme and authority are taken from the target; path and query
/// come from the request unchanged. Redirects are passed back to the
/// client rather than followed.
///
/// `timeout` bounds connecting and each wait for upstream data, not the
/// whole exchange, so long downloads keep streaming as long as bytes flow.
#[derive(Debug, Clone)]
pub struct UpstreamDispatcher {
    client: Client,
    target: Url,
}

impl UpstreamDispatcher {
    pub fn new(target: Url, timeout: Duration) -> Result<Self, DispatchError> {
        let client = Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .redirect(Policy::none())
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| DispatchError::InvalidRequest(e.to_string()))?;

        Ok(Self { client, target })
    }

    /// Upstream URL for a request target.
    pub fn upstream_url(&self, uri: &Uri) -> Url {
        let mut url = self.target.clone();
        url.set_path(uri.path());
        url.set_query(uri.query());
        url
    }
}

#[async_trait]
impl Dispatcher for UpstreamDispatcher {
    async fn dispatch(&self, request: OutboundRequest) -> Result<Response, DispatchError> {
        let url = self.upstream_url(&request.uri);

        let mut headers = request.headers;
        strip_hop_by_hop(&mut headers);
        headers.remove(HOST);
        headers.remove(CONTENT_LENGTH);

        tracing::debug!(method = %request.method, url = %url, "forwarding request upstream");

        let body = request.body;
        if let Some(len) = body.size_hint().exact().filter(|len| *len > 0) {
            headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
        }

        let mut builder = self.client.request(request.method, url).headers(headers);
        if !body.is_end_stream() {
            builder = builder.body(reqwest::Body::wrap_stream(body.into_data_stream()));
        }

        let upstream = builder.send().await.map_err(map_reqwest_error)?;

        let status = upstream.status();
        let mut response_headers = upstream.headers().clone();
        strip_hop_by_hop(&mut response_headers);

        let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;
        Ok(response)
    }
}

fn map_reqwest_error(error: reqwest::Error) -> DispatchError {
    if error.is_timeout() {
        DispatchError::Timeout
    } else if error.is_builder() {
        DispatchError::InvalidRequest(error.to_string())
    } else {
        DispatchError::Unavailable(error.to_string())
    }
}

/// Remove hop-by-hop headers, including any named by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Append `peer_ip` to `X-Forwarded-For`, merging repeated header lines.
pub fn append_forwarded_for(headers: &mut HeaderMap, peer_ip: &str) {
    let prior: Vec<&str> = headers
        .get_all(&X_FORWARDED_FOR)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .collect();

    let value = if prior.is_empty() {
        peer_ip.to_string()
    } else {
        format!("{}, {peer_ip}", prior.join(", "))
    };

    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR.clone(), value);
    }
}
