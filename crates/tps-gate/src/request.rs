use std::net::SocketAddr;

use axum::http::header::{CONTENT_TYPE, HOST};
use axum::http::{HeaderMap, Method, Uri};

use crate::error::GateError;

/// Form field carrying the widget's proof.
pub const CHALLENGE_RESPONSE_FIELD: &str = "cf-turnstile-response";

/// Form field carrying the pending request identifier.
pub const REQUEST_ID_FIELD: &str = "request_id";

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// A submitted challenge form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeSubmission {
    /// Identifier of the captured request to replay.
    pub request_id: String,

    /// Proof produced by the challenge widget.
    pub response: String,
}

/// Detect a challenge submission in a buffered request.
///
/// Only a urlencoded POST carrying the challenge response field counts.
/// Everything else yields `Ok(None)` and is treated as an ordinary
/// request. A submission with an empty proof or identifier is rejected.
pub fn parse_submission(
    method: &Method,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Option<ChallengeSubmission>, GateError> {
    if *method != Method::POST || !is_form(headers) {
        return Ok(None);
    }

    let Ok(fields) = serde_urlencoded::from_bytes::<Vec<(String, String)>>(body) else {
        return Ok(None);
    };

    let Some(response) = field(&fields, CHALLENGE_RESPONSE_FIELD) else {
        return Ok(None);
    };

    if response.is_empty() {
        return Err(GateError::BadRequest("missing challenge response".into()));
    }

    let request_id = field(&fields, REQUEST_ID_FIELD).unwrap_or_default();
    if request_id.is_empty() {
        return Err(GateError::BadRequest("missing request_id".into()));
    }

    Ok(Some(ChallengeSubmission {
        request_id: request_id.to_string(),
        response: response.to_string(),
    }))
}

fn field<'a>(fields: &'a [(String, String)], name: &str) -> Option<&'a str> {
    fields
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.trim())
}

fn is_form(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
        .is_some_and(|mime| mime.trim().eq_ignore_ascii_case(FORM_CONTENT_TYPE))
}

/// Address of the client for audit records.
///
/// With `trust_forwarded` the first `X-Forwarded-For` entry wins, then
/// `X-Real-IP`; otherwise only the socket peer is used.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>, trust_forwarded: bool) -> String {
    if trust_forwarded {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|ip| !ip.is_empty());
        if let Some(ip) = forwarded {
            return ip.to_string();
        }

        let real_ip = headers
            .get("x-real-ip")
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|ip| !ip.is_empty());
        if let Some(ip) = real_ip {
            return ip.to_string();
        }
    }

    peer.map_or_else(|| "unknown".to_string(), |addr| addr.ip().to_string())
}

/// Public hostname the client asked for, lowercased and without a port.
///
/// Empty when neither the request target nor `Host` names one.
pub fn public_host(uri: &Uri, headers: &HeaderMap) -> String {
    let raw = uri.host().map(str::to_string).or_else(|| {
        headers
            .get(HOST)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    });

    raw.map(|host| strip_port(host.trim()).to_ascii_lowercase())
        .unwrap_or_default()
}

fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn form_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded; charset=UTF-8"),
        );
        headers
    }

    #[test]
    fn test_parse_submission_complete() {
        let parsed = parse_submission(
            &Method::POST,
            &form_headers(),
            b"request_id=abc123&cf-turnstile-response=proof%2Bvalue",
        )
        .unwrap()
        .unwrap();

        assert_eq!(parsed.request_id, "abc123");
        assert_eq!(parsed.response, "proof+value");
    }

    #[test]
    fn test_parse_submission_ignores_non_post() {
        let parsed = parse_submission(
            &Method::GET,
            &form_headers(),
            b"request_id=abc&cf-turnstile-response=x",
        )
        .unwrap();
        assert!(parsed.is_none());
    }

    #[test]
    fn test_parse_submission_ignores_other_content_types() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let parsed = parse_submission(
            &Method::POST,
            &headers,
            br#"{"request_id":"abc","cf-turnstile-response":"x"}"#,
        )
        .unwrap();
        assert!(parsed.is_none());
    }

    #[test]
    fn test_parse_submission_ignores_forms_without_proof() {
        let parsed = parse_submission(&Method::POST, &form_headers(), b"user=alice&pw=secret")
            .unwrap();
        assert!(parsed.is_none());
    }

    #[test]
    fn test_parse_submission_rejects_missing_request_id() {
        let err = parse_submission(&Method::POST, &form_headers(), b"cf-turnstile-response=x")
            .unwrap_err();
        assert!(matches!(err, GateError::BadRequest(_)));

        let err = parse_submission(
            &Method::POST,
            &form_headers(),
            b"cf-turnstile-response=x&request_id=",
        )
        .unwrap_err();
        assert!(matches!(err, GateError::BadRequest(_)));
    }

    #[test]
    fn test_parse_submission_rejects_empty_proof() {
        let err = parse_submission(
            &Method::POST,
            &form_headers(),
            b"cf-turnstile-response=&request_id=abc",
        )
        .unwrap_err();
        assert!(matches!(err, GateError::BadRequest(_)));
    }

    #[test]
    fn test_client_ip_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static(" 203.0.113.7 , 10.0.0.1"));
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.1"));
        let peer: SocketAddr = "127.0.0.1:5000".parse().unwrap();

        assert_eq!(client_ip(&headers, Some(peer), true), "203.0.113.7");
        assert_eq!(client_ip(&headers, Some(peer), false), "127.0.0.1");
    }

    #[test]
    fn test_client_ip_falls_back() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.1"));
        assert_eq!(client_ip(&headers, None, true), "198.51.100.1");

        let peer: SocketAddr = "[::1]:8080".parse().unwrap();
        assert_eq!(client_ip(&HeaderMap::new(), Some(peer), true), "::1");
        assert_eq!(client_ip(&HeaderMap::new(), None, true), "unknown");
    }

    #[test]
    fn test_public_host_from_header() {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("Example.COM:8443"));
        assert_eq!(public_host(&Uri::from_static("/path"), &headers), "example.com");
    }

    #[test]
    fn test_public_host_prefers_absolute_target() {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("other.example"));
        let uri = Uri::from_static("http://site.example:8080/a");
        assert_eq!(public_host(&uri, &headers), "site.example");
    }

    #[test]
    fn test_public_host_ipv6_and_missing() {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("[2001:db8::1]:443"));
        assert_eq!(public_host(&Uri::from_static("/"), &headers), "2001:db8::1");

        assert_eq!(public_host(&Uri::from_static("/"), &HeaderMap::new()), "");
    }
}
