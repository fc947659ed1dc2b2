pub mod engine;
pub mod language;
pub mod sse;

pub use engine::{ContinuationEngine, EngineSettings};

use http::header::{HeaderName, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use http::{HeaderMap, Method};

/// Google RPC status label for an HTTP status code, as used in Gemini error
/// payloads.
pub fn google_status(code: u16) -> &'static str {
    match code {
        400 => "INVALID_ARGUMENT",
        401 => "UNAUTHENTICATED",
        403 => "PERMISSION_DENIED",
        404 => "NOT_FOUND",
        429 => "RESOURCE_EXHAUSTED",
        500 => "INTERNAL",
        503 => "UNAVAILABLE",
        504 => "DEADLINE_EXCEEDED",
        _ => "UNKNOWN",
    }
}

/// The continuation engine only engages for streaming generate calls:
/// `POST` with `alt=sse` in the query.
pub fn is_stream_generate_request(method: &Method, path_and_query: &str) -> bool {
    if method != Method::POST {
        return false;
    }
    let Some((_, query)) = path_and_query.split_once('?') else {
        return false;
    };
    query
        .split('&')
        .any(|pair| matches!(pair.split_once('='), Some(("alt", "sse"))))
}

/// Continuation requests forward only these headers upstream.
pub fn continuation_headers(headers: &HeaderMap) -> HeaderMap {
    const KEEP: &[HeaderName] = &[AUTHORIZATION, CONTENT_TYPE, ACCEPT];
    let mut out = HeaderMap::new();
    for name in KEEP {
        for value in headers.get_all(name) {
            out.append(name.clone(), value.clone());
        }
    }
    let api_key = HeaderName::from_static("x-goog-api-key");
    for value in headers.get_all(&api_key) {
        out.append(api_key.clone(), value.clone());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn status_mapping() {
        assert_eq!(google_status(429), "RESOURCE_EXHAUSTED");
        assert_eq!(google_status(504), "DEADLINE_EXCEEDED");
        assert_eq!(google_status(418), "UNKNOWN");
    }

    #[test]
    fn stream_request_detection() {
        let post = Method::POST;
        assert!(is_stream_generate_request(
            &post,
            "/v1beta/models/g:streamGenerateContent?alt=sse"
        ));
        assert!(is_stream_generate_request(
            &post,
            "/v1beta/models/g:streamGenerateContent?key=k&alt=sse"
        ));
        assert!(!is_stream_generate_request(
            &post,
            "/v1beta/models/g:generateContent"
        ));
        assert!(!is_stream_generate_request(
            &post,
            "/v1beta/models/g:streamGenerateContent?alt=json"
        ));
        assert!(!is_stream_generate_request(
            &Method::GET,
            "/v1beta/models?alt=sse"
        ));
    }

    #[test]
    fn continuation_headers_whitelist() {
        let mut h = HeaderMap::new();
        h.insert("authorization", HeaderValue::from_static("Bearer x"));
        h.insert("x-goog-api-key", HeaderValue::from_static("k"));
        h.insert("content-type", HeaderValue::from_static("application/json"));
        h.insert("accept", HeaderValue::from_static("*/*"));
        h.insert("cookie", HeaderValue::from_static("secret"));
        h.insert("user-agent", HeaderValue::from_static("curl"));

        let kept = continuation_headers(&h);
        assert_eq!(kept.len(), 4);
        assert!(kept.get("cookie").is_none());
        assert!(kept.get("user-agent").is_none());
        assert_eq!(kept.get("x-goog-api-key").unwrap(), "k");
    }
}
