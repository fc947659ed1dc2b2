pub mod codec;
pub mod fetch;
pub mod raw;
pub mod ws_codec;

use crate::error::{FailureRecord, ProxyError};
use bytes::Bytes;
use futures_util::Stream;
use http::{HeaderMap, Method};
use regex::Regex;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::OnceLock;
use std::time::Instant;
use tracing::{debug, warn};

/// Byte-stream body handle of an upstream response. Dropping the stream
/// releases the underlying socket.
pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, ProxyError>> + Send>>;

/// Uniform upstream response produced by either transport and consumed
/// exactly once by the caller.
pub struct UpstreamResponse {
    pub status: u16,
    pub reason: String,
    pub headers: HeaderMap,
    pub body: BodyStream,
}

impl UpstreamResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Drain the whole body into one buffer. Only used for small bodies
    /// (error payloads); streaming callers consume `body` directly.
    pub async fn collect_body(self) -> Result<Bytes, ProxyError> {
        use futures_util::StreamExt;
        let mut body = self.body;
        let mut out = Vec::new();
        while let Some(chunk) = body.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(Bytes::from(out))
    }
}

/// Fully resolved request target: scheme + host + port + path-and-query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetUrl {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub path_and_query: String,
}

impl TargetUrl {
    pub fn default_port(scheme: &str) -> u16 {
        match scheme {
            "https" | "wss" => 443,
            _ => 80,
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self.scheme.as_str(), "https" | "wss")
    }

    /// Parse an absolute base URL such as `https://api.example.com/v1`.
    pub fn parse(url: &str) -> Result<Self, ProxyError> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| ProxyError::BadRequest(format!("not an absolute url: {}", url)))?;
        match scheme {
            "http" | "https" | "ws" | "wss" => {}
            other => {
                return Err(ProxyError::BadRequest(format!("unsupported scheme: {}", other)))
            }
        }
        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, ""),
        };
        if authority.is_empty() {
            return Err(ProxyError::BadRequest(format!("url has no host: {}", url)));
        }
        let (host, port) = match authority.rsplit_once(':') {
            Some((h, p)) => {
                let port = p
                    .parse::<u16>()
                    .map_err(|_| ProxyError::BadRequest(format!("bad port in url: {}", url)))?;
                (h.to_string(), port)
            }
            None => (authority.to_string(), Self::default_port(scheme)),
        };
        let path_and_query = if path.is_empty() { "/".to_string() } else { path.to_string() };
        Ok(Self {
            scheme: scheme.to_string(),
            host,
            port,
            path_and_query,
        })
    }

    /// Join a suffix (path + optional query, leading `/` optional) onto this
    /// base. Used to map a preset route's remainder onto its upstream base.
    pub fn join(&self, rest: &str) -> Self {
        let mut path = self.path_and_query.trim_end_matches('/').to_string();
        if !rest.is_empty() {
            if !rest.starts_with('/') {
                path.push('/');
            }
            path.push_str(rest);
        }
        if path.is_empty() {
            path.push('/');
        }
        Self {
            scheme: self.scheme.clone(),
            host: self.host.clone(),
            port: self.port,
            path_and_query: path,
        }
    }

    /// `host` or `host:port` as it should appear in a Host header: the port
    /// is included only when it differs from the scheme default.
    pub fn host_header(&self) -> String {
        if self.port == Self::default_port(&self.scheme) {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for TargetUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}{}", self.scheme, self.host_header(), self.path_and_query)
    }
}

/// Immutable request description handed to a transport. Each dispatch
/// attempt gets a fresh view; the buffered body makes cloning cheap.
#[derive(Debug, Clone)]
pub struct RequestEnvelope {
    pub method: Method,
    pub target: TargetUrl,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

fn hygiene_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^(host|accept-encoding|cf-|cdn-|referer|referrer)").expect("valid regex")
    })
}

/// Drop headers that would leak deployment metadata or force a content
/// encoding the codec cannot undo. Idempotent; repeated values survive.
pub fn filter_headers(headers: &HeaderMap) -> HeaderMap {
    let pattern = hygiene_pattern();
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers.iter() {
        if pattern.is_match(name.as_str()) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// A dispatcher the continuation engine can re-enter for retry requests.
/// Implemented by `TransportSelector`; test doubles script their own
/// responses.
pub trait Dispatch: Send + Sync {
    fn dispatch<'a>(
        &'a self,
        envelope: &'a RequestEnvelope,
        prefer_fetch: bool,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamResponse, ProxyError>> + Send + 'a>>;
}

/// Per-route transport selection with automatic fallback.
///
/// Policy: routes that prefer the high-level client go straight to it.
/// Everything else tries the raw socket first (it is the only path that can
/// suppress intermediary headers) and falls back to the high-level client
/// when the failure looks like a transient network condition.
pub struct TransportSelector {
    raw: raw::RawTransport,
    fetch: fetch::FetchTransport,
    aggressive_fallback: bool,
}

impl TransportSelector {
    pub fn new(aggressive_fallback: bool) -> Self {
        Self {
            raw: raw::RawTransport::new(),
            fetch: fetch::FetchTransport::new(),
            aggressive_fallback,
        }
    }

    /// The raw transport, for callers that need the socket itself (the
    /// WebSocket relay).
    pub fn raw_transport(&self) -> &raw::RawTransport {
        &self.raw
    }

    pub async fn send(
        &self,
        envelope: &RequestEnvelope,
        prefer_fetch: bool,
    ) -> Result<UpstreamResponse, ProxyError> {
        if prefer_fetch {
            return self.fetch.send(envelope).await;
        }

        let raw_start = Instant::now();
        let raw_err = match self.raw.send(envelope).await {
            Ok(resp) => return Ok(resp),
            Err(e) => e,
        };
        let raw_elapsed = raw_start.elapsed();

        if !self.aggressive_fallback && !raw_err.eligible_for_fallback() {
            warn!(
                target = %envelope.target,
                error = %raw_err,
                "transport: raw socket failed, not fallback-eligible"
            );
            return Err(raw_err);
        }

        debug!(
            target = %envelope.target,
            error = %raw_err,
            elapsed_ms = raw_elapsed.as_millis() as u64,
            "transport: raw socket failed, falling back to fetch"
        );
        metrics::counter!("gateway_transport_fallback_total").increment(1);

        let fetch_start = Instant::now();
        match self.fetch.send(envelope).await {
            Ok(resp) => Ok(resp),
            Err(fetch_err) => Err(ProxyError::BadGateway(vec![
                FailureRecord {
                    transport: "raw",
                    message: raw_err.to_string(),
                    elapsed: raw_elapsed,
                },
                FailureRecord {
                    transport: "fetch",
                    message: fetch_err.to_string(),
                    elapsed: fetch_start.elapsed(),
                },
            ])),
        }
    }
}

impl Dispatch for TransportSelector {
    fn dispatch<'a>(
        &'a self,
        envelope: &'a RequestEnvelope,
        prefer_fetch: bool,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamResponse, ProxyError>> + Send + 'a>> {
        Box::pin(self.send(envelope, prefer_fetch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn parse_base_url_with_default_port() {
        let t = TargetUrl::parse("https://api.example.com").unwrap();
        assert_eq!(t.scheme, "https");
        assert_eq!(t.host, "api.example.com");
        assert_eq!(t.port, 443);
        assert_eq!(t.path_and_query, "/");
    }

    #[test]
    fn parse_base_url_with_explicit_port_and_path() {
        let t = TargetUrl::parse("http://127.0.0.1:8081/v1").unwrap();
        assert_eq!(t.port, 8081);
        assert_eq!(t.path_and_query, "/v1");
        assert_eq!(t.host_header(), "127.0.0.1:8081");
    }

    #[test]
    fn parse_rejects_bad_inputs() {
        assert!(TargetUrl::parse("api.example.com/x").is_err());
        assert!(TargetUrl::parse("ftp://example.com").is_err());
        assert!(TargetUrl::parse("https://").is_err());
        assert!(TargetUrl::parse("https://host:notaport/x").is_err());
    }

    #[test]
    fn join_merges_base_path_and_rest() {
        let base = TargetUrl::parse("https://openrouter.example/api").unwrap();
        let joined = base.join("/v1/models?limit=5");
        assert_eq!(joined.path_and_query, "/api/v1/models?limit=5");

        let bare = TargetUrl::parse("https://api.example.com").unwrap();
        assert_eq!(bare.join("").path_and_query, "/");
        assert_eq!(bare.join("v1/models").path_and_query, "/v1/models");
    }

    #[test]
    fn host_header_omits_default_port() {
        let t = TargetUrl::parse("https://api.example.com").unwrap();
        assert_eq!(t.host_header(), "api.example.com");
    }

    #[test]
    fn filter_strips_leaky_headers() {
        let mut h = HeaderMap::new();
        h.insert("host", HeaderValue::from_static("gateway.internal"));
        h.insert("accept-encoding", HeaderValue::from_static("gzip"));
        h.insert("cf-connecting-ip", HeaderValue::from_static("1.2.3.4"));
        h.insert("CF-Ray", HeaderValue::from_static("abc"));
        h.insert("cdn-loop", HeaderValue::from_static("cloudflare"));
        h.insert("referer", HeaderValue::from_static("https://evil.example"));
        h.insert("authorization", HeaderValue::from_static("Bearer sk-1"));
        h.insert("content-type", HeaderValue::from_static("application/json"));

        let filtered = filter_headers(&h);
        assert!(filtered.get("host").is_none());
        assert!(filtered.get("accept-encoding").is_none());
        assert!(filtered.get("cf-connecting-ip").is_none());
        assert!(filtered.get("cf-ray").is_none());
        assert!(filtered.get("cdn-loop").is_none());
        assert!(filtered.get("referer").is_none());
        assert_eq!(filtered.get("authorization").unwrap(), "Bearer sk-1");
        assert_eq!(filtered.get("content-type").unwrap(), "application/json");
    }

    #[test]
    fn filter_is_idempotent_and_keeps_repeats() {
        let mut h = HeaderMap::new();
        h.append("x-custom", HeaderValue::from_static("a"));
        h.append("x-custom", HeaderValue::from_static("b"));
        h.insert("host", HeaderValue::from_static("x"));

        let once = filter_headers(&h);
        let twice = filter_headers(&once);
        assert_eq!(once, twice);
        let values: Vec<_> = twice.get_all("x-custom").iter().collect();
        assert_eq!(values.len(), 2);
    }
}
