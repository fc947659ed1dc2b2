use crate::error::ProxyError;
use crate::transport::BodyStream;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::StatusCode;
use http_body_util::{BodyExt, Full};
use hyper::body::Frame;
use std::net::IpAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Instant, SystemTime};
use tokio::sync::mpsc;

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, ProxyError>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty_body() -> BoxBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed()
}

/// Response body fed through an mpsc channel. Used for every streamed
/// response: the sender side lives in the producing task, and dropping the
/// response (client disconnect) closes the channel, which is how
/// cancellation reaches the producer.
pub struct ChannelBody<T> {
    rx: mpsc::Receiver<T>,
}

impl<T> ChannelBody<T> {
    pub fn new(rx: mpsc::Receiver<T>) -> Self {
        Self { rx }
    }
}

impl hyper::body::Body for ChannelBody<Bytes> {
    type Data = Bytes;
    type Error = ProxyError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, ProxyError>>> {
        self.get_mut()
            .rx
            .poll_recv(cx)
            .map(|opt| opt.map(|bytes| Ok(Frame::data(bytes))))
    }
}

impl hyper::body::Body for ChannelBody<Result<Bytes, ProxyError>> {
    type Data = Bytes;
    type Error = ProxyError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, ProxyError>>> {
        self.get_mut()
            .rx
            .poll_recv(cx)
            .map(|opt| opt.map(|item| item.map(Frame::data)))
    }
}

/// Bridge an upstream body stream into a response body. A pump task feeds
/// the channel; if the downstream goes away the send fails and the pump
/// drops the upstream stream, releasing its socket.
pub fn stream_to_body(mut stream: BodyStream) -> BoxBody {
    use futures_util::StreamExt;
    let (tx, rx) = mpsc::channel::<Result<Bytes, ProxyError>>(16);
    tokio::spawn(async move {
        while let Some(item) = stream.next().await {
            let stop = item.is_err();
            if tx.send(item).await.is_err() || stop {
                return;
            }
        }
    });
    ChannelBody::new(rx).boxed()
}

/// Every response the gateway originates or forwards carries the permissive
/// CORS marker.
pub fn apply_cors(headers: &mut http::HeaderMap) {
    headers.insert(
        HeaderName::from_static("access-control-allow-origin"),
        HeaderValue::from_static("*"),
    );
}

/// Preflight response: allow everything, cache the verdict for a day.
pub fn preflight_response() -> hyper::Response<BoxBody> {
    hyper::Response::builder()
        .status(StatusCode::NO_CONTENT)
        .header("access-control-allow-origin", "*")
        .header(
            "access-control-allow-methods",
            "GET, POST, PUT, PATCH, DELETE, HEAD, OPTIONS",
        )
        .header("access-control-allow-headers", "*")
        .header("access-control-max-age", "86400")
        .body(empty_body())
        .unwrap()
}

/// Per-request context: metadata for the access log and metrics.
pub struct RequestContext {
    pub method: String,
    pub path: String,
    pub route_id: String,
    pub client_ip: IpAddr,
    pub start: Instant,
}

impl RequestContext {
    pub fn new(method: String, path: String, client_ip: IpAddr) -> Self {
        Self {
            method,
            path,
            route_id: String::new(),
            client_ip,
            start: Instant::now(),
        }
    }

    /// Gateway-originated JSON error with the standard envelope. Metrics
    /// and the access log are recorded once at the handler's single exit.
    pub fn error_response(
        &self,
        status: StatusCode,
        message: &str,
        details: Option<serde_json::Value>,
    ) -> hyper::Response<BoxBody> {
        let mut payload = serde_json::json!({
            "error": {
                "code": status.as_u16(),
                "message": message,
                "timestamp": humantime::format_rfc3339_seconds(SystemTime::now()).to_string(),
            }
        });
        if let Some(details) = details {
            payload["error"]["details"] = details;
        }

        hyper::Response::builder()
            .status(status)
            .header("content-type", "application/json; charset=utf-8")
            .header("x-proxy-error", "true")
            .header("access-control-allow-origin", "*")
            .body(full_body(payload.to_string()))
            .unwrap()
    }

    pub fn count_request(&self, status: u16) {
        let mut buf = itoa::Buffer::new();
        let status_str = buf.format(status);

        metrics::counter!(
            "gateway_http_requests_total",
            "route" => self.route_id.clone(),
            "method" => self.method.clone(),
            "status_code" => status_str.to_owned(),
        )
        .increment(1);

        metrics::histogram!(
            "gateway_http_request_duration_seconds",
            "route" => self.route_id.clone(),
        )
        .record(self.start.elapsed().as_secs_f64());
    }

    /// Structured access log — one line per request at info level.
    pub fn log_access(&self, status: u16) {
        tracing::info!(
            client_ip = %self.client_ip,
            method = %self.method,
            path = %self.path,
            status = status,
            route = %self.route_id,
            latency_ms = %self.start.elapsed().as_millis(),
            "access"
        );
    }
}

const REDACTED_HEADERS: &[&str] = &["authorization", "x-goog-api-key", "x-api-key", "cookie"];

/// Debug-mode header dump with credential material masked.
pub fn log_request_headers(headers: &http::HeaderMap) {
    for (name, value) in headers.iter() {
        let shown = if REDACTED_HEADERS.contains(&name.as_str()) {
            "<redacted>"
        } else {
            value.to_str().unwrap_or("<binary>")
        };
        tracing::debug!(header = %name, value = %shown, "request header");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RequestContext {
        RequestContext::new(
            "GET".into(),
            "/x".into(),
            "127.0.0.1".parse().unwrap(),
        )
    }

    #[test]
    fn error_response_envelope() {
        let resp = ctx().error_response(StatusCode::UNAUTHORIZED, "unauthorized", None);
        assert_eq!(resp.status(), 401);
        assert_eq!(resp.headers().get("x-proxy-error").unwrap(), "true");
        assert_eq!(
            resp.headers().get("access-control-allow-origin").unwrap(),
            "*"
        );
        assert_eq!(
            resp.headers().get("content-type").unwrap(),
            "application/json; charset=utf-8"
        );
    }

    #[test]
    fn preflight_allows_everything() {
        let resp = preflight_response();
        assert_eq!(resp.status(), 204);
        assert!(resp
            .headers()
            .get("access-control-allow-methods")
            .unwrap()
            .to_str()
            .unwrap()
            .contains("POST"));
        assert_eq!(resp.headers().get("access-control-max-age").unwrap(), "86400");
    }
}
