use std::fmt;
use std::time::Duration;

/// One failed transport attempt, kept for the combined bad-gateway report.
#[derive(Debug, Clone)]
pub struct FailureRecord {
    pub transport: &'static str,
    pub message: String,
    pub elapsed: Duration,
}

#[derive(Debug)]
pub enum ProxyError {
    /// TCP dial failure — always eligible for transport fallback.
    Connect(String),
    /// Socket-level read/write failure after the connection was established.
    Io(std::io::Error),
    /// TLS handshake or certificate failure — never eligible for fallback.
    Tls(String),
    /// Malformed HTTP/1.1 framing from the upstream — never eligible.
    Protocol(String),
    /// WebSocket framing violation (oversized payload, truncated header, ...).
    WebSocket(String),
    /// Upstream refused the WebSocket upgrade handshake.
    UpgradeRejected(u16, String),
    /// High-level client failure.
    Fetch(reqwest::Error),
    /// Per-attempt timeout on the high-level path.
    Timeout,
    /// Both transports failed; carries the per-attempt records.
    BadGateway(Vec<FailureRecord>),
    /// The downstream client went away; a write on the response body failed.
    Disconnected,
    /// Request could not be represented (bad URL, header value, body read).
    BadRequest(String),
    Internal(String),
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::Connect(msg) => write!(f, "connect error: {}", msg),
            ProxyError::Io(e) => write!(f, "io error: {}", e),
            ProxyError::Tls(msg) => write!(f, "tls error: {}", msg),
            ProxyError::Protocol(msg) => write!(f, "protocol error: {}", msg),
            ProxyError::WebSocket(msg) => write!(f, "websocket error: {}", msg),
            ProxyError::UpgradeRejected(status, reason) => {
                write!(f, "upgrade rejected: {} {}", status, reason)
            }
            ProxyError::Fetch(e) => write!(f, "fetch error: {}", e),
            ProxyError::Timeout => write!(f, "request timed out"),
            ProxyError::BadGateway(records) => {
                write!(f, "all transports failed:")?;
                for r in records {
                    write!(
                        f,
                        " [{} after {}ms: {}]",
                        r.transport,
                        r.elapsed.as_millis(),
                        r.message
                    )?;
                }
                Ok(())
            }
            ProxyError::Disconnected => write!(f, "downstream disconnected"),
            ProxyError::BadRequest(msg) => write!(f, "bad request: {}", msg),
            ProxyError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for ProxyError {}

impl From<std::io::Error> for ProxyError {
    fn from(e: std::io::Error) -> Self {
        ProxyError::Io(e)
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(e: reqwest::Error) -> Self {
        ProxyError::Fetch(e)
    }
}

/// Substrings that mark an error message as a transient network condition.
/// Last-resort shim for errors that only carry a string; the typed variants
/// above are consulted first.
const NETWORK_ERROR_MARKERS: &[&str] = &[
    "network",
    "connection",
    "connect",
    "socket",
    "tcp",
    "timeout",
    "timed out",
    "refused",
    "reset",
    "aborted",
    "closed",
    "lost",
    "unreachable",
    "epipe",
    "stream",
];

pub fn message_looks_like_network_error(msg: &str) -> bool {
    let lower = msg.to_lowercase();
    NETWORK_ERROR_MARKERS.iter().any(|m| lower.contains(m))
}

impl ProxyError {
    /// Whether a raw-socket failure should trigger fallback to the
    /// high-level transport. TLS verification and protocol-parse failures
    /// are deliberate rejections, not transient conditions.
    pub fn eligible_for_fallback(&self) -> bool {
        match self {
            ProxyError::Connect(_) | ProxyError::Io(_) | ProxyError::Timeout => true,
            ProxyError::Tls(_) | ProxyError::Protocol(_) => false,
            other => message_looks_like_network_error(&other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_and_io_are_fallback_eligible() {
        assert!(ProxyError::Connect("dial tcp".into()).eligible_for_fallback());
        let io = ProxyError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "connection reset by peer",
        ));
        assert!(io.eligible_for_fallback());
    }

    #[test]
    fn tls_and_protocol_are_not() {
        assert!(!ProxyError::Tls("invalid peer certificate".into()).eligible_for_fallback());
        assert!(!ProxyError::Protocol("bad status line".into()).eligible_for_fallback());
    }

    #[test]
    fn substring_shim_catches_string_causes() {
        assert!(message_looks_like_network_error("Connection reset by peer"));
        assert!(message_looks_like_network_error("operation TIMED OUT"));
        assert!(!message_looks_like_network_error("invalid header value"));
    }
}
