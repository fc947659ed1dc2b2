//! Raw-socket HTTP/1.1 transport.
//!
//! Dials the upstream directly (TLS for https/wss) and speaks HTTP/1.1 by
//! hand through the frame codec. No intermediary ever touches the request,
//! so nothing beyond the serialized headers reaches the wire.

use crate::error::ProxyError;
use crate::transport::codec::{body_framing, read_preamble, BodyReader};
use crate::transport::{BodyStream, RequestEnvelope, TargetUrl, UpstreamResponse};
use bytes::BytesMut;
use http::header::{CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::Method;
use rustls::pki_types::ServerName;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Either a plain TCP stream or a TLS session over one.
pub trait RawConn: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> RawConn for T {}

pub type Conn = Box<dyn RawConn>;

pub struct RawTransport {
    tls: TlsConnector,
}

impl RawTransport {
    pub fn new() -> Self {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Self {
            tls: TlsConnector::from(Arc::new(config)),
        }
    }

    /// Dial `host:port`, wrapping in TLS when the scheme demands it.
    pub async fn connect(&self, target: &TargetUrl) -> Result<Conn, ProxyError> {
        let tcp = TcpStream::connect((target.host.as_str(), target.port))
            .await
            .map_err(|e| {
                ProxyError::Connect(format!("{}:{}: {}", target.host, target.port, e))
            })?;
        tcp.set_nodelay(true).ok();

        if !target.is_tls() {
            return Ok(Box::new(tcp));
        }

        let server_name = ServerName::try_from(target.host.clone())
            .map_err(|_| ProxyError::Tls(format!("invalid server name: {}", target.host)))?;
        let stream = self
            .tls
            .connect(server_name, tcp)
            .await
            .map_err(|e| ProxyError::Tls(e.to_string()))?;
        Ok(Box::new(stream))
    }

    /// One request-response exchange. The returned response's body stream
    /// owns the socket; dropping it releases the connection.
    pub async fn send(&self, envelope: &RequestEnvelope) -> Result<UpstreamResponse, ProxyError> {
        let mut conn = self.connect(&envelope.target).await?;

        let request = serialize_request(envelope);
        conn.write_all(&request).await?;
        conn.flush().await?;

        let mut leftover = BytesMut::new();
        let preamble = read_preamble(&mut conn, &mut leftover).await?;
        debug!(
            target = %envelope.target,
            status = preamble.status,
            "raw: response preamble received"
        );

        let framing = body_framing(&preamble.headers);
        let reader = BodyReader::new(conn, leftover, framing);

        Ok(UpstreamResponse {
            status: preamble.status,
            reason: preamble.reason,
            headers: preamble.headers,
            body: reader_stream(reader),
        })
    }
}

impl Default for RawTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn reader_stream(reader: BodyReader<Conn>) -> BodyStream {
    Box::pin(futures_util::stream::unfold(reader, |mut r| async move {
        match r.next_chunk().await {
            Ok(Some(chunk)) => Some((Ok(chunk), r)),
            Ok(None) => None,
            Err(e) => Some((Err(e), r)),
        }
    }))
}

/// Serialize the request line, hygiene-filtered headers, and buffered body
/// into one write. The gateway speaks for itself on `Host`,
/// `Accept-Encoding`, `Connection`, and `Content-Length`.
fn serialize_request(envelope: &RequestEnvelope) -> BytesMut {
    let body_len = envelope.body.as_ref().map(|b| b.len());
    let mut out = BytesMut::with_capacity(512 + body_len.unwrap_or(0));

    out.extend_from_slice(envelope.method.as_str().as_bytes());
    out.extend_from_slice(b" ");
    out.extend_from_slice(envelope.target.path_and_query.as_bytes());
    out.extend_from_slice(b" HTTP/1.1\r\n");

    out.extend_from_slice(b"Host: ");
    out.extend_from_slice(envelope.target.host_header().as_bytes());
    out.extend_from_slice(b"\r\n");

    for (name, value) in envelope.headers.iter() {
        // Owned by the serializer, not the caller.
        if name == CONTENT_LENGTH || name == TRANSFER_ENCODING || name == CONNECTION {
            continue;
        }
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }

    out.extend_from_slice(b"Accept-Encoding: identity\r\n");
    out.extend_from_slice(b"Connection: close\r\n");

    match body_len {
        Some(len) => {
            let mut buf = itoa::Buffer::new();
            out.extend_from_slice(b"Content-Length: ");
            out.extend_from_slice(buf.format(len).as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        None => {
            // Bodyless POST/PUT still advertise an explicit zero length.
            if envelope.method == Method::POST || envelope.method == Method::PUT {
                out.extend_from_slice(b"Content-Length: 0\r\n");
            }
        }
    }

    out.extend_from_slice(b"\r\n");
    if let Some(body) = &envelope.body {
        out.extend_from_slice(body);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::filter_headers;
    use bytes::Bytes;
    use http::{HeaderMap, HeaderValue};

    fn envelope(method: Method, body: Option<Bytes>) -> RequestEnvelope {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer sk-1"));
        headers.insert("host", HeaderValue::from_static("gateway.local"));
        headers.insert("accept-encoding", HeaderValue::from_static("br"));
        headers.insert("content-length", HeaderValue::from_static("999"));
        RequestEnvelope {
            method,
            target: TargetUrl::parse("https://api.example.com/v1/chat?x=1").unwrap(),
            headers: filter_headers(&headers),
            body,
        }
    }

    #[test]
    fn serialized_request_shape() {
        let env = envelope(Method::POST, Some(Bytes::from_static(b"{\"a\":1}")));
        let wire = serialize_request(&env);
        let text = std::str::from_utf8(&wire).unwrap();

        assert!(text.starts_with("POST /v1/chat?x=1 HTTP/1.1\r\n"));
        assert!(text.contains("Host: api.example.com\r\n"));
        assert!(text.contains("authorization: Bearer sk-1\r\n"));
        assert!(text.contains("Accept-Encoding: identity\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.contains("Content-Length: 7\r\n"));
        assert!(text.ends_with("\r\n\r\n{\"a\":1}"));
        // The client's own framing headers never leak through.
        assert!(!text.contains("999"));
        assert!(!text.contains("gateway.local"));
        assert!(!text.contains("br"));
    }

    #[test]
    fn empty_post_gets_zero_content_length() {
        let env = envelope(Method::POST, None);
        let wire = serialize_request(&env);
        let text = std::str::from_utf8(&wire).unwrap();
        assert!(text.contains("Content-Length: 0\r\n"));
    }

    #[test]
    fn bodyless_get_has_no_content_length() {
        let env = envelope(Method::GET, None);
        let wire = serialize_request(&env);
        let text = std::str::from_utf8(&wire).unwrap();
        assert!(!text.contains("Content-Length"));
    }

    #[tokio::test]
    async fn refused_dial_classifies_as_connect() {
        let transport = RawTransport::new();
        // Port 1 on localhost is reliably closed.
        let env = RequestEnvelope {
            method: Method::GET,
            target: TargetUrl::parse("http://127.0.0.1:1/").unwrap(),
            headers: HeaderMap::new(),
            body: None,
        };
        match transport.send(&env).await {
            Err(e @ ProxyError::Connect(_)) => assert!(e.eligible_for_fallback()),
            other => panic!("expected connect error, got {:?}", other.map(|_| "response")),
        }
    }
}
