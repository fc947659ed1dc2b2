//! WebSocket relay: bidirectional frame pump between a downstream hyper
//! upgrade and an upstream raw socket.

use crate::error::ProxyError;
use crate::proxy::context::{empty_body, BoxBody};
use crate::transport::codec::read_preamble;
use crate::transport::raw::{Conn, RawTransport};
use crate::transport::ws_codec::{
    accept_key, handshake_key, WsReceiver, WsRole, WsSender, OP_BINARY, OP_CLOSE,
    OP_CONTINUATION, OP_PING, OP_PONG, OP_TEXT,
};
use crate::transport::{filter_headers, TargetUrl};
use bytes::BytesMut;
use http::header::{CONNECTION, UPGRADE};
use http::HeaderMap;
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

/// Sessions are torn down after this long without a frame in either
/// direction on the respective pump.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

/// Perform the upstream handshake, answer the downstream handshake, and
/// hand the paired sockets to the pump task. Returns the `101` response
/// that hyper completes the downstream upgrade with.
pub async fn relay(
    req: Request<Incoming>,
    target: TargetUrl,
    raw: &RawTransport,
) -> Result<Response<BoxBody>, ProxyError> {
    let client_key = req
        .headers()
        .get("sec-websocket-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .ok_or_else(|| ProxyError::BadRequest("missing sec-websocket-key".into()))?;

    // Upstream side first: no point upgrading the client if the upstream
    // refuses us.
    let mut conn = raw.connect(&target).await?;
    let upstream_key = handshake_key();
    let handshake = build_upgrade_request(&target, req.headers(), &upstream_key);
    conn.write_all(&handshake).await?;
    conn.flush().await?;

    let mut leftover = BytesMut::new();
    let preamble = read_preamble(&mut conn, &mut leftover).await?;
    if preamble.status != 101 || !preamble.reason.eq_ignore_ascii_case("switching protocols") {
        warn!(
            target = %target,
            status = preamble.status,
            reason = %preamble.reason,
            "ws: upstream refused upgrade"
        );
        return Err(ProxyError::UpgradeRejected(preamble.status, preamble.reason));
    }
    debug!(target = %target, "ws: upstream upgrade accepted");

    let accept = accept_key(&client_key);
    let upgrade_fut = hyper::upgrade::on(req);
    tokio::spawn(async move {
        match upgrade_fut.await {
            Ok(upgraded) => {
                metrics::gauge!("gateway_ws_sessions_active").increment(1.0);
                pump_session(TokioIo::new(upgraded), conn, leftover).await;
                metrics::gauge!("gateway_ws_sessions_active").decrement(1.0);
            }
            Err(e) => warn!(error = %e, "ws: downstream upgrade failed"),
        }
    });

    Ok(Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(UPGRADE, "websocket")
        .header(CONNECTION, "Upgrade")
        .header("sec-websocket-accept", accept)
        .body(empty_body())
        .unwrap())
}

/// Synthesised HTTP/1.1 upgrade request for the upstream socket.
fn build_upgrade_request(target: &TargetUrl, client_headers: &HeaderMap, key: &str) -> BytesMut {
    let mut out = BytesMut::with_capacity(512);
    out.extend_from_slice(b"GET ");
    out.extend_from_slice(target.path_and_query.as_bytes());
    out.extend_from_slice(b" HTTP/1.1\r\n");
    out.extend_from_slice(b"Host: ");
    out.extend_from_slice(target.host_header().as_bytes());
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(b"Upgrade: websocket\r\nConnection: Upgrade\r\n");
    out.extend_from_slice(b"Sec-WebSocket-Key: ");
    out.extend_from_slice(key.as_bytes());
    out.extend_from_slice(b"\r\nSec-WebSocket-Version: 13\r\n");

    // The relay speaks its own handshake; drop the client's copy of it
    // along with the usual hygiene set.
    for (name, value) in filter_headers(client_headers).iter() {
        let lower = name.as_str();
        if lower == "upgrade"
            || lower == "connection"
            || lower.starts_with("sec-websocket-")
        {
            continue;
        }
        out.extend_from_slice(lower.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
}

/// Run both pumps until one side closes, errors, or idles out. Everything
/// (both sockets, reader buffers, writer locks) is owned here, so teardown
/// happens exactly once, whichever pump finishes first.
async fn pump_session<D>(downstream: D, upstream: Conn, leftover: BytesMut)
where
    D: AsyncRead + AsyncWrite + Send + 'static,
{
    let (up_read, up_write) = tokio::io::split(upstream);
    let (down_read, down_write) = tokio::io::split(downstream);

    let up_sender = WsSender::new(up_write, WsRole::Client);
    let mut up_receiver = WsReceiver::with_leftover(up_read, up_sender.clone(), leftover);
    let down_sender = WsSender::new(down_write, WsRole::Server);
    let mut down_receiver = WsReceiver::new(down_read, down_sender.clone());

    let result = tokio::select! {
        r = client_to_upstream(&mut down_receiver, &up_sender) => r,
        r = upstream_to_client(&mut up_receiver, &down_sender) => r,
    };
    if let Err(e) = result {
        debug!(error = %e, "ws: session ended");
    }
}

/// Downstream frames, one timed read per frame so ping/pong keepalives
/// reset the idle clock too. Completed client messages are relayed
/// upstream as text messages, masked by the client-role sender.
async fn client_to_upstream<R, W, UW>(
    down: &mut WsReceiver<R, W>,
    up: &WsSender<UW>,
) -> Result<(), ProxyError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    UW: AsyncWrite + Unpin,
{
    loop {
        let frame = match tokio::time::timeout(IDLE_TIMEOUT, down.read_frame()).await {
            Err(_) => {
                debug!("ws: downstream idle timeout");
                let _ = up.close(1000).await;
                return Ok(());
            }
            Ok(Ok(Some(frame))) => frame,
            Ok(Ok(None)) => {
                // Client closed; pass it on.
                let _ = up.close(1000).await;
                return Ok(());
            }
            Ok(Err(e)) => {
                let _ = up.close(1000).await;
                return Err(e);
            }
        };

        match frame.opcode {
            OP_TEXT | OP_BINARY | OP_CONTINUATION => {
                if let Some((_, payload)) = down.assemble(frame)? {
                    up.send_message(OP_TEXT, &payload).await?;
                }
            }
            OP_CLOSE => {
                let _ = up.close(1000).await;
                return Ok(());
            }
            // Ping answered inside the receiver; both reset the idle timer
            // by virtue of being reads.
            OP_PING | OP_PONG => {}
            other => debug!(opcode = other, "ws: skipping unknown opcode"),
        }
    }
}

/// Upstream frames are dispatched by opcode; fragments are reassembled
/// before forwarding so the downstream sender can re-fragment as needed.
async fn upstream_to_client<R, W, DW>(
    up: &mut WsReceiver<R, W>,
    down: &WsSender<DW>,
) -> Result<(), ProxyError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    DW: AsyncWrite + Unpin,
{
    loop {
        let frame = match tokio::time::timeout(IDLE_TIMEOUT, up.read_frame()).await {
            Err(_) => {
                debug!("ws: upstream idle timeout");
                let _ = down.close(1000).await;
                return Ok(());
            }
            Ok(Ok(Some(frame))) => frame,
            Ok(Ok(None)) => {
                let _ = down.close(1000).await;
                return Ok(());
            }
            Ok(Err(e)) => {
                let _ = down.close(1000).await;
                return Err(e);
            }
        };

        match frame.opcode {
            OP_TEXT | OP_BINARY | OP_CONTINUATION => {
                if let Some((opcode, payload)) = up.assemble(frame)? {
                    down.send_message(opcode, &payload).await?;
                }
            }
            OP_CLOSE => {
                debug!("ws: upstream close, shutting down");
                let _ = down.close(1000).await;
                return Ok(());
            }
            // Ping answered inside the receiver; both reset the idle timer
            // by virtue of being reads.
            OP_PING | OP_PONG => {}
            other => debug!(opcode = other, "ws: skipping unknown opcode"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn upgrade_detection_is_case_insensitive() {
        let mut h = HeaderMap::new();
        h.insert(UPGRADE, HeaderValue::from_static("WebSocket"));
        assert!(is_websocket_upgrade(&h));
        let mut h = HeaderMap::new();
        h.insert(UPGRADE, HeaderValue::from_static("h2c"));
        assert!(!is_websocket_upgrade(&h));
        assert!(!is_websocket_upgrade(&HeaderMap::new()));
    }

    #[test]
    fn upgrade_request_shape() {
        let target = TargetUrl::parse("wss://stream.example.com/v1/live?model=x").unwrap();
        let mut client_headers = HeaderMap::new();
        client_headers.insert("authorization", HeaderValue::from_static("Bearer k"));
        client_headers.insert("sec-websocket-key", HeaderValue::from_static("client-key"));
        client_headers.insert("sec-websocket-version", HeaderValue::from_static("13"));
        client_headers.insert("host", HeaderValue::from_static("gateway.local"));
        client_headers.insert("connection", HeaderValue::from_static("Upgrade"));

        let wire = build_upgrade_request(&target, &client_headers, "fresh-key");
        let text = std::str::from_utf8(&wire).unwrap();

        assert!(text.starts_with("GET /v1/live?model=x HTTP/1.1\r\n"));
        assert!(text.contains("Host: stream.example.com\r\n"));
        assert!(text.contains("Sec-WebSocket-Key: fresh-key\r\n"));
        assert!(text.contains("Sec-WebSocket-Version: 13\r\n"));
        assert!(text.contains("authorization: Bearer k\r\n"));
        // The client's own handshake headers are replaced, not forwarded.
        assert!(!text.contains("client-key"));
        assert!(!text.contains("gateway.local"));
        assert_eq!(text.matches("Sec-WebSocket-Key").count(), 1);
    }
}
