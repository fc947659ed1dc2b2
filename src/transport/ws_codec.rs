//! WebSocket frame packing/unpacking (RFC 6455 subset).
//!
//! Frames are capped at 65 535 payload bytes, so the 8-byte extended length
//! coding is never produced and is rejected on receipt. Larger logical
//! messages travel as fragments and are reassembled by the receiver.

use crate::error::ProxyError;
use base64::Engine;
use bytes::{Buf, Bytes, BytesMut};
use sha1::{Digest, Sha1};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

pub const OP_CONTINUATION: u8 = 0x0;
pub const OP_TEXT: u8 = 0x1;
pub const OP_BINARY: u8 = 0x2;
pub const OP_CLOSE: u8 = 0x8;
pub const OP_PING: u8 = 0x9;
pub const OP_PONG: u8 = 0xA;

/// Frames above this payload size are rejected in both directions.
pub const MAX_FRAME_PAYLOAD: usize = 65_535;

const WS_ACCEPT_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsFrame {
    pub fin: bool,
    pub opcode: u8,
    pub payload: Bytes,
}

impl WsFrame {
    pub fn is_control(&self) -> bool {
        self.opcode >= OP_CLOSE
    }
}

/// Which side of the connection we are. Per RFC 6455, client→server frames
/// are masked with a fresh key, server→client frames are not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsRole {
    Client,
    Server,
}

/// Random nonce for the `Sec-WebSocket-Key` handshake header.
pub fn handshake_key() -> String {
    let nonce: [u8; 16] = rand::random();
    base64::engine::general_purpose::STANDARD.encode(nonce)
}

/// `Sec-WebSocket-Accept` value for a given handshake key.
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_ACCEPT_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Serialize one complete (FIN) frame.
pub fn encode_frame(opcode: u8, payload: &[u8], mask: bool) -> Result<BytesMut, ProxyError> {
    encode_frame_with_fin(true, opcode, payload, mask)
}

pub fn encode_frame_with_fin(
    fin: bool,
    opcode: u8,
    payload: &[u8],
    mask: bool,
) -> Result<BytesMut, ProxyError> {
    if payload.len() > MAX_FRAME_PAYLOAD {
        return Err(ProxyError::WebSocket(format!(
            "frame payload too large: {} > {}",
            payload.len(),
            MAX_FRAME_PAYLOAD
        )));
    }

    let fin_bit = if fin { 0x80u8 } else { 0x00 };
    let mut out = BytesMut::with_capacity(payload.len() + 8);
    out.extend_from_slice(&[fin_bit | (opcode & 0x0F)]);

    let mask_bit = if mask { 0x80u8 } else { 0x00 };
    if payload.len() < 126 {
        out.extend_from_slice(&[mask_bit | payload.len() as u8]);
    } else {
        out.extend_from_slice(&[mask_bit | 126]);
        out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    }

    if mask {
        let key: [u8; 4] = rand::random();
        out.extend_from_slice(&key);
        let start = out.len();
        out.extend_from_slice(payload);
        for (i, byte) in out[start..].iter_mut().enumerate() {
            *byte ^= key[i % 4];
        }
    } else {
        out.extend_from_slice(payload);
    }

    Ok(out)
}

/// Try to pop one complete frame off the front of `buf`. `None` means more
/// bytes are needed; the buffer is left untouched in that case.
pub fn decode_frame(buf: &mut BytesMut) -> Result<Option<WsFrame>, ProxyError> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let b0 = buf[0];
    let b1 = buf[1];
    let fin = b0 & 0x80 != 0;
    let opcode = b0 & 0x0F;
    let masked = b1 & 0x80 != 0;
    let len7 = b1 & 0x7F;

    let (header_len, payload_len) = match len7 {
        127 => {
            // 8-byte lengths only encode payloads past the 65 535 cap.
            return Err(ProxyError::WebSocket(
                "frame uses 64-bit length coding, payload exceeds cap".into(),
            ));
        }
        126 => {
            if buf.len() < 4 {
                return Ok(None);
            }
            let len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
            (4usize, len)
        }
        n => (2usize, n as usize),
    };

    let mask_len = if masked { 4 } else { 0 };
    let total = header_len + mask_len + payload_len;
    if buf.len() < total {
        return Ok(None);
    }

    buf.advance(header_len);
    let key: [u8; 4] = if masked {
        let k = [buf[0], buf[1], buf[2], buf[3]];
        buf.advance(4);
        k
    } else {
        [0; 4]
    };

    let mut payload = buf.split_to(payload_len);
    if masked {
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= key[i % 4];
        }
    }

    Ok(Some(WsFrame {
        fin,
        opcode,
        payload: payload.freeze(),
    }))
}

/// Cloneable write half; both relay pumps share it through a mutex so pong
/// answers and forwarded frames interleave at frame granularity.
pub struct WsSender<W> {
    writer: Arc<Mutex<W>>,
    role: WsRole,
}

impl<W> Clone for WsSender<W> {
    fn clone(&self) -> Self {
        Self {
            writer: self.writer.clone(),
            role: self.role,
        }
    }
}

impl<W: AsyncWrite + Unpin> WsSender<W> {
    pub fn new(writer: W, role: WsRole) -> Self {
        Self {
            writer: Arc::new(Mutex::new(writer)),
            role,
        }
    }

    pub async fn send(&self, opcode: u8, payload: &[u8]) -> Result<(), ProxyError> {
        let frame = encode_frame(opcode, payload, self.role == WsRole::Client)?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Send a logical message, fragmenting when the payload exceeds the
    /// per-frame cap. All fragments go out under one writer lock so frames
    /// from the other pump cannot interleave mid-message.
    pub async fn send_message(&self, opcode: u8, payload: &[u8]) -> Result<(), ProxyError> {
        let mask = self.role == WsRole::Client;
        if payload.len() <= MAX_FRAME_PAYLOAD {
            return self.send(opcode, payload).await;
        }

        let mut writer = self.writer.lock().await;
        let mut chunks = payload.chunks(MAX_FRAME_PAYLOAD).peekable();
        let mut first = true;
        while let Some(chunk) = chunks.next() {
            let fin = chunks.peek().is_none();
            let op = if first { opcode } else { OP_CONTINUATION };
            first = false;
            let frame = encode_frame_with_fin(fin, op, chunk, mask)?;
            writer.write_all(&frame).await?;
        }
        writer.flush().await?;
        Ok(())
    }

    pub async fn close(&self, code: u16) -> Result<(), ProxyError> {
        self.send(OP_CLOSE, &code.to_be_bytes()).await
    }
}

/// Read half with partial-frame buffering. Holds a sender clone so a ping
/// is answered with its pong before the frame is surfaced to the caller.
pub struct WsReceiver<R, W> {
    reader: R,
    buf: BytesMut,
    sender: WsSender<W>,
    pending: Option<(u8, BytesMut)>,
}

impl<R: AsyncRead + Unpin, W: AsyncWrite + Unpin> WsReceiver<R, W> {
    pub fn new(reader: R, sender: WsSender<W>) -> Self {
        Self {
            reader,
            buf: BytesMut::new(),
            sender,
            pending: None,
        }
    }

    /// Buffered bytes that arrived before the receiver was constructed
    /// (e.g. frames the upstream sent right behind its 101 response).
    pub fn with_leftover(reader: R, sender: WsSender<W>, leftover: BytesMut) -> Self {
        Self {
            reader,
            buf: leftover,
            sender,
            pending: None,
        }
    }

    /// Next frame, refilling from the socket as needed. `None` on clean EOF
    /// between frames. Pings are answered before the frame is returned.
    pub async fn read_frame(&mut self) -> Result<Option<WsFrame>, ProxyError> {
        loop {
            if let Some(frame) = decode_frame(&mut self.buf)? {
                if frame.opcode == OP_PING {
                    self.sender.send(OP_PONG, &frame.payload).await?;
                }
                return Ok(Some(frame));
            }
            self.buf.reserve(8 * 1024);
            let n = self.reader.read_buf(&mut self.buf).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(ProxyError::WebSocket(
                    "connection closed inside a frame".into(),
                ));
            }
        }
    }

    /// Fold a data or continuation frame into the pending reassembly
    /// buffer. Returns the completed logical message once a FIN arrives;
    /// control frames never assemble.
    pub fn assemble(&mut self, frame: WsFrame) -> Result<Option<(u8, Bytes)>, ProxyError> {
        match frame.opcode {
            OP_TEXT | OP_BINARY => {
                if frame.fin {
                    return Ok(Some((frame.opcode, frame.payload)));
                }
                let mut acc = BytesMut::new();
                acc.extend_from_slice(&frame.payload);
                self.pending = Some((frame.opcode, acc));
                Ok(None)
            }
            OP_CONTINUATION => {
                let Some((opcode, mut acc)) = self.pending.take() else {
                    return Err(ProxyError::WebSocket(
                        "continuation frame without an initiating frame".into(),
                    ));
                };
                acc.extend_from_slice(&frame.payload);
                if frame.fin {
                    Ok(Some((opcode, acc.freeze())))
                } else {
                    self.pending = Some((opcode, acc));
                    Ok(None)
                }
            }
            _ => Ok(None),
        }
    }

}
