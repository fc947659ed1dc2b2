//! HTTP/1.1 response framing over a raw byte stream.
//!
//! The raw-socket transport cannot lean on a client library for response
//! parsing, so framing is done here: preamble (status line + headers), then
//! chunked / content-length / read-to-EOF body decoding. The codec never
//! decompresses — outbound requests pin `Accept-Encoding: identity`.

use crate::error::ProxyError;
use bytes::{Buf, Bytes, BytesMut};
use http::header::{HeaderName, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderValue};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Preamble size cap; a well-behaved upstream never comes close.
const MAX_PREAMBLE_BYTES: usize = 64 * 1024;

const READ_CHUNK: usize = 16 * 1024;

#[derive(Debug)]
pub struct ResponsePreamble {
    pub status: u16,
    pub reason: String,
    pub headers: HeaderMap,
}

/// Read from `reader` into `buf` until the `CRLF CRLF` preamble terminator
/// is seen, then parse it. Bytes past the terminator stay in `buf` — they
/// are the start of the body.
pub async fn read_preamble<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut BytesMut,
) -> Result<ResponsePreamble, ProxyError> {
    loop {
        if let Some(end) = find_preamble_end(buf) {
            let head = buf.split_to(end + 4);
            return parse_preamble(&head[..end]);
        }
        if buf.len() > MAX_PREAMBLE_BYTES {
            return Err(ProxyError::Protocol("response preamble too large".into()));
        }
        buf.reserve(READ_CHUNK);
        let n = reader.read_buf(buf).await?;
        if n == 0 {
            // An abrupt close before any response is a transport-level
            // failure, not a protocol violation — it stays fallback-eligible.
            return Err(ProxyError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before response preamble",
            )));
        }
    }
}

fn find_preamble_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_preamble(head: &[u8]) -> Result<ResponsePreamble, ProxyError> {
    let text = std::str::from_utf8(head)
        .map_err(|_| ProxyError::Protocol("response preamble is not valid utf-8".into()))?;
    let mut lines = text.split("\r\n");
    let status_line = lines
        .next()
        .ok_or_else(|| ProxyError::Protocol("empty response preamble".into()))?;
    let (status, reason) = parse_status_line(status_line)?;

    let mut headers = HeaderMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ProxyError::Protocol(format!("malformed header line: {}", line)))?;
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|_| ProxyError::Protocol(format!("bad header name: {}", name)))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|_| ProxyError::Protocol(format!("bad header value for {}", name)))?;
        // Repeated headers keep every value.
        headers.append(name, value);
    }

    Ok(ResponsePreamble {
        status,
        reason,
        headers,
    })
}

/// `HTTP/1.[01] <digits> <reason>`; the reason phrase may be empty.
fn parse_status_line(line: &str) -> Result<(u16, String), ProxyError> {
    let rest = line
        .strip_prefix("HTTP/1.")
        .ok_or_else(|| ProxyError::Protocol(format!("bad status line: {}", line)))?;
    let mut chars = rest.chars();
    match chars.next() {
        Some('0') | Some('1') => {}
        _ => return Err(ProxyError::Protocol(format!("bad status line: {}", line))),
    }
    let rest = chars.as_str();
    let rest = rest
        .strip_prefix(' ')
        .ok_or_else(|| ProxyError::Protocol(format!("bad status line: {}", line)))?;
    let (code, reason) = match rest.split_once(' ') {
        Some((code, reason)) => (code, reason),
        None => (rest, ""),
    };
    if code.is_empty() || !code.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ProxyError::Protocol(format!("bad status line: {}", line)));
    }
    let status = code
        .parse::<u16>()
        .map_err(|_| ProxyError::Protocol(format!("bad status code: {}", code)))?;
    Ok((status, reason.to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    Chunked,
    ContentLength(u64),
    ReadToEof,
}

/// Decide body framing from the response headers. `Transfer-Encoding:
/// chunked` wins over `Content-Length`; with neither, read to EOF.
pub fn body_framing(headers: &HeaderMap) -> BodyFraming {
    let chunked = headers.get_all(TRANSFER_ENCODING).iter().any(|v| {
        v.to_str()
            .map(|s| s.split(',').any(|t| t.trim().eq_ignore_ascii_case("chunked")))
            .unwrap_or(false)
    });
    if chunked {
        return BodyFraming::Chunked;
    }
    if let Some(len) = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
    {
        return BodyFraming::ContentLength(len);
    }
    BodyFraming::ReadToEof
}

enum ChunkPhase {
    Size,
    Data { remaining: u64 },
    DataCrlf,
    Trailers,
}

enum BodyState {
    Length { remaining: u64 },
    Eof,
    Chunked(ChunkPhase),
    Done,
}

/// Decoded-body reader. Owns the socket (read half) for the rest of the
/// exchange; bytes already pulled past the preamble are counted first.
pub struct BodyReader<R> {
    reader: R,
    buf: BytesMut,
    state: BodyState,
}

impl<R: AsyncRead + Unpin> BodyReader<R> {
    pub fn new(reader: R, leftover: BytesMut, framing: BodyFraming) -> Self {
        let state = match framing {
            BodyFraming::Chunked => BodyState::Chunked(ChunkPhase::Size),
            BodyFraming::ContentLength(0) => BodyState::Done,
            BodyFraming::ContentLength(n) => BodyState::Length { remaining: n },
            BodyFraming::ReadToEof => BodyState::Eof,
        };
        Self {
            reader,
            buf: leftover,
            state,
        }
    }

    /// Next decoded chunk; `None` once the body is complete. Errors fuse the
    /// reader.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, ProxyError> {
        match self.step().await {
            Ok(v) => Ok(v),
            Err(e) => {
                self.state = BodyState::Done;
                Err(e)
            }
        }
    }

    async fn step(&mut self) -> Result<Option<Bytes>, ProxyError> {
        loop {
            match &mut self.state {
                BodyState::Done => return Ok(None),

                BodyState::Length { remaining } => {
                    if self.buf.is_empty() {
                        let n = Self::fill(&mut self.reader, &mut self.buf).await?;
                        if n == 0 {
                            return Err(ProxyError::Protocol(
                                "connection closed before content-length satisfied".into(),
                            ));
                        }
                    }
                    let take = (*remaining).min(self.buf.len() as u64) as usize;
                    *remaining -= take as u64;
                    if *remaining == 0 {
                        self.state = BodyState::Done;
                    }
                    return Ok(Some(self.buf.split_to(take).freeze()));
                }

                BodyState::Eof => {
                    if !self.buf.is_empty() {
                        let out = self.buf.split().freeze();
                        return Ok(Some(out));
                    }
                    let n = Self::fill(&mut self.reader, &mut self.buf).await?;
                    if n == 0 {
                        self.state = BodyState::Done;
                        return Ok(None);
                    }
                }

                BodyState::Chunked(phase) => match phase {
                    ChunkPhase::Size => {
                        let line = match take_line(&mut self.buf) {
                            Some(line) => line,
                            None => {
                                let n = Self::fill(&mut self.reader, &mut self.buf).await?;
                                if n == 0 {
                                    return Err(ProxyError::Protocol(
                                        "connection closed inside chunked body".into(),
                                    ));
                                }
                                continue;
                            }
                        };
                        let size = parse_chunk_size(&line)?;
                        if size == 0 {
                            *phase = ChunkPhase::Trailers;
                        } else {
                            *phase = ChunkPhase::Data { remaining: size };
                        }
                    }

                    ChunkPhase::Data { remaining } => {
                        if self.buf.is_empty() {
                            let n = Self::fill(&mut self.reader, &mut self.buf).await?;
                            if n == 0 {
                                return Err(ProxyError::Protocol(
                                    "connection closed inside chunk data".into(),
                                ));
                            }
                        }
                        let take = (*remaining).min(self.buf.len() as u64) as usize;
                        *remaining -= take as u64;
                        if *remaining == 0 {
                            *phase = ChunkPhase::DataCrlf;
                        }
                        return Ok(Some(self.buf.split_to(take).freeze()));
                    }

                    ChunkPhase::DataCrlf => {
                        while self.buf.len() < 2 {
                            let n = Self::fill(&mut self.reader, &mut self.buf).await?;
                            if n == 0 {
                                return Err(ProxyError::Protocol(
                                    "connection closed inside chunked body".into(),
                                ));
                            }
                        }
                        if &self.buf[..2] != b"\r\n" {
                            return Err(ProxyError::Protocol(
                                "chunk data not terminated by CRLF".into(),
                            ));
                        }
                        self.buf.advance(2);
                        *phase = ChunkPhase::Size;
                    }

                    ChunkPhase::Trailers => {
                        // Consume trailer lines up to (and including) the
                        // final empty line.
                        let line = match take_line(&mut self.buf) {
                            Some(line) => line,
                            None => {
                                let n = Self::fill(&mut self.reader, &mut self.buf).await?;
                                if n == 0 {
                                    return Err(ProxyError::Protocol(
                                        "connection closed inside chunked trailers".into(),
                                    ));
                                }
                                continue;
                            }
                        };
                        if line.is_empty() {
                            self.state = BodyState::Done;
                            return Ok(None);
                        }
                    }
                },
            }
        }
    }

    async fn fill(reader: &mut R, buf: &mut BytesMut) -> Result<usize, ProxyError> {
        buf.reserve(READ_CHUNK);
        let n = reader.read_buf(buf).await?;
        Ok(n)
    }
}

/// Pop one CRLF-terminated line from the front of `buf`, without the CRLF.
/// `None` when the buffer holds no complete line yet.
fn take_line(buf: &mut BytesMut) -> Option<Bytes> {
    let pos = buf.windows(2).position(|w| w == b"\r\n")?;
    let line = buf.split_to(pos).freeze();
    buf.advance(2);
    Some(line)
}

/// Hex chunk size; chunk extensions after `;` are ignored.
fn parse_chunk_size(line: &[u8]) -> Result<u64, ProxyError> {
    let text = std::str::from_utf8(line)
        .map_err(|_| ProxyError::Protocol("chunk size line is not utf-8".into()))?;
    let size_part = text.split(';').next().unwrap_or("").trim();
    if size_part.is_empty() {
        return Err(ProxyError::Protocol("empty chunk size line".into()));
    }
    u64::from_str_radix(size_part, 16)
        .map_err(|_| ProxyError::Protocol(format!("bad chunk size: {}", size_part)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn preamble_parses_status_and_repeated_headers() {
        let wire = b"HTTP/1.1 200 OK\r\nSet-Cookie: a=1\r\nSet-Cookie: b=2\r\nContent-Length: 0\r\n\r\n";
        let mut reader = Builder::new().read(wire).build();
        let mut buf = BytesMut::new();
        let preamble = read_preamble(&mut reader, &mut buf).await.unwrap();
        assert_eq!(preamble.status, 200);
        assert_eq!(preamble.reason, "OK");
        let cookies: Vec<_> = preamble.headers.get_all("set-cookie").iter().collect();
        assert_eq!(cookies.len(), 2);
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn preamble_keeps_body_bytes_in_buffer() {
        let wire = b"HTTP/1.0 404 Not Found\r\nContent-Length: 4\r\n\r\nbody";
        let mut reader = Builder::new().read(wire).build();
        let mut buf = BytesMut::new();
        let preamble = read_preamble(&mut reader, &mut buf).await.unwrap();
        assert_eq!(preamble.status, 404);
        assert_eq!(preamble.reason, "Not Found");
        assert_eq!(&buf[..], b"body");
    }

    #[tokio::test]
    async fn preamble_split_across_reads() {
        let mut reader = Builder::new()
            .read(b"HTTP/1.1 20")
            .read(b"0 OK\r\nX-A: 1\r")
            .read(b"\n\r\nrest")
            .build();
        let mut buf = BytesMut::new();
        let preamble = read_preamble(&mut reader, &mut buf).await.unwrap();
        assert_eq!(preamble.status, 200);
        assert_eq!(&buf[..], b"rest");
    }

    #[test]
    fn status_line_validation() {
        assert!(parse_status_line("HTTP/1.1 200 OK").is_ok());
        assert!(parse_status_line("HTTP/1.0 204").is_ok());
        let (code, reason) = parse_status_line("HTTP/1.1 301 Moved Permanently").unwrap();
        assert_eq!((code, reason.as_str()), (301, "Moved Permanently"));
        assert!(parse_status_line("HTTP/2 200 OK").is_err());
        assert!(parse_status_line("HTTP/1.1 abc OK").is_err());
        assert!(parse_status_line("ICY 200 OK").is_err());
    }

    #[test]
    fn framing_selection() {
        let mut h = HeaderMap::new();
        h.insert(TRANSFER_ENCODING, HeaderValue::from_static("gzip, chunked"));
        h.insert(CONTENT_LENGTH, HeaderValue::from_static("10"));
        assert_eq!(body_framing(&h), BodyFraming::Chunked);

        let mut h = HeaderMap::new();
        h.insert(CONTENT_LENGTH, HeaderValue::from_static("42"));
        assert_eq!(body_framing(&h), BodyFraming::ContentLength(42));

        assert_eq!(body_framing(&HeaderMap::new()), BodyFraming::ReadToEof);
    }

    #[tokio::test]
    async fn content_length_body_counts_leftover_bytes() {
        let mut leftover = BytesMut::new();
        leftover.extend_from_slice(b"hell");
        let reader = Builder::new().read(b"o").build();
        let mut body = BodyReader::new(reader, leftover, BodyFraming::ContentLength(5));

        let mut out = Vec::new();
        while let Some(chunk) = body.next_chunk().await.unwrap() {
            out.extend_from_slice(&chunk);
        }
        assert_eq!(out, b"hello");
    }

    #[tokio::test]
    async fn chunked_body_basic() {
        let reader = Builder::new()
            .read(b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n")
            .build();
        let mut body = BodyReader::new(reader, BytesMut::new(), BodyFraming::Chunked);

        let mut out = Vec::new();
        while let Some(chunk) = body.next_chunk().await.unwrap() {
            out.extend_from_slice(&chunk);
        }
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn chunk_crlf_on_read_boundary_still_parses() {
        // The CRLF terminating the first chunk's data arrives in a separate
        // read, split down the middle.
        let reader = Builder::new()
            .read(b"5\r\nhello")
            .read(b"\r")
            .read(b"\n0\r\n")
            .read(b"\r\n")
            .build();
        let mut body = BodyReader::new(reader, BytesMut::new(), BodyFraming::Chunked);

        let mut out = Vec::new();
        while let Some(chunk) = body.next_chunk().await.unwrap() {
            out.extend_from_slice(&chunk);
        }
        assert_eq!(out, b"hello");
    }

    #[tokio::test]
    async fn chunk_larger_than_single_read() {
        let reader = Builder::new()
            .read(b"a\r\n01234")
            .read(b"56789\r\n0\r\n\r\n")
            .build();
        let mut body = BodyReader::new(reader, BytesMut::new(), BodyFraming::Chunked);

        let mut out = Vec::new();
        while let Some(chunk) = body.next_chunk().await.unwrap() {
            out.extend_from_slice(&chunk);
        }
        assert_eq!(out, b"0123456789");
    }

    #[tokio::test]
    async fn chunked_with_extensions_and_trailers() {
        let reader = Builder::new()
            .read(b"4;ext=1\r\nabcd\r\n0\r\nX-Trailer: v\r\n\r\n")
            .build();
        let mut body = BodyReader::new(reader, BytesMut::new(), BodyFraming::Chunked);

        let mut out = Vec::new();
        while let Some(chunk) = body.next_chunk().await.unwrap() {
            out.extend_from_slice(&chunk);
        }
        assert_eq!(out, b"abcd");
    }

    #[tokio::test]
    async fn read_to_eof_body() {
        let reader = Builder::new().read(b"stream").read(b"ing").build();
        let mut body = BodyReader::new(reader, BytesMut::new(), BodyFraming::ReadToEof);

        let mut out = Vec::new();
        while let Some(chunk) = body.next_chunk().await.unwrap() {
            out.extend_from_slice(&chunk);
        }
        assert_eq!(out, b"streaming");
    }

    #[tokio::test]
    async fn truncated_content_length_is_an_error() {
        let reader = Builder::new().read(b"ab").build();
        let mut body = BodyReader::new(reader, BytesMut::new(), BodyFraming::ContentLength(5));
        assert_eq!(&body.next_chunk().await.unwrap().unwrap()[..], b"ab");
        assert!(body.next_chunk().await.is_err());
        // Fused after the error.
        assert!(body.next_chunk().await.unwrap().is_none());
    }
}
