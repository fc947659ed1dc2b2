//! Chunk-boundary-tolerant line splitter over an upstream byte stream.
//!
//! SSE frames are newline-delimited but TCP chunks land wherever they like;
//! the buffer here survives across reads so a line split down the middle is
//! reassembled before it is yielded.

use crate::error::ProxyError;
use crate::transport::BodyStream;
use bytes::{Buf, BytesMut};
use futures_util::StreamExt;

pub struct SseLineStream {
    body: BodyStream,
    buf: BytesMut,
    eof: bool,
}

impl SseLineStream {
    pub fn new(body: BodyStream) -> Self {
        Self {
            body,
            buf: BytesMut::new(),
            eof: false,
        }
    }

    /// Next logical line, without its terminator. Splits on `\r?\n`. At EOF
    /// a final unterminated fragment is yielded once if non-empty; after
    /// that the stream is exhausted. Upstream errors propagate.
    pub async fn next_line(&mut self) -> Result<Option<String>, ProxyError> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let mut line = self.buf.split_to(pos);
                self.buf.advance(1);
                if line.last() == Some(&b'\r') {
                    line.truncate(line.len() - 1);
                }
                return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
            }

            if self.eof {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                let line = self.buf.split();
                return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
            }

            match self.body.next().await {
                Some(Ok(chunk)) => self.buf.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    self.eof = true;
                    return Err(e);
                }
                None => self.eof = true,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures_util::stream;

    fn body_from(chunks: Vec<&'static [u8]>) -> BodyStream {
        Box::pin(stream::iter(
            chunks
                .into_iter()
                .map(|c| Ok::<_, ProxyError>(Bytes::from_static(c)))
                .collect::<Vec<_>>(),
        ))
    }

    async fn collect_lines(mut s: SseLineStream) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(line) = s.next_line().await.unwrap() {
            out.push(line);
        }
        out
    }

    #[tokio::test]
    async fn splits_lines_across_chunk_boundaries() {
        let body = body_from(vec![b"data: hel", b"lo\ndata:", b" world\n"]);
        let lines = collect_lines(SseLineStream::new(body)).await;
        assert_eq!(lines, vec!["data: hello", "data: world"]);
    }

    #[tokio::test]
    async fn handles_crlf_and_bare_lf() {
        let body = body_from(vec![b"a\r\nb\nc\r\n"]);
        let lines = collect_lines(SseLineStream::new(body)).await;
        assert_eq!(lines, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn final_unterminated_fragment_is_yielded() {
        let body = body_from(vec![b"data: one\ndata: tail"]);
        let lines = collect_lines(SseLineStream::new(body)).await;
        assert_eq!(lines, vec!["data: one", "data: tail"]);
    }

    #[tokio::test]
    async fn trailing_newline_yields_no_empty_tail() {
        let body = body_from(vec![b"data: one\n"]);
        let mut s = SseLineStream::new(body);
        assert_eq!(s.next_line().await.unwrap().as_deref(), Some("data: one"));
        assert!(s.next_line().await.unwrap().is_none());
        // Finite: stays exhausted.
        assert!(s.next_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_separator_lines_are_preserved() {
        let body = body_from(vec![b"data: a\n\ndata: b\n\n"]);
        let lines = collect_lines(SseLineStream::new(body)).await;
        assert_eq!(lines, vec!["data: a", "", "data: b", ""]);
    }

    #[tokio::test]
    async fn upstream_error_propagates() {
        let chunks: Vec<Result<Bytes, ProxyError>> = vec![
            Ok(Bytes::from_static(b"data: a\n")),
            Err(ProxyError::Internal("boom".into())),
        ];
        let mut s = SseLineStream::new(Box::pin(stream::iter(chunks)));
        assert_eq!(s.next_line().await.unwrap().as_deref(), Some("data: a"));
        assert!(s.next_line().await.is_err());
    }
}
