//! Buffered, mirrored reader for one direction of a connection.
//!
//! `FramedReader` is the primary parser's view of a socket: it reads heads
//! and walks body framing so the engine knows where each transaction ends.
//! Every byte it consumes is duplicated onto the connection's [`Mirror`],
//! which is what transforms actually see and forward.

use std::io;

use bytes::{Bytes, BytesMut};
use futures_util::FutureExt;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{ProxyError, Side};
use crate::http::head::{parse_request, parse_response, BodyFraming, RequestHead, ResponseHead};
use crate::mirror::{Mirror, MirrorTap};

const READ_CHUNK: usize = 16 * 1024;
const MAX_HEAD_BYTES: usize = 64 * 1024;

pub struct FramedReader<R> {
    io: R,
    buf: BytesMut,
    mirror: Option<Mirror>,
    side: Side,
}

impl<R> FramedReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(io: R, side: Side) -> Self {
        Self {
            io,
            buf: BytesMut::with_capacity(READ_CHUNK),
            mirror: None,
            side,
        }
    }

    /// Prepare the mirror for a new transaction: created on first use, and
    /// on reuse any transform piped by the previous transaction is detached.
    pub fn attach_mirror(&mut self) -> &mut Mirror {
        if let Some(mirror) = self.mirror.as_mut() {
            if mirror.unpipe() {
                tracing::trace!(side = %self.side, "Detached stale mirror pipe");
            }
        }
        self.mirror.get_or_insert_with(Mirror::new)
    }

    /// Pipe the mirror to a fresh tap.
    pub fn pipe_mirror(&mut self) -> MirrorTap {
        self.mirror.get_or_insert_with(Mirror::new).pipe()
    }

    pub fn unpipe_mirror(&mut self) {
        if let Some(mirror) = self.mirror.as_mut() {
            mirror.unpipe();
        }
    }

    pub fn mirror(&self) -> Option<&Mirror> {
        self.mirror.as_ref()
    }

    /// Bytes read from the socket but not consumed yet.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Read the next request head. `Ok(None)` means the client closed
    /// cleanly between requests.
    pub async fn read_request_head(&mut self) -> Result<Option<RequestHead>, ProxyError> {
        loop {
            if !self.buf.is_empty() {
                if let Some((head, len)) = parse_request(&self.buf)? {
                    self.consume(len).await;
                    return Ok(Some(head));
                }
                self.check_head_size()?;
            }
            if self.fill().await? == 0 {
                return if self.buf.is_empty() {
                    Ok(None)
                } else {
                    Err(self.eof("connection closed inside request head"))
                };
            }
        }
    }

    /// Read the next response head.
    pub async fn read_response_head(&mut self) -> Result<ResponseHead, ProxyError> {
        loop {
            if !self.buf.is_empty() {
                if let Some((head, len)) = parse_response(&self.buf)? {
                    self.consume(len).await;
                    return Ok(head);
                }
                self.check_head_size()?;
            }
            if self.fill().await? == 0 {
                return Err(self.eof("connection closed before response head"));
            }
        }
    }

    /// Consume one message body according to `framing`, mirroring it as it
    /// goes. Returns the number of raw bytes consumed.
    pub async fn forward_body(&mut self, framing: BodyFraming) -> Result<u64, ProxyError> {
        match framing {
            BodyFraming::Empty => Ok(0),
            BodyFraming::Length(len) => self.forward_exact(len).await,
            BodyFraming::Chunked => self.forward_chunked().await,
            BodyFraming::UntilClose => self.forward_to_eof().await,
        }
    }

    /// Whether an idle connection can no longer carry a request: the peer
    /// closed it, it failed, or it sent bytes nobody asked for.
    pub fn is_stale(&mut self) -> bool {
        if !self.buf.is_empty() {
            return true;
        }
        match self.fill().now_or_never() {
            None => false,
            Some(Ok(_)) | Some(Err(_)) => true,
        }
    }

    /// Split into the raw reader and whatever was buffered but not consumed.
    pub fn into_parts(self) -> (R, Bytes) {
        (self.io, self.buf.freeze())
    }

    async fn forward_exact(&mut self, len: u64) -> Result<u64, ProxyError> {
        let mut remaining = len;
        while remaining > 0 {
            if self.buf.is_empty() {
                self.fill_or_eof().await?;
            }
            let take = remaining.min(self.buf.len() as u64) as usize;
            self.consume(take).await;
            remaining -= take as u64;
        }
        Ok(len)
    }

    async fn forward_chunked(&mut self) -> Result<u64, ProxyError> {
        let mut total = 0;
        loop {
            let (line_len, size) = loop {
                match httparse::parse_chunk_size(&self.buf) {
                    Ok(httparse::Status::Complete(parsed)) => break parsed,
                    Ok(httparse::Status::Partial) => {
                        self.check_head_size()?;
                        self.fill_or_eof().await?;
                    }
                    Err(_) => {
                        return Err(ProxyError::Protocol("invalid chunk size line".to_string()))
                    }
                }
            };
            self.consume(line_len).await;
            total += line_len as u64;

            if size == 0 {
                return Ok(total + self.forward_trailers().await?);
            }
            // chunk data plus its CRLF
            total += self.forward_exact(size + 2).await?;
        }
    }

    async fn forward_trailers(&mut self) -> Result<u64, ProxyError> {
        let mut total = 0;
        loop {
            match self.buf.windows(2).position(|w| w == b"\r\n") {
                Some(pos) => {
                    let line_len = pos + 2;
                    self.consume(line_len).await;
                    total += line_len as u64;
                    if line_len == 2 {
                        return Ok(total);
                    }
                }
                None => {
                    self.check_head_size()?;
                    self.fill_or_eof().await?;
                }
            }
        }
    }

    async fn forward_to_eof(&mut self) -> Result<u64, ProxyError> {
        let mut total = 0;
        loop {
            let pending = self.buf.len();
            if pending > 0 {
                self.consume(pending).await;
                total += pending as u64;
            }
            if self.fill().await? == 0 {
                return Ok(total);
            }
        }
    }

    /// Hand `len` buffered bytes to the mirror. Waits while a piped tap is
    /// full, which is what throttles reads from the socket.
    async fn consume(&mut self, len: usize) {
        let chunk = self.buf.split_to(len).freeze();
        if let Some(mirror) = self.mirror.as_mut() {
            mirror.push(chunk).await;
        }
    }

    async fn fill(&mut self) -> Result<usize, ProxyError> {
        self.buf.reserve(READ_CHUNK);
        self.io
            .read_buf(&mut self.buf)
            .await
            .map_err(|e| ProxyError::connection(self.side, e))
    }

    async fn fill_or_eof(&mut self) -> Result<(), ProxyError> {
        if self.fill().await? == 0 {
            return Err(self.eof("connection closed inside message body"));
        }
        Ok(())
    }

    fn check_head_size(&self) -> Result<(), ProxyError> {
        if self.buf.len() > MAX_HEAD_BYTES {
            return Err(ProxyError::Protocol(format!(
                "{} message head exceeds {MAX_HEAD_BYTES} bytes",
                self.side
            )));
        }
        Ok(())
    }

    fn eof(&self, message: &str) -> ProxyError {
        ProxyError::connection(self.side, io::Error::new(io::ErrorKind::UnexpectedEof, message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;

    /// Hands out at most three bytes per read.
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
    }

    impl Trickle {
        fn new(data: &[u8]) -> Self {
            Self {
                data: data.to_vec(),
                pos: 0,
            }
        }
    }

    impl AsyncRead for Trickle {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            let end = (self.pos + 3).min(self.data.len());
            let start = self.pos;
            buf.put_slice(&self.data[start..end]);
            self.pos = end;
            Poll::Ready(Ok(()))
        }
    }

    async fn drain(tap: &mut MirrorTap) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = tap.recv().await {
            out.extend_from_slice(&chunk);
        }
        out
    }

    #[tokio::test]
    async fn chunked_body_stops_at_message_boundary() {
        let raw = b"POST /a HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n\
                    5\r\nhello\r\n6;ext=1\r\n world\r\n0\r\nX-Trailer: yes\r\n\r\n\
                    GET /b HTTP/1.1\r\nHost: b\r\n\r\n";
        let mut reader = FramedReader::new(Trickle::new(raw), Side::Inbound);

        reader.attach_mirror();
        let first = reader.read_request_head().await.unwrap().unwrap();
        let mut tap = reader.pipe_mirror();
        // Three-byte reads produce more chunks than a tap queues.
        let forward = async {
            let consumed = reader.forward_body(first.framing().unwrap()).await.unwrap();
            reader.unpipe_mirror();
            consumed
        };
        let (consumed, mirrored) = tokio::join!(forward, drain(&mut tap));

        assert!(mirrored.starts_with(b"POST /a HTTP/1.1\r\n"));
        assert!(mirrored.ends_with(b"0\r\nX-Trailer: yes\r\n\r\n"));
        assert!(!mirrored.windows(6).any(|w| w == b"GET /b"));
        assert_eq!(
            consumed as usize,
            b"5\r\nhello\r\n6;ext=1\r\n world\r\n0\r\nX-Trailer: yes\r\n\r\n".len()
        );

        reader.attach_mirror();
        let second = reader.read_request_head().await.unwrap().unwrap();
        assert_eq!(second.target, "/b");
        assert_eq!(reader.read_request_head().await.unwrap().map(|h| h.target), None);
    }

    #[tokio::test]
    async fn sized_body_is_mirrored_exactly() {
        let raw: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 11\r\n\r\nHello worldHTTP/1.1";
        let mut reader = FramedReader::new(raw, Side::Outbound);

        reader.attach_mirror();
        let head = reader.read_response_head().await.unwrap();
        let mut tap = reader.pipe_mirror();
        let framing = head.framing(&http::Method::GET).unwrap();
        assert_eq!(reader.forward_body(framing).await.unwrap(), 11);
        reader.unpipe_mirror();

        let mirrored = drain(&mut tap).await;
        assert_eq!(mirrored, b"HTTP/1.1 200 OK\r\nContent-Length: 11\r\n\r\nHello world");
        assert_eq!(reader.buffered(), b"HTTP/1.1".len());
    }

    #[tokio::test]
    async fn stalled_tap_stops_reading_the_socket() {
        let (mut origin, proxy_side) = tokio::io::duplex(64 * 1024);
        let mut reader = FramedReader::new(proxy_side, Side::Outbound);
        let body = vec![b'a'; 1024 * 1024];
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let _ = origin.write_all(&body).await;
        });

        let _tap = reader.pipe_mirror();
        let forward = reader.forward_body(BodyFraming::Length(1024 * 1024));
        let stalled = tokio::time::timeout(std::time::Duration::from_millis(100), forward).await;
        assert!(stalled.is_err());

        let mirrored = reader.mirror().unwrap().mirrored_bytes();
        assert!(mirrored < 1024 * 1024);
    }

    #[tokio::test]
    async fn truncated_body_is_connection_error() {
        let raw: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 20\r\n\r\nshort";
        let mut reader = FramedReader::new(raw, Side::Outbound);
        let head = reader.read_response_head().await.unwrap();
        let err = reader
            .forward_body(head.framing(&http::Method::GET).unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.side(), Some(Side::Outbound));
    }

    #[tokio::test]
    async fn close_delimited_body_runs_to_eof() {
        let raw: &[u8] = b"HTTP/1.0 200 OK\r\n\r\nstreamed until close";
        let mut reader = FramedReader::new(raw, Side::Outbound);
        let head = reader.read_response_head().await.unwrap();
        let framing = head.framing(&http::Method::GET).unwrap();
        assert_eq!(framing, BodyFraming::UntilClose);
        assert_eq!(reader.forward_body(framing).await.unwrap(), 20);
    }

    #[tokio::test]
    async fn closed_peer_is_stale() {
        let raw: &[u8] = b"";
        let mut reader = FramedReader::new(raw, Side::Outbound);
        assert!(reader.is_stale());
    }

    #[tokio::test]
    async fn leftover_bytes_survive_into_parts() {
        let raw: &[u8] = b"CONNECT a:443 HTTP/1.1\r\nHost: a:443\r\n\r\n\x16\x03\x01";
        let mut reader = FramedReader::new(raw, Side::Inbound);
        let head = reader.read_request_head().await.unwrap().unwrap();
        assert!(head.is_connect());
        let (_, leftover) = reader.into_parts();
        assert_eq!(&leftover[..], b"\x16\x03\x01");
    }
}
