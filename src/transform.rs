//! Byte transforms applied to each direction of a transaction.
//!
//! A transform sees the raw mirrored bytes of one direction (head included)
//! and returns what should be written to the peer instead. Output length and
//! timing may differ from input; framing headers are not rewritten, so a
//! length-changing transform on a sized body must fix `Content-Length` itself
//! or use chunked/close-delimited messages.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::{Direction, ProxyError, Side, TransformError};
use crate::mirror::MirrorTap;

/// Duplex byte transform for one direction of one transaction.
#[async_trait]
pub trait Transform: Send {
    /// Transform one chunk. Returning an empty buffer holds output back.
    async fn transform(&mut self, chunk: Bytes) -> Result<Bytes, TransformError>;

    /// Called once at end of stream; returns whatever was held back.
    async fn flush(&mut self) -> Result<Bytes, TransformError> {
        Ok(Bytes::new())
    }
}

pub type BoxTransform = Box<dyn Transform>;

/// Passes bytes through untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

#[async_trait]
impl Transform for Identity {
    async fn transform(&mut self, chunk: Bytes) -> Result<Bytes, TransformError> {
        Ok(chunk)
    }
}

/// Streaming literal replacement that also matches across chunk boundaries.
///
/// Up to `needle.len() - 1` trailing bytes are held back between chunks.
#[derive(Debug, Clone)]
pub struct Replace {
    needle: Bytes,
    replacement: Bytes,
    carry: BytesMut,
}

impl Replace {
    pub fn new(needle: impl Into<Bytes>, replacement: impl Into<Bytes>) -> Self {
        Self {
            needle: needle.into(),
            replacement: replacement.into(),
            carry: BytesMut::new(),
        }
    }
}

#[async_trait]
impl Transform for Replace {
    async fn transform(&mut self, chunk: Bytes) -> Result<Bytes, TransformError> {
        if self.needle.is_empty() {
            return Ok(chunk);
        }
        self.carry.extend_from_slice(&chunk);
        let buf = self.carry.split().freeze();

        let mut out = BytesMut::with_capacity(buf.len());
        let mut pos = 0;
        while let Some(found) = find(&buf[pos..], &self.needle) {
            out.extend_from_slice(&buf[pos..pos + found]);
            out.extend_from_slice(&self.replacement);
            pos += found + self.needle.len();
        }

        // Anything that could still be the start of a match stays in carry.
        let keep = (self.needle.len() - 1).min(buf.len() - pos);
        let emit_to = buf.len() - keep;
        out.extend_from_slice(&buf[pos..emit_to]);
        self.carry.extend_from_slice(&buf[emit_to..]);
        Ok(out.freeze())
    }

    async fn flush(&mut self) -> Result<Bytes, TransformError> {
        Ok(self.carry.split().freeze())
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Adapts a synchronous chunk function into a transform.
pub fn from_fn<F>(f: F) -> FnTransform<F>
where
    F: FnMut(Bytes) -> Result<Bytes, TransformError> + Send,
{
    FnTransform(f)
}

pub struct FnTransform<F>(F);

#[async_trait]
impl<F> Transform for FnTransform<F>
where
    F: FnMut(Bytes) -> Result<Bytes, TransformError> + Send,
{
    async fn transform(&mut self, chunk: Bytes) -> Result<Bytes, TransformError> {
        (self.0)(chunk)
    }
}

/// Drive one direction: mirrored bytes from `tap` through `transform` into
/// `dst`. Ends when the mirror is unpiped; the transform is flushed and `dst`
/// is flushed but left open. Returns bytes written.
pub(crate) async fn run_stage<W>(
    mut tap: MirrorTap,
    mut transform: BoxTransform,
    dst: &mut W,
    direction: Direction,
) -> Result<u64, ProxyError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let side = match direction {
        Direction::Request => Side::Outbound,
        Direction::Response => Side::Inbound,
    };
    let mut written = 0u64;

    while let Some(chunk) = tap.recv().await {
        let out = transform
            .transform(chunk)
            .await
            .map_err(|source| ProxyError::Transform { direction, source })?;
        if !out.is_empty() {
            dst.write_all(&out)
                .await
                .map_err(|e| ProxyError::connection(side, e))?;
            written += out.len() as u64;
        }
    }

    let tail = transform
        .flush()
        .await
        .map_err(|source| ProxyError::Transform { direction, source })?;
    if !tail.is_empty() {
        dst.write_all(&tail)
            .await
            .map_err(|e| ProxyError::connection(side, e))?;
        written += tail.len() as u64;
    }
    dst.flush()
        .await
        .map_err(|e| ProxyError::connection(side, e))?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::Mirror;

    async fn run_chunks(transform: &mut dyn Transform, chunks: &[&'static str]) -> String {
        let mut out = Vec::new();
        for chunk in chunks {
            let piece = transform.transform(Bytes::from_static(chunk.as_bytes())).await;
            out.extend_from_slice(&piece.unwrap());
        }
        out.extend_from_slice(&transform.flush().await.unwrap());
        String::from_utf8(out).unwrap()
    }

    #[tokio::test]
    async fn replace_within_one_chunk() {
        let mut t = Replace::new("Hello world", "HELLO WORLD");
        assert_eq!(
            run_chunks(&mut t, &["say Hello world twice: Hello world"]).await,
            "say HELLO WORLD twice: HELLO WORLD"
        );
    }

    #[tokio::test]
    async fn replace_across_chunk_boundaries() {
        let mut t = Replace::new("Hello world", "HELLO EVERYBODY");
        assert_eq!(
            run_chunks(&mut t, &["echo: Hel", "lo wo", "rld\r\n"]).await,
            "echo: HELLO EVERYBODY\r\n"
        );
    }

    #[tokio::test]
    async fn replace_holds_back_only_possible_prefixes() {
        let mut t = Replace::new("abc", "x");
        let first = t.transform(Bytes::from_static(b"12345ab")).await.unwrap();
        assert_eq!(&first[..], b"12345");
        let second = t.transform(Bytes::from_static(b"d")).await.unwrap();
        assert_eq!(&second[..], b"a");
        assert_eq!(&t.flush().await.unwrap()[..], b"bd");
    }

    #[tokio::test]
    async fn stage_forwards_backlog_and_flushes_tail() {
        let mut mirror = Mirror::new();
        mirror.push(Bytes::from_static(b"GET / HTTP/1.1\r\necho: Hello ")).await;
        let tap = mirror.pipe();
        mirror.push(Bytes::from_static(b"world\r\n\r\n")).await;
        mirror.unpipe();

        let mut out = Vec::new();
        let written = run_stage(
            tap,
            Box::new(Replace::new("Hello world", "HELLO EVERYBODY")),
            &mut out,
            Direction::Request,
        )
        .await
        .unwrap();

        assert_eq!(out, b"GET / HTTP/1.1\r\necho: HELLO EVERYBODY\r\n\r\n");
        assert_eq!(written, out.len() as u64);
    }

    #[tokio::test]
    async fn failing_transform_reports_direction() {
        let mut mirror = Mirror::new();
        let tap = mirror.pipe();
        mirror.push(Bytes::from_static(b"boom")).await;
        mirror.unpipe();

        let failing = from_fn(|_| Err(TransformError::new("refused")));
        let err = run_stage(tap, Box::new(failing), &mut Vec::<u8>::new(), Direction::Response)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProxyError::Transform {
                direction: Direction::Response,
                ..
            }
        ));
    }
}
