//! Mirrored stream tee.
//!
//! # Data Flow
//! ```text
//! socket ──read──▶ FramedReader (primary HTTP parser)
//!                      │ consume(n)
//!                      ▼
//!                   Mirror ──piped──▶ MirrorTap ──▶ transform stage
//!                      │
//!                      └─unpiped──▶ backlog (held for the next pipe)
//! ```
//!
//! # Design Decisions
//! - The parser drives the mirror: only consumed bytes are mirrored, so a
//!   pipelined follow-up request sitting in the read buffer never leaks into
//!   the current transaction's transform
//! - Taps are bounded: once `TAP_DEPTH` chunks are queued the parser waits
//!   for the transform stage, so a slow destination slows reads from the
//!   source instead of growing memory
//! - Bytes consumed while unpiped (message heads) are held in the backlog
//!   and handed to the next tap in one go
//! - One mirror per connection, living as long as the connection's read half

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::ProxyError;
use crate::events::{ErrorContext, EventBus, ProxyEvent};

/// Chunks a tap queues before the parser waits on its consumer.
pub const TAP_DEPTH: usize = 8;

/// Secondary, order-preserving read view of a connection.
#[derive(Debug, Default)]
pub struct Mirror {
    tap: Option<mpsc::Sender<Bytes>>,
    backlog: VecDeque<Bytes>,
    mirrored: u64,
    pipes: u64,
}

impl Mirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// Duplicate a consumed chunk onto the current tap, or hold it until one
    /// is piped. Waits while the tap is full.
    pub async fn push(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.mirrored += chunk.len() as u64;

        if let Some(tap) = &self.tap {
            if let Err(mpsc::error::SendError(lost)) = tap.send(chunk).await {
                // The stage behind this tap already failed and reported it.
                tracing::trace!(bytes = lost.len(), "Mirror tap closed, dropping chunk");
                self.tap = None;
            }
            return;
        }
        self.backlog.push_back(chunk);
    }

    /// Attach a fresh tap. Any stale tap is detached first and held backlog
    /// is delivered ahead of new bytes.
    pub fn pipe(&mut self) -> MirrorTap {
        self.unpipe();
        let (tx, rx) = mpsc::channel(TAP_DEPTH.max(self.backlog.len()));
        for chunk in self.backlog.drain(..) {
            // capacity covers the whole backlog and rx is alive
            let _ = tx.try_send(chunk);
        }
        self.tap = Some(tx);
        self.pipes += 1;
        MirrorTap { rx }
    }

    /// Detach the current tap. Its receiver sees end-of-stream once it has
    /// drained what was already sent. Returns whether a tap was attached.
    pub fn unpipe(&mut self) -> bool {
        self.tap.take().is_some()
    }

    pub fn is_piped(&self) -> bool {
        self.tap.is_some()
    }

    /// Total bytes duplicated since the mirror was created.
    pub fn mirrored_bytes(&self) -> u64 {
        self.mirrored
    }

    /// Bytes held while no tap is attached.
    pub fn backlog_len(&self) -> usize {
        self.backlog.iter().map(Bytes::len).sum()
    }

    /// Number of taps ever attached (one per transaction direction).
    pub fn pipe_count(&self) -> u64 {
        self.pipes
    }
}

/// Receiving end of a piped mirror.
#[derive(Debug)]
pub struct MirrorTap {
    rx: mpsc::Receiver<Bytes>,
}

impl MirrorTap {
    /// Next mirrored chunk, or `None` once the mirror was unpiped and
    /// everything sent before that has been received.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

/// Surfaces an underlying connection fault on the shared error surface
/// exactly once, no matter how many paths (parser, mirror consumer) observe
/// the same connection.
#[derive(Debug, Clone, Default)]
pub struct FaultLatch {
    tripped: Arc<AtomicBool>,
}

impl FaultLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit `error` unless this connection already reported a fault.
    /// Returns whether the event was emitted.
    pub fn report(&self, events: &EventBus, error: ProxyError, context: ErrorContext) -> bool {
        if self.tripped.swap(true, Ordering::AcqRel) {
            tracing::trace!(%context, error = %error, "Suppressing duplicate connection fault");
            return false;
        }
        events.emit(&ProxyEvent::Error {
            error: Arc::new(error),
            context,
        });
        true
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::connection::ConnectionId;
    use std::io;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn backlog_is_delivered_before_new_bytes() {
        let mut mirror = Mirror::new();
        mirror.push(Bytes::from_static(b"GET / HTTP/1.1\r\n")).await;
        mirror.push(Bytes::from_static(b"\r\n")).await;
        assert_eq!(mirror.backlog_len(), 18);

        let mut tap = mirror.pipe();
        mirror.push(Bytes::from_static(b"body")).await;
        mirror.unpipe();

        let mut seen = Vec::new();
        while let Some(chunk) = tap.recv().await {
            seen.extend_from_slice(&chunk);
        }
        assert_eq!(seen, b"GET / HTTP/1.1\r\n\r\nbody");
        assert_eq!(mirror.mirrored_bytes(), 22);
        assert_eq!(mirror.backlog_len(), 0);
    }

    #[tokio::test]
    async fn repiping_isolates_transactions() {
        let mut mirror = Mirror::new();

        let mut first = mirror.pipe();
        mirror.push(Bytes::from_static(b"one")).await;

        // A new transaction attaches without an explicit unpipe.
        let mut second = mirror.pipe();
        mirror.push(Bytes::from_static(b"two")).await;
        mirror.unpipe();

        assert_eq!(first.recv().await.as_deref(), Some(&b"one"[..]));
        assert_eq!(first.recv().await, None);
        assert_eq!(second.recv().await.as_deref(), Some(&b"two"[..]));
        assert_eq!(second.recv().await, None);
        assert_eq!(mirror.pipe_count(), 2);
    }

    #[tokio::test]
    async fn closed_tap_drops_instead_of_backlogging() {
        let mut mirror = Mirror::new();
        let tap = mirror.pipe();
        drop(tap);

        mirror.push(Bytes::from_static(b"lost")).await;
        assert!(!mirror.is_piped());
        assert_eq!(mirror.backlog_len(), 0);
    }

    #[tokio::test]
    async fn full_tap_holds_the_producer() {
        let mut mirror = Mirror::new();
        let mut tap = mirror.pipe();
        for _ in 0..TAP_DEPTH {
            mirror.push(Bytes::from_static(b"x")).await;
        }

        let blocked = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            mirror.push(Bytes::from_static(b"y")),
        )
        .await;
        assert!(blocked.is_err());

        assert_eq!(tap.recv().await.as_deref(), Some(&b"x"[..]));
        mirror.push(Bytes::from_static(b"z")).await;
    }

    #[tokio::test]
    async fn large_backlog_fits_the_next_tap() {
        let mut mirror = Mirror::new();
        for _ in 0..TAP_DEPTH * 2 {
            mirror.push(Bytes::from_static(b"h")).await;
        }
        let mut tap = mirror.pipe();
        mirror.unpipe();

        let mut seen = 0;
        while let Some(chunk) = tap.recv().await {
            seen += chunk.len();
        }
        assert_eq!(seen, TAP_DEPTH * 2);
    }

    #[test]
    fn fault_latch_reports_once() {
        let events = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        events.subscribe(move |event| {
            if matches!(event, ProxyEvent::Error { .. }) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        let latch = FaultLatch::new();
        let mirror_path = latch.clone();
        let context = ErrorContext::Inbound(ConnectionId::new());
        let reset = || ProxyError::inbound(io::Error::from(io::ErrorKind::ConnectionReset));

        assert!(latch.report(&events, reset(), context.clone()));
        assert!(!mirror_path.report(&events, reset(), context));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(latch.is_tripped());
    }
}
