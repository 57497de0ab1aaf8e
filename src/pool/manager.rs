//! Keyed keep-alive pool.
//!
//! # Responsibilities
//! - Hand out an idle connection for a destination, or open a new one
//! - Take connections back after a transaction (release / reclaim)
//! - Permanently drop connections owned by an upgraded protocol (adopt)
//! - Close idle connections on shutdown

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::config::TimeoutConfig;
use crate::error::ProxyError;
use crate::hooks::ServerOptions;
use crate::net::tls::TlsConnectors;
use crate::observability::metrics;
use crate::pool::destination::{Destination, PoolKey};
use crate::pool::outbound::{BusyGuard, OutboundConnection};

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections ever opened.
    pub opened: u64,
    /// Times an idle connection was handed out again.
    pub reused: u64,
    /// Connections reclaimed from a finished CONNECT tunnel.
    pub reclaimed: u64,
    /// Connections removed from pooling by an upgrade.
    pub adopted: u64,
    pub idle: usize,
    pub busy: usize,
}

/// Outbound connections keyed by destination and origin TLS profile.
/// Unbounded; idle connections live until they go stale or the pool is
/// closed.
#[derive(Debug)]
pub struct ConnectionPool {
    idle: DashMap<PoolKey, Vec<OutboundConnection>>,
    keep_alive: bool,
    timeouts: TimeoutConfig,
    connectors: TlsConnectors,
    closed: AtomicBool,
    busy: Arc<AtomicUsize>,
    opened: AtomicU64,
    reused: AtomicU64,
    reclaimed: AtomicU64,
    adopted: AtomicU64,
}

impl ConnectionPool {
    pub fn new(keep_alive: bool, timeouts: TimeoutConfig, connectors: TlsConnectors) -> Self {
        Self {
            idle: DashMap::new(),
            keep_alive,
            timeouts,
            connectors,
            closed: AtomicBool::new(false),
            busy: Arc::new(AtomicUsize::new(0)),
            opened: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            reclaimed: AtomicU64::new(0),
            adopted: AtomicU64::new(0),
        }
    }

    /// Get a connection for `destination` as `options` would build it: an
    /// idle one if a healthy one with the same TLS profile is pooled,
    /// otherwise a freshly connected one.
    pub async fn obtain(
        &self,
        destination: &Destination,
        options: &ServerOptions,
    ) -> Result<OutboundConnection, ProxyError> {
        let key = PoolKey::new(destination, options);
        if let Some(mut conn) = self.take_idle(&key) {
            conn.mark_reused();
            conn.busy = Some(BusyGuard::new(&self.busy));
            self.reused.fetch_add(1, Ordering::Relaxed);
            metrics::record_pool_reuse();
            tracing::debug!(
                connection_id = %conn.id(),
                pool_key = %key,
                "Reusing pooled connection"
            );
            return Ok(conn);
        }

        let mut conn = OutboundConnection::connect(
            key,
            options,
            &self.connectors,
            self.timeouts.connect(),
            self.timeouts.handshake(),
        )
        .await?;
        conn.busy = Some(BusyGuard::new(&self.busy));
        self.opened.fetch_add(1, Ordering::Relaxed);
        metrics::record_pool_open();
        Ok(conn)
    }

    fn take_idle(&self, key: &PoolKey) -> Option<OutboundConnection> {
        let mut entry = self.idle.get_mut(key)?;
        // Most recently released first.
        while let Some(mut conn) = entry.pop() {
            if conn.reader.is_stale() {
                tracing::debug!(connection_id = %conn.id(), "Discarding stale pooled connection");
                continue;
            }
            return Some(conn);
        }
        None
    }

    /// Return a finished connection to its idle list. Closes it instead when
    /// keep-alive is off or the pool is closed.
    pub fn release(&self, mut conn: OutboundConnection) {
        conn.busy = None;
        conn.finish_transaction();
        if !self.keep_alive || self.closed.load(Ordering::Acquire) {
            tracing::debug!(connection_id = %conn.id(), "Closing outbound connection");
            return;
        }
        conn.reader.unpipe_mirror();
        tracing::trace!(
            connection_id = %conn.id(),
            destination = %conn.destination(),
            "Connection returned to idle pool"
        );
        self.idle
            .entry(conn.pool_key().clone())
            .or_default()
            .push(conn);
    }

    /// Finish a CONNECT transaction whose connection was never written to and
    /// put the connection back in the idle pool without touching its
    /// transport, so decrypted requests to the same destination pick it up.
    pub fn reclaim(&self, conn: OutboundConnection) {
        self.reclaimed.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            connection_id = %conn.id(),
            destination = %conn.destination(),
            "Reclaiming tunnel connection"
        );
        self.release(conn);
    }

    /// Take a connection out of pooling for good; the upgraded protocol owns
    /// its transport until either peer closes it.
    pub fn adopt(&self, mut conn: OutboundConnection) {
        conn.busy = None;
        conn.finish_transaction();
        self.adopted.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(connection_id = %conn.id(), "Outbound connection adopted by upgrade");
    }

    /// Drop a busy connection after a failed or aborted transaction.
    pub fn discard(&self, conn: OutboundConnection) {
        tracing::debug!(connection_id = %conn.id(), "Discarding outbound connection");
    }

    /// Close every idle connection and stop pooling new ones. Returns how many
    /// were closed.
    pub fn close_idle(&self) -> usize {
        self.closed.store(true, Ordering::Release);
        let mut closed = 0;
        self.idle.retain(|_, conns| {
            closed += conns.len();
            false
        });
        tracing::debug!(closed, "Idle pool closed");
        closed
    }

    /// Idle connections to `destination`, across every TLS profile.
    pub fn idle_count(&self, destination: &Destination) -> usize {
        self.idle
            .iter()
            .filter(|entry| entry.key().destination == *destination)
            .map(|entry| entry.value().len())
            .sum()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            opened: self.opened.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            reclaimed: self.reclaimed.load(Ordering::Relaxed),
            adopted: self.adopted.load(Ordering::Relaxed),
            idle: self.idle.iter().map(|entry| entry.value().len()).sum(),
            busy: self.busy.load(Ordering::SeqCst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::tls::{self, TlsIdentity};
    use crate::pool::destination::Scheme;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn origin() -> (TcpListener, Destination) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, Destination::new("127.0.0.1", port, Scheme::Plain))
    }

    fn pool(keep_alive: bool) -> ConnectionPool {
        ConnectionPool::new(keep_alive, TimeoutConfig::default(), TlsConnectors::new().unwrap())
    }

    #[tokio::test]
    async fn released_connection_is_reused() {
        let (listener, dest) = origin().await;
        let accepting = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            socket
        });

        let pool = pool(true);
        let conn = pool.obtain(&dest, &ServerOptions::default()).await.unwrap();
        let first_id = conn.id();
        let _origin_side = accepting.await.unwrap();
        assert_eq!(pool.stats().busy, 1);

        pool.release(conn);
        assert_eq!(pool.idle_count(&dest), 1);
        assert_eq!(pool.stats().busy, 0);

        let again = pool.obtain(&dest, &ServerOptions::default()).await.unwrap();
        assert_eq!(again.id(), first_id);
        assert!(again.is_reused());
        assert_eq!(again.transactions(), 1);

        let stats = pool.stats();
        assert_eq!((stats.opened, stats.reused, stats.busy), (1, 1, 1));
    }

    #[tokio::test]
    async fn stale_idle_connection_is_replaced() {
        let (listener, dest) = origin().await;
        let pool = pool(true);

        let accepting = tokio::spawn(async move {
            let (first, _) = listener.accept().await.unwrap();
            drop(first);
            let (second, _) = listener.accept().await.unwrap();
            second
        });

        let conn = pool.obtain(&dest, &ServerOptions::default()).await.unwrap();
        let first_id = conn.id();
        pool.release(conn);

        // Give the FIN time to arrive.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let fresh = pool.obtain(&dest, &ServerOptions::default()).await.unwrap();
        assert_ne!(fresh.id(), first_id);
        assert!(!fresh.is_reused());
        assert_eq!(pool.stats().opened, 2);
        let _ = accepting.await.unwrap();
    }

    #[tokio::test]
    async fn keep_alive_off_closes_on_release() {
        let (listener, dest) = origin().await;
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        });

        let pool = pool(false);
        let conn = pool.obtain(&dest, &ServerOptions::default()).await.unwrap();
        pool.release(conn);
        assert_eq!(pool.idle_count(&dest), 0);
    }

    #[tokio::test]
    async fn reclaim_and_adopt_bookkeeping() {
        let (listener, dest) = origin().await;
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let pool = pool(true);
        let tunnel = pool.obtain(&dest, &ServerOptions::default()).await.unwrap();
        pool.reclaim(tunnel);
        assert_eq!(pool.idle_count(&dest), 1);

        let upgraded = pool.obtain(&dest, &ServerOptions::default()).await.unwrap();
        pool.adopt(upgraded);

        let stats = pool.stats();
        assert_eq!(stats.reclaimed, 1);
        assert_eq!(stats.adopted, 1);
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.busy, 0);
    }

    #[tokio::test]
    async fn close_idle_empties_pool_and_stops_pooling() {
        let (listener, dest) = origin().await;
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let pool = pool(true);
        let a = pool.obtain(&dest, &ServerOptions::default()).await.unwrap();
        let b = pool.obtain(&dest, &ServerOptions::default()).await.unwrap();
        pool.release(a);
        assert_eq!(pool.close_idle(), 1);

        pool.release(b);
        assert_eq!(pool.idle_count(&dest), 0);
    }

    #[tokio::test]
    async fn refused_connect_is_an_outbound_error() {
        let (listener, dest) = origin().await;
        drop(listener);

        let err = pool(true)
            .obtain(&dest, &ServerOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.side(), Some(crate::error::Side::Outbound));
    }

    /// TLS origin presenting the built-in self-signed localhost identity.
    async fn self_signed_origin() -> Destination {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let config = tls::server_config(&TlsIdentity::localhost().unwrap()).unwrap();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let config = Arc::clone(&config);
                tokio::spawn(async move {
                    if let Ok(mut stream) = tls::accept(config, socket, Duration::from_secs(5)).await {
                        let mut buf = [0u8; 1];
                        let _ = stream.read(&mut buf).await;
                    }
                });
            }
        });
        Destination::new("127.0.0.1", port, Scheme::Tls)
    }

    fn tls_options(accept_invalid_certs: bool) -> ServerOptions {
        ServerOptions {
            server_name: Some("localhost".to_string()),
            accept_invalid_certs,
            ..ServerOptions::default()
        }
    }

    #[tokio::test]
    async fn verified_request_never_reuses_unverified_connection() {
        let dest = self_signed_origin().await;
        let pool = pool(true);

        let lax = pool.obtain(&dest, &tls_options(true)).await.unwrap();
        let lax_id = lax.id();
        pool.release(lax);
        assert_eq!(pool.idle_count(&dest), 1);

        // The self-signed origin fails verification on a fresh connect.
        let err = pool.obtain(&dest, &tls_options(false)).await.unwrap_err();
        assert_eq!(err.kind(), "tls_handshake");
        assert_eq!(pool.stats().reused, 0);
        assert_eq!(pool.idle_count(&dest), 1);

        let again = pool.obtain(&dest, &tls_options(true)).await.unwrap();
        assert_eq!(again.id(), lax_id);
        assert!(again.is_reused());
    }

    #[tokio::test]
    async fn server_name_is_part_of_the_key() {
        let dest = self_signed_origin().await;
        let pool = pool(true);

        let localhost = pool.obtain(&dest, &tls_options(true)).await.unwrap();
        pool.release(localhost);

        let renamed = ServerOptions {
            server_name: Some("127.0.0.1".to_string()),
            accept_invalid_certs: true,
            ..ServerOptions::default()
        };
        let other = pool.obtain(&dest, &renamed).await.unwrap();
        assert!(!other.is_reused());
        assert_eq!(pool.stats().opened, 2);
    }
}
