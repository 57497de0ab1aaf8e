//! Origin-facing connections.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;

use crate::error::{ProxyError, Side};
use crate::events::OutboundInfo;
use crate::hooks::ServerOptions;
use crate::http::FramedReader;
use crate::mirror::FaultLatch;
use crate::net::connection::ConnectionId;
use crate::net::io::BoxedIo;
use crate::net::tls::{self, TlsConnectors};
use crate::pool::destination::{Destination, PoolKey};

/// Decrements the pool's busy count when the owning transaction lets go of
/// its connection, however it ends.
#[derive(Debug)]
pub(crate) struct BusyGuard(Arc<AtomicUsize>);

impl BusyGuard {
    pub(crate) fn new(busy: &Arc<AtomicUsize>) -> Self {
        busy.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(busy))
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A connection to an origin. Owned by the pool while idle and by exactly one
/// transaction while busy.
pub struct OutboundConnection {
    id: ConnectionId,
    key: PoolKey,
    pub(crate) reader: FramedReader<ReadHalf<BoxedIo>>,
    pub(crate) writer: WriteHalf<BoxedIo>,
    latch: FaultLatch,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    reused: bool,
    transactions: u64,
    pub(crate) busy: Option<BusyGuard>,
}

impl OutboundConnection {
    /// Open a TCP connection, TLS-wrapped when `key` carries a TLS profile.
    pub(crate) async fn connect(
        key: PoolKey,
        options: &ServerOptions,
        connectors: &TlsConnectors,
        connect_timeout: Duration,
        handshake_timeout: Duration,
    ) -> Result<Self, ProxyError> {
        let destination = &key.destination;
        let deadline = options.connect_timeout.unwrap_or(connect_timeout);
        let stream = tokio::time::timeout(
            deadline,
            TcpStream::connect((destination.host.as_str(), destination.port)),
        )
        .await
        .map_err(|_| {
            ProxyError::outbound(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect to {destination} timed out"),
            ))
        })?
        .map_err(ProxyError::outbound)?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::trace!(destination = %destination, error = %e, "Failed to set TCP_NODELAY");
        }
        let local_addr = stream.local_addr().ok();
        let peer_addr = stream.peer_addr().ok();

        let io: BoxedIo = match &key.tls {
            None => Box::new(stream),
            Some(profile) => {
                let config = connectors.config(!profile.verify);
                Box::new(
                    tls::connect(config, &profile.server_name, stream, handshake_timeout).await?,
                )
            }
        };
        let (read, write) = tokio::io::split(io);
        let id = ConnectionId::new();

        tracing::debug!(
            connection_id = %id,
            pool_key = %key,
            peer_addr = ?peer_addr,
            "Outbound connection opened"
        );

        Ok(Self {
            id,
            key,
            reader: FramedReader::new(read, Side::Outbound),
            writer: write,
            latch: FaultLatch::new(),
            local_addr,
            peer_addr,
            reused: false,
            transactions: 0,
            busy: None,
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn destination(&self) -> &Destination {
        &self.key.destination
    }

    /// Idle list this connection returns to.
    pub fn pool_key(&self) -> &PoolKey {
        &self.key
    }

    /// Handed out from the idle pool rather than freshly opened.
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    /// Transactions completed on this connection.
    pub fn transactions(&self) -> u64 {
        self.transactions
    }

    pub fn latch(&self) -> &FaultLatch {
        &self.latch
    }

    pub fn info(&self) -> OutboundInfo {
        OutboundInfo {
            id: self.id,
            destination: self.key.destination.clone(),
            reused: self.reused,
            local_addr: self.local_addr,
            peer_addr: self.peer_addr,
        }
    }

    pub(crate) fn mark_reused(&mut self) {
        self.reused = true;
    }

    pub(crate) fn finish_transaction(&mut self) {
        self.transactions += 1;
    }
}

impl std::fmt::Debug for OutboundConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundConnection")
            .field("id", &self.id)
            .field("pool_key", &self.key)
            .field("reused", &self.reused)
            .field("transactions", &self.transactions)
            .finish_non_exhaustive()
    }
}
