//! CONNECT interception and protocol-upgrade tunnels.
//!
//! # Data Flow
//! ```text
//! CONNECT host:port
//!     → resolve (TLS scheme) → server_options → pool.obtain → Connected
//!     → "200 Connection Established" to the client
//!     → TLS accept on the client socket (bytes buffered behind the CONNECT
//!       head are replayed into the handshake)
//!     → Connection event → pool.reclaim(outbound)
//!     → decrypted stream served as a fresh inbound pipeline
//!
//! Upgrade (101)
//!     → both directions relay raw bytes through their transforms
//!     → outbound adopted, never pooled again
//! ```
//!
//! # States
//! `Requested → Connecting → Established → (TlsHandshake) → Active → Released`

use std::sync::Arc;

use tokio::io::AsyncWriteExt;

use crate::error::ProxyError;
use crate::events::{DecryptedConnection, ProxyEvent, TransactionId};
use crate::http::RequestHead;
use crate::net::connection::ConnectionId;
use crate::net::io::PrefixedIo;
use crate::net::tls;
use crate::observability::metrics;
use crate::proxy::inbound::InboundConnection;
use crate::proxy::transaction::{announce_connected, resolve_destination};
use crate::proxy::{serve_inbound, ProxyInner};

/// The only status line the proxy ever writes on its own.
pub const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelKind {
    /// `CONNECT`, intercepted and TLS-terminated.
    Connect,
    /// `101 Switching Protocols` on a regular request.
    Upgrade,
}

impl TunnelKind {
    fn label(self) -> &'static str {
        match self {
            TunnelKind::Connect => "connect",
            TunnelKind::Upgrade => "upgrade",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Requested,
    Connecting,
    Established,
    /// CONNECT only.
    TlsHandshake,
    Active,
    Released,
}

impl TunnelState {
    pub fn can_advance_to(self, next: TunnelState, kind: TunnelKind) -> bool {
        use TunnelState::*;
        match (self, next) {
            (Requested, Connecting) | (Connecting, Established) | (Active, Released) => true,
            (Established, TlsHandshake) | (TlsHandshake, Active) => kind == TunnelKind::Connect,
            (Established, Active) => kind == TunnelKind::Upgrade,
            _ => false,
        }
    }
}

/// Lifecycle of one tunnel.
#[derive(Debug)]
pub struct TunnelSession {
    transaction: TransactionId,
    kind: TunnelKind,
    state: TunnelState,
    authority: String,
}

impl TunnelSession {
    pub fn new(transaction: TransactionId, kind: TunnelKind, authority: impl Into<String>) -> Self {
        Self {
            transaction,
            kind,
            state: TunnelState::Requested,
            authority: authority.into(),
        }
    }

    pub fn state(&self) -> TunnelState {
        self.state
    }

    pub fn kind(&self) -> TunnelKind {
        self.kind
    }

    pub fn advance(&mut self, next: TunnelState) -> Result<(), ProxyError> {
        if !self.state.can_advance_to(next, self.kind) {
            return Err(ProxyError::Protocol(format!(
                "illegal {} tunnel transition {:?} -> {:?}",
                self.kind.label(),
                self.state,
                next
            )));
        }
        tracing::trace!(
            transaction_id = %self.transaction,
            authority = %self.authority,
            from = ?self.state,
            to = ?next,
            "Tunnel state"
        );
        self.state = next;
        if next == TunnelState::Active {
            metrics::record_tunnel(self.kind.label());
        }
        Ok(())
    }
}

/// Intercept a CONNECT: answer it, terminate the client's TLS and serve the
/// decrypted stream. Returns once the decrypted connection is finished.
///
/// Ordering:
/// - `Connection` is emitted after the client handshake completes, not
///   before the `200` line, so it can carry the negotiated SNI and ALPN.
/// - Bytes the client sent right behind the CONNECT head are replayed into
///   the TLS acceptor rather than written to the origin connection. They are
///   the start of the client's handshake, and the origin connection stays
///   unused until it is reclaimed for the decrypted requests.
pub(crate) async fn intercept_connect(
    inner: Arc<ProxyInner>,
    inbound: InboundConnection,
    request: RequestHead,
) -> Result<(), ProxyError> {
    let request = Arc::new(request);
    let mut session = TunnelSession::new(TransactionId::new(), TunnelKind::Connect, request.target.as_str());
    inner.events.emit(&ProxyEvent::Request(Arc::clone(&request)));

    session.advance(TunnelState::Connecting)?;
    let (destination, options) = resolve_destination(&inner, &request, inbound.tls).await?;
    let mut outbound = inner.pool.obtain(&destination, &options).await?;
    outbound.reader.attach_mirror();
    session.advance(TunnelState::Established)?;

    if !announce_connected(&inner, &outbound, &request) {
        inner.pool.discard(outbound);
        return Ok(());
    }

    let server_config = match inner
        .hooks
        .resolve_client_options(&request)
        .await
        .and_then(|options| options.into_server_config(&inner.default_tls))
    {
        Ok(config) => config,
        Err(e) => {
            inner.pool.reclaim(outbound);
            return Err(e);
        }
    };

    let InboundConnection {
        id: parent,
        peer,
        reader,
        mut writer,
        ..
    } = inbound;

    if let Err(e) = writer.write_all(CONNECT_ESTABLISHED).await {
        inner.pool.reclaim(outbound);
        return Err(ProxyError::inbound(e));
    }
    if let Err(e) = writer.flush().await {
        inner.pool.reclaim(outbound);
        return Err(ProxyError::inbound(e));
    }

    let (read_half, buffered) = reader.into_parts();
    let client_io = PrefixedIo::new(buffered, read_half.unsplit(writer));

    session.advance(TunnelState::TlsHandshake)?;
    let stream = match tls::accept(server_config, client_io, inner.config.timeouts.handshake()).await {
        Ok(stream) => stream,
        Err(e) => {
            // The outbound side never carried a byte; it is still healthy.
            inner.pool.reclaim(outbound);
            return Err(e);
        }
    };

    let (_, tls_session) = stream.get_ref();
    let decrypted = DecryptedConnection {
        id: ConnectionId::new(),
        parent,
        peer_addr: peer,
        authority: request.target.clone(),
        server_name: tls_session.server_name().map(str::to_string),
        alpn_protocol: tls_session.alpn_protocol().map(<[u8]>::to_vec),
    };

    session.advance(TunnelState::Active)?;
    inner.events.emit(&ProxyEvent::Connection(decrypted.clone()));
    inner.pool.reclaim(outbound);

    tracing::debug!(
        connection_id = %decrypted.id,
        parent = %parent,
        authority = %decrypted.authority,
        sni = ?decrypted.server_name,
        "Serving decrypted tunnel"
    );
    serve_inbound(Arc::clone(&inner), Box::new(stream), peer, decrypted.id, true).await;

    session.advance(TunnelState::Released)
}
