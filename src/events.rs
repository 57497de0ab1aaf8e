//! Application-observable lifecycle events.
//!
//! Every lifecycle signal is one [`ProxyEvent`] variant dispatched through a
//! single subscription interface. Response-side events always carry the
//! request that produced them.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::error::ProxyError;
use crate::http::{RequestHead, ResponseHead};
use crate::net::connection::ConnectionId;
use crate::pool::Destination;

/// Identifier of one request/response exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId(uuid::Uuid);

impl TransactionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "txn-{}", self.0)
    }
}

/// Where an error happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorContext {
    /// Accepting connections.
    Listener,
    /// A client connection, outside any transaction.
    Inbound(ConnectionId),
    /// An origin connection.
    Outbound(ConnectionId),
    /// A transaction on the given client connection.
    Transaction {
        id: TransactionId,
        connection: ConnectionId,
    },
}

impl std::fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorContext::Listener => f.write_str("listener"),
            ErrorContext::Inbound(id) => write!(f, "inbound {id}"),
            ErrorContext::Outbound(id) => write!(f, "outbound {id}"),
            ErrorContext::Transaction { id, connection } => write!(f, "{id} on {connection}"),
        }
    }
}

/// Snapshot of an outbound connection handed to `Connected` observers.
#[derive(Debug, Clone)]
pub struct OutboundInfo {
    pub id: ConnectionId,
    pub destination: Destination,
    /// Taken from the idle pool rather than freshly opened.
    pub reused: bool,
    pub local_addr: Option<SocketAddr>,
    pub peer_addr: Option<SocketAddr>,
}

/// Lets a `Connected` observer tear down the outbound connection, which
/// aborts the transaction.
#[derive(Debug, Clone, Default)]
pub struct ConnectedControl {
    destroyed: Arc<AtomicBool>,
}

impl ConnectedControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn destroy(&self) {
        self.destroyed.store(true, Ordering::Release);
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }
}

/// A client connection whose CONNECT tunnel has been TLS-terminated and is
/// now served as a fresh inbound pipeline.
#[derive(Debug, Clone)]
pub struct DecryptedConnection {
    pub id: ConnectionId,
    /// The tunnel's originating client connection.
    pub parent: ConnectionId,
    pub peer_addr: SocketAddr,
    /// CONNECT target authority.
    pub authority: String,
    /// SNI the client sent, if any.
    pub server_name: Option<String>,
    pub alpn_protocol: Option<Vec<u8>>,
}

/// Lifecycle events republished to the application.
#[derive(Debug, Clone)]
pub enum ProxyEvent {
    /// Outbound connection ready for the request.
    Connected {
        connection: OutboundInfo,
        request: Arc<RequestHead>,
        control: ConnectedControl,
    },
    /// Decrypted connection from an intercepted CONNECT tunnel.
    Connection(DecryptedConnection),
    /// Parsed inbound request head, exactly once per transaction.
    Request(Arc<RequestHead>),
    Response {
        response: Arc<ResponseHead>,
        request: Arc<RequestHead>,
    },
    /// Origin switched protocols.
    UpgradeClient {
        response: Arc<ResponseHead>,
        request: Arc<RequestHead>,
    },
    /// Origin accepted a forwarded CONNECT.
    Connect {
        response: Arc<ResponseHead>,
        request: Arc<RequestHead>,
    },
    /// `100 Continue`.
    Continue {
        response: Arc<ResponseHead>,
        request: Arc<RequestHead>,
    },
    /// Any other informational (1xx) head.
    Information {
        response: Arc<ResponseHead>,
        request: Arc<RequestHead>,
    },
    Error {
        error: Arc<ProxyError>,
        context: ErrorContext,
    },
}

/// Discriminant of [`ProxyEvent`], handy for logging and filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    Connection,
    Request,
    Response,
    UpgradeClient,
    Connect,
    Continue,
    Information,
    Error,
}

impl ProxyEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ProxyEvent::Connected { .. } => EventKind::Connected,
            ProxyEvent::Connection(_) => EventKind::Connection,
            ProxyEvent::Request(_) => EventKind::Request,
            ProxyEvent::Response { .. } => EventKind::Response,
            ProxyEvent::UpgradeClient { .. } => EventKind::UpgradeClient,
            ProxyEvent::Connect { .. } => EventKind::Connect,
            ProxyEvent::Continue { .. } => EventKind::Continue,
            ProxyEvent::Information { .. } => EventKind::Information,
            ProxyEvent::Error { .. } => EventKind::Error,
        }
    }

    /// Request this event is paired with, if any.
    pub fn request(&self) -> Option<&Arc<RequestHead>> {
        match self {
            ProxyEvent::Connected { request, .. }
            | ProxyEvent::Request(request)
            | ProxyEvent::Response { request, .. }
            | ProxyEvent::UpgradeClient { request, .. }
            | ProxyEvent::Connect { request, .. }
            | ProxyEvent::Continue { request, .. }
            | ProxyEvent::Information { request, .. } => Some(request),
            ProxyEvent::Connection(_) | ProxyEvent::Error { .. } => None,
        }
    }
}

type Handler = Arc<dyn Fn(&ProxyEvent) + Send + Sync>;

/// Fan-out of events to subscribers. Handlers run inline on the task that
/// raised the event, so they must not block.
pub struct EventBus {
    handlers: ArcSwap<Vec<Handler>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            handlers: ArcSwap::from_pointee(Vec::new()),
        }
    }

    pub fn subscribe<F>(&self, handler: F)
    where
        F: Fn(&ProxyEvent) + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(handler);
        self.handlers.rcu(|current| {
            let mut next = Vec::with_capacity(current.len() + 1);
            next.extend(current.iter().cloned());
            next.push(Arc::clone(&handler));
            next
        });
    }

    pub fn emit(&self, event: &ProxyEvent) {
        let handlers = self.handlers.load();
        if handlers.is_empty() {
            if let ProxyEvent::Error { error, context } = event {
                tracing::warn!(%context, error = %error, "Unobserved proxy error");
            }
            return;
        }
        for handler in handlers.iter() {
            handler(event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.handlers.load().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
