//! Request/response orchestrator.
//!
//! # Data Flow
//! ```text
//! listen() accept loop / serve_connection()
//!     → inbound.rs (one task per client connection, keep-alive loop)
//!         → CONNECT: tunnel::intercept_connect → decrypted stream
//!                    re-enters inbound.rs as a fresh pipeline
//!         → otherwise: transaction.rs
//!             resolve → server_options → pool.obtain → Connected
//!             → request direction ‖ bridge::relay_responses
//!             → release / adopt / discard
//! ```
//!
//! # Design Decisions
//! - One `Proxy` owns its pool, event bus and connection tracker; cloning a
//!   `Proxy` shares them
//! - Errors never escape a connection task; they surface as `Error` events

pub(crate) mod inbound;
pub(crate) mod transaction;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::config::{validate_config, ConfigError, ProxyConfig};
use crate::error::ProxyError;
use crate::events::{ErrorContext, EventBus, ProxyEvent};
use crate::hooks::ProxyHooks;
use crate::lifecycle::Shutdown;
use crate::net::connection::{ConnectionGuard, ConnectionTracker};
use crate::net::io::{BoxedIo, Io};
use crate::net::listener::Listener;
use crate::net::tls::{self, TlsConnectors, TlsIdentity};
use crate::pool::ConnectionPool;

pub(crate) use inbound::serve_inbound;

/// State shared by every connection task of one proxy.
pub(crate) struct ProxyInner {
    pub(crate) config: ProxyConfig,
    pub(crate) hooks: ProxyHooks,
    pub(crate) pool: ConnectionPool,
    pub(crate) events: EventBus,
    pub(crate) tracker: ConnectionTracker,
    /// Client-facing TLS config used when `client_options` supplies none.
    pub(crate) default_tls: Arc<rustls::ServerConfig>,
    shutdown: Shutdown,
    accept_tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// An intercepting forwarding proxy.
#[derive(Clone)]
pub struct Proxy {
    inner: Arc<ProxyInner>,
}

impl Proxy {
    /// Build a proxy. Validates `config` and loads the client-facing identity
    /// (the configured PEM files, or the built-in localhost pair).
    pub fn new(config: ProxyConfig, hooks: ProxyHooks) -> Result<Self, ProxyError> {
        validate_config(&config).map_err(ConfigError::Validation)?;

        let identity = match &config.tls {
            Some(files) => {
                TlsIdentity::from_pem_files(Path::new(&files.cert_path), Path::new(&files.key_path))?
            }
            None => TlsIdentity::localhost()?,
        };
        let default_tls = tls::server_config(&identity)?;
        let pool = ConnectionPool::new(
            config.keep_alive,
            config.timeouts.clone(),
            TlsConnectors::new()?,
        );

        Ok(Self {
            inner: Arc::new(ProxyInner {
                config,
                hooks,
                pool,
                events: EventBus::new(),
                tracker: ConnectionTracker::new(),
                default_tls,
                shutdown: Shutdown::new(),
                accept_tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Register an event handler. Handlers run inline and must not block.
    pub fn subscribe<F>(&self, handler: F)
    where
        F: Fn(&ProxyEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(handler);
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.inner.config
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.inner.pool
    }

    /// Client connections currently being served, decrypted tunnels included.
    pub fn active_connections(&self) -> u64 {
        self.inner.tracker.active_count()
    }

    /// Bind `addr` and accept connections on a background task until
    /// [`close`](Self::close). Returns the bound address.
    pub async fn listen(&self, addr: SocketAddr) -> Result<SocketAddr, ProxyError> {
        if self.inner.shutdown.is_triggered() {
            return Err(ProxyError::Closed);
        }
        let listener = Listener::bind(addr, self.inner.config.listener.max_connections).await?;
        let local_addr = listener.local_addr()?;
        let mut shutdown_rx = self.inner.shutdown.subscribe();
        let inner = Arc::clone(&self.inner);

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.wait() => {
                        tracing::info!(address = %local_addr, "Listener stopped");
                        break;
                    }
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer, permit)) => {
                                let inner = Arc::clone(&inner);
                                let guard = inner.tracker.track();
                                tokio::spawn(async move {
                                    serve_tracked(inner, Box::new(stream), peer, guard).await;
                                    drop(permit);
                                });
                            }
                            Err(e) => {
                                inner.events.emit(&ProxyEvent::Error {
                                    error: Arc::new(e),
                                    context: ErrorContext::Listener,
                                });
                                tokio::time::sleep(Duration::from_millis(50)).await;
                            }
                        }
                    }
                }
            }
        });

        self.inner
            .accept_tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task);
        Ok(local_addr)
    }

    /// Serve one already-accepted client stream to completion. For embedding
    /// with a listener the proxy does not own.
    pub async fn serve_connection<S: Io>(&self, io: S, peer: SocketAddr) {
        let guard = self.inner.tracker.track();
        serve_tracked(Arc::clone(&self.inner), Box::new(io), peer, guard).await;
    }

    /// Stop accepting and close idle pooled connections. Connections already
    /// being served, tunnels included, run on. Returns how many idle
    /// connections were closed.
    pub async fn close(&self) -> usize {
        self.inner.shutdown.trigger();
        let tasks = std::mem::take(
            &mut *self
                .inner
                .accept_tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for task in tasks {
            let _ = task.await;
        }
        let closed = self.inner.pool.close_idle();
        tracing::info!(idle_closed = closed, "Proxy closed");
        closed
    }

    /// Wait for served client connections to finish on their own. Returns
    /// false if some were still open when `timeout` elapsed.
    pub async fn wait_until_idle(&self, timeout: Duration) -> bool {
        self.inner.tracker.wait_until_idle(timeout).await
    }

    /// Terminate every client connection currently tracked, including
    /// decrypted tunnel connections.
    pub fn close_all_connections(&self) {
        self.inner.tracker.close_all();
    }
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("active_connections", &self.active_connections())
            .field("pool", &self.inner.pool.stats())
            .field("events", &self.inner.events)
            .finish()
    }
}

/// Run a client connection until it finishes or `close_all` is signalled.
async fn serve_tracked(
    inner: Arc<ProxyInner>,
    io: BoxedIo,
    peer: SocketAddr,
    mut guard: ConnectionGuard,
) {
    let id = guard.id();
    tokio::select! {
        _ = serve_inbound(inner, io, peer, id, false) => {}
        _ = guard.closed() => {
            tracing::debug!(connection_id = %id, "Connection closed by close_all_connections");
        }
    }
}
