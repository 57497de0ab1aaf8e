//! Client connection pipeline.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};

use crate::error::{ProxyError, Side};
use crate::events::{ErrorContext, ProxyEvent};
use crate::http::FramedReader;
use crate::mirror::FaultLatch;
use crate::net::connection::ConnectionId;
use crate::net::io::BoxedIo;
use crate::proxy::transaction::{self, Next};
use crate::proxy::ProxyInner;
use crate::tunnel;

/// A client connection: plain TCP, or the decrypted side of a CONNECT tunnel.
pub(crate) struct InboundConnection {
    pub(crate) id: ConnectionId,
    pub(crate) peer: SocketAddr,
    /// Requests on this connection arrived over TLS the proxy terminated.
    pub(crate) tls: bool,
    pub(crate) reader: FramedReader<ReadHalf<BoxedIo>>,
    pub(crate) writer: WriteHalf<BoxedIo>,
    pub(crate) latch: FaultLatch,
}

/// Serve requests from one client connection until it closes.
///
/// Boxed because a CONNECT tunnel serves its decrypted stream through this
/// same function.
pub(crate) fn serve_inbound(
    inner: Arc<ProxyInner>,
    io: BoxedIo,
    peer: SocketAddr,
    id: ConnectionId,
    tls: bool,
) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        let (read, write) = tokio::io::split(io);
        let mut conn = InboundConnection {
            id,
            peer,
            tls,
            reader: FramedReader::new(read, Side::Inbound),
            writer: write,
            latch: FaultLatch::new(),
        };
        tracing::debug!(connection_id = %id, peer_addr = %peer, tls, "Serving client connection");

        loop {
            conn.reader.attach_mirror();
            let request = match conn.reader.read_request_head().await {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(e) => {
                    report(&inner, &conn.latch, id, e);
                    break;
                }
            };

            if request.is_connect() {
                let latch = conn.latch.clone();
                if let Err(e) = tunnel::intercept_connect(Arc::clone(&inner), conn, request).await {
                    report(&inner, &latch, id, e);
                }
                return;
            }

            match transaction::run(&inner, &mut conn, request).await {
                Next::KeepAlive => continue,
                Next::Close => break,
            }
        }

        let _ = conn.writer.shutdown().await;
        tracing::debug!(connection_id = %id, "Client connection finished");
    })
}

/// Client-side transport faults go through the connection's latch so they are
/// reported once; anything else is reported as is.
fn report(inner: &ProxyInner, latch: &FaultLatch, id: ConnectionId, error: ProxyError) {
    let context = ErrorContext::Inbound(id);
    if error.side() == Some(Side::Inbound) {
        latch.report(&inner.events, error, context);
    } else {
        inner.events.emit(&ProxyEvent::Error {
            error: Arc::new(error),
            context,
        });
    }
}
