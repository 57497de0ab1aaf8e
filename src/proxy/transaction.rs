//! One request/response exchange on a client connection.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::sync::oneshot;
use tracing::Instrument;

use crate::bridge::{self, ResponseOutcome};
use crate::error::{Direction, ProxyError, Side};
use crate::events::{ConnectedControl, ErrorContext, ProxyEvent, TransactionId};
use crate::hooks::ServerOptions;
use crate::http::{BodyFraming, FramedReader, RequestHead};
use crate::mirror::FaultLatch;
use crate::net::connection::ConnectionId;
use crate::observability::metrics;
use crate::pool::{self, Destination, OutboundConnection};
use crate::proxy::inbound::InboundConnection;
use crate::proxy::ProxyInner;
use crate::transform;
use crate::tunnel::{TunnelKind, TunnelSession, TunnelState};

/// What the client connection does after a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Next {
    KeepAlive,
    Close,
}

/// Run one non-CONNECT transaction. Errors are reported here and close the
/// client connection.
pub(crate) async fn run(
    inner: &ProxyInner,
    inbound: &mut InboundConnection,
    request: RequestHead,
) -> Next {
    let id = TransactionId::new();
    let request = Arc::new(request);
    let span = tracing::debug_span!(
        "transaction",
        transaction_id = %id,
        connection_id = %inbound.id,
        method = %request.method,
        target = %request.target,
    );

    async move {
        inner.events.emit(&ProxyEvent::Request(Arc::clone(&request)));

        let mut origin = None;
        match exchange(inner, inbound, &request, id, &mut origin).await {
            Ok(next) => next,
            Err(error) => {
                tracing::debug!(error = %error, "Transaction failed");
                metrics::record_transaction("failed");
                report(inner, inbound, origin, error, id);
                Next::Close
            }
        }
    }
    .instrument(span)
    .await
}

/// Resolve where `request` goes and apply the `server_options` hook.
pub(crate) async fn resolve_destination(
    inner: &ProxyInner,
    request: &RequestHead,
    inbound_tls: bool,
) -> Result<(Destination, ServerOptions), ProxyError> {
    let destination = pool::resolve(request, inbound_tls)?;
    let options = inner.hooks.resolve_server_options(request).await?;
    Ok((destination.with_overrides(&options), options))
}

/// Emit `Connected`. Returns false when an observer destroyed the outbound
/// connection, in which case the transaction must be abandoned.
pub(crate) fn announce_connected(
    inner: &ProxyInner,
    outbound: &OutboundConnection,
    request: &Arc<RequestHead>,
) -> bool {
    let control = ConnectedControl::new();
    inner.events.emit(&ProxyEvent::Connected {
        connection: outbound.info(),
        request: Arc::clone(request),
        control: control.clone(),
    });
    if control.is_destroyed() {
        tracing::debug!(connection_id = %outbound.id(), "Outbound connection destroyed by observer");
        metrics::record_transaction("aborted");
        return false;
    }
    true
}

async fn exchange(
    inner: &ProxyInner,
    inbound: &mut InboundConnection,
    request: &Arc<RequestHead>,
    id: TransactionId,
    origin: &mut Option<(ConnectionId, FaultLatch)>,
) -> Result<Next, ProxyError> {
    let framing = request.framing()?;
    let mut tunnel = request
        .wants_upgrade()
        .then(|| TunnelSession::new(id, TunnelKind::Upgrade, request.target.as_str()));

    advance(&mut tunnel, TunnelState::Connecting)?;
    let (destination, options) = resolve_destination(inner, request, inbound.tls).await?;
    let mut outbound = inner.pool.obtain(&destination, &options).await?;
    *origin = Some((outbound.id(), outbound.latch().clone()));
    outbound.reader.attach_mirror();
    advance(&mut tunnel, TunnelState::Established)?;

    if !announce_connected(inner, &outbound, request) {
        inner.pool.discard(outbound);
        return Ok(Next::Close);
    }

    let (upgrade_tx, upgrade_rx) = match tunnel {
        Some(_) => {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        }
        None => (None, None),
    };

    let request_transform = inner.hooks.make_request_transform(request);
    let request_tap = inbound.reader.pipe_mirror();

    let client_reader = &mut inbound.reader;
    let client_writer = &mut inbound.writer;
    let origin_reader = &mut outbound.reader;
    let origin_writer = &mut outbound.writer;

    let requests = async move {
        let forward = forward_request(client_reader, framing, upgrade_rx);
        let stage = transform::run_stage(
            request_tap,
            request_transform,
            &mut *origin_writer,
            Direction::Request,
        );
        let (upgraded, _) = tokio::try_join!(forward, stage)?;
        if upgraded {
            let _ = origin_writer.shutdown().await;
        }
        Ok::<_, ProxyError>(())
    };
    let responses = bridge::relay_responses(
        &inner.events,
        &inner.hooks,
        request,
        origin_reader,
        client_writer,
        upgrade_tx,
    );
    let ((), outcome) = tokio::try_join!(requests, responses)?;

    match outcome {
        ResponseOutcome::Complete { keep_alive } => {
            if keep_alive {
                inner.pool.release(outbound);
            } else {
                inner.pool.discard(outbound);
            }
            metrics::record_transaction("completed");
            Ok(if keep_alive { Next::KeepAlive } else { Next::Close })
        }
        ResponseOutcome::Upgraded => {
            advance(&mut tunnel, TunnelState::Active)?;
            inner.pool.adopt(outbound);
            advance(&mut tunnel, TunnelState::Released)?;
            metrics::record_transaction("upgraded");
            Ok(Next::Close)
        }
    }
}

/// Consume the request body (and, after a 101, the raw upgraded stream) so
/// the mirror feeds the request transform. Returns whether the connection
/// was upgraded.
async fn forward_request<R>(
    reader: &mut FramedReader<R>,
    framing: BodyFraming,
    upgrade: Option<oneshot::Receiver<bool>>,
) -> Result<bool, ProxyError>
where
    R: AsyncRead + Unpin,
{
    let result = async {
        reader.forward_body(framing).await?;
        let upgraded = match upgrade {
            Some(rx) => rx.await.unwrap_or(false),
            None => false,
        };
        if upgraded {
            reader.forward_body(BodyFraming::UntilClose).await?;
        }
        Ok::<_, ProxyError>(upgraded)
    }
    .await;
    reader.unpipe_mirror();
    result
}

fn advance(tunnel: &mut Option<TunnelSession>, next: TunnelState) -> Result<(), ProxyError> {
    tunnel.as_mut().map_or(Ok(()), |session| session.advance(next))
}

/// Surface a transaction failure once. Transport faults go through the latch
/// of the connection they happened on.
fn report(
    inner: &ProxyInner,
    inbound: &InboundConnection,
    origin: Option<(ConnectionId, FaultLatch)>,
    error: ProxyError,
    id: TransactionId,
) {
    let transaction = ErrorContext::Transaction {
        id,
        connection: inbound.id,
    };
    match (error.side(), origin) {
        (Some(Side::Inbound), _) => {
            inbound.latch.report(&inner.events, error, transaction);
        }
        (Some(Side::Outbound), Some((origin_id, latch))) => {
            latch.report(&inner.events, error, ErrorContext::Outbound(origin_id));
        }
        _ => inner.events.emit(&ProxyEvent::Error {
            error: Arc::new(error),
            context: transaction,
        }),
    }
}
