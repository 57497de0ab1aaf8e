//! Protocol event bridge for the response direction.
//!
//! # Data Flow
//! ```text
//! origin socket
//!     → FramedReader::read_response_head (primary parser)
//!     → classify (continue / information / upgrade-client / connect / response)
//!     → ProxyEvent paired with the originating request
//!     → mirror pipe → response transform → client socket
//!     → body drained by the parser until framing says it ended
//! ```
//!
//! # Design Decisions
//! - Every head gets its own response transform, so interim 1xx heads never
//!   share a transform with the final response
//! - The bridge drains bodies itself; nothing depends on the application
//!   reading anything for the connection to be released

use std::sync::Arc;

use http::{Method, StatusCode};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;

use crate::error::{Direction, ProxyError};
use crate::events::{EventBus, ProxyEvent};
use crate::hooks::ProxyHooks;
use crate::http::{BodyFraming, FramedReader, RequestHead, ResponseHead};
use crate::transform;

/// What a response head means for the transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    /// `100 Continue`; the final head follows.
    Continue,
    /// Any other 1xx except 101; the final head follows.
    Information,
    /// `101 Switching Protocols`.
    UpgradeClient,
    /// 2xx answer to a CONNECT.
    Connect,
    /// Final response.
    Response,
}

impl ResponseKind {
    fn into_event(self, response: Arc<ResponseHead>, request: Arc<RequestHead>) -> ProxyEvent {
        match self {
            ResponseKind::Continue => ProxyEvent::Continue { response, request },
            ResponseKind::Information => ProxyEvent::Information { response, request },
            ResponseKind::UpgradeClient => ProxyEvent::UpgradeClient { response, request },
            ResponseKind::Connect => ProxyEvent::Connect { response, request },
            ResponseKind::Response => ProxyEvent::Response { response, request },
        }
    }
}

pub fn classify(response: &ResponseHead, request_method: &Method) -> ResponseKind {
    match response.status {
        StatusCode::CONTINUE => ResponseKind::Continue,
        StatusCode::SWITCHING_PROTOCOLS => ResponseKind::UpgradeClient,
        status if status.is_informational() => ResponseKind::Information,
        status if status.is_success() && *request_method == Method::CONNECT => ResponseKind::Connect,
        _ => ResponseKind::Response,
    }
}

/// How the response direction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResponseOutcome {
    /// A final response was relayed in full. `keep_alive` says whether both
    /// connections can carry another transaction.
    Complete { keep_alive: bool },
    /// The origin switched protocols and the raw relay ran until it closed.
    Upgraded,
}

/// Relay response heads and bodies from `origin` to `client` until the final
/// response (or an upgraded stream) has been delivered.
///
/// `upgrade` is resolved as soon as the final head is known: `true` when the
/// origin switched protocols, `false` otherwise.
pub(crate) async fn relay_responses<R, W>(
    events: &EventBus,
    hooks: &ProxyHooks,
    request: &Arc<RequestHead>,
    origin: &mut FramedReader<R>,
    client: &mut W,
    mut upgrade: Option<oneshot::Sender<bool>>,
) -> Result<ResponseOutcome, ProxyError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + ?Sized,
{
    loop {
        origin.attach_mirror();
        let head = origin.read_response_head().await?;
        let kind = classify(&head, &request.method);
        let framing = match kind {
            ResponseKind::Continue | ResponseKind::Information => BodyFraming::Empty,
            ResponseKind::UpgradeClient | ResponseKind::Connect => BodyFraming::UntilClose,
            ResponseKind::Response => head.framing(&request.method)?,
        };
        let keep_alive = framing != BodyFraming::UntilClose
            && head.keep_alive()
            && request.keep_alive();

        tracing::debug!(
            status = head.status.as_u16(),
            kind = ?kind,
            framing = ?framing,
            "Response head"
        );

        let head = Arc::new(head);
        let transform = hooks.make_response_transform(&head, request);
        events.emit(&kind.into_event(Arc::clone(&head), Arc::clone(request)));

        if !matches!(kind, ResponseKind::Continue | ResponseKind::Information) {
            if let Some(tx) = upgrade.take() {
                let _ = tx.send(kind == ResponseKind::UpgradeClient);
            }
        }

        let tap = origin.pipe_mirror();
        let drain = async {
            let drained = origin.forward_body(framing).await;
            origin.unpipe_mirror();
            drained
        };
        let stage = transform::run_stage(tap, transform, client, Direction::Response);
        tokio::try_join!(drain, stage)?;

        match kind {
            ResponseKind::Continue | ResponseKind::Information => continue,
            ResponseKind::UpgradeClient | ResponseKind::Connect => {
                let _ = client.shutdown().await;
                return Ok(ResponseOutcome::Upgraded);
            }
            ResponseKind::Response => return Ok(ResponseOutcome::Complete { keep_alive }),
        }
    }
}
