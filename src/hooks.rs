//! Caller-supplied per-transaction behaviour.
//!
//! Hooks are typed closures. Transform factories run synchronously when a
//! head is parsed; option hooks may be synchronous or return a future.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{self, BoxFuture};
use futures_util::FutureExt;

use crate::error::ProxyError;
use crate::http::{RequestHead, ResponseHead};
use crate::net::tls::{self, TlsIdentity};
use crate::transform::{BoxTransform, Identity, Transform};

/// Client-facing TLS settings for an intercepted CONNECT tunnel.
#[derive(Debug, Clone, Default)]
pub struct ClientTlsOptions {
    /// Certificate and key presented to the client.
    pub identity: Option<TlsIdentity>,
    /// Complete rustls config; takes precedence over `identity`.
    pub server_config: Option<Arc<rustls::ServerConfig>>,
}

impl ClientTlsOptions {
    pub fn with_identity(identity: TlsIdentity) -> Self {
        Self {
            identity: Some(identity),
            server_config: None,
        }
    }

    /// Resolve to a rustls config, falling back to `default` when neither an
    /// identity nor a config was supplied.
    pub(crate) fn into_server_config(
        self,
        default: &Arc<rustls::ServerConfig>,
    ) -> Result<Arc<rustls::ServerConfig>, ProxyError> {
        match (self.server_config, self.identity) {
            (Some(config), _) => Ok(config),
            (None, Some(identity)) => tls::server_config(&identity),
            (None, None) => Ok(Arc::clone(default)),
        }
    }
}

/// Origin-facing overrides applied before the pool key is computed.
#[derive(Debug, Clone, Default)]
pub struct ServerOptions {
    pub host: Option<String>,
    pub port: Option<u16>,
    /// SNI and verification name; defaults to the destination host.
    pub server_name: Option<String>,
    /// Skip origin certificate verification.
    pub accept_invalid_certs: bool,
    /// Overrides `timeouts.connect_secs` for this destination.
    pub connect_timeout: Option<Duration>,
}

type RequestTransformFn = dyn Fn(&RequestHead) -> BoxTransform + Send + Sync;
type ResponseTransformFn = dyn Fn(&ResponseHead, &RequestHead) -> BoxTransform + Send + Sync;
type ClientOptionsFn =
    dyn Fn(&RequestHead) -> BoxFuture<'static, Result<ClientTlsOptions, ProxyError>> + Send + Sync;
type ServerOptionsFn =
    dyn Fn(&RequestHead) -> BoxFuture<'static, Result<ServerOptions, ProxyError>> + Send + Sync;

/// Per-transaction hooks. Every hook is optional; defaults are identity
/// transforms, the built-in identity and no server overrides.
///
/// ```no_run
/// use intercept_proxy::hooks::ProxyHooks;
/// use intercept_proxy::transform::Replace;
///
/// let hooks = ProxyHooks::new()
///     .response_transform(|_res, _req| Replace::new("Hello world", "HELLO WORLD"));
/// ```
#[derive(Clone)]
pub struct ProxyHooks {
    request_transform: Arc<RequestTransformFn>,
    response_transform: Arc<ResponseTransformFn>,
    client_options: Arc<ClientOptionsFn>,
    server_options: Arc<ServerOptionsFn>,
}

impl Default for ProxyHooks {
    fn default() -> Self {
        Self {
            request_transform: Arc::new(|_: &RequestHead| -> BoxTransform { Box::new(Identity) }),
            response_transform: Arc::new(|_: &ResponseHead, _: &RequestHead| -> BoxTransform {
                Box::new(Identity)
            }),
            client_options: Arc::new(|_: &RequestHead| {
                future::ready(Ok::<_, ProxyError>(ClientTlsOptions::default())).boxed()
            }),
            server_options: Arc::new(|_: &RequestHead| {
                future::ready(Ok::<_, ProxyError>(ServerOptions::default())).boxed()
            }),
        }
    }
}

impl ProxyHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_transform<F, T>(mut self, factory: F) -> Self
    where
        F: Fn(&RequestHead) -> T + Send + Sync + 'static,
        T: Transform + 'static,
    {
        self.request_transform =
            Arc::new(move |request: &RequestHead| -> BoxTransform { Box::new(factory(request)) });
        self
    }

    pub fn response_transform<F, T>(mut self, factory: F) -> Self
    where
        F: Fn(&ResponseHead, &RequestHead) -> T + Send + Sync + 'static,
        T: Transform + 'static,
    {
        self.response_transform = Arc::new(
            move |response: &ResponseHead, request: &RequestHead| -> BoxTransform {
                Box::new(factory(response, request))
            },
        );
        self
    }

    pub fn client_options<F>(mut self, hook: F) -> Self
    where
        F: Fn(&RequestHead) -> ClientTlsOptions + Send + Sync + 'static,
    {
        self.client_options = Arc::new(move |request: &RequestHead| {
            future::ready(Ok::<_, ProxyError>(hook(request))).boxed()
        });
        self
    }

    /// Asynchronous variant; the future must own what it needs from the head.
    pub fn client_options_async<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(&RequestHead) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ClientTlsOptions, ProxyError>> + Send + 'static,
    {
        self.client_options = Arc::new(move |request: &RequestHead| hook(request).boxed());
        self
    }

    pub fn server_options<F>(mut self, hook: F) -> Self
    where
        F: Fn(&RequestHead) -> ServerOptions + Send + Sync + 'static,
    {
        self.server_options = Arc::new(move |request: &RequestHead| {
            future::ready(Ok::<_, ProxyError>(hook(request))).boxed()
        });
        self
    }

    /// Asynchronous variant; the future must own what it needs from the head.
    pub fn server_options_async<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(&RequestHead) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ServerOptions, ProxyError>> + Send + 'static,
    {
        self.server_options = Arc::new(move |request: &RequestHead| hook(request).boxed());
        self
    }

    pub(crate) fn make_request_transform(&self, request: &RequestHead) -> BoxTransform {
        (self.request_transform)(request)
    }

    pub(crate) fn make_response_transform(
        &self,
        response: &ResponseHead,
        request: &RequestHead,
    ) -> BoxTransform {
        (self.response_transform)(response, request)
    }

    pub(crate) async fn resolve_client_options(
        &self,
        request: &RequestHead,
    ) -> Result<ClientTlsOptions, ProxyError> {
        (self.client_options)(request).await
    }

    pub(crate) async fn resolve_server_options(
        &self,
        request: &RequestHead,
    ) -> Result<ServerOptions, ProxyError> {
        (self.server_options)(request).await
    }
}

impl std::fmt::Debug for ProxyHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyHooks").finish_non_exhaustive()
    }
}
