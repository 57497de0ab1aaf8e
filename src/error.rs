//! Error taxonomy for the proxy engine.
//!
//! Errors are scoped to one connection or transaction and surface as
//! [`ProxyEvent::Error`](crate::events::ProxyEvent::Error); they never cross
//! transaction boundaries.

use std::io;

use crate::config::loader::ConfigError;

/// Which side of the proxy a transport fault happened on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Client-facing connection.
    Inbound,
    /// Origin-facing connection.
    Outbound,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Inbound => f.write_str("inbound"),
            Side::Outbound => f.write_str("outbound"),
        }
    }
}

/// Direction a transform was running in when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Request,
    Response,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Request => f.write_str("request"),
            Direction::Response => f.write_str("response"),
        }
    }
}

/// Error raised by a caller-supplied transform.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct TransformError {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl TransformError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Top-level error type for the proxy engine.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Transport reset, refused, timed out or closed mid-message.
    #[error("{side} connection error: {source}")]
    Connection {
        side: Side,
        #[source]
        source: io::Error,
    },

    /// Client- or server-facing TLS handshake failed.
    #[error("{side} TLS handshake failed: {source}")]
    TlsHandshake {
        side: Side,
        #[source]
        source: io::Error,
    },

    /// A caller transform failed while processing one direction.
    #[error("{direction} transform failed: {source}")]
    Transform {
        direction: Direction,
        #[source]
        source: TransformError,
    },

    /// Malformed HTTP message head or unresolvable destination.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Invalid TLS identity or configuration.
    #[error("TLS configuration error: {0}")]
    Tls(String),

    /// A caller option hook failed.
    #[error("hook failed: {0}")]
    Hook(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The proxy was closed and accepts no new listeners.
    #[error("proxy is closed")]
    Closed,
}

impl ProxyError {
    pub fn inbound(source: io::Error) -> Self {
        ProxyError::Connection {
            side: Side::Inbound,
            source,
        }
    }

    pub fn outbound(source: io::Error) -> Self {
        ProxyError::Connection {
            side: Side::Outbound,
            source,
        }
    }

    pub fn connection(side: Side, source: io::Error) -> Self {
        ProxyError::Connection { side, source }
    }

    /// The connection side this error is attributable to, if any.
    pub fn side(&self) -> Option<Side> {
        match self {
            ProxyError::Connection { side, .. } | ProxyError::TlsHandshake { side, .. } => {
                Some(*side)
            }
            _ => None,
        }
    }

    /// Short label used for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::Connection { .. } => "connection",
            ProxyError::TlsHandshake { .. } => "tls_handshake",
            ProxyError::Transform { .. } => "transform",
            ProxyError::Protocol(_) => "protocol",
            ProxyError::Tls(_) => "tls",
            ProxyError::Hook(_) => "hook",
            ProxyError::Config(_) => "config",
            ProxyError::Closed => "closed",
        }
    }
}

pub type Result<T, E = ProxyError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_error_reports_side() {
        let err = ProxyError::outbound(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        assert_eq!(err.side(), Some(Side::Outbound));
        assert_eq!(err.kind(), "connection");
        assert_eq!(err.to_string(), "outbound connection error: refused");
    }

    #[test]
    fn transform_error_display() {
        let err = ProxyError::Transform {
            direction: Direction::Response,
            source: TransformError::new("bad chunk"),
        };
        assert_eq!(err.side(), None);
        assert_eq!(err.to_string(), "response transform failed: bad chunk");
    }
}
