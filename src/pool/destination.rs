//! Destination resolution.
//!
//! Maps a parsed request onto the (host, port, scheme) triple it is sent to,
//! and that triple plus the origin TLS profile onto the outbound pool key.

use url::{Host, Url};

use crate::error::ProxyError;
use crate::hooks::ServerOptions;
use crate::http::RequestHead;

/// Transport towards the origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Plain,
    Tls,
}

impl Scheme {
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Plain => 80,
            Scheme::Tls => 443,
        }
    }
}

impl std::fmt::Display for Scheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scheme::Plain => f.write_str("http"),
            Scheme::Tls => f.write_str("https"),
        }
    }
}

/// Where a request goes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub host: String,
    pub port: u16,
    pub scheme: Scheme,
}

impl Destination {
    pub fn new(host: impl Into<String>, port: u16, scheme: Scheme) -> Self {
        Self {
            host: host.into(),
            port,
            scheme,
        }
    }

    /// `host:port`, with IPv6 literals bracketed.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Apply host/port overrides from the `server_options` hook.
    pub fn with_overrides(mut self, options: &ServerOptions) -> Self {
        if let Some(host) = &options.host {
            self.host = host.clone();
        }
        if let Some(port) = options.port {
            self.port = port;
        }
        self
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}", self.scheme, self.authority())
    }
}

/// How a TLS connection to the origin was set up.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TlsProfile {
    /// SNI and certificate verification name.
    pub server_name: String,
    /// Whether the origin certificate was verified.
    pub verify: bool,
}

/// Key of the idle pool. Connections opened under one TLS profile are never
/// handed to a request that asks for another.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub destination: Destination,
    /// `None` for plain-text destinations.
    pub tls: Option<TlsProfile>,
}

impl PoolKey {
    pub fn new(destination: &Destination, options: &ServerOptions) -> Self {
        let tls = match destination.scheme {
            Scheme::Plain => None,
            Scheme::Tls => Some(TlsProfile {
                server_name: options
                    .server_name
                    .clone()
                    .unwrap_or_else(|| destination.host.clone()),
                verify: !options.accept_invalid_certs,
            }),
        };
        Self {
            destination: destination.clone(),
            tls,
        }
    }
}

impl std::fmt::Display for PoolKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.tls {
            None => write!(f, "{}", self.destination),
            Some(profile) if profile.verify => {
                write!(f, "{} (sni {})", self.destination, profile.server_name)
            }
            Some(profile) => write!(
                f,
                "{} (sni {}, unverified)",
                self.destination, profile.server_name
            ),
        }
    }
}

/// Resolve the destination of `request`.
///
/// CONNECT and origin-form targets use the Host header (or the target) as an
/// authority; their scheme is TLS for CONNECT or when the request arrived over
/// a decrypted tunnel. Absolute-form targets carry their own scheme.
pub fn resolve(request: &RequestHead, inbound_tls: bool) -> Result<Destination, ProxyError> {
    if request.is_connect() || request.is_relative() {
        let authority = request.host().unwrap_or(request.target.as_str());
        let scheme = if request.is_connect() || inbound_tls {
            Scheme::Tls
        } else {
            Scheme::Plain
        };
        // A throwaway non-special scheme lets the URL parser split the
        // authority without imposing http defaults.
        let url = Url::parse(&format!("unknown://{authority}"))
            .map_err(|e| ProxyError::Protocol(format!("invalid authority {authority:?}: {e}")))?;
        let host = host_of(&url)
            .ok_or_else(|| ProxyError::Protocol(format!("no host in {authority:?}")))?;
        let port = url.port().unwrap_or_else(|| scheme.default_port());
        return Ok(Destination::new(host, port, scheme));
    }

    let url = Url::parse(&request.target)
        .map_err(|e| ProxyError::Protocol(format!("invalid target {:?}: {e}", request.target)))?;
    let scheme = match url.scheme() {
        "https" | "wss" => Scheme::Tls,
        _ => Scheme::Plain,
    };
    let host = host_of(&url)
        .ok_or_else(|| ProxyError::Protocol(format!("no host in {:?}", request.target)))?;
    let port = url.port().unwrap_or_else(|| scheme.default_port());
    Ok(Destination::new(host, port, scheme))
}

fn host_of(url: &Url) -> Option<String> {
    match url.host()? {
        Host::Domain(domain) if domain.is_empty() => None,
        Host::Domain(domain) => Some(domain.to_ascii_lowercase()),
        Host::Ipv4(addr) => Some(addr.to_string()),
        Host::Ipv6(addr) => Some(addr.to_string()),
    }
}
