//! TLS endpoints.
//!
//! # Responsibilities
//! - Hold the client-facing identity (built-in localhost pair or PEM files)
//! - Build rustls server configs for intercepted CONNECT tunnels
//! - Build rustls client configs for TLS origins (verified or permissive)
//! - Run handshakes under a deadline

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::{client, server, TlsAcceptor, TlsConnector};

use crate::error::{ProxyError, Side};

/// Self-signed certificate for localhost, 127.0.0.1 and ::1.
const LOCALHOST_CERT: &[u8] = include_bytes!("identity/localhost.cert.pem");
const LOCALHOST_KEY: &[u8] = include_bytes!("identity/localhost.key.pem");

/// The only application protocol the engine speaks on either side.
const HTTP_11: &[u8] = b"http/1.1";

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Certificate chain plus private key.
#[derive(Debug)]
pub struct TlsIdentity {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl Clone for TlsIdentity {
    fn clone(&self) -> Self {
        Self {
            cert_chain: self.cert_chain.clone(),
            key: self.key.clone_key(),
        }
    }
}

impl TlsIdentity {
    /// Built-in self-signed localhost identity.
    pub fn localhost() -> Result<Self, ProxyError> {
        Self::from_pem(LOCALHOST_CERT, LOCALHOST_KEY)
    }

    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self, ProxyError> {
        let cert_chain = rustls_pemfile::certs(&mut &cert_pem[..])
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ProxyError::Tls(format!("unreadable certificate PEM: {e}")))?;
        if cert_chain.is_empty() {
            return Err(ProxyError::Tls("no certificate found in PEM".to_string()));
        }
        let key = rustls_pemfile::private_key(&mut &key_pem[..])
            .map_err(|e| ProxyError::Tls(format!("unreadable key PEM: {e}")))?
            .ok_or_else(|| ProxyError::Tls("no private key found in PEM".to_string()))?;
        Ok(Self { cert_chain, key })
    }

    /// Load from certificate and key files.
    pub fn from_pem_files(cert_path: &Path, key_path: &Path) -> Result<Self, ProxyError> {
        if !cert_path.exists() {
            return Err(ProxyError::Tls(format!(
                "Certificate file not found: {:?}",
                cert_path
            )));
        }
        if !key_path.exists() {
            return Err(ProxyError::Tls(format!(
                "Private key file not found: {:?}",
                key_path
            )));
        }
        let cert_pem = std::fs::read(cert_path)
            .map_err(|e| ProxyError::Tls(format!("reading {:?}: {e}", cert_path)))?;
        let key_pem = std::fs::read(key_path)
            .map_err(|e| ProxyError::Tls(format!("reading {:?}: {e}", key_path)))?;
        Self::from_pem(&cert_pem, &key_pem)
    }
}

/// Server-side config presenting `identity` without requesting client
/// certificates.
pub fn server_config(identity: &TlsIdentity) -> Result<Arc<ServerConfig>, ProxyError> {
    let identity = identity.clone();
    let mut config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| ProxyError::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(identity.cert_chain, identity.key)
        .map_err(|e| ProxyError::Tls(format!("Failed to build TLS config: {e}")))?;
    config.alpn_protocols = vec![HTTP_11.to_vec()];
    Ok(Arc::new(config))
}

/// Client configs for origin connections, built once per pool.
#[derive(Debug, Clone)]
pub struct TlsConnectors {
    verified: Arc<ClientConfig>,
    permissive: Arc<ClientConfig>,
}

impl TlsConnectors {
    pub fn new() -> Result<Self, ProxyError> {
        let roots: RootCertStore = webpki_roots::TLS_SERVER_ROOTS.iter().cloned().collect();
        let mut verified = ClientConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .map_err(|e| ProxyError::Tls(e.to_string()))?
            .with_root_certificates(roots)
            .with_no_client_auth();
        verified.alpn_protocols = vec![HTTP_11.to_vec()];

        let mut permissive = ClientConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .map_err(|e| ProxyError::Tls(e.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert::new()))
            .with_no_client_auth();
        permissive.alpn_protocols = vec![HTTP_11.to_vec()];

        Ok(Self {
            verified: Arc::new(verified),
            permissive: Arc::new(permissive),
        })
    }

    pub fn config(&self, accept_invalid_certs: bool) -> Arc<ClientConfig> {
        if accept_invalid_certs {
            Arc::clone(&self.permissive)
        } else {
            Arc::clone(&self.verified)
        }
    }
}

/// Terminate TLS on a client-facing stream.
pub async fn accept<IO>(
    config: Arc<ServerConfig>,
    io: IO,
    deadline: Duration,
) -> Result<server::TlsStream<IO>, ProxyError>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let acceptor = TlsAcceptor::from(config);
    match tokio::time::timeout(deadline, acceptor.accept(io)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(ProxyError::TlsHandshake {
            side: Side::Inbound,
            source,
        }),
        Err(_) => Err(ProxyError::TlsHandshake {
            side: Side::Inbound,
            source: io::Error::new(io::ErrorKind::TimedOut, "client handshake timed out"),
        }),
    }
}

/// Open TLS towards an origin.
pub async fn connect<IO>(
    config: Arc<ClientConfig>,
    server_name: &str,
    io: IO,
    deadline: Duration,
) -> Result<client::TlsStream<IO>, ProxyError>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let name = ServerName::try_from(server_name.to_string()).map_err(|e| {
        ProxyError::TlsHandshake {
            side: Side::Outbound,
            source: io::Error::new(io::ErrorKind::InvalidInput, e),
        }
    })?;
    let connector = TlsConnector::from(config);
    match tokio::time::timeout(deadline, connector.connect(name, io)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(ProxyError::TlsHandshake {
            side: Side::Outbound,
            source,
        }),
        Err(_) => Err(ProxyError::TlsHandshake {
            side: Side::Outbound,
            source: io::Error::new(io::ErrorKind::TimedOut, "origin handshake timed out"),
        }),
    }
}

/// Verifier that accepts any origin certificate while still checking
/// handshake signatures.
#[derive(Debug)]
pub struct AcceptAnyCert {
    provider: Arc<CryptoProvider>,
}

impl AcceptAnyCert {
    pub fn new() -> Self {
        Self {
            provider: provider(),
        }
    }
}

impl Default for AcceptAnyCert {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
