//! TLS material loading and the acceptor/connector pair used for the two
//! in-band upgrades: server-side TLS toward clients, client-side TLS toward
//! backends.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream as ClientTlsStream;
use tokio_rustls::server::TlsStream as ServerTlsStream;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("invalid TLS configuration: {0}")]
    Config(String),

    #[error("failed to load certificates from {path}: {reason}")]
    CertLoad { path: PathBuf, reason: String },

    #[error("failed to load private key from {path}: {reason}")]
    KeyLoad { path: PathBuf, reason: String },

    #[error("TLS handshake failed: {0}")]
    Handshake(String),
}

/// Minimum negotiated TLS version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsVersion {
    Tls10,
    Tls11,
    #[default]
    Tls12,
    Tls13,
}

impl FromStr for TlsVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TLSv1.0" => Ok(TlsVersion::Tls10),
            "TLSv1.1" => Ok(TlsVersion::Tls11),
            "TLSv1.2" => Ok(TlsVersion::Tls12),
            "TLSv1.3" => Ok(TlsVersion::Tls13),
            _ => Err(format!(
                "unknown TLS version {s:?}, expected TLSv1.0/TLSv1.1/TLSv1.2/TLSv1.3"
            )),
        }
    }
}

/// TLS file material from the command line or config file. All-empty means
/// TLS is disabled and SSL is never offered to clients.
#[derive(Debug, Clone, Default)]
pub struct TlsSettings {
    pub ca: Option<PathBuf>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub min_version: TlsVersion,
}

impl TlsSettings {
    pub fn is_enabled(&self) -> bool {
        self.ca.is_some() || self.cert.is_some() || self.key.is_some()
    }
}

fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let file = File::open(path).map_err(|e| TlsError::CertLoad {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let mut reader = BufReader::new(file);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::CertLoad {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    if certs.is_empty() {
        return Err(TlsError::CertLoad {
            path: path.to_path_buf(),
            reason: "no certificates found in file".to_string(),
        });
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let file = File::open(path).map_err(|e| TlsError::KeyLoad {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TlsError::KeyLoad {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?
        .ok_or_else(|| TlsError::KeyLoad {
            path: path.to_path_buf(),
            reason: "no private key found in file".to_string(),
        })
}

static TLS12_AND_TLS13: &[&rustls::SupportedProtocolVersion] =
    &[&rustls::version::TLS12, &rustls::version::TLS13];
static TLS13_ONLY: &[&rustls::SupportedProtocolVersion] = &[&rustls::version::TLS13];

fn protocol_versions(min: TlsVersion) -> &'static [&'static rustls::SupportedProtocolVersion] {
    match min {
        TlsVersion::Tls10 | TlsVersion::Tls11 => {
            warn!("rustls does not support TLS 1.0/1.1, using TLSv1.2 as the minimum");
            TLS12_AND_TLS13
        }
        TlsVersion::Tls12 => TLS12_AND_TLS13,
        TlsVersion::Tls13 => TLS13_ONLY,
    }
}

/// Server-side TLS for upgrading client connections after an SSLRequest.
#[derive(Clone)]
pub struct TlsAcceptor {
    inner: tokio_rustls::TlsAcceptor,
}

impl TlsAcceptor {
    /// Build an acceptor from the configured material, or `None` when TLS
    /// is disabled. A configured CA becomes the trust root for optional
    /// client certificates.
    pub fn from_settings(settings: &TlsSettings) -> Result<Option<Self>, TlsError> {
        if !settings.is_enabled() {
            return Ok(None);
        }

        let (Some(cert_path), Some(key_path)) = (&settings.cert, &settings.key) else {
            return Err(TlsError::Config(
                "TLS requires both --tls-cert and --tls-key".to_string(),
            ));
        };

        let certs = load_certificates(cert_path)?;
        let key = load_private_key(key_path)?;
        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let builder = ServerConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(protocol_versions(settings.min_version))
            .map_err(|e| TlsError::Config(format!("failed to set protocol versions: {e}")))?;

        let builder = match &settings.ca {
            Some(ca_path) => {
                let mut roots = RootCertStore::empty();
                for cert in load_certificates(ca_path)? {
                    roots.add(cert).map_err(|e| TlsError::CertLoad {
                        path: ca_path.clone(),
                        reason: e.to_string(),
                    })?;
                }
                let verifier = WebPkiClientVerifier::builder_with_provider(
                    Arc::new(roots),
                    provider,
                )
                .allow_unauthenticated()
                .build()
                .map_err(|e| TlsError::Config(format!("failed to build client verifier: {e}")))?;
                builder.with_client_cert_verifier(verifier)
            }
            None => builder.with_no_client_auth(),
        };

        let config = builder
            .with_single_cert(certs, key)
            .map_err(|e| TlsError::Config(format!("failed to build TLS config: {e}")))?;

        Ok(Some(Self {
            inner: tokio_rustls::TlsAcceptor::from(Arc::new(config)),
        }))
    }

    pub async fn accept(&self, stream: TcpStream) -> Result<ServerTlsStream<TcpStream>, TlsError> {
        self.inner
            .accept(stream)
            .await
            .map_err(|e| TlsError::Handshake(e.to_string()))
    }
}

/// Client-side TLS for the backend leg. Certificate verification is skipped:
/// the backend address comes from the operator's own directory, not from the
/// network.
#[derive(Clone)]
pub struct TlsConnector {
    inner: tokio_rustls::TlsConnector,
}

impl TlsConnector {
    pub fn new_insecure() -> Result<Self, TlsError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| TlsError::Config(format!("failed to set protocol versions: {e}")))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoCertificateVerification))
            .with_no_client_auth();

        Ok(Self {
            inner: tokio_rustls::TlsConnector::from(Arc::new(config)),
        })
    }

    pub async fn connect(
        &self,
        stream: TcpStream,
        server_name: &str,
    ) -> Result<ClientTlsStream<TcpStream>, TlsError> {
        let server_name = ServerName::try_from(server_name.to_string())
            .map_err(|_| TlsError::Config(format!("invalid server name: {server_name}")))?;
        self.inner
            .connect(server_name, stream)
            .await
            .map_err(|e| TlsError::Handshake(e.to_string()))
    }
}

/// Accepts any backend certificate.
#[derive(Debug)]
struct NoCertificateVerification;

impl rustls::client::danger::ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}
