//! Gateway configuration: command-line flags, optionally layered on top of
//! a TOML config file. Explicit flags win over file values.

use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;

use crate::router::BackendEntry;
use crate::tls::{TlsSettings, TlsVersion};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config value: {0}")]
    Invalid(String),
}

/// Command-line interface of the gateway binary.
#[derive(Debug, Parser)]
#[command(name = "mysql-gateway", version, about = "MySQL cluster gateway")]
pub struct Cli {
    /// Listening address (default ":3306")
    #[arg(long, value_name = "HOST:PORT")]
    pub addr: Option<String>,

    /// Backend cluster registration, repeatable
    #[arg(long = "backend", value_name = "ID=ADDR")]
    pub backends: Vec<BackendEntry>,

    /// TLS CA file; becomes the trust root for optional client certificates
    #[arg(long = "tls-ca", value_name = "PATH")]
    pub tls_ca: Option<PathBuf>,

    /// TLS certificate file
    #[arg(long = "tls-cert", value_name = "PATH")]
    pub tls_cert: Option<PathBuf>,

    /// TLS private key file
    #[arg(long = "tls-key", value_name = "PATH")]
    pub tls_key: Option<PathBuf>,

    /// Minimum negotiated TLS version (TLSv1.0/TLSv1.1/TLSv1.2/TLSv1.3)
    #[arg(long = "tls-version", value_name = "VERSION")]
    pub tls_version: Option<TlsVersion>,

    /// Accept client-requested compression
    #[arg(long)]
    pub compress: bool,

    /// Clear the secure-connection capability in the forwarded handshake
    /// response
    #[arg(long = "backend-insecure-transport")]
    pub backend_insecure_transport: bool,

    /// Optional TOML config file; explicit flags override its values
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

/// Fully resolved gateway configuration.
#[derive(Debug, Default)]
pub struct GatewayConfig {
    pub addr: String,
    pub backends: Vec<BackendEntry>,
    pub tls: TlsSettings,
    pub compress: bool,
    pub backend_insecure_transport: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct FileConfig {
    addr: Option<String>,
    compress: Option<bool>,
    backend_insecure_transport: Option<bool>,
    tls: Option<FileTlsConfig>,
    #[serde(default, rename = "backend")]
    backends: Vec<FileBackend>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct FileTlsConfig {
    ca: Option<PathBuf>,
    cert: Option<PathBuf>,
    key: Option<PathBuf>,
    min_version: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct FileBackend {
    cluster_id: String,
    address: String,
}

impl Cli {
    /// Resolve the final configuration from the flags and the optional
    /// config file.
    pub fn into_config(self) -> Result<GatewayConfig, ConfigError> {
        let file = match &self.config {
            Some(path) => toml::from_str::<FileConfig>(&std::fs::read_to_string(path)?)?,
            None => FileConfig::default(),
        };
        self.merge(file)
    }

    fn merge(self, file: FileConfig) -> Result<GatewayConfig, ConfigError> {
        let file_tls = file.tls.unwrap_or_default();
        let file_min_version = file_tls
            .min_version
            .map(|v| v.parse::<TlsVersion>().map_err(ConfigError::Invalid))
            .transpose()?;

        let mut backends: Vec<BackendEntry> = file
            .backends
            .into_iter()
            .map(|b| BackendEntry {
                cluster_id: b.cluster_id,
                address: b.address,
            })
            .collect();
        backends.extend(self.backends);

        Ok(GatewayConfig {
            addr: normalize_addr(
                self.addr
                    .or(file.addr)
                    .unwrap_or_else(|| ":3306".to_string()),
            ),
            backends,
            tls: TlsSettings {
                ca: self.tls_ca.or(file_tls.ca),
                cert: self.tls_cert.or(file_tls.cert),
                key: self.tls_key.or(file_tls.key),
                min_version: self
                    .tls_version
                    .or(file_min_version)
                    .unwrap_or_default(),
            },
            compress: self.compress || file.compress.unwrap_or(false),
            backend_insecure_transport: self.backend_insecure_transport
                || file.backend_insecure_transport.unwrap_or(false),
        })
    }
}

/// Accept the `:port` shorthand for "all interfaces".
fn normalize_addr(addr: String) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr
    }
}
