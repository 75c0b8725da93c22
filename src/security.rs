//! TLS configuration
//!
//! Loads the certificate and key the listeners hand to their peer
//! transports. The core holds only paths; credential files for NLA are
//! consumed by the authentication layer and never parsed here.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rustls::{Certificate, PrivateKey, ServerConfig};
use tracing::{debug, info};

/// TLS configuration wrapper around the rustls server config.
#[derive(Clone, Debug)]
pub struct TlsConfig {
    server_config: Arc<ServerConfig>,
}

impl TlsConfig {
    /// Create a TLS config from PEM files.
    pub fn from_files(cert_path: &Path, key_path: &Path) -> Result<Self> {
        debug!("certificate: {}", cert_path.display());
        debug!("private key: {}", key_path.display());

        let cert_file = std::fs::File::open(cert_path).context("failed to open certificate file")?;
        let mut cert_reader = std::io::BufReader::new(cert_file);
        let certs = rustls_pemfile::certs(&mut cert_reader)
            .context("failed to parse certificate")?
            .into_iter()
            .map(Certificate)
            .collect::<Vec<_>>();

        if certs.is_empty() {
            anyhow::bail!("no certificates found in {}", cert_path.display());
        }

        let key_file = std::fs::File::open(key_path).context("failed to open private key file")?;
        let mut key_reader = std::io::BufReader::new(key_file);
        let keys = rustls_pemfile::pkcs8_private_keys(&mut key_reader)
            .context("failed to parse private key")?;

        let private_key = if let Some(key) = keys.into_iter().next() {
            PrivateKey(key)
        } else {
            // try RSA format
            let key_file = std::fs::File::open(key_path)?;
            let mut key_reader = std::io::BufReader::new(key_file);
            let rsa_keys = rustls_pemfile::rsa_private_keys(&mut key_reader)
                .context("failed to parse RSA private key")?;
            PrivateKey(
                rsa_keys
                    .into_iter()
                    .next()
                    .context("no private key found in file")?,
            )
        };

        let server_config = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(certs, private_key)
            .context("failed to configure certificate")?;

        info!("tls configuration loaded");

        Ok(Self {
            server_config: Arc::new(server_config),
        })
    }

    /// The rustls server config shared by the peer transports.
    pub fn server_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.server_config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_files_report_context() {
        let err = TlsConfig::from_files(
            Path::new("/nonexistent/server.crt"),
            Path::new("/nonexistent/server.key"),
        )
        .unwrap_err();
        assert!(err.to_string().contains("certificate"));
    }
}
