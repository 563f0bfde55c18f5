//! TLS configuration.
//!
//! Loads the PEM certificate and key used for `wss://`. When either file is
//! missing a self-signed pair is generated and written in their place, so a
//! fresh checkout can serve a browser client after accepting the warning.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use rustls::ServerConfig;

use crate::error::ServerError;

/// ALPN protocol for WebSocket over TLS.
const ALPN_PROTOCOL: &[u8] = b"http/1.1";

/// Where TLS material lives and what a generated certificate should cover.
#[derive(Debug, Clone)]
pub struct TlsSettings {
    /// PEM certificate chain
    pub cert_path: PathBuf,
    /// PEM private key
    pub key_path: PathBuf,
    /// Subject alternative names for a generated certificate
    pub subject_names: Vec<String>,
}

impl TlsSettings {
    /// Settings for the given files, with `localhost` as the only generated
    /// subject.
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
            subject_names: vec!["localhost".to_string()],
        }
    }

    /// Build the rustls server configuration, generating the files first if
    /// either is missing.
    pub fn server_config(&self) -> Result<Arc<ServerConfig>, ServerError> {
        if !self.cert_path.exists() || !self.key_path.exists() {
            self.write_self_signed()?;
        }
        load_tls_config(&self.cert_path, &self.key_path).map(Arc::new)
    }

    fn write_self_signed(&self) -> Result<(), ServerError> {
        let cert = rcgen::generate_simple_self_signed(self.subject_names.clone())
            .map_err(|e| ServerError::Config(format!("failed to generate self-signed cert: {e}")))?;

        fs::write(&self.cert_path, cert.cert.pem()).map_err(|e| {
            ServerError::Config(format!("failed to write cert '{}': {e}", self.cert_path.display()))
        })?;
        fs::write(&self.key_path, cert.key_pair.serialize_pem()).map_err(|e| {
            ServerError::Config(format!("failed to write key '{}': {e}", self.key_path.display()))
        })?;

        tracing::warn!(
            cert = %self.cert_path.display(),
            key = %self.key_path.display(),
            "Generated self-signed certificate - not for production use!"
        );
        Ok(())
    }
}

fn load_tls_config(cert_path: &Path, key_path: &Path) -> Result<ServerConfig, ServerError> {
    let cert_pem = fs::read(cert_path).map_err(|e| {
        ServerError::Config(format!("failed to read cert '{}': {e}", cert_path.display()))
    })?;

    let key_pem = fs::read(key_path).map_err(|e| {
        ServerError::Config(format!("failed to read key '{}': {e}", key_path.display()))
    })?;

    let certs = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ServerError::Config(format!("failed to parse certificates: {e}")))?;

    if certs.is_empty() {
        return Err(ServerError::Config(format!(
            "no certificate found in '{}'",
            cert_path.display()
        )));
    }

    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| ServerError::Config(format!("failed to parse private key: {e}")))?
        .ok_or_else(|| ServerError::Config("no private key found".to_string()))?;

    let mut tls_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ServerError::Config(format!("invalid TLS config: {e}")))?;

    tls_config.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

    Ok(tls_config)
}
