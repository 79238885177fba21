//! TLS configuration for `run_tls`.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use crate::error::{Error, Result};

/// Builds a TLS acceptor from PEM encoded certificate chain and private key files.
pub fn acceptor(cert_file: impl AsRef<Path>, key_file: impl AsRef<Path>) -> Result<TlsAcceptor> {
    Ok(TlsAcceptor::from(Arc::new(server_config(
        cert_file, key_file,
    )?)))
}

/// Builds a server configuration without client authentication.
pub fn server_config(
    cert_file: impl AsRef<Path>,
    key_file: impl AsRef<Path>,
) -> Result<ServerConfig> {
    // Another provider may already be installed, that one wins.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let certs = load_certs(cert_file.as_ref())?;
    let key = load_key(key_file.as_ref())?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    debug!(
        cert = %cert_file.as_ref().display(),
        "tls server configuration loaded"
    );
    Ok(config)
}

/// Reads every certificate from a PEM file.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Certificate(format!("{}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(Error::Certificate(format!(
            "{}: no certificate found",
            path.display()
        )));
    }
    Ok(certs)
}

/// Reads the first private key (PKCS#8, PKCS#1 or SEC1) from a PEM file.
pub fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| Error::Certificate(format!("{}: {e}", path.display())))?
        .ok_or_else(|| Error::Certificate(format!("{}: no private key found", path.display())))
}

fn open(path: &Path) -> Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| Error::Certificate(format!("{}: {e}", path.display())))
}
