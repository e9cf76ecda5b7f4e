// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! TLS termination for the webhook listener.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use crate::errors::ConfigError;

/// Builds an acceptor from a PEM certificate chain and a PEM private key (PKCS#8, PKCS#1 or
/// SEC1).
pub fn load_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, ConfigError> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    let mut config =
        ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .and_then(|builder| builder.with_no_client_auth().with_single_cert(certs, key))
            .map_err(|e| tls_error(cert_path, e))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    debug!(
        "Loaded TLS certificate {} and key {}",
        cert_path.display(),
        key_path.display()
    );
    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
    let mut reader = BufReader::new(File::open(path).map_err(|e| tls_error(path, e))?);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| tls_error(path, e))?;
    if certs.is_empty() {
        return Err(tls_error(path, "no certificate found"));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, ConfigError> {
    let mut reader = BufReader::new(File::open(path).map_err(|e| tls_error(path, e))?);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| tls_error(path, e))?
        .ok_or_else(|| tls_error(path, "no private key found"))
}

fn tls_error(path: &Path, reason: impl std::fmt::Display) -> ConfigError {
    ConfigError::Tls {
        path: path.display().to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::path::PathBuf;

    pub fn cert_path() -> PathBuf {
        PathBuf::from(concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/cert.pem"))
    }

    pub fn key_path() -> PathBuf {
        PathBuf::from(concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/key.pem"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_acceptor_from_pem_files() {
        assert!(load_acceptor(&fixtures::cert_path(), &fixtures::key_path()).is_ok());
    }

    #[test]
    fn test_swapped_files_are_rejected() {
        let err = load_acceptor(&fixtures::key_path(), &fixtures::cert_path()).err().unwrap();
        assert!(matches!(err, ConfigError::Tls { .. }));
        assert!(err.to_string().contains("no certificate found"));
    }

    #[test]
    fn test_missing_file_is_rejected() {
        let err = load_acceptor(Path::new("/nonexistent/cert.pem"), &fixtures::key_path())
            .err().unwrap();
        assert!(err
            .to_string()
            .starts_with("Unable to load TLS material from /nonexistent/cert.pem"));
    }
}
