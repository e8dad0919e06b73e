//! Client TLS configuration for edge connections.
//!
//! The RPC port requires a client certificate signed by the tunnel CA.
//! Session caching, tickets, and renegotiation are all disabled: every
//! reconnect performs a fresh handshake, so an edge restart can never
//! leave the client holding a stale session.

use std::fs;
use std::io::BufReader;
use std::path::Path;

use rustls::client::Resumption;
use rustls::RootCertStore;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tracing::info;

use crate::config::ClientConfig;

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("no certificates found in {0}")]
    EmptyCerts(String),
    #[error("no private key found in {0}")]
    NoKey(String),
    #[error("tls: {0}")]
    Rustls(#[from] rustls::Error),
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let file = fs::File::open(path).map_err(|e| TlsError::Read {
        path: path.display().to_string(),
        source: e,
    })?;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
    if certs.is_empty() {
        return Err(TlsError::EmptyCerts(path.display().to_string()));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let file = fs::File::open(path).map_err(|e| TlsError::Read {
        path: path.display().to_string(),
        source: e,
    })?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| TlsError::Read {
            path: path.display().to_string(),
            source: e,
        })?
        .ok_or_else(|| TlsError::NoKey(path.display().to_string()))
}

/// Build the rustls client config from the security section.
///
/// Falls back to the webpki system roots when no CA is configured, and to
/// no client auth when no client certificate pair is configured (the raw
/// port and test setups accept that).
pub fn build_client_tls(config: &ClientConfig) -> Result<rustls::ClientConfig, TlsError> {
    let roots = match &config.ca_cert {
        Some(path) => {
            let mut roots = RootCertStore::empty();
            for cert in load_certs(path)? {
                roots.add(cert)?;
            }
            info!(ca = %path.display(), "using configured tunnel CA");
            roots
        }
        None => RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    };

    let builder = rustls::ClientConfig::builder().with_root_certificates(roots);

    let mut tls = match (&config.client_cert, &config.client_key) {
        (Some(cert_path), Some(key_path)) => {
            let certs = load_certs(cert_path)?;
            let key = load_key(key_path)?;
            info!(cert = %cert_path.display(), "client certificate loaded");
            builder.with_client_auth_cert(certs, key)?
        }
        _ => builder.with_no_client_auth(),
    };

    // fresh handshake on every reconnect
    tls.resumption = Resumption::disabled();
    tls.enable_sni = true;

    Ok(tls)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClientArgs, ClientConfig};

    fn config_with_security(
        ca: Option<&str>,
        cert: Option<&str>,
        key: Option<&str>,
    ) -> ClientConfig {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let home = std::env::temp_dir().join(format!("giraffecloud-tls-{}", std::process::id()));
        std::fs::create_dir_all(&home).unwrap();
        crate::config::ConfigFile {
            token: Some("tok".into()),
            local_port: Some(8080),
            security: crate::config::SecuritySection {
                ca_cert: ca.map(String::from),
                client_cert: cert.map(String::from),
                client_key: key.map(String::from),
            },
            ..Default::default()
        }
        .save(&home.join("config.json"))
        .unwrap();
        ClientConfig::resolve(&ClientArgs {
            home: Some(home),
            log_level: "info".into(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_system_roots_without_ca() {
        let config = config_with_security(None, None, None);
        let tls = build_client_tls(&config).unwrap();
        // resumption disabled: no session storage side effects to assert
        // directly, so just confirm construction succeeds
        assert!(tls.enable_sni);
    }

    #[test]
    fn test_missing_ca_file_errors() {
        let config = config_with_security(Some("/nonexistent/ca.pem"), None, None);
        assert!(matches!(
            build_client_tls(&config),
            Err(TlsError::Read { .. })
        ));
    }
}
