//! TLS acceptors for the two tunnel ports.
//!
//! Port A (RPC) requires a client certificate signed by the tunnel CA.
//! Port B (raw) authenticates the server only; end users are authenticated
//! by the upstream proxy.

use std::fs;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rcgen::{CertificateParams, KeyPair};
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use sha2::{Digest, Sha256};
use tokio_rustls::TlsAcceptor;
use tracing::info;

fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = fs::File::open(path)
        .map_err(|e| anyhow::anyhow!("failed to open {}: {}", path.display(), e))?;
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut BufReader::new(file)).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        anyhow::bail!("no certificates found in {}", path.display());
    }
    Ok(certs)
}

fn load_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file = fs::File::open(path)
        .map_err(|e| anyhow::anyhow!("failed to open {}: {}", path.display(), e))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))?
        .ok_or_else(|| anyhow::anyhow!("no private key found in {}", path.display()))
}

/// Acceptor for the RPC port: mutual TLS against the tunnel CA.
pub fn build_rpc_acceptor(
    cert_path: &Path,
    key_path: &Path,
    client_ca_path: &Path,
) -> anyhow::Result<TlsAcceptor> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    let mut roots = RootCertStore::empty();
    for ca in load_certs(client_ca_path)? {
        roots.add(ca)?;
    }
    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| anyhow::anyhow!("client verifier: {}", e))?;

    let config = rustls::ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Acceptor for the raw port: server authentication only.
pub fn build_raw_acceptor(cert_path: &Path, key_path: &Path) -> anyhow::Result<TlsAcceptor> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Generate a self-signed certificate pair if the files do not exist.
///
/// Development convenience only; production edges run CA-issued certs.
pub fn ensure_self_signed_cert(cert_path: &Path, key_path: &Path) -> anyhow::Result<()> {
    if cert_path.exists() && key_path.exists() {
        info!(
            cert = %cert_path.display(),
            key = %key_path.display(),
            "using existing TLS certificate"
        );
        return Ok(());
    }

    info!("generating self-signed TLS certificate");

    let mut params = CertificateParams::new(vec!["localhost".into(), "giraffe-edge".into()])?;
    params.distinguished_name = rcgen::DistinguishedName::new();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "giraffe-edge");

    let key_pair = KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;

    fs::write(cert_path, cert.pem())?;
    fs::write(key_path, key_pair.serialize_pem())?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(key_path, fs::Permissions::from_mode(0o600))?;
    }

    info!(
        cert = %cert_path.display(),
        key = %key_path.display(),
        "self-signed TLS certificate generated"
    );

    Ok(())
}

/// SHA-256 fingerprint of the first certificate in a PEM file, hex-encoded.
pub fn cert_sha256_fingerprint(cert_path: &Path) -> anyhow::Result<String> {
    let certs = load_certs(cert_path)?;
    let digest = Sha256::digest(certs[0].as_ref());
    Ok(hex::encode(digest))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_paths(tag: &str) -> (std::path::PathBuf, std::path::PathBuf) {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let dir = std::env::temp_dir().join(format!("giraffe-edge-tls-{}-{}", tag, std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        (dir.join("cert.pem"), dir.join("key.pem"))
    }

    #[test]
    fn test_self_signed_generation_and_load() {
        let (cert, key) = temp_paths("gen");
        ensure_self_signed_cert(&cert, &key).unwrap();
        assert!(cert.exists() && key.exists());
        // idempotent
        ensure_self_signed_cert(&cert, &key).unwrap();
        build_raw_acceptor(&cert, &key).unwrap();
        let fp = cert_sha256_fingerprint(&cert).unwrap();
        assert_eq!(fp.len(), 64);
    }

    #[test]
    fn test_missing_cert_errors() {
        let missing = Path::new("/nonexistent/cert.pem");
        assert!(build_raw_acceptor(missing, missing).is_err());
    }
}
