//! TLS outer transport.

use anyhow::{Context, bail};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use tokio_rustls::{TlsAcceptor, TlsConnector};

fn install_crypto_provider() {
    static CRYPTO_INIT: OnceLock<()> = OnceLock::new();
    CRYPTO_INIT.get_or_init(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Read every certificate in a PEM file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or holds no certificate.
pub fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("parsing certificates in {}", path.display()))?;
    if certs.is_empty() {
        bail!("no certificates found in {}", path.display());
    }
    Ok(certs)
}

/// Read the first private key (PKCS#8, PKCS#1 or SEC1) in a PEM file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or holds no key.
pub fn load_private_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .with_context(|| format!("parsing private key in {}", path.display()))?
        .with_context(|| format!("no private key found in {}", path.display()))
}

/// Server-side acceptor for the given certificate chain and key.
///
/// # Errors
///
/// Returns an error if the material cannot be loaded or does not match.
pub fn acceptor(cert_file: &Path, key_file: &Path) -> anyhow::Result<TlsAcceptor> {
    install_crypto_provider();
    let certs = load_certs(cert_file)?;
    let key = load_private_key(key_file)?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("building TLS server configuration")?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Client-side connector trusting `ca_file`, or any certificate when
/// `insecure` is set.
///
/// # Errors
///
/// Returns an error if neither a CA file nor `insecure` is given, or the CA
/// file cannot be loaded.
pub fn connector(ca_file: Option<&Path>, insecure: bool) -> anyhow::Result<TlsConnector> {
    install_crypto_provider();

    let config = if insecure {
        tracing::warn!("server certificate verification is disabled");
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
            .with_no_client_auth()
    } else {
        let Some(ca_file) = ca_file else {
            bail!("a CA file is required to verify the server certificate");
        };
        let mut roots = RootCertStore::empty();
        for cert in load_certs(ca_file)? {
            roots
                .add(cert)
                .with_context(|| format!("adding root from {}", ca_file.display()))?;
        }
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    };

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Parse the name the server certificate must carry.
///
/// # Errors
///
/// Returns an error for a string that is neither a DNS name nor an IP.
pub fn server_name(name: &str) -> anyhow::Result<ServerName<'static>> {
    ServerName::try_from(name.to_string()).with_context(|| format!("invalid server name '{name}'"))
}

/// Verifier that accepts every server certificate.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
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
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_files() {
        assert!(load_certs(Path::new("/nonexistent/cert.pem")).is_err());
        assert!(acceptor(Path::new("/nonexistent/a"), Path::new("/nonexistent/b")).is_err());
    }

    #[test]
    fn test_empty_pem() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not a certificate").unwrap();
        assert!(load_certs(file.path()).is_err());
        assert!(load_private_key(file.path()).is_err());
    }

    #[test]
    fn test_connector_requires_trust() {
        assert!(connector(None, false).is_err());
        assert!(connector(None, true).is_ok());
    }

    #[test]
    fn test_server_name() {
        assert!(server_name("vpn.example.org").is_ok());
        assert!(server_name("10.0.0.1").is_ok());
        assert!(server_name("not a name!").is_err());
    }
}
