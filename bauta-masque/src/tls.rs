//! rustls configuration for both roles.
//!
//! Mutual authentication against a single operator CA: the server presents a
//! leaf chained to it and verifies client leaves against it. QUIC mandates
//! TLS 1.3; ALPN is pinned to `h3`.

use bauta_core::{config, Error, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{aws_lc_rs, verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::WebPkiClientVerifier;
use rustls::{DigitallySignedStruct, KeyLog, RootCertStore, SignatureScheme};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

fn provider() -> Arc<CryptoProvider> {
    Arc::new(aws_lc_rs::default_provider())
}

/// Load a PEM certificate chain.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let data = std::fs::read(path)
        .map_err(|e| Error::config(format!("read {}: {e}", path.display())))?;
    let certs: std::io::Result<Vec<_>> = rustls_pemfile::certs(&mut data.as_slice()).collect();
    let certs = certs.map_err(|e| Error::config(format!("parse {}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(Error::config(format!(
            "{} contains no certificates",
            path.display()
        )));
    }
    Ok(certs)
}

/// Load a PEM private key (PKCS#8, PKCS#1, or SEC1).
pub fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let data = std::fs::read(path)
        .map_err(|e| Error::config(format!("read {}: {e}", path.display())))?;
    rustls_pemfile::private_key(&mut data.as_slice())
        .map_err(|e| Error::config(format!("parse {}: {e}", path.display())))?
        .ok_or_else(|| Error::config(format!("{} contains no private key", path.display())))
}

fn root_store(path: &Path) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .map_err(|e| Error::config(format!("bad CA certificate: {e}")))?;
    }
    Ok(roots)
}

/// Client-side TLS: verify the server against the operator CA (or skip in
/// tests), present the client leaf.
pub fn client_tls(cfg: &config::ClientConfig) -> Result<rustls::ClientConfig> {
    let certs = load_certs(&cfg.tls_cert)?;
    let key = load_key(&cfg.tls_key)?;

    let builder = rustls::ClientConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| Error::config(format!("tls versions: {e}")))?;

    let mut tls = if cfg.insecure_skip_verify {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification::new()))
            .with_client_auth_cert(certs, key)
            .map_err(|e| Error::config(format!("client certificate: {e}")))?
    } else {
        builder
            .with_root_certificates(root_store(&cfg.ca_file)?)
            .with_client_auth_cert(certs, key)
            .map_err(|e| Error::config(format!("client certificate: {e}")))?
    };

    tls.alpn_protocols = vec![b"h3".to_vec()];
    if let Some(path) = &cfg.key_log_file {
        tls.key_log = Arc::new(FileKeyLog::create(path)?);
    }
    Ok(tls)
}

/// Server-side TLS: present the server leaf, require client certificates
/// chained to the operator CA.
pub fn server_tls(cfg: &config::ServerConfig) -> Result<rustls::ServerConfig> {
    let certs = load_certs(&cfg.tls_cert)?;
    let key = load_key(&cfg.tls_key)?;
    let roots = root_store(&cfg.ca_file)?;

    let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider())
        .build()
        .map_err(|e| Error::config(format!("client verifier: {e}")))?;

    let mut tls = rustls::ServerConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| Error::config(format!("tls versions: {e}")))?
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .map_err(|e| Error::config(format!("server certificate: {e}")))?;

    tls.alpn_protocols = vec![b"h3".to_vec()];
    if let Some(path) = &cfg.key_log_file {
        tls.key_log = Arc::new(FileKeyLog::create(path)?);
    }
    Ok(tls)
}

/// NSS-format key log writing to a configured path (rustls's built-in
/// `KeyLogFile` only honours the SSLKEYLOGFILE environment variable).
#[derive(Debug)]
pub struct FileKeyLog {
    file: Mutex<std::fs::File>,
}

impl FileKeyLog {
    pub fn create(path: &Path) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .map_err(|e| Error::config(format!("open key log {}: {e}", path.display())))?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl KeyLog for FileKeyLog {
    fn log(&self, label: &str, client_random: &[u8], secret: &[u8]) {
        if let Ok(mut file) = self.file.lock() {
            let _ = writeln!(
                file,
                "{label} {} {}",
                hex::encode(client_random),
                hex::encode(secret)
            );
        }
    }
}

/// Accepts any server certificate. Gated behind `insecure_skip_verify`,
/// which exists for test rigs only.
#[derive(Debug)]
struct SkipServerVerification(Arc<CryptoProvider>);

impl SkipServerVerification {
    fn new() -> Self {
        Self(provider())
    }
}

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
