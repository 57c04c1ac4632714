//! TLS material for QUIC endpoints
//!
//! Builds the rustls client and server configurations (TLS 1.3, ring provider,
//! ALPN pinned to the exchange protocol) and the quinn configs that wrap them.

use crate::config::{ClientConfig, ServerConfig};
use crate::quic::{transport_config, Role};
use crate::{ExchangeError, Result};
use log::{debug, warn};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn tls_error(context: &str, e: impl std::fmt::Display) -> ExchangeError {
    ExchangeError::Tls(format!("{}: {}", context, e))
}

/// Read every certificate from a PEM file
pub fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| tls_error(&format!("reading {}", path.display()), e))?;

    if certs.is_empty() {
        return Err(ExchangeError::Tls(format!(
            "no certificates in {}",
            path.display()
        )));
    }
    Ok(certs)
}

/// Read the first private key from a PEM file
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| tls_error(&format!("reading {}", path.display()), e))?
        .ok_or_else(|| ExchangeError::Tls(format!("no private key in {}", path.display())))
}

/// Server-side rustls configuration
pub fn server_crypto(config: &ServerConfig) -> Result<rustls::ServerConfig> {
    let cert_chain = load_certificates(&config.certificate)?;
    // The key may be bundled with the certificate
    let key_path = config.private_key.as_ref().unwrap_or(&config.certificate);
    let key = load_private_key(key_path)?;

    let mut crypto = rustls::ServerConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| tls_error("server protocol versions", e))?
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .map_err(|e| tls_error("server certificate", e))?;

    crypto.alpn_protocols = vec![config.alpn.as_bytes().to_vec()];
    crypto.max_early_data_size = 0;

    Ok(crypto)
}

/// quinn server configuration
pub fn quic_server_config(config: &ServerConfig) -> Result<quinn::ServerConfig> {
    let crypto = server_crypto(config)?;
    let quic_crypto = quinn::crypto::rustls::QuicServerConfig::try_from(crypto)
        .map_err(|e| tls_error("server cipher suites", e))?;

    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(quic_crypto));
    server_config.transport_config(transport_config(config.idle_timeout, Role::Server)?);
    Ok(server_config)
}

fn root_store(ca_certs: Option<&Path>) -> Result<rustls::RootCertStore> {
    let mut roots = rustls::RootCertStore::empty();

    match ca_certs {
        Some(path) => {
            let (added, ignored) = roots.add_parsable_certificates(load_certificates(path)?);
            debug!("Loaded {} CA certificates from {} ({} ignored)", added, path.display(), ignored);
        }
        None => {
            let native = rustls_native_certs::load_native_certs();
            for e in &native.errors {
                warn!("Platform certificate store: {}", e);
            }
            let (added, _) = roots.add_parsable_certificates(native.certs);
            debug!("Loaded {} platform CA certificates", added);
        }
    }

    if roots.is_empty() {
        return Err(ExchangeError::Tls("no trusted CA certificates".into()));
    }
    Ok(roots)
}

/// Client-side rustls configuration
pub fn client_crypto(config: &ClientConfig) -> Result<rustls::ClientConfig> {
    let provider = provider();
    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| tls_error("client protocol versions", e))?;

    let mut crypto = if config.insecure {
        warn!("Server certificate verification is disabled");
        builder
            .dangerous()
            .with_custom_certificate_verifier(SkipServerVerification::new(provider))
            .with_no_client_auth()
    } else {
        builder
            .with_root_certificates(root_store(config.ca_certs.as_deref())?)
            .with_no_client_auth()
    };

    crypto.alpn_protocols = vec![config.alpn.as_bytes().to_vec()];
    if let Some(path) = &config.secrets_log {
        crypto.key_log = Arc::new(KeyLogFile::open(path)?);
    }

    Ok(crypto)
}

/// quinn client configuration
pub fn quic_client_config(config: &ClientConfig) -> Result<quinn::ClientConfig> {
    let crypto = client_crypto(config)?;
    let quic_crypto = quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
        .map_err(|e| tls_error("client cipher suites", e))?;

    let mut client_config = quinn::ClientConfig::new(Arc::new(quic_crypto));
    client_config.transport_config(transport_config(config.idle_timeout, Role::Client)?);
    Ok(client_config)
}

/// Accepts any server certificate (`--insecure`)
#[derive(Debug)]
struct SkipServerVerification(Arc<CryptoProvider>);

impl SkipServerVerification {
    fn new(provider: Arc<CryptoProvider>) -> Arc<Self> {
        Arc::new(Self(provider))
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// Appends TLS secrets in NSS key log format, for Wireshark
#[derive(Debug)]
pub struct KeyLogFile {
    path: PathBuf,
    file: Mutex<File>,
}

impl KeyLogFile {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }
}

impl rustls::KeyLog for KeyLogFile {
    fn log(&self, label: &str, client_random: &[u8], secret: &[u8]) {
        let line = format!(
            "{} {} {}\n",
            label,
            hex::encode(client_random),
            hex::encode(secret)
        );
        let Ok(mut file) = self.file.lock() else {
            return;
        };
        if let Err(e) = file.write_all(line.as_bytes()) {
            warn!("Writing key log {}: {}", self.path.display(), e);
        }
    }
}
