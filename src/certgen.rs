//! Self-signed certificate bootstrap
//!
//! One-shot generation of a server certificate and key for local testing. The
//! certificate names `localhost` and `127.0.0.1` unless told otherwise.

use crate::{ExchangeError, Result};
use chrono::{Datelike, Duration, Utc};
use rcgen::{CertificateParams, DnType, KeyPair};
use std::path::{Path, PathBuf};

/// What to put in the certificate
#[derive(Debug, Clone)]
pub struct CertParams {
    /// Subject common name
    pub common_name: String,
    /// DNS names and IP addresses for the subject alternative name extension
    pub subject_alt_names: Vec<String>,
    /// Validity period from today
    pub validity_days: i64,
}

impl Default for CertParams {
    fn default() -> Self {
        Self {
            common_name: "localhost".to_string(),
            subject_alt_names: vec!["localhost".to_string(), "127.0.0.1".to_string()],
            validity_days: 365,
        }
    }
}

/// Generated certificate and key
#[derive(Debug, Clone)]
pub struct SelfSigned {
    pub cert_pem: String,
    pub key_pem: String,
    pub cert_der: Vec<u8>,
}

/// Paths written by [`SelfSigned::write_to`]
#[derive(Debug, Clone)]
pub struct WrittenFiles {
    pub certificate: PathBuf,
    pub private_key: PathBuf,
}

const MAX_CERT_YEAR: i32 = 9999;

fn cert_error(e: rcgen::Error) -> ExchangeError {
    ExchangeError::Tls(format!("certificate generation: {}", e))
}

/// Generate a self-signed certificate (ECDSA P-256)
pub fn generate(params: &CertParams) -> Result<SelfSigned> {
    if params.validity_days <= 0 {
        return Err(ExchangeError::InvalidConfig(
            "certificate validity must be at least one day".into(),
        ));
    }

    let now = Utc::now();
    // X.509 times stop at year 9999
    let expiry = Duration::try_days(params.validity_days)
        .and_then(|validity| now.checked_add_signed(validity))
        .filter(|expiry| expiry.year() <= MAX_CERT_YEAR)
        .ok_or_else(|| {
            ExchangeError::InvalidConfig(format!(
                "certificate validity of {} days ends after year {}",
                params.validity_days, MAX_CERT_YEAR
            ))
        })?;

    let mut cert_params =
        CertificateParams::new(params.subject_alt_names.clone()).map_err(cert_error)?;
    cert_params
        .distinguished_name
        .push(DnType::CommonName, params.common_name.as_str());

    cert_params.not_before = rcgen::date_time_ymd(now.year(), now.month() as u8, now.day() as u8);
    cert_params.not_after =
        rcgen::date_time_ymd(expiry.year(), expiry.month() as u8, expiry.day() as u8);

    let key_pair = KeyPair::generate().map_err(cert_error)?;
    let cert = cert_params.self_signed(&key_pair).map_err(cert_error)?;

    Ok(SelfSigned {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
        cert_der: cert.der().to_vec(),
    })
}

impl SelfSigned {
    /// Write `cert.pem` and `key.pem` into `dir`
    pub fn write_to(&self, dir: &Path) -> Result<WrittenFiles> {
        std::fs::create_dir_all(dir)?;

        let files = WrittenFiles {
            certificate: dir.join("cert.pem"),
            private_key: dir.join("key.pem"),
        };
        std::fs::write(&files.certificate, &self.cert_pem)?;
        std::fs::write(&files.private_key, &self.key_pem)?;

        Ok(files)
    }
}
