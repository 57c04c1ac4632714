//! Client and server configuration

use crate::quic::DEFAULT_MAX_PAYLOAD;
use crate::responder::ResponsePolicy;
use crate::{ExchangeError, DEFAULT_ALPN, DEFAULT_PORT, DEFAULT_RESPONSE};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_alpn() -> String {
    DEFAULT_ALPN.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_max_payload() -> usize {
    DEFAULT_MAX_PAYLOAD
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server host name or IP address
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application protocol offered through ALPN
    #[serde(default = "default_alpn")]
    pub alpn: String,

    /// Name checked against the server certificate (defaults to `host`)
    #[serde(default)]
    pub server_name: Option<String>,

    /// PEM bundle of trusted CA certificates (platform store when unset)
    #[serde(default)]
    pub ca_certs: Option<PathBuf>,

    /// Skip server certificate verification
    #[serde(default)]
    pub insecure: bool,

    /// Append TLS secrets to this file (NSS key log format)
    #[serde(default)]
    pub secrets_log: Option<PathBuf>,

    /// Limit for establishing the session
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Session is dropped after this long without traffic
    #[serde(default = "default_idle_timeout", with = "humantime_serde")]
    pub idle_timeout: Duration,

    /// Largest accepted response (bytes)
    #[serde(default = "default_max_payload")]
    pub max_response_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            alpn: default_alpn(),
            server_name: None,
            ca_certs: None,
            insecure: false,
            secrets_log: None,
            connect_timeout: default_connect_timeout(),
            idle_timeout: default_idle_timeout(),
            max_response_size: DEFAULT_MAX_PAYLOAD,
        }
    }
}

impl ClientConfig {
    /// Load configuration from TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Name presented for SNI and certificate checks
    pub fn server_name(&self) -> &str {
        self.server_name.as_deref().unwrap_or(&self.host)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ExchangeError> {
        if self.host.is_empty() {
            return Err(ExchangeError::InvalidConfig("host must be set".into()));
        }
        validate_common(&self.alpn, self.port, self.max_response_size)?;
        if self.connect_timeout.is_zero() {
            return Err(ExchangeError::InvalidConfig(
                "connect timeout must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// How the server computes responses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum ResponseMode {
    /// Same text for every query
    Fixed { text: String },
    /// Query sent back unchanged
    Echo,
}

impl Default for ResponseMode {
    fn default() -> Self {
        ResponseMode::Fixed {
            text: DEFAULT_RESPONSE.to_string(),
        }
    }
}

impl ResponsePolicy for ResponseMode {
    fn respond(&self, query: &[u8]) -> Bytes {
        match self {
            ResponseMode::Fixed { text } => Bytes::from(text.clone()),
            ResponseMode::Echo => Bytes::copy_from_slice(query),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    pub host: String,

    /// Listen port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application protocol required through ALPN
    #[serde(default = "default_alpn")]
    pub alpn: String,

    /// PEM certificate chain
    pub certificate: PathBuf,

    /// PEM private key (read from `certificate` when unset)
    #[serde(default)]
    pub private_key: Option<PathBuf>,

    /// Validate client addresses with a retry packet before accepting
    #[serde(default)]
    pub retry: bool,

    /// Session is dropped after this long without traffic
    #[serde(default = "default_idle_timeout", with = "humantime_serde")]
    pub idle_timeout: Duration,

    /// Largest accepted query (bytes)
    #[serde(default = "default_max_payload")]
    pub max_query_size: usize,

    /// Response policy
    #[serde(default)]
    pub response: ResponseMode,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "::".to_string(),
            port: DEFAULT_PORT,
            alpn: default_alpn(),
            certificate: PathBuf::from("cert.pem"),
            private_key: None,
            retry: false,
            idle_timeout: default_idle_timeout(),
            max_query_size: DEFAULT_MAX_PAYLOAD,
            response: ResponseMode::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ExchangeError> {
        validate_common(&self.alpn, 1, self.max_query_size)?;
        if self.certificate.as_os_str().is_empty() {
            return Err(ExchangeError::InvalidConfig("certificate must be set".into()));
        }
        Ok(())
    }
}

fn validate_common(alpn: &str, port: u16, max_payload: usize) -> Result<(), ExchangeError> {
    if alpn.is_empty() || alpn.len() > 255 {
        return Err(ExchangeError::InvalidConfig(
            "ALPN identifier must be 1 to 255 bytes".into(),
        ));
    }
    if port == 0 {
        return Err(ExchangeError::InvalidConfig("port must be non-zero".into()));
    }
    if max_payload == 0 {
        return Err(ExchangeError::InvalidConfig(
            "payload limit must be positive".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let client = ClientConfig::default();
        assert_eq!(client.port, 853);
        assert_eq!(client.alpn, "doq");
        assert_eq!(client.server_name(), "localhost");
        assert!(client.validate().is_ok());

        let server = ServerConfig::default();
        assert_eq!(server.host, "::");
        assert_eq!(server.response, ResponseMode::default());
        assert!(server.validate().is_ok());
    }

    #[test]
    fn test_client_from_toml() {
        let config: ClientConfig = toml::from_str(
            r#"
            host = "127.0.0.1"
            port = 8853
            insecure = true
            connect_timeout = "2s"
            idle_timeout = "1m 30s"
            "#,
        )
        .unwrap();

        assert_eq!(config.port, 8853);
        assert!(config.insecure);
        assert_eq!(config.alpn, "doq");
        assert_eq!(config.connect_timeout, Duration::from_secs(2));
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
    }

    #[test]
    fn test_server_from_toml() {
        let config: ServerConfig = toml::from_str(
            r#"
            host = "0.0.0.0"
            certificate = "tls/cert.pem"
            private_key = "tls/key.pem"
            retry = true

            [response]
            mode = "echo"
            "#,
        )
        .unwrap();

        assert_eq!(config.port, 853);
        assert!(config.retry);
        assert_eq!(config.response, ResponseMode::Echo);
        assert_eq!(config.private_key, Some(PathBuf::from("tls/key.pem")));
    }

    #[test]
    fn test_response_modes() {
        let fixed = ResponseMode::Fixed {
            text: "canned".into(),
        };
        assert_eq!(fixed.respond(b"q"), Bytes::from_static(b"canned"));
        assert_eq!(ResponseMode::Echo.respond(b"q"), Bytes::from_static(b"q"));
    }

    #[test]
    fn test_validation() {
        let mut client = ClientConfig::default();
        client.alpn.clear();
        assert!(client.validate().is_err());

        let mut client = ClientConfig::default();
        client.port = 0;
        assert!(client.validate().is_err());

        let mut client = ClientConfig::default();
        client.connect_timeout = Duration::ZERO;
        assert!(client.validate().is_err());

        let mut server = ServerConfig::default();
        server.max_query_size = 0;
        assert!(matches!(
            server.validate(),
            Err(ExchangeError::InvalidConfig(_))
        ));
    }
}
