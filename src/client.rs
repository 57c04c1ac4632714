//! Query client
//!
//! Every query gets a fresh session: connect, run one [`QueryCoordinator`]
//! exchange, close.

use crate::config::ClientConfig;
use crate::coordinator::QueryCoordinator;
use crate::quic::QuicSession;
use crate::transport::SecureSession;
use crate::{tls, ExchangeError, Result};
use bytes::Bytes;
use log::{debug, info};
use quinn::Endpoint;
use std::future::Future;
use std::net::SocketAddr;
use tokio::sync::OnceCell;

/// DNS-over-QUIC style query client
pub struct DoqClient {
    config: ClientConfig,
    quic_config: quinn::ClientConfig,
    endpoint_v4: OnceCell<Endpoint>,
    endpoint_v6: OnceCell<Endpoint>,
}

impl DoqClient {
    /// Create a client endpoint
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or TLS material cannot be
    /// loaded
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let quic_config = tls::quic_client_config(&config)?;

        Ok(Self {
            config,
            quic_config,
            endpoint_v4: OnceCell::new(),
            endpoint_v6: OnceCell::new(),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Local endpoint of the server's address family, bound on first use
    async fn endpoint_for(&self, remote: SocketAddr) -> Result<&Endpoint> {
        let (cell, local) = if remote.is_ipv4() {
            (&self.endpoint_v4, SocketAddr::from(([0, 0, 0, 0], 0)))
        } else {
            (&self.endpoint_v6, SocketAddr::from(([0u16; 8], 0)))
        };

        let endpoint = cell
            .get_or_try_init(|| async move {
                debug!("Binding client endpoint on {}", local);
                Endpoint::client(local)
            })
            .await?;
        Ok(endpoint)
    }

    async fn resolve(&self) -> Result<SocketAddr> {
        let mut addrs = tokio::net::lookup_host((self.config.host.as_str(), self.config.port))
            .await
            .map_err(|e| {
                ExchangeError::TransportClosed(format!("resolving {}: {}", self.config.host, e))
            })?;

        addrs.next().ok_or_else(|| {
            ExchangeError::TransportClosed(format!("no address for {}", self.config.host))
        })
    }

    /// Establish a new session, bounded by the connect timeout
    pub async fn connect(&self) -> Result<QuicSession> {
        let remote = self.resolve().await?;
        let endpoint = self.endpoint_for(remote).await?;
        debug!("Connecting to {}:{} ({})", self.config.host, self.config.port, remote);

        let connecting = endpoint
            .connect_with(self.quic_config.clone(), remote, self.config.server_name())
            .map_err(|e| ExchangeError::TransportClosed(e.to_string()))?;

        let connection = tokio::time::timeout(self.config.connect_timeout, connecting)
            .await
            .map_err(|_| {
                ExchangeError::TransportClosed(format!(
                    "no session with {} within {}",
                    remote,
                    humantime::format_duration(self.config.connect_timeout)
                ))
            })?
            .map_err(|e| ExchangeError::TransportClosed(e.to_string()))?;

        let session = QuicSession::client(connection, self.config.max_response_size);
        info!(
            "Session established with {} (alpn {})",
            session.peer(),
            session
                .alpn()
                .map(String::from_utf8_lossy)
                .unwrap_or_default()
        );
        Ok(session)
    }

    /// Run one exchange on a fresh session
    pub async fn query(&self, payload: impl Into<Bytes>) -> Result<Bytes> {
        self.query_until(payload, std::future::pending::<()>()).await
    }

    /// Run one exchange on a fresh session, giving up with `Cancelled` once
    /// `shutdown` resolves
    pub async fn query_until<F>(&self, payload: impl Into<Bytes>, shutdown: F) -> Result<Bytes>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let session = tokio::select! {
            biased;
            session = self.connect() => session?,
            _ = &mut shutdown => return Err(ExchangeError::Cancelled),
        };

        let mut coordinator = QueryCoordinator::new(session);
        coordinator.query_until(payload, shutdown).await
    }

    /// Wait for closed sessions to finish their close handshake
    pub async fn wait_idle(&self) {
        for endpoint in [self.endpoint_v4.get(), self.endpoint_v6.get()]
            .into_iter()
            .flatten()
        {
            endpoint.wait_idle().await;
        }
    }
}
