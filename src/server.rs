//! Query server
//!
//! Accepts QUIC connections and hands each one to its own task running a
//! [`Responder`]. Connections optionally go through a stateless retry first so
//! the client's address is validated before any handshake state is kept.

use crate::config::ServerConfig;
use crate::quic::QuicSession;
use crate::responder::{Responder, ResponsePolicy};
use crate::{tls, ExchangeError, Result};
use log::{debug, info, warn};
use quinn::{Endpoint, Incoming};
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

/// DNS-over-QUIC style query server
pub struct DoqServer<P> {
    endpoint: Endpoint,
    responder: Arc<Responder<P>>,
    retry: bool,
    max_query_size: usize,
}

async fn listen_addr(config: &ServerConfig) -> Result<SocketAddr> {
    if let Ok(ip) = config.host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, config.port));
    }

    tokio::net::lookup_host((config.host.as_str(), config.port))
        .await?
        .next()
        .ok_or_else(|| ExchangeError::InvalidConfig(format!("no address for {}", config.host)))
}

impl<P: ResponsePolicy> DoqServer<P> {
    /// Bind the listening endpoint
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the certificate or key
    /// cannot be loaded or the UDP socket cannot be bound
    pub async fn bind(config: &ServerConfig, policy: P) -> Result<Self> {
        config.validate()?;
        let server_config = tls::quic_server_config(config)?;
        let addr = listen_addr(config).await?;

        let endpoint = Endpoint::server(server_config, addr)?;
        info!(
            "Listening on {} (alpn {}, retry {})",
            endpoint.local_addr()?,
            config.alpn,
            if config.retry { "on" } else { "off" }
        );

        Ok(Self {
            endpoint,
            responder: Arc::new(Responder::new(policy)),
            retry: config.retry,
            max_query_size: config.max_query_size,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }

    /// Serve until the endpoint is closed
    pub async fn run(&self) -> Result<()> {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Serve until `shutdown` resolves, then close every session
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            let incoming = tokio::select! {
                biased;
                _ = &mut shutdown => break,
                incoming = self.endpoint.accept() => match incoming {
                    Some(incoming) => incoming,
                    None => break,
                },
            };
            self.handle_incoming(incoming);
        }

        info!("Shutting down");
        self.endpoint.close(0u32.into(), b"server shutdown");
        self.endpoint.wait_idle().await;
        Ok(())
    }

    fn handle_incoming(&self, incoming: Incoming) {
        let remote = incoming.remote_address();

        if self.retry && !incoming.remote_address_validated() {
            debug!("Sending retry to {}", remote);
            if let Err(e) = incoming.retry() {
                warn!("Retry to {} failed: {}", remote, e);
            }
            return;
        }

        let responder = self.responder.clone();
        let max_query_size = self.max_query_size;
        tokio::spawn(async move {
            let connection = match incoming.await {
                Ok(connection) => connection,
                Err(e) => {
                    warn!("Handshake with {} failed: {}", remote, e);
                    return;
                }
            };
            info!("Accepted session from {}", remote);

            let summary = responder
                .serve(QuicSession::server(connection, max_query_size))
                .await;
            if summary.failed > 0 || summary.rejected > 0 {
                warn!(
                    "Session from {} ended with {} failed responses and {} rejected queries",
                    remote, summary.failed, summary.rejected
                );
            }
        });
    }
}
