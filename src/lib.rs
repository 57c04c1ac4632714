//! doq-exchange: single query/response exchanges over DNS-over-QUIC sessions
//!
//! A client opens a fresh encrypted QUIC session, sends one opaque query on one
//! bidirectional stream, waits for exactly one response on that stream and closes
//! the session. A server answers every inbound stream exactly once, on the same
//! stream, using a pluggable response policy.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use doq_exchange::{ClientConfig, DoqClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = ClientConfig::default();
//!     config.insecure = true;
//!
//!     let client = DoqClient::new(config)?;
//!     let response = client.query("Hello server").await?;
//!     println!("{}", String::from_utf8_lossy(&response));
//!
//!     client.wait_idle().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────┐   SecureSession    ┌─────────────────────┐
//! │  QueryCoordinator   │◀══════════════════▶│     Responder       │
//! │  (one query, one    │  quinn + rustls    │  (every stream,     │
//! │   PendingWait)      │  or memory::pair   │   exactly once)     │
//! └─────────────────────┘                    └─────────────────────┘
//!           ▲                                          ▲
//!       DoqClient                                  DoqServer
//! ```

pub mod certgen;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod memory;
pub mod pending;
pub mod quic;
pub mod responder;
pub mod server;
pub mod tls;
pub mod transport;

// Re-export core types
pub use client::DoqClient;
pub use config::{ClientConfig, ResponseMode, ServerConfig};
pub use coordinator::{EventDisposition, ExchangeState, QueryCoordinator};
pub use pending::{PendingWait, WaitOutcome};
pub use quic::QuicSession;
pub use responder::{EchoResponse, FixedResponse, Responder, ResponsePolicy, ServeSummary};
pub use server::DoqServer;
pub use transport::{CloseReason, SecureSession, SessionEvent, StreamId, TransportError};

/// Application protocol identifier negotiated through ALPN
pub const DEFAULT_ALPN: &str = "doq";

/// Well-known DNS-over-QUIC port
pub const DEFAULT_PORT: u16 = 853;

/// Canned answer of the reference server
pub const DEFAULT_RESPONSE: &str = "Here is the data you requested";

/// Result alias for exchange operations
pub type Result<T> = std::result::Result<T, ExchangeError>;

/// Exchange error types
#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    /// The session ended before a response arrived
    #[error("Transport closed: {0}")]
    TransportClosed(String),

    /// The waiting caller gave up
    #[error("Exchange cancelled")]
    Cancelled,

    /// Writing a response onto a stream failed (server side)
    #[error("Failed to write response on stream {stream_id}: {reason}")]
    ResponseWriteFailed { stream_id: StreamId, reason: String },

    /// A previous query on this session never settled
    #[error("A query is already outstanding on this session")]
    QueryOutstanding,

    /// The session already carried its one exchange
    #[error("Session already used for an exchange")]
    SessionSpent,

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Certificate, key or TLS setup error
    #[error("TLS error: {0}")]
    Tls(String),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<TransportError> for ExchangeError {
    fn from(err: TransportError) -> Self {
        ExchangeError::TransportClosed(err.to_string())
    }
}
