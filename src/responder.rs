//! Server Response Responder
//!
//! Answers every inbound stream exactly once, on the same stream, and ends it.
//! The responder keeps no per-session state: each session is served by its own
//! task and a failed write only costs the stream it happened on.

use crate::transport::{SecureSession, SessionEvent, StreamId};
use crate::{ExchangeError, Result, DEFAULT_RESPONSE};
use bytes::Bytes;
use log::{debug, info, warn};

/// Computes the response to a complete query
pub trait ResponsePolicy: Send + Sync + 'static {
    fn respond(&self, query: &[u8]) -> Bytes;
}

/// Same answer for every query
#[derive(Debug, Clone)]
pub struct FixedResponse(Bytes);

impl FixedResponse {
    pub fn new(response: impl Into<Bytes>) -> Self {
        Self(response.into())
    }
}

impl Default for FixedResponse {
    fn default() -> Self {
        Self(Bytes::from_static(DEFAULT_RESPONSE.as_bytes()))
    }
}

impl ResponsePolicy for FixedResponse {
    fn respond(&self, _query: &[u8]) -> Bytes {
        self.0.clone()
    }
}

/// Sends the query back unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoResponse;

impl ResponsePolicy for EchoResponse {
    fn respond(&self, query: &[u8]) -> Bytes {
        Bytes::copy_from_slice(query)
    }
}

impl<F> ResponsePolicy for F
where
    F: Fn(&[u8]) -> Bytes + Send + Sync + 'static,
{
    fn respond(&self, query: &[u8]) -> Bytes {
        self(query)
    }
}

/// Outcome of serving one session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServeSummary {
    /// Streams answered successfully
    pub answered: u64,
    /// Streams whose response could not be written
    pub failed: u64,
    /// Streams that ended before a complete query arrived
    pub rejected: u64,
}

/// Answers queries with a [`ResponsePolicy`]
#[derive(Debug, Clone, Default)]
pub struct Responder<P> {
    policy: P,
}

impl<P: ResponsePolicy> Responder<P> {
    pub fn new(policy: P) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    /// Serve one session until it closes
    ///
    /// Streams are answered one at a time, in arrival order. A response write
    /// held back by the peer's flow control delays the answers to the session's
    /// later streams; with one query per session this never comes up.
    pub async fn serve<S: SecureSession>(&self, mut session: S) -> ServeSummary {
        let peer = session.peer();
        let mut summary = ServeSummary::default();

        while let Some(event) = session.next_event().await {
            match event {
                SessionEvent::DataReceived {
                    stream_id,
                    data,
                    end_stream,
                } => {
                    if !end_stream {
                        debug!("Query on stream {} from {} has no end-of-stream marker", stream_id, peer);
                    }
                    match self.answer(&mut session, stream_id, &data).await {
                        Ok(()) => summary.answered += 1,
                        Err(e) => {
                            warn!("{} (peer {})", e, peer);
                            summary.failed += 1;
                        }
                    }
                }
                SessionEvent::StreamFailed { stream_id, reason } => {
                    warn!("Stream {} from {} dropped: {}", stream_id, peer, reason);
                    summary.rejected += 1;
                }
                SessionEvent::Closed { reason } => {
                    debug!("Session with {} closed: {}", peer, reason);
                    break;
                }
                SessionEvent::Error { reason } => {
                    debug!("Session with {} failed: {}", peer, reason);
                    break;
                }
            }
        }

        debug!(
            "Done serving {}: {} answered, {} failed, {} rejected",
            peer, summary.answered, summary.failed, summary.rejected
        );
        summary
    }

    /// Write the response to `query` on `stream_id` and end the stream
    ///
    /// # Errors
    ///
    /// `ResponseWriteFailed` if the stream was reset or the session is gone
    pub async fn answer<S: SecureSession>(
        &self,
        session: &mut S,
        stream_id: StreamId,
        query: &[u8],
    ) -> Result<()> {
        info!(
            "Query on stream {} from {}: {}",
            stream_id,
            session.peer(),
            String::from_utf8_lossy(query)
        );

        let response = self.policy.respond(query);
        let write_failed = |e: crate::TransportError| ExchangeError::ResponseWriteFailed {
            stream_id,
            reason: e.to_string(),
        };

        session
            .send_stream_data(stream_id, response, true)
            .map_err(write_failed)?;
        session.transmit().await.map_err(write_failed)
    }
}
