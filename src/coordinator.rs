//! Client Query Coordinator
//!
//! Owns one session for exactly one exchange:
//!
//! ```text
//! Idle ──open──▶ StreamOpened ──send+transmit──▶ AwaitingResponse
//!                                                   │        │
//!                                     response data │        │ close / error / cancel
//!                                                   ▼        ▼
//!                                   Fulfilled ──▶ Closed    Failed
//! ```
//!
//! The pending-wait slot belongs to the coordinator alone, so no locking is
//! involved: events are pulled from the session by the same task that waits.

use crate::pending::{PendingWait, WaitOutcome};
use crate::transport::{CloseReason, SecureSession, SessionEvent};
use crate::{ExchangeError, Result};
use bytes::Bytes;
use log::debug;
use std::future::Future;

/// Position of the exchange in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    Idle,
    StreamOpened,
    AwaitingResponse,
    Fulfilled,
    Closed,
    Failed,
}

impl ExchangeState {
    /// No transition leaves a terminal state
    pub fn is_terminal(self) -> bool {
        matches!(self, ExchangeState::Closed | ExchangeState::Failed)
    }
}

/// What [`QueryCoordinator::handle_event`] did with an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventDisposition {
    /// The wait was fulfilled by this event
    Fulfilled,
    /// The wait failed because the session ended
    Failed,
    /// No matching wait; the event was dropped
    Stray,
}

/// Drives a single query/response cycle over one session
pub struct QueryCoordinator<S> {
    session: S,
    state: ExchangeState,
    pending: Option<PendingWait>,
}

impl<S: SecureSession> QueryCoordinator<S> {
    pub fn new(session: S) -> Self {
        Self {
            session,
            state: ExchangeState::Idle,
            pending: None,
        }
    }

    pub fn state(&self) -> ExchangeState {
        self.state
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    pub fn into_session(self) -> S {
        self.session
    }

    /// Send `payload` and wait for the response
    ///
    /// # Errors
    ///
    /// - `TransportClosed` if the session ends first
    /// - `QueryOutstanding` if an earlier query on this session never settled
    /// - `SessionSpent` if this session already carried its exchange
    pub async fn query(&mut self, payload: impl Into<Bytes>) -> Result<Bytes> {
        self.query_until(payload, std::future::pending::<()>()).await
    }

    /// Like [`query`](Self::query), but gives up with `Cancelled` once `shutdown`
    /// resolves. A response already delivered by the session still wins.
    pub async fn query_until<F>(&mut self, payload: impl Into<Bytes>, shutdown: F) -> Result<Bytes>
    where
        F: Future<Output = ()>,
    {
        if self.pending.is_some() {
            return Err(ExchangeError::QueryOutstanding);
        }
        if self.state != ExchangeState::Idle {
            return Err(ExchangeError::SessionSpent);
        }

        if let Err(err) = self.send_query(payload.into()).await {
            match self.pending.as_mut() {
                Some(wait) => {
                    wait.fail(err.to_string());
                }
                None => {
                    self.state = ExchangeState::Failed;
                    self.session.close(CloseReason::Failed).await;
                    return Err(err);
                }
            }
        } else {
            self.await_response(shutdown).await;
        }

        self.finish().await
    }

    /// Release the session after a query future was dropped mid-flight
    pub async fn abandon(&mut self) {
        if let Some(wait) = self.pending.as_mut() {
            wait.cancel();
        }
        if !self.state.is_terminal() {
            let _ = self.finish().await;
        }
    }

    /// Apply one session event to the exchange
    ///
    /// Only data on the stream the query went out on settles the wait. Anything
    /// else, and everything after a terminal state, is stray and ignored.
    pub fn handle_event(&mut self, event: SessionEvent) -> EventDisposition {
        if self.state != ExchangeState::AwaitingResponse {
            debug!("Ignoring event in state {:?}: {:?}", self.state, event);
            return EventDisposition::Stray;
        }
        let Some(wait) = self.pending.as_mut() else {
            debug!("Ignoring event with no pending wait: {:?}", event);
            return EventDisposition::Stray;
        };

        match event {
            SessionEvent::DataReceived {
                stream_id,
                data,
                end_stream,
            } if stream_id == wait.stream_id() => {
                if !end_stream {
                    debug!("Response on stream {} has no end-of-stream marker", stream_id);
                }
                debug!("Response on stream {} ({} bytes)", stream_id, data.len());
                wait.fulfil(data);
                self.state = ExchangeState::Fulfilled;
                EventDisposition::Fulfilled
            }
            SessionEvent::DataReceived { stream_id, .. } => {
                debug!(
                    "Ignoring data on stream {} while waiting on stream {}",
                    stream_id,
                    wait.stream_id()
                );
                EventDisposition::Stray
            }
            SessionEvent::StreamFailed { stream_id, reason } if stream_id == wait.stream_id() => {
                debug!("Stream {} failed before the response: {}", stream_id, reason);
                wait.fail(format!("stream {} failed: {}", stream_id, reason));
                self.state = ExchangeState::Failed;
                EventDisposition::Failed
            }
            SessionEvent::StreamFailed { stream_id, .. } => {
                debug!("Ignoring failure of unrelated stream {}", stream_id);
                EventDisposition::Stray
            }
            SessionEvent::Closed { reason } | SessionEvent::Error { reason } => {
                debug!("Session ended before the response: {}", reason);
                wait.fail(reason);
                self.state = ExchangeState::Failed;
                EventDisposition::Failed
            }
        }
    }

    async fn send_query(&mut self, payload: Bytes) -> Result<()> {
        let stream_id = self.session.open_stream().await?;
        self.state = ExchangeState::StreamOpened;

        debug!(
            "Sending query on stream {} to {} ({} bytes)",
            stream_id,
            self.session.peer(),
            payload.len()
        );
        self.session.send_stream_data(stream_id, payload, true)?;

        self.pending = Some(PendingWait::new(stream_id));
        self.state = ExchangeState::AwaitingResponse;

        // Writes only leave the session on an explicit flush
        self.session.transmit().await?;
        Ok(())
    }

    async fn await_response<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        while self.state == ExchangeState::AwaitingResponse {
            tokio::select! {
                biased;

                event = self.session.next_event() => match event {
                    Some(event) => {
                        self.handle_event(event);
                    }
                    None => self.fail_pending("session closed before a response arrived"),
                },

                _ = &mut shutdown => {
                    // Anything already delivered is processed before giving up
                    while self.state == ExchangeState::AwaitingResponse {
                        match self.session.try_next_event() {
                            Some(event) => {
                                self.handle_event(event);
                            }
                            None => break,
                        }
                    }
                    if self.state == ExchangeState::AwaitingResponse {
                        debug!("Query cancelled while waiting for the response");
                        if let Some(wait) = self.pending.as_mut() {
                            wait.cancel();
                        }
                        self.state = ExchangeState::Failed;
                    }
                }
            }
        }
    }

    fn fail_pending(&mut self, reason: &str) {
        if let Some(wait) = self.pending.as_mut() {
            wait.fail(reason);
        }
        self.state = ExchangeState::Failed;
    }

    /// Close the session according to how the wait settled and hand back its result
    async fn finish(&mut self) -> Result<Bytes> {
        let wait = self.pending.take();
        let reason = match wait.as_ref().and_then(PendingWait::outcome) {
            Some(WaitOutcome::Response(_)) => CloseReason::Completed,
            Some(WaitOutcome::Cancelled) => CloseReason::Cancelled,
            _ => CloseReason::Failed,
        };

        self.session.close(reason).await;
        self.state = match reason {
            CloseReason::Completed => ExchangeState::Closed,
            _ => ExchangeState::Failed,
        };

        match wait {
            Some(wait) => wait.into_result(),
            None => Err(ExchangeError::TransportClosed(
                "no query was outstanding".to_string(),
            )),
        }
    }
}
