//! Single-shot wait for the response to one outstanding query

use crate::transport::StreamId;
use crate::ExchangeError;
use bytes::Bytes;

/// How a wait was settled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    Response(Bytes),
    TransportClosed(String),
    Cancelled,
}

/// Result cell for the query sent on `stream_id`. Settles at most once.
#[derive(Debug)]
pub struct PendingWait {
    stream_id: StreamId,
    outcome: Option<WaitOutcome>,
}

impl PendingWait {
    pub fn new(stream_id: StreamId) -> Self {
        Self {
            stream_id,
            outcome: None,
        }
    }

    /// Stream the query was sent on
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn is_settled(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn outcome(&self) -> Option<&WaitOutcome> {
        self.outcome.as_ref()
    }

    /// Settle with the response. Returns `false` if already settled.
    pub fn fulfil(&mut self, response: Bytes) -> bool {
        self.settle(WaitOutcome::Response(response))
    }

    /// Settle with a transport failure. Returns `false` if already settled.
    pub fn fail(&mut self, reason: impl Into<String>) -> bool {
        self.settle(WaitOutcome::TransportClosed(reason.into()))
    }

    /// Settle as cancelled. Returns `false` if already settled.
    pub fn cancel(&mut self) -> bool {
        self.settle(WaitOutcome::Cancelled)
    }

    fn settle(&mut self, outcome: WaitOutcome) -> bool {
        if self.outcome.is_some() {
            return false;
        }
        self.outcome = Some(outcome);
        true
    }

    /// Consume the wait. An unsettled wait reports the session as gone.
    pub fn into_result(self) -> Result<Bytes, ExchangeError> {
        match self.outcome {
            Some(WaitOutcome::Response(response)) => Ok(response),
            Some(WaitOutcome::TransportClosed(reason)) => Err(ExchangeError::TransportClosed(reason)),
            Some(WaitOutcome::Cancelled) => Err(ExchangeError::Cancelled),
            None => Err(ExchangeError::TransportClosed(format!(
                "wait on stream {} abandoned before settlement",
                self.stream_id
            ))),
        }
    }
}
