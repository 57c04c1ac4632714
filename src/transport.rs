//! Session Abstraction Layer
//!
//! The query/response protocol only needs a narrow view of the secure, multiplexed
//! transport underneath it: open a stream, queue bytes on it, flush, observe an
//! ordered feed of events, close. [`SecureSession`] is that view. The QUIC binding
//! lives in [`crate::quic`], an in-process loopback in [`crate::memory`].

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::net::SocketAddr;

/// DoQ application error code: no error, the session is done
pub const DOQ_NO_ERROR: u32 = 0x0;
/// DoQ application error code: local failure unrelated to the peer
pub const DOQ_INTERNAL_ERROR: u32 = 0x1;
/// DoQ application error code: the peer broke the exchange rules
pub const DOQ_PROTOCOL_ERROR: u32 = 0x2;
/// DoQ application error code: the outstanding request was abandoned
pub const DOQ_REQUEST_CANCELLED: u32 = 0x3;

/// Session-unique stream identifier, allocated by whichever side opens the stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u64);

impl StreamId {
    /// Raw identifier
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for StreamId {
    fn from(value: u64) -> Self {
        StreamId(value)
    }
}

/// Event delivered by a session, in order per stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Bytes arrived on a stream. With `end_stream` the peer finished sending on it.
    DataReceived {
        stream_id: StreamId,
        data: Bytes,
        end_stream: bool,
    },

    /// A stream ended without delivering its data (reset by the peer, or stopped
    /// locally for exceeding the payload limit). The session stays open.
    StreamFailed { stream_id: StreamId, reason: String },

    /// The session ended in an orderly way
    Closed { reason: String },

    /// The session ended abruptly (reset, idle timeout, network loss)
    Error { reason: String },
}

impl SessionEvent {
    /// Whether this event ends the session
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed { .. } | Self::Error { .. })
    }
}

/// Why the local side is closing a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The exchange finished normally
    Completed,
    /// The waiting caller gave up
    Cancelled,
    /// The exchange failed locally
    Failed,
}

impl CloseReason {
    /// Application error code sent to the peer
    pub fn code(self) -> u32 {
        match self {
            CloseReason::Completed => DOQ_NO_ERROR,
            CloseReason::Cancelled => DOQ_REQUEST_CANCELLED,
            CloseReason::Failed => DOQ_INTERNAL_ERROR,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::Completed => "completed",
            CloseReason::Cancelled => "cancelled",
            CloseReason::Failed => "failed",
        }
    }
}

/// Session-level failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("session closed: {0}")]
    Closed(String),

    #[error("unknown stream {0}")]
    UnknownStream(StreamId),

    #[error("stream {0} already finished")]
    StreamFinished(StreamId),

    #[error("write on stream {stream_id} failed: {reason}")]
    StreamWrite { stream_id: StreamId, reason: String },
}

/// An established secure session between one client and one server
#[async_trait]
pub trait SecureSession: Send {
    /// Remote peer address
    fn peer(&self) -> SocketAddr;

    /// Negotiated application protocol, if any
    fn alpn(&self) -> Option<&[u8]>;

    /// Allocate a new locally initiated bidirectional stream
    async fn open_stream(&mut self) -> Result<StreamId, TransportError>;

    /// Queue bytes on a stream. Nothing reaches the peer before [`transmit`](Self::transmit).
    /// `end_stream` closes the local send direction.
    fn send_stream_data(
        &mut self,
        stream_id: StreamId,
        data: Bytes,
        end_stream: bool,
    ) -> Result<(), TransportError>;

    /// Flush queued writes to the peer
    async fn transmit(&mut self) -> Result<(), TransportError>;

    /// Next event, or `None` once the session is closed
    async fn next_event(&mut self) -> Option<SessionEvent>;

    /// Next event if one is already available
    fn try_next_event(&mut self) -> Option<SessionEvent>;

    /// Terminate the session. No events are delivered afterwards.
    async fn close(&mut self, reason: CloseReason);

    /// Whether the session has ended, locally or by the peer
    fn is_closed(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_reason_codes() {
        assert_eq!(CloseReason::Completed.code(), DOQ_NO_ERROR);
        assert_eq!(CloseReason::Cancelled.code(), DOQ_REQUEST_CANCELLED);
        assert_eq!(CloseReason::Failed.code(), DOQ_INTERNAL_ERROR);
    }

    #[test]
    fn test_terminal_events() {
        let data = SessionEvent::DataReceived {
            stream_id: StreamId(0),
            data: Bytes::from_static(b"x"),
            end_stream: true,
        };
        assert!(!data.is_terminal());
        let failed = SessionEvent::StreamFailed {
            stream_id: StreamId(0),
            reason: "reset by peer".into(),
        };
        assert!(!failed.is_terminal());
        assert!(SessionEvent::Closed { reason: "bye".into() }.is_terminal());
        assert!(SessionEvent::Error { reason: "reset".into() }.is_terminal());
    }
}
