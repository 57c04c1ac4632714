//! In-process loopback sessions
//!
//! Two [`MemorySession`]s joined by channels behave like a connected client/server
//! pair: queued writes travel only on `transmit()`, closing one side delivers
//! `Closed` to the other, and [`MemorySession::abort`] drops the link abruptly.

use crate::transport::{CloseReason, SecureSession, SessionEvent, StreamId, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashSet;
use std::net::SocketAddr;
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};

/// Which end of the pair a session is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

/// Connected client/server pair negotiated for `doq`
pub fn pair() -> (MemorySession, MemorySession) {
    pair_with_alpn(b"doq")
}

/// Connected client/server pair negotiated for `alpn`
pub fn pair_with_alpn(alpn: &[u8]) -> (MemorySession, MemorySession) {
    let (to_server, server_inbound) = mpsc::unbounded_channel();
    let (to_client, client_inbound) = mpsc::unbounded_channel();

    let client_addr = SocketAddr::from(([127, 0, 0, 1], 50_000));
    let server_addr = SocketAddr::from(([127, 0, 0, 1], 853));

    let client = MemorySession::new(Side::Client, server_addr, alpn, to_server, client_inbound);
    let server = MemorySession::new(Side::Server, client_addr, alpn, to_client, server_inbound);
    (client, server)
}

/// One end of a loopback session
#[derive(Debug)]
pub struct MemorySession {
    side: Side,
    peer: SocketAddr,
    alpn: Vec<u8>,
    next_stream: u64,
    writable: HashSet<StreamId>,
    finished: HashSet<StreamId>,
    queued: Vec<(StreamId, Bytes, bool)>,
    outbound: Option<UnboundedSender<SessionEvent>>,
    inbound: UnboundedReceiver<SessionEvent>,
    closed: bool,
    close_reason: Option<CloseReason>,
    transmits: usize,
}

impl MemorySession {
    fn new(
        side: Side,
        peer: SocketAddr,
        alpn: &[u8],
        outbound: UnboundedSender<SessionEvent>,
        inbound: UnboundedReceiver<SessionEvent>,
    ) -> Self {
        // QUIC numbering: bit 0 carries the initiator, bit 1 the direction
        let next_stream = match side {
            Side::Client => 0,
            Side::Server => 1,
        };

        Self {
            side,
            peer,
            alpn: alpn.to_vec(),
            next_stream,
            writable: HashSet::new(),
            finished: HashSet::new(),
            queued: Vec::new(),
            outbound: Some(outbound),
            inbound,
            closed: false,
            close_reason: None,
            transmits: 0,
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    /// Reason passed to the local `close()`, if it was called
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
    }

    /// Number of successful `transmit()` calls
    pub fn transmit_count(&self) -> usize {
        self.transmits
    }

    /// Writes waiting for the next `transmit()`
    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    /// Drop the link without a close notification; the peer observes an error
    pub fn abort(&mut self) {
        self.outbound = None;
        self.inbound.close();
        self.closed = true;
    }

    /// Abandon a stream; the peer sees `StreamFailed` for it without a `transmit()`
    pub fn reset_stream(&mut self, stream_id: StreamId, code: u32) -> Result<(), TransportError> {
        let outbound = match (&self.outbound, self.closed) {
            (Some(outbound), false) => outbound,
            _ => return Err(TransportError::Closed("session already closed".into())),
        };

        self.writable.remove(&stream_id);
        self.finished.insert(stream_id);
        self.queued.retain(|(queued, _, _)| *queued != stream_id);
        outbound
            .send(SessionEvent::StreamFailed {
                stream_id,
                reason: format!("reset by peer (code {:#x})", code),
            })
            .map_err(|_| TransportError::Closed("peer went away".into()))
    }

    fn accept(&mut self, event: SessionEvent) -> SessionEvent {
        match &event {
            SessionEvent::DataReceived { stream_id, .. } => {
                if !self.finished.contains(stream_id) {
                    self.writable.insert(*stream_id);
                }
            }
            SessionEvent::StreamFailed { stream_id, .. } => {
                self.writable.remove(stream_id);
                self.finished.insert(*stream_id);
            }
            SessionEvent::Closed { .. } | SessionEvent::Error { .. } => {
                self.closed = true;
                self.outbound = None;
            }
        }
        event
    }

    fn link_lost(&mut self) -> SessionEvent {
        self.closed = true;
        self.outbound = None;
        SessionEvent::Error {
            reason: "loopback link dropped".to_string(),
        }
    }
}

#[async_trait]
impl SecureSession for MemorySession {
    fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn alpn(&self) -> Option<&[u8]> {
        Some(&self.alpn)
    }

    async fn open_stream(&mut self) -> Result<StreamId, TransportError> {
        if self.closed {
            return Err(TransportError::Closed("session already closed".into()));
        }

        let stream_id = StreamId(self.next_stream);
        self.next_stream += 4;
        self.writable.insert(stream_id);
        Ok(stream_id)
    }

    fn send_stream_data(
        &mut self,
        stream_id: StreamId,
        data: Bytes,
        end_stream: bool,
    ) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed("session already closed".into()));
        }
        if self.finished.contains(&stream_id) {
            return Err(TransportError::StreamFinished(stream_id));
        }
        if !self.writable.contains(&stream_id) {
            return Err(TransportError::UnknownStream(stream_id));
        }

        if end_stream {
            self.writable.remove(&stream_id);
            self.finished.insert(stream_id);
        }
        self.queued.push((stream_id, data, end_stream));
        Ok(())
    }

    async fn transmit(&mut self) -> Result<(), TransportError> {
        let outbound = match (&self.outbound, self.closed) {
            (Some(outbound), false) => outbound.clone(),
            _ => return Err(TransportError::Closed("session already closed".into())),
        };

        for (stream_id, data, end_stream) in self.queued.drain(..) {
            outbound
                .send(SessionEvent::DataReceived {
                    stream_id,
                    data,
                    end_stream,
                })
                .map_err(|_| TransportError::Closed("peer went away".into()))?;
        }

        self.transmits += 1;
        Ok(())
    }

    async fn next_event(&mut self) -> Option<SessionEvent> {
        if self.closed {
            return None;
        }

        match self.inbound.recv().await {
            Some(event) => Some(self.accept(event)),
            None => Some(self.link_lost()),
        }
    }

    fn try_next_event(&mut self) -> Option<SessionEvent> {
        if self.closed {
            return None;
        }

        match self.inbound.try_recv() {
            Ok(event) => Some(self.accept(event)),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(self.link_lost()),
        }
    }

    async fn close(&mut self, reason: CloseReason) {
        if self.closed {
            return;
        }

        if let Some(outbound) = self.outbound.take() {
            let _ = outbound.send(SessionEvent::Closed {
                reason: format!("peer closed ({})", reason.as_str()),
            });
        }
        self.inbound.close();
        self.closed = true;
        self.close_reason = Some(reason);
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}
