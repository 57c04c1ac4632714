//! QUIC Session Implementation
//!
//! Binds [`SecureSession`] to a quinn connection. Every bidirectional stream's
//! receive half is read to its end on its own task and surfaces as a single
//! `DataReceived` event, or as `StreamFailed` when the peer resets it or it
//! outgrows the payload limit; a watcher task reports the connection ending. Writes are
//! queued by `send_stream_data` and only hit the wire on `transmit`.

use crate::transport::{
    CloseReason, SecureSession, SessionEvent, StreamId, TransportError, DOQ_PROTOCOL_ERROR,
    DOQ_REQUEST_CANCELLED,
};
use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, warn};
use quinn::{
    Connection, ConnectionError, ReadError, ReadToEndError, RecvStream, SendStream, VarInt,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};

/// Largest query or response accepted on a stream (DoQ messages are length-limited to 16 bits)
pub const DEFAULT_MAX_PAYLOAD: usize = 65_535;

/// Which side of the connection a session is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Transport parameters shared by client and server endpoints
pub fn transport_config(
    idle_timeout: Duration,
    role: Role,
) -> Result<Arc<quinn::TransportConfig>, crate::ExchangeError> {
    let idle = quinn::IdleTimeout::try_from(idle_timeout).map_err(|e| {
        crate::ExchangeError::InvalidConfig(format!("idle timeout {:?}: {}", idle_timeout, e))
    })?;

    let mut transport = quinn::TransportConfig::default();
    transport.max_idle_timeout(Some(idle));
    // Queries only travel on client-initiated bidirectional streams
    transport.max_concurrent_uni_streams(0u32.into());
    if role == Role::Client {
        transport.max_concurrent_bidi_streams(0u32.into());
    }

    Ok(Arc::new(transport))
}

enum Inbound {
    Stream { stream_id: StreamId, send: SendStream },
    /// Receive half failed; the send half is reset with `code`
    StreamFailed {
        stream_id: StreamId,
        code: u32,
        reason: String,
    },
    Event(SessionEvent),
}

struct QueuedWrite {
    stream_id: StreamId,
    data: Bytes,
    end_stream: bool,
}

/// A quinn connection seen as a [`SecureSession`]
pub struct QuicSession {
    connection: Connection,
    peer: SocketAddr,
    alpn: Option<Vec<u8>>,
    max_payload: usize,
    send_streams: HashMap<StreamId, SendStream>,
    queued: Vec<QueuedWrite>,
    events_tx: UnboundedSender<Inbound>,
    events: UnboundedReceiver<Inbound>,
    closed: bool,
}

impl QuicSession {
    /// Wrap an established client connection
    pub fn client(connection: Connection, max_payload: usize) -> Self {
        Self::new(connection, max_payload, Role::Client)
    }

    /// Wrap an accepted server connection; peer-opened streams are picked up automatically
    pub fn server(connection: Connection, max_payload: usize) -> Self {
        Self::new(connection, max_payload, Role::Server)
    }

    fn new(connection: Connection, max_payload: usize, role: Role) -> Self {
        let (events_tx, events) = mpsc::unbounded_channel();

        let alpn = connection
            .handshake_data()
            .and_then(|data| data.downcast::<quinn::crypto::rustls::HandshakeData>().ok())
            .and_then(|data| data.protocol);

        spawn_close_watcher(connection.clone(), events_tx.clone());
        if role == Role::Server {
            spawn_acceptor(connection.clone(), events_tx.clone(), max_payload);
        }

        Self {
            peer: connection.remote_address(),
            connection,
            alpn,
            max_payload,
            send_streams: HashMap::new(),
            queued: Vec::new(),
            events_tx,
            events,
            closed: false,
        }
    }

    /// Underlying quinn connection
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    fn accept(&mut self, inbound: Inbound) -> Option<SessionEvent> {
        match inbound {
            Inbound::Stream { stream_id, send } => {
                self.send_streams.insert(stream_id, send);
                None
            }
            Inbound::StreamFailed {
                stream_id,
                code,
                reason,
            } => {
                self.queued.retain(|write| write.stream_id != stream_id);
                if let Some(mut send) = self.send_streams.remove(&stream_id) {
                    // Already finished or reset by the peer: nothing left to abort
                    let _ = send.reset(VarInt::from_u32(code));
                }
                Some(SessionEvent::StreamFailed { stream_id, reason })
            }
            Inbound::Event(event) => {
                if event.is_terminal() {
                    self.closed = true;
                }
                Some(event)
            }
        }
    }

    async fn write_queued(&mut self, write: QueuedWrite) -> Result<(), TransportError> {
        let stream_id = write.stream_id;
        let send = self
            .send_streams
            .get_mut(&stream_id)
            .ok_or(TransportError::UnknownStream(stream_id))?;

        send.write_all(&write.data)
            .await
            .map_err(|e| TransportError::StreamWrite {
                stream_id,
                reason: e.to_string(),
            })?;

        if write.end_stream {
            // Finished streams are terminal: drop the send half
            if let Some(mut send) = self.send_streams.remove(&stream_id) {
                send.finish().map_err(|e| TransportError::StreamWrite {
                    stream_id,
                    reason: e.to_string(),
                })?;
            }
        }
        Ok(())
    }
}

fn stream_id(id: quinn::StreamId) -> StreamId {
    StreamId(VarInt::from(id).into_inner())
}

fn spawn_close_watcher(connection: Connection, events: UnboundedSender<Inbound>) {
    tokio::spawn(async move {
        let event = match connection.closed().await {
            ConnectionError::LocallyClosed => return,
            e @ (ConnectionError::ApplicationClosed(_) | ConnectionError::ConnectionClosed(_)) => {
                SessionEvent::Closed {
                    reason: e.to_string(),
                }
            }
            e => SessionEvent::Error {
                reason: e.to_string(),
            },
        };
        let _ = events.send(Inbound::Event(event));
    });
}

fn spawn_acceptor(connection: Connection, events: UnboundedSender<Inbound>, max_payload: usize) {
    tokio::spawn(async move {
        loop {
            let (send, recv) = match connection.accept_bi().await {
                Ok(streams) => streams,
                Err(e) => {
                    debug!("Stopped accepting streams from {}: {}", connection.remote_address(), e);
                    break;
                }
            };

            let id = stream_id(send.id());
            if events.send(Inbound::Stream { stream_id: id, send }).is_err() {
                break;
            }
            spawn_reader(id, recv, events.clone(), max_payload);
        }
    });
}

fn spawn_reader(
    stream_id: StreamId,
    mut recv: RecvStream,
    events: UnboundedSender<Inbound>,
    max_payload: usize,
) {
    tokio::spawn(async move {
        match recv.read_to_end(max_payload).await {
            Ok(data) => {
                let _ = events.send(Inbound::Event(SessionEvent::DataReceived {
                    stream_id,
                    data: Bytes::from(data),
                    end_stream: true,
                }));
            }
            Err(ReadToEndError::TooLong) => {
                warn!(
                    "Stream {} exceeded {} bytes, stopping it",
                    stream_id, max_payload
                );
                let _ = recv.stop(VarInt::from_u32(DOQ_PROTOCOL_ERROR));
                let _ = events.send(Inbound::StreamFailed {
                    stream_id,
                    code: DOQ_PROTOCOL_ERROR,
                    reason: format!("payload exceeds {} bytes", max_payload),
                });
            }
            Err(ReadToEndError::Read(ReadError::ConnectionLost(e))) => {
                // Reported by the close watcher
                debug!("Stream {} ended with the connection: {}", stream_id, e);
            }
            Err(ReadToEndError::Read(e)) => {
                debug!("Stream {} ended without data: {}", stream_id, e);
                let _ = events.send(Inbound::StreamFailed {
                    stream_id,
                    code: DOQ_REQUEST_CANCELLED,
                    reason: e.to_string(),
                });
            }
        }
    });
}

#[async_trait]
impl SecureSession for QuicSession {
    fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn alpn(&self) -> Option<&[u8]> {
        self.alpn.as_deref()
    }

    async fn open_stream(&mut self) -> Result<StreamId, TransportError> {
        if self.closed {
            return Err(TransportError::Closed("session already closed".into()));
        }

        let (send, recv) = self
            .connection
            .open_bi()
            .await
            .map_err(|e| TransportError::Closed(e.to_string()))?;

        let id = stream_id(send.id());
        self.send_streams.insert(id, send);
        spawn_reader(id, recv, self.events_tx.clone(), self.max_payload);
        Ok(id)
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
        if self
            .queued
            .iter()
            .any(|write| write.stream_id == stream_id && write.end_stream)
        {
            return Err(TransportError::StreamFinished(stream_id));
        }
        if !self.send_streams.contains_key(&stream_id) {
            return Err(TransportError::UnknownStream(stream_id));
        }

        self.queued.push(QueuedWrite {
            stream_id,
            data,
            end_stream,
        });
        Ok(())
    }

    async fn transmit(&mut self) -> Result<(), TransportError> {
        let mut first_error = None;

        for write in std::mem::take(&mut self.queued) {
            if let Err(e) = self.write_queued(write).await {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn next_event(&mut self) -> Option<SessionEvent> {
        while !self.closed {
            let inbound = self.events.recv().await?;
            if let Some(event) = self.accept(inbound) {
                return Some(event);
            }
        }
        None
    }

    fn try_next_event(&mut self) -> Option<SessionEvent> {
        while !self.closed {
            match self.events.try_recv() {
                Ok(inbound) => {
                    if let Some(event) = self.accept(inbound) {
                        return Some(event);
                    }
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return None,
            }
        }
        None
    }

    async fn close(&mut self, reason: CloseReason) {
        self.closed = true;
        self.queued.clear();
        self.send_streams.clear();
        self.connection
            .close(VarInt::from_u32(reason.code()), reason.as_str().as_bytes());
        self.events.close();
        debug!("Closed session with {} ({})", self.peer, reason.as_str());
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for QuicSession {
    fn drop(&mut self) {
        if !self.closed {
            // Releases the background tasks' connection handles too
            self.connection.close(
                VarInt::from_u32(CloseReason::Cancelled.code()),
                CloseReason::Cancelled.as_str().as_bytes(),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_transport_refuses_peer_streams() {
        assert!(transport_config(Duration::from_secs(30), Role::Client).is_ok());
        assert!(transport_config(Duration::from_secs(30), Role::Server).is_ok());
    }

    #[test]
    fn test_idle_timeout_out_of_range() {
        let err = transport_config(Duration::from_secs(u64::MAX / 1000), Role::Client).unwrap_err();
        assert!(matches!(err, crate::ExchangeError::InvalidConfig(_)));
    }

    #[test]
    fn test_stream_id_conversion() {
        // Client-initiated bidirectional streams are 0, 4, 8, ...
        let id = quinn::StreamId::new(quinn::Side::Client, quinn::Dir::Bi, 2);
        assert_eq!(stream_id(id), StreamId(8));
    }
}
