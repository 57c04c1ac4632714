//! End-to-end exchanges over QUIC on loopback

use async_trait::async_trait;
use bytes::Bytes;
use doq_exchange::certgen::{self, CertParams, WrittenFiles};
use doq_exchange::{
    tls, ClientConfig, CloseReason, DoqClient, DoqServer, EchoResponse, ExchangeError,
    ExchangeState, QueryCoordinator, QuicSession, ResponseMode, ResponsePolicy, SecureSession,
    ServerConfig, SessionEvent, StreamId, TransportError, DEFAULT_RESPONSE,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

struct TestServer {
    addr: SocketAddr,
    files: WrittenFiles,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
    _dir: TempDir,
}

impl TestServer {
    async fn start<P: ResponsePolicy>(policy: P, retry: bool) -> Self {
        Self::start_with(policy, |config| config.retry = retry).await
    }

    async fn start_with<P: ResponsePolicy>(
        policy: P,
        configure: impl FnOnce(&mut ServerConfig),
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let files = certgen::generate(&CertParams::default())
            .unwrap()
            .write_to(dir.path())
            .unwrap();

        let mut config = ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            certificate: files.certificate.clone(),
            private_key: Some(files.private_key.clone()),
            ..ServerConfig::default()
        };
        configure(&mut config);

        let server = DoqServer::bind(&config, policy).await.unwrap();
        let addr = server.local_addr().unwrap();
        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            server
                .run_until(async {
                    let _ = stopped.await;
                })
                .await
                .unwrap();
        });

        Self {
            addr,
            files,
            stop: Some(stop),
            task,
            _dir: dir,
        }
    }

    fn client_config(&self) -> ClientConfig {
        ClientConfig {
            host: "127.0.0.1".into(),
            port: self.addr.port(),
            server_name: Some("localhost".into()),
            ca_certs: Some(self.files.certificate.clone()),
            ..ClientConfig::default()
        }
    }

    async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        let _ = tokio::time::timeout(Duration::from_secs(5), self.task).await;
    }
}

#[tokio::test]
async fn test_hello_gets_fixed_response() {
    let server = TestServer::start(ResponseMode::default(), false).await;
    let client = DoqClient::new(server.client_config()).unwrap();

    let response = client.query("Hello server").await.unwrap();
    assert_eq!(response, Bytes::from_static(DEFAULT_RESPONSE.as_bytes()));

    client.wait_idle().await;
    server.stop().await;
}

#[tokio::test]
async fn test_echo_round_trip_with_retry() {
    let server = TestServer::start(EchoResponse, true).await;
    let client = DoqClient::new(server.client_config()).unwrap();

    let payload = Bytes::from(vec![0u8, 1, 2, 0xff, 0xfe]);
    let response = client.query(payload.clone()).await.unwrap();
    assert_eq!(response, payload);

    server.stop().await;
}

#[tokio::test]
async fn test_each_query_gets_a_fresh_session() {
    let server = TestServer::start(EchoResponse, false).await;
    let client = DoqClient::new(server.client_config()).unwrap();

    for i in 0..3 {
        let query = format!("query {}", i);
        let response = client.query(query.clone()).await.unwrap();
        assert_eq!(response, Bytes::from(query));
    }

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_sessions_are_isolated() {
    let server = TestServer::start(EchoResponse, false).await;
    let client = Arc::new(DoqClient::new(server.client_config()).unwrap());

    let exchanges = (0..50).map(|i| {
        let client = client.clone();
        async move {
            let query = format!("q{}", i);
            let response = client.query(query.clone()).await;
            (query, response)
        }
    });

    let results = futures::future::join_all(exchanges).await;
    assert_eq!(results.len(), 50);
    for (query, response) in results {
        assert_eq!(response.unwrap(), Bytes::from(query));
    }

    server.stop().await;
}

#[tokio::test]
async fn test_query_dependent_policy() {
    let policy = |query: &[u8]| Bytes::from(format!("{} bytes", query.len()));
    let server = TestServer::start(policy, false).await;
    let client = DoqClient::new(server.client_config()).unwrap();

    let response = client.query("abcd").await.unwrap();
    assert_eq!(response, Bytes::from_static(b"4 bytes"));

    server.stop().await;
}

#[tokio::test]
async fn test_untrusted_certificate_is_transport_closed() {
    let server = TestServer::start(ResponseMode::default(), false).await;

    // Trust a certificate other than the server's
    let other = tempfile::tempdir().unwrap();
    let other_files = certgen::generate(&CertParams::default())
        .unwrap()
        .write_to(other.path())
        .unwrap();

    let mut config = server.client_config();
    config.ca_certs = Some(other_files.certificate);
    let client = DoqClient::new(config).unwrap();

    let result = client.query("Hello server").await;
    assert!(matches!(result, Err(ExchangeError::TransportClosed(_))));

    server.stop().await;
}

#[tokio::test]
async fn test_alpn_mismatch_is_transport_closed() {
    let server = TestServer::start(ResponseMode::default(), false).await;

    let mut config = server.client_config();
    config.alpn = "h3".into();
    let client = DoqClient::new(config).unwrap();

    let result = client.query("Hello server").await;
    assert!(matches!(result, Err(ExchangeError::TransportClosed(_))));

    server.stop().await;
}

#[tokio::test]
async fn test_unreachable_server_times_out() {
    // Bound but silent: handshake packets go nowhere
    let silent = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let port = silent.local_addr().unwrap().port();

    let config = ClientConfig {
        host: "127.0.0.1".into(),
        port,
        insecure: true,
        connect_timeout: Duration::from_millis(300),
        ..ClientConfig::default()
    };
    let client = DoqClient::new(config).unwrap();

    let started = Instant::now();
    let result = client.query("Hello server").await;
    assert!(matches!(result, Err(ExchangeError::TransportClosed(_))));
    assert!(started.elapsed() < Duration::from_secs(5));
}

/// A bare quinn endpoint with the crate's TLS setup, for scripting the server side
fn raw_peer() -> (quinn::Endpoint, WrittenFiles, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let files = certgen::generate(&CertParams::default())
        .unwrap()
        .write_to(dir.path())
        .unwrap();
    let config = ServerConfig {
        certificate: files.certificate.clone(),
        private_key: Some(files.private_key.clone()),
        ..ServerConfig::default()
    };

    let endpoint = quinn::Endpoint::server(
        tls::quic_server_config(&config).unwrap(),
        SocketAddr::from(([127, 0, 0, 1], 0)),
    )
    .unwrap();
    (endpoint, files, dir)
}

fn raw_peer_client(endpoint: &quinn::Endpoint, files: &WrittenFiles) -> DoqClient {
    DoqClient::new(ClientConfig {
        host: "127.0.0.1".into(),
        port: endpoint.local_addr().unwrap().port(),
        server_name: Some("localhost".into()),
        ca_certs: Some(files.certificate.clone()),
        ..ClientConfig::default()
    })
    .unwrap()
}

#[tokio::test]
async fn test_server_closing_early_is_transport_closed() {
    let (endpoint, files, _dir) = raw_peer();
    let client = raw_peer_client(&endpoint, &files);

    // Reads the query, then drops the session without answering
    let peer = tokio::spawn(async move {
        let connection = endpoint.accept().await.unwrap().await.unwrap();
        let (send, mut recv) = connection.accept_bi().await.unwrap();
        let query = recv.read_to_end(1024).await.unwrap();
        connection.close(0x1u32.into(), b"internal error");
        drop(send);
        endpoint.wait_idle().await;
        query
    });

    let result = client.query("Hello server").await;
    assert!(matches!(result, Err(ExchangeError::TransportClosed(_))));
    assert_eq!(peer.await.unwrap(), b"Hello server".to_vec());
}

#[tokio::test]
async fn test_client_closes_with_no_error_after_answer() {
    let (endpoint, files, _dir) = raw_peer();
    let client = raw_peer_client(&endpoint, &files);

    let peer = tokio::spawn(async move {
        let connection = endpoint.accept().await.unwrap().await.unwrap();
        let (mut send, mut recv) = connection.accept_bi().await.unwrap();
        let query = recv.read_to_end(1024).await.unwrap();
        assert_eq!(query, b"Hello server".to_vec());

        send.write_all(DEFAULT_RESPONSE.as_bytes()).await.unwrap();
        send.finish().unwrap();
        connection.closed().await
    });

    let response = client.query("Hello server").await.unwrap();
    assert_eq!(response, Bytes::from_static(DEFAULT_RESPONSE.as_bytes()));

    match tokio::time::timeout(Duration::from_secs(5), peer)
        .await
        .unwrap()
        .unwrap()
    {
        quinn::ConnectionError::ApplicationClosed(close) => {
            assert_eq!(close.error_code, quinn::VarInt::from_u32(0));
            assert_eq!(&close.reason[..], b"completed");
        }
        other => panic!("expected an application close, got {:?}", other),
    }
}

#[tokio::test]
async fn test_oversized_response_fails_fast() {
    let server = TestServer::start(ResponseMode::default(), false).await;

    let mut config = server.client_config();
    config.max_response_size = 4;
    let client = DoqClient::new(config).unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), client.query("Hello server"))
        .await
        .expect("query should settle without waiting for the idle timeout");
    assert!(matches!(result, Err(ExchangeError::TransportClosed(_))));

    server.stop().await;
}

#[tokio::test]
async fn test_oversized_query_fails_fast() {
    let server = TestServer::start_with(EchoResponse, |config| config.max_query_size = 8).await;
    let client = DoqClient::new(server.client_config()).unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), client.query(vec![b'x'; 64]))
        .await
        .expect("query should settle without waiting for the idle timeout");
    assert!(matches!(result, Err(ExchangeError::TransportClosed(_))));

    // The server keeps answering queries within the limit
    let response = client.query("short").await.unwrap();
    assert_eq!(response, Bytes::from_static(b"short"));

    server.stop().await;
}

/// Fires `shutdown` at the moment the response reaches the session, so both
/// are ready when the coordinator next looks
struct ShutdownOnResponse {
    inner: QuicSession,
    held: Option<SessionEvent>,
    fire: Option<oneshot::Sender<()>>,
}

#[async_trait]
impl SecureSession for ShutdownOnResponse {
    fn peer(&self) -> SocketAddr {
        self.inner.peer()
    }

    fn alpn(&self) -> Option<&[u8]> {
        self.inner.alpn()
    }

    async fn open_stream(&mut self) -> Result<StreamId, TransportError> {
        self.inner.open_stream().await
    }

    fn send_stream_data(
        &mut self,
        stream_id: StreamId,
        data: Bytes,
        end_stream: bool,
    ) -> Result<(), TransportError> {
        self.inner.send_stream_data(stream_id, data, end_stream)
    }

    async fn transmit(&mut self) -> Result<(), TransportError> {
        self.inner.transmit().await
    }

    async fn next_event(&mut self) -> Option<SessionEvent> {
        if let Some(event) = self.held.take() {
            return Some(event);
        }

        let event = self.inner.next_event().await?;
        if matches!(event, SessionEvent::DataReceived { .. }) {
            if let Some(fire) = self.fire.take() {
                let _ = fire.send(());
                self.held = Some(event);
                return std::future::pending().await;
            }
        }
        Some(event)
    }

    fn try_next_event(&mut self) -> Option<SessionEvent> {
        self.held.take().or_else(|| self.inner.try_next_event())
    }

    async fn close(&mut self, reason: CloseReason) {
        self.inner.close(reason).await
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

#[tokio::test]
async fn test_response_wins_over_simultaneous_shutdown() {
    let server = TestServer::start(ResponseMode::default(), false).await;
    let client = DoqClient::new(server.client_config()).unwrap();

    let (fire, fired) = oneshot::channel();
    let session = ShutdownOnResponse {
        inner: client.connect().await.unwrap(),
        held: None,
        fire: Some(fire),
    };
    let mut coordinator = QueryCoordinator::new(session);

    let result = coordinator
        .query_until("Hello server", async {
            let _ = fired.await;
        })
        .await;
    assert_eq!(result.unwrap(), Bytes::from_static(DEFAULT_RESPONSE.as_bytes()));
    assert_eq!(coordinator.state(), ExchangeState::Closed);
    assert!(coordinator.session().is_closed());

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_abandoned_sessions_do_not_affect_others() {
    let server = TestServer::start(EchoResponse, false).await;
    let client = Arc::new(DoqClient::new(server.client_config()).unwrap());

    // Full query sent, session dropped before the answer can be written
    let mut abandoned = client.connect().await.unwrap();
    let stream_id = abandoned.open_stream().await.unwrap();
    abandoned
        .send_stream_data(stream_id, Bytes::from_static(b"never read"), true)
        .unwrap();
    abandoned.transmit().await.unwrap();

    // Query left without its end-of-stream marker
    let mut half_sent = client.connect().await.unwrap();
    let partial = half_sent.open_stream().await.unwrap();
    half_sent
        .send_stream_data(partial, Bytes::from_static(b"incompl"), false)
        .unwrap();
    half_sent.transmit().await.unwrap();

    let in_flight = tokio::spawn({
        let client = client.clone();
        async move { client.query("still answered").await }
    });
    drop(abandoned);
    drop(half_sent);

    assert_eq!(
        in_flight.await.unwrap().unwrap(),
        Bytes::from_static(b"still answered")
    );
    assert_eq!(
        client.query("afterwards").await.unwrap(),
        Bytes::from_static(b"afterwards")
    );

    server.stop().await;
}
