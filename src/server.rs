//! Tokio-based relay server
//!
//! Accepts client connections, dials the fixed upstream target for each one,
//! runs the optional setup hook and hands the resulting pair to two copy
//! loops. The accept loop never waits on a connection.

use crate::filter::{ByteFilter, ConnectionSetupHook, FilterFactory};
use crate::transport::{ConnectionGauge, ConnectionPair, PairHandle};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Errors raised by the relay engine.
///
/// Only `Bind` is fatal to the process; everything else is scoped to one
/// connection and is logged by the accept loop.
#[derive(Error, Debug)]
pub enum RelayError {
    /// The listening socket could not be bound.
    #[error("Failed to bind listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    /// The upstream target could not be reached.
    #[error("Failed to connect to upstream {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },
    /// The connection setup hook failed on the upstream connection.
    #[error("Upstream connection setup failed: {0}")]
    Setup(#[source] io::Error),
    /// Any other socket error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Immutable relay settings, shared by every connection
#[derive(Clone)]
pub struct RelayConfig {
    listen_addr: String,
    target_addr: String,
    request_filter: Option<Arc<dyn FilterFactory>>,
    response_filter: Option<Arc<dyn FilterFactory>>,
    setup_hook: Option<Arc<dyn ConnectionSetupHook>>,
}

impl RelayConfig {
    /// Relay from `listen_addr` to `target_addr` with no filters and no setup hook.
    pub fn new(listen_addr: impl Into<String>, target_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            target_addr: target_addr.into(),
            request_filter: None,
            response_filter: None,
            setup_hook: None,
        }
    }

    /// Filter applied to bytes flowing from the client to the upstream.
    pub fn with_request_filter(mut self, factory: impl FilterFactory + 'static) -> Self {
        self.request_filter = Some(Arc::new(factory));
        self
    }

    /// Filter applied to bytes flowing from the upstream to the client.
    pub fn with_response_filter(mut self, factory: impl FilterFactory + 'static) -> Self {
        self.response_filter = Some(Arc::new(factory));
        self
    }

    /// Hook run on every upstream connection before relaying starts.
    pub fn with_setup_hook(mut self, hook: impl ConnectionSetupHook + 'static) -> Self {
        self.setup_hook = Some(Arc::new(hook));
        self
    }

    pub fn listen_addr(&self) -> &str {
        &self.listen_addr
    }

    pub fn target_addr(&self) -> &str {
        &self.target_addr
    }

    fn request_filter(&self) -> Option<Box<dyn ByteFilter>> {
        self.request_filter.as_ref().map(|factory| factory.new_filter())
    }

    fn response_filter(&self) -> Option<Box<dyn ByteFilter>> {
        self.response_filter.as_ref().map(|factory| factory.new_filter())
    }
}

impl fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayConfig")
            .field("listen_addr", &self.listen_addr)
            .field("target_addr", &self.target_addr)
            .field("request_filter", &self.request_filter.is_some())
            .field("response_filter", &self.response_filter.is_some())
            .field("setup_hook", &self.setup_hook.is_some())
            .finish()
    }
}

/// Relay server instance
///
/// Cloning is cheap; clones share the configuration, the shutdown signal and
/// the set of running connection tasks.
#[derive(Debug, Clone)]
pub struct Server {
    /// Relay configuration
    config: Arc<RelayConfig>,
    /// Cancelled to stop accepting and close every active pair
    shutdown: CancellationToken,
    /// Every connection and copy-loop task
    tracker: TaskTracker,
    /// Pairs currently relaying
    gauge: ConnectionGauge,
    /// Source of connection ids for logging
    next_id: Arc<AtomicU64>,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config: Arc::new(config),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            gauge: ConnectionGauge::default(),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Token that stops the server when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Number of connection pairs still relaying.
    pub fn active_connections(&self) -> usize {
        self.gauge.get()
    }

    /// Bind the configured listen address and run the accept loop.
    pub async fn listen_and_serve(&self) -> Result<(), RelayError> {
        let addr = self.config.listen_addr();
        let listener = TcpListener::bind(addr).await.map_err(|source| RelayError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        info!("Listening on {}, relaying to {}", addr, self.config.target_addr());
        self.serve(listener).await
    }

    /// Accept connections from `listener` until the server is shut down.
    ///
    /// Accept errors are logged and skipped.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RelayError> {
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown signal received, stopping listener");
                    break;
                }
                result = listener.accept() => {
                    let (socket, peer_addr) = match result {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("Failed to accept connection: {}", e);
                            continue;
                        }
                    };
                    debug!("Accepted connection from {}", peer_addr);

                    let server = self.clone();
                    self.tracker.spawn(async move {
                        if let Err(e) = server.handle_connection(socket, peer_addr).await {
                            warn!("Connection from {} abandoned: {}", peer_addr, e);
                        }
                    });
                }
            }
        }

        Ok(())
    }

    /// Dial the upstream for `client`, run the setup hook and start relaying.
    ///
    /// Returns as soon as both copy loops are spawned. On error `client` is
    /// dropped, which closes it.
    pub async fn handle_connection(
        &self,
        client: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), RelayError> {
        let target = self.config.target_addr();
        let mut upstream = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Ok(()),
            result = TcpStream::connect(target) => result.map_err(|source| RelayError::Dial {
                addr: target.to_string(),
                source,
            })?,
        };

        if let Some(hook) = &self.config.setup_hook {
            hook.setup(&mut upstream).await.map_err(RelayError::Setup)?;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = PairHandle::new(id, &self.shutdown);
        let pair = ConnectionPair::new(client, upstream, peer_addr, handle);
        // Totals are logged by the pair task itself
        let _ = pair.spawn(
            &self.tracker,
            &self.gauge,
            self.config.request_filter(),
            self.config.response_filter(),
        );

        Ok(())
    }

    /// Wait for every connection task to finish.
    ///
    /// Usually called after cancelling [`Server::shutdown_token`].
    pub async fn wait_for_connections(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::RELAY_BUFFER_SIZE;
    use crate::filter::{AsciiUppercase, SetupFuture};
    use crate::protocol::{ProxyHeader, ProxyHeaderHook};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::oneshot;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    /// Upstream that echoes every connection back to itself
    async fn echo_upstream() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let (mut read, mut write) = socket.split();
                    let _ = tokio::io::copy(&mut read, &mut write).await;
                });
            }
        });
        addr
    }

    /// Address nothing is listening on
    async fn dead_upstream() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    async fn start(
        config: impl FnOnce(String) -> RelayConfig,
    ) -> (Server, SocketAddr, JoinHandle<Result<(), RelayError>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Server::new(config(addr.to_string()));
        let running = server.clone();
        let task = tokio::spawn(async move { running.serve(listener).await });
        (server, addr, task)
    }

    async fn assert_closed(stream: &mut TcpStream) {
        let mut buf = [0u8; 16];
        match timeout(WAIT, stream.read(&mut buf)).await {
            Ok(Ok(0)) | Ok(Err(_)) => {}
            Ok(Ok(n)) => panic!("Expected closed connection, read {} bytes", n),
            Err(_) => panic!("Connection was not closed in time"),
        }
    }

    async fn roundtrip(stream: &mut TcpStream, payload: &[u8]) -> Vec<u8> {
        stream.write_all(payload).await.unwrap();
        let mut received = vec![0u8; payload.len()];
        timeout(WAIT, stream.read_exact(&mut received)).await.unwrap().unwrap();
        received
    }

    #[tokio::test]
    async fn test_relays_bytes_unchanged() {
        let upstream = echo_upstream().await;
        let (_server, addr, _task) =
            start(|listen| RelayConfig::new(listen, upstream.to_string())).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        let received = roundtrip(&mut client, b"GET / HTTP/1.1\r\n\r\n").await;
        assert_eq!(received, b"GET / HTTP/1.1\r\n\r\n");
    }

    #[tokio::test]
    async fn test_request_filter_rewrites_upstream_bytes() {
        let upstream = echo_upstream().await;
        let (_server, addr, _task) = start(|listen| {
            RelayConfig::new(listen, upstream.to_string()).with_request_filter(|| AsciiUppercase)
        })
        .await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        assert_eq!(roundtrip(&mut client, b"hello, relay").await, b"HELLO, RELAY");
    }

    #[tokio::test]
    async fn test_response_filter_rewrites_client_bytes() {
        let upstream = echo_upstream().await;
        let (_server, addr, _task) = start(|listen| {
            RelayConfig::new(listen, upstream.to_string()).with_response_filter(|| {
                |chunk: &mut Vec<u8>| chunk.reverse()
            })
        })
        .await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        assert_eq!(roundtrip(&mut client, b"abc").await, b"cba");
    }

    #[tokio::test]
    async fn test_request_filter_can_grow_chunks() {
        let upstream = echo_upstream().await;
        let (_server, addr, _task) = start(|listen| {
            RelayConfig::new(listen, upstream.to_string())
                .with_request_filter(|| |chunk: &mut Vec<u8>| chunk.extend_from_slice(b"+"))
        })
        .await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"abc").await.unwrap();
        let mut received = [0u8; 4];
        timeout(WAIT, client.read_exact(&mut received)).await.unwrap().unwrap();
        assert_eq!(&received, b"abc+");
    }

    #[tokio::test]
    async fn test_payloads_larger_than_read_buffer_are_relayed_intact() {
        let upstream = echo_upstream().await;
        let (_server, addr, _task) =
            start(|listen| RelayConfig::new(listen, upstream.to_string())).await;

        let sizes = [
            1,
            RELAY_BUFFER_SIZE - 1,
            RELAY_BUFFER_SIZE,
            RELAY_BUFFER_SIZE + 1,
            1_000_000,
        ];
        for size in sizes {
            let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            let client = TcpStream::connect(addr).await.unwrap();
            let (mut read, mut write) = client.into_split();

            // The client keeps its write side open: end of stream would tear the pair down
            // before the echo is back.
            let outgoing = payload.clone();
            let writer = tokio::spawn(async move {
                write.write_all(&outgoing).await.unwrap();
                write
            });

            let mut received = vec![0u8; size];
            timeout(WAIT, read.read_exact(&mut received)).await.unwrap().unwrap();
            let _write = writer.await.unwrap();

            assert_eq!(received.len(), size);
            assert!(received == payload, "payload of {} bytes was altered", size);
        }
    }

    #[tokio::test]
    async fn test_proxy_header_precedes_payload() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = vec![0u8; 28 + 4];
            socket.read_exact(&mut received).await.unwrap();
            let _ = tx.send(received);
        });

        let header = ProxyHeader::tcp(
            "10.0.0.1:1234".parse().unwrap(),
            "10.0.0.2:80".parse().unwrap(),
        );
        let expected = header.clone();
        let (_server, addr, _task) = start(move |listen| {
            RelayConfig::new(listen, upstream.to_string())
                .with_setup_hook(ProxyHeaderHook::new(header))
        })
        .await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"ping").await.unwrap();

        let received = timeout(WAIT, rx).await.unwrap().unwrap();
        let (parsed, consumed) = ProxyHeader::parse(&received).unwrap();
        assert_eq!(consumed, 28);
        assert_eq!(parsed, expected);
        assert_eq!(&received[consumed..], b"ping");
    }

    #[tokio::test]
    async fn test_upstream_close_tears_down_pair() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            socket.read_exact(&mut buf).await.unwrap();
            // Hang up mid-relay.
            drop(socket);
        });

        let (server, addr, _task) =
            start(|listen| RelayConfig::new(listen, upstream.to_string())).await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"hello").await.unwrap();

        assert_closed(&mut client).await;

        timeout(WAIT, async {
            while server.active_connections() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("copy loops did not finish");
    }

    #[tokio::test]
    async fn test_connections_do_not_share_filter_state() {
        let upstream = echo_upstream().await;
        // Upper-cases only the first chunk seen on each connection.
        let (_server, addr, _task) = start(|listen| {
            RelayConfig::new(listen, upstream.to_string()).with_request_filter(|| {
                let mut first = true;
                move |chunk: &mut Vec<u8>| {
                    if std::mem::take(&mut first) {
                        chunk.make_ascii_uppercase();
                    }
                }
            })
        })
        .await;

        let mut a = TcpStream::connect(addr).await.unwrap();
        let mut b = TcpStream::connect(addr).await.unwrap();

        assert_eq!(roundtrip(&mut a, b"abc").await, b"ABC");
        assert_eq!(roundtrip(&mut b, b"def").await, b"DEF");
        assert_eq!(roundtrip(&mut a, b"ghi").await, b"ghi");
        assert_eq!(roundtrip(&mut b, b"jkl").await, b"jkl");
    }

    #[tokio::test]
    async fn test_dial_failure_closes_client_and_keeps_accepting() {
        let upstream = dead_upstream().await;
        let (_server, addr, task) =
            start(|listen| RelayConfig::new(listen, upstream.to_string())).await;

        let mut first = TcpStream::connect(addr).await.unwrap();
        assert_closed(&mut first).await;

        let mut second = TcpStream::connect(addr).await.unwrap();
        assert_closed(&mut second).await;

        assert!(!task.is_finished());
    }

    struct FailingHook;

    impl ConnectionSetupHook for FailingHook {
        fn setup<'a>(&'a self, upstream: &'a mut TcpStream) -> SetupFuture<'a> {
            Box::pin(async move {
                upstream.shutdown().await?;
                Err(io::Error::new(io::ErrorKind::Other, "setup refused"))
            })
        }
    }

    #[tokio::test]
    async fn test_setup_hook_failure_closes_client() {
        let upstream = echo_upstream().await;
        let (server, addr, _task) = start(|listen| {
            RelayConfig::new(listen, upstream.to_string()).with_setup_hook(FailingHook)
        })
        .await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        let _ = client.write_all(b"never relayed").await;
        assert_closed(&mut client).await;
        assert_eq!(server.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_stops_listener_and_closes_pairs() {
        let upstream = echo_upstream().await;
        let (server, addr, task) =
            start(|listen| RelayConfig::new(listen, upstream.to_string())).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        assert_eq!(roundtrip(&mut client, b"before").await, b"before");
        assert_eq!(server.active_connections(), 1);

        server.shutdown_token().cancel();

        let result = timeout(WAIT, task).await.unwrap().unwrap();
        assert!(result.is_ok());
        assert_closed(&mut client).await;
        timeout(WAIT, server.wait_for_connections()).await.unwrap();
        assert_eq!(server.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = occupied.local_addr().unwrap();

        let server = Server::new(RelayConfig::new(addr.to_string(), "127.0.0.1:80"));
        let result = server.listen_and_serve().await;
        assert!(matches!(result, Err(RelayError::Bind { .. })));
    }

    #[test]
    fn test_relay_config_debug_hides_hooks() {
        let config =
            RelayConfig::new("0.0.0.0:4444", "127.0.0.1:80").with_request_filter(|| AsciiUppercase);
        let debug = format!("{:?}", config);
        assert!(debug.contains("request_filter: true"));
        assert!(debug.contains("setup_hook: false"));
    }
}
