//! Test harness for gateway integration tests.
//!
//! Provides in-process upstream SOCKS5 relays, scripted in-memory backends,
//! and a gateway handle wired to real TCP listeners.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

use relaygate_gateway::proxy::{
    AddressedStream, Backend, BackendConnector, BackendHandle, BackendPool, BoxedStream,
    ConnectionTracker, Listener, ListenerConfig, ListenerKind, ListenerStats, Proxyer, Target,
};
use relaygate_gateway::ConnectError;

/// Upstream SOCKS5 relay that accepts CONNECT to any target and echoes.
#[allow(dead_code)]
pub struct SocksEchoBackend {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicU64>,
    pub targets: Arc<Mutex<Vec<String>>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl SocksEchoBackend {
    pub async fn spawn() -> io::Result<Self> {
        Self::spawn_on("127.0.0.1:0".parse().unwrap()).await
    }

    pub async fn spawn_on(bind_addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(bind_addr).await?;
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicU64::new(0));
        let targets = Arc::new(Mutex::new(Vec::new()));

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let conn_clone = Arc::clone(&connections);
        let targets_clone = Arc::clone(&targets);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((mut stream, _)) => {
                                conn_clone.fetch_add(1, Ordering::Relaxed);
                                let targets = Arc::clone(&targets_clone);
                                tokio::spawn(async move {
                                    let Ok(target) = serve_socks_handshake(&mut stream).await else {
                                        return;
                                    };
                                    targets.lock().unwrap().push(target);
                                    let mut buf = vec![0u8; 8192];
                                    loop {
                                        match stream.read(&mut buf).await {
                                            Ok(0) | Err(_) => break,
                                            Ok(n) => {
                                                if stream.write_all(&buf[..n]).await.is_err() {
                                                    break;
                                                }
                                            }
                                        }
                                    }
                                });
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            connections,
            targets,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn targets(&self) -> Vec<String> {
        self.targets.lock().unwrap().clone()
    }
}

impl Drop for SocksEchoBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Minimal upstream-side SOCKS5 handshake (NO AUTH, CONNECT).
async fn serve_socks_handshake(stream: &mut TcpStream) -> io::Result<String> {
    let mut greeting = [0u8; 2];
    stream.read_exact(&mut greeting).await?;
    let mut methods = vec![0u8; greeting[1] as usize];
    stream.read_exact(&mut methods).await?;
    stream.write_all(&[5, 0]).await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    let host = match head[3] {
        1 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await?;
            std::net::Ipv4Addr::from(ip).to_string()
        }
        3 => {
            let len = stream.read_u8().await? as usize;
            let mut name = vec![0u8; len];
            stream.read_exact(&mut name).await?;
            String::from_utf8_lossy(&name).into_owned()
        }
        _ => return Err(io::Error::other("unsupported atyp")),
    };
    let port = stream.read_u16().await?;
    stream.write_all(&[5, 0, 0, 1, 0, 0, 0, 0, 0, 0]).await?;
    Ok(format!("{}:{}", host, port))
}

/// Reserve a local port with nothing listening on it.
#[allow(dead_code)]
pub async fn dead_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// Gateway with SOCKS5 and HTTP listeners on ephemeral ports.
#[allow(dead_code)]
pub struct GatewayHandle {
    pub socks_addr: SocketAddr,
    pub http_addr: SocketAddr,
    pub pool: Arc<BackendPool>,
    pub proxyer: Arc<Proxyer>,
    pub tracker: Arc<ConnectionTracker>,
    pub socks_stats: Arc<ListenerStats>,
    pub http_stats: Arc<ListenerStats>,
}

impl GatewayHandle {
    pub async fn spawn(pool: BackendPool, relay_timeout: Duration) -> io::Result<Self> {
        let pool = Arc::new(pool);
        let tracker = Arc::new(ConnectionTracker::new());
        let proxyer = Arc::new(
            Proxyer::new(pool.clone(), Arc::clone(&tracker)).with_relay_timeout(relay_timeout),
        );

        let socks = Listener::bind(
            ListenerConfig::new("127.0.0.1:0".parse().unwrap(), ListenerKind::Socks5),
            Arc::clone(&proxyer),
        )
        .await?;
        let http = Listener::bind(
            ListenerConfig::new("127.0.0.1:0".parse().unwrap(), ListenerKind::Http),
            Arc::clone(&proxyer),
        )
        .await?;

        let socks_addr = socks.local_addr()?;
        let http_addr = http.local_addr()?;
        let socks_stats = socks.stats();
        let http_stats = http.stats();

        tokio::spawn(Arc::new(socks).run());
        tokio::spawn(Arc::new(http).run());

        Ok(Self {
            socks_addr,
            http_addr,
            pool,
            proxyer,
            tracker,
            socks_stats,
            http_stats,
        })
    }

    /// Wait until no connection is tracked any more.
    pub async fn wait_idle(&self) {
        for _ in 0..200 {
            if self.tracker.live_count() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("gateway still has {} live connections", self.tracker.live_count());
    }
}

/// Open a SOCKS5 tunnel through the gateway.
#[allow(dead_code)]
pub async fn socks_client(gateway: SocketAddr, host: &str, port: u16) -> io::Result<TcpStream> {
    let mut stream = TcpStream::connect(gateway).await?;
    stream.write_all(&[5, 1, 0]).await?;
    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice != [5, 0] {
        return Err(io::Error::other("method rejected"));
    }

    let mut request = vec![5, 1, 0, 3, host.len() as u8];
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await?;
    if reply[1] != 0 {
        return Err(io::Error::other(format!("reply code {}", reply[1])));
    }
    Ok(stream)
}

/// What the far end of a scripted backend stream does.
#[derive(Debug, Clone, Copy)]
#[allow(dead_code)]
pub enum RemoteScript {
    /// Read until EOF, then send `n` bytes and close.
    DrainThenReply(usize),
    /// Send `n` bytes and close without reading.
    ReplyAndClose(usize),
    /// Read until EOF, then send back twice as many bytes and close.
    DrainThenDouble,
}

impl RemoteScript {
    async fn run(self, mut remote: DuplexStream) {
        let reply_len = match self {
            RemoteScript::ReplyAndClose(n) => n,
            RemoteScript::DrainThenReply(n) => {
                let mut sink = Vec::new();
                let _ = remote.read_to_end(&mut sink).await;
                n
            }
            RemoteScript::DrainThenDouble => {
                let mut sink = Vec::new();
                let _ = remote.read_to_end(&mut sink).await;
                sink.len() * 2
            }
        };
        let _ = remote.write_all(&vec![b'x'; reply_len]).await;
        let _ = remote.shutdown().await;
    }
}

/// In-memory connector: waits `delay`, then hands out a duplex stream whose
/// far end follows `script`.
#[allow(dead_code)]
pub struct ScriptedConnector {
    pub delay: Duration,
    pub fail: bool,
    pub script: RemoteScript,
    pub backend: Arc<dyn BackendHandle>,
    pub connects: AtomicU64,
}

#[allow(dead_code)]
impl ScriptedConnector {
    pub fn new(backend: Arc<dyn BackendHandle>, script: RemoteScript) -> Self {
        Self {
            delay: Duration::ZERO,
            fail: false,
            script,
            backend,
            connects: AtomicU64::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }
}

#[async_trait]
impl BackendConnector for ScriptedConnector {
    async fn connect(
        &self,
        _target: &Target,
    ) -> Result<(BoxedStream, Arc<dyn BackendHandle>), ConnectError> {
        let n = self.connects.fetch_add(1, Ordering::Relaxed);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            return Err(ConnectError::Rejected {
                backend: self.backend.name().to_string(),
                reason: "scripted failure".to_string(),
            });
        }

        let (local, remote) = tokio::io::duplex(64 * 1024);
        tokio::spawn(self.script.run(remote));
        let stream = AddressedStream::new(
            local,
            format!("10.0.0.1:{}", 40000 + n % 20000),
            "10.0.0.2:1080",
        );
        Ok((Box::new(stream), Arc::clone(&self.backend)))
    }
}

/// Backend handle that records every call.
#[derive(Default)]
#[allow(dead_code)]
pub struct RecordingBackend {
    pub increases: AtomicU64,
    pub decreases: AtomicU64,
    pub in_calls: Mutex<Vec<u64>>,
    pub out_calls: Mutex<Vec<u64>>,
}

impl BackendHandle for RecordingBackend {
    fn name(&self) -> &str {
        "recording"
    }

    fn increase_conn_count(&self) {
        self.increases.fetch_add(1, Ordering::SeqCst);
    }

    fn decrease_conn_count(&self) {
        self.decreases.fetch_add(1, Ordering::SeqCst);
    }

    fn add_in_bytes(&self, bytes: u64) {
        self.in_calls.lock().unwrap().push(bytes);
    }

    fn add_out_bytes(&self, bytes: u64) {
        self.out_calls.lock().unwrap().push(bytes);
    }
}

/// Client side of an in-memory connection, plus the half handed to the gateway.
#[allow(dead_code)]
pub fn client_pair(port: u16) -> (AddressedStream<DuplexStream>, DuplexStream) {
    let (gateway_side, user_side) = tokio::io::duplex(64 * 1024);
    (
        AddressedStream::new(gateway_side, "127.0.0.1:1080", format!("127.0.0.1:{}", port)),
        user_side,
    )
}

#[allow(dead_code)]
pub fn pool_with(backends: Vec<Backend>) -> BackendPool {
    BackendPool::new(backends).with_connect_timeout(Duration::from_millis(500))
}
