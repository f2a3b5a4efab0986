//! TCP listeners for client-facing proxy protocols.
//!
//! A listener accepts connections, runs the protocol handshake for its
//! [`ListenerKind`] to learn the client's target, and hands the connection
//! to the shared [`Proxyer`]. Each connection runs on its own task inside a
//! `connection` span.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn, Instrument};

use super::orchestrator::Proxyer;
use super::{http, socks5};

/// Default maximum concurrent connections per listener.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Default time allowed for a client to finish its handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Client-facing protocol spoken on a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenerKind {
    Socks5,
    Http,
}

impl ListenerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListenerKind::Socks5 => "socks5",
            ListenerKind::Http => "http",
        }
    }
}

/// Failure while reading a client's proxy request.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("unsupported protocol version {0:#04x}")]
    BadVersion(u8),

    #[error("no acceptable authentication method")]
    NoAcceptableMethod,

    #[error("unsupported command {0:#04x}")]
    UnsupportedCommand(u8),

    #[error("unsupported address type {0:#04x}")]
    UnsupportedAddressType(u8),

    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("request head exceeds {0} bytes")]
    HeadTooLarge(usize),

    #[error("handshake timed out")]
    Timeout,
}

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Protocol spoken by clients.
    pub kind: ListenerKind,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Deadline for the client handshake.
    pub handshake_timeout: Duration,
}

impl ListenerConfig {
    /// Create a new listener configuration.
    pub fn new(bind_addr: SocketAddr, kind: ListenerKind) -> Self {
        Self {
            bind_addr,
            kind,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

/// Per-listener counters, updated lock-free from connection tasks.
#[derive(Debug, Default)]
pub struct ListenerStats {
    pub accepted: AtomicU64,
    /// In handshake or proxying right now.
    pub active: AtomicU64,
    pub closed: AtomicU64,
    /// Turned away because every slot was taken.
    pub rejected: AtomicU64,
    /// Handshakes that failed or ran out of time.
    pub handshakes_failed: AtomicU64,
    /// Handshake succeeded but no backend could be reached.
    pub backend_failed: AtomicU64,
}

/// Plain copy of [`ListenerStats`].
#[derive(Debug, Clone, Serialize)]
pub struct ListenerStatsSnapshot {
    pub accepted: u64,
    pub active: u64,
    pub closed: u64,
    pub rejected: u64,
    pub handshakes_failed: u64,
    pub backend_failed: u64,
}

impl ListenerStats {
    pub fn snapshot(&self) -> ListenerStatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        ListenerStatsSnapshot {
            accepted: load(&self.accepted),
            active: load(&self.active),
            closed: load(&self.closed),
            rejected: load(&self.rejected),
            handshakes_failed: load(&self.handshakes_failed),
            backend_failed: load(&self.backend_failed),
        }
    }
}

/// Holds a connection slot and keeps the active/closed counters honest
/// however the connection task ends.
struct Slot {
    stats: Arc<ListenerStats>,
    _permit: OwnedSemaphorePermit,
}

impl Slot {
    fn new(stats: Arc<ListenerStats>, permit: OwnedSemaphorePermit) -> Self {
        stats.accepted.fetch_add(1, Ordering::Relaxed);
        stats.active.fetch_add(1, Ordering::Relaxed);
        Self {
            stats,
            _permit: permit,
        }
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.stats.active.fetch_sub(1, Ordering::Relaxed);
        self.stats.closed.fetch_add(1, Ordering::Relaxed);
    }
}

/// A client-facing TCP listener.
pub struct Listener {
    config: ListenerConfig,
    socket: TcpListener,
    proxyer: Arc<Proxyer>,
    /// One permit per concurrently served client.
    slots: Arc<Semaphore>,
    stats: Arc<ListenerStats>,
}

impl Listener {
    pub async fn bind(config: ListenerConfig, proxyer: Arc<Proxyer>) -> io::Result<Self> {
        let socket = TcpListener::bind(config.bind_addr).await?;

        info!(
            bind_addr = %socket.local_addr()?,
            kind = config.kind.as_str(),
            max_connections = config.max_connections,
            "Listener bound"
        );

        Ok(Self {
            slots: Arc::new(Semaphore::new(config.max_connections)),
            socket,
            config,
            proxyer,
            stats: Arc::default(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn kind(&self) -> ListenerKind {
        self.config.kind
    }

    /// Shared handle to this listener's counters.
    pub fn stats(&self) -> Arc<ListenerStats> {
        Arc::clone(&self.stats)
    }

    /// Accept clients until the socket fails. Each client is served on its
    /// own task.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        let kind = self.config.kind.as_str();
        info!(bind_addr = %self.socket.local_addr()?, kind, "Accepting clients");

        loop {
            let (stream, peer) = match self.socket.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(kind, error = %e, "Accept failed");
                    // Back off so a persistent error (e.g. EMFILE) does not spin.
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };

            let Some(slot) = self.admit() else {
                warn!(kind, peer = %peer, "Client rejected: listener at capacity");
                continue;
            };

            let listener = Arc::clone(&self);
            tokio::spawn(
                async move {
                    let _slot = slot;
                    if let Err(e) = listener.handle_connection(stream).await {
                        debug!(error = %e, "Client handshake failed");
                    }
                }
                .instrument(tracing::info_span!("connection", kind, peer = %peer)),
            );
        }
    }

    fn admit(&self) -> Option<Slot> {
        match Arc::clone(&self.slots).try_acquire_owned() {
            Ok(permit) => Some(Slot::new(Arc::clone(&self.stats), permit)),
            Err(_) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Handshake with the client, then proxy it.
    async fn handle_connection(&self, mut client: TcpStream) -> Result<(), HandshakeError> {
        client.set_nodelay(true)?;

        let kind = self.config.kind;
        let handshake = async {
            match kind {
                ListenerKind::Socks5 => socks5::accept_handshake(&mut client).await,
                ListenerKind::Http => http::accept_request(&mut client).await,
            }
        };

        let target = tokio::time::timeout(self.config.handshake_timeout, handshake)
            .await
            .unwrap_or(Err(HandshakeError::Timeout))
            .inspect_err(|_| {
                self.stats.handshakes_failed.fetch_add(1, Ordering::Relaxed);
            })?;

        debug!(target = %target, "Client request parsed");

        if let Err(e) = self.proxyer.do_proxy(target, client).await {
            self.stats.backend_failed.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, "Proxy failed");
        }

        Ok(())
    }
}
