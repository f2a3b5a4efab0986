//! Proxy gateway implementation.
//!
//! This module provides:
//! - SOCKS5 and HTTP-proxy listeners
//! - Backend pool with pluggable selection over upstream SOCKS5 relays
//! - Per-connection orchestration and connection tracking
//! - Bidirectional relaying with idle timeouts and byte accounting
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> Proxyer::do_proxy -> BackendConnector -> Backend -> Target
//!                              |
//!                     ConnectionTracker, BackendHandle metrics
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use proxy::{Backend, BackendPool, ConnectionTracker, Listener, ListenerConfig, ListenerKind, Proxyer};
//!
//! let pool = Arc::new(BackendPool::new(vec![Backend::new("hk1", "10.0.0.2:1080")]));
//! let tracker = Arc::new(ConnectionTracker::new());
//! let proxyer = Arc::new(Proxyer::new(pool, tracker));
//!
//! let config = ListenerConfig::new("127.0.0.1:1080".parse()?, ListenerKind::Socks5);
//! let listener = Arc::new(Listener::bind(config, proxyer).await?);
//! listener.run().await?;
//! ```

mod backend;
mod connector;
mod http;
mod listener;
mod orchestrator;
mod relay;
mod socks5;
mod stream;
mod target;
mod tracker;
mod upstream;

pub use backend::{
    policy_from_name, Backend, BackendPool, BackendStats, HealthStatus, LeastConnections,
    RoundRobin, SelectionPolicy, DEFAULT_CONNECT_TIMEOUT, DEFAULT_UNHEALTHY_COOLDOWN,
};
pub use connector::{BackendConnector, BackendHandle};
pub use http::{parse_request, ProxyRequest};
pub use listener::{
    HandshakeError, Listener, ListenerConfig, ListenerKind, ListenerStats, ListenerStatsSnapshot,
};
pub use orchestrator::{Proxyer, DEFAULT_RELAY_TIMEOUT};
pub use relay::{copy_with_idle_timeout, relay_direction, spawn_relay, RelayEnd};
pub use stream::{AddressedStream, BoxedStream, ProxyStream};
pub use target::Target;
pub use tracker::{ConnId, ConnectionRecord, ConnectionTracker, TrackedConnection};
pub use upstream::{socks5_connect, Credentials, UpstreamError};
