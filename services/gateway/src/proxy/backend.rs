//! Upstream relay pool: per-relay counters, passive health and selection.
//!
//! Backends are upstream SOCKS5 relays. The pool picks one backend per
//! connection through a pluggable [`SelectionPolicy`], opens a TCP stream to
//! it and negotiates a CONNECT to the client's target. Exactly one backend is
//! tried per connection; a failed attempt marks that backend unhealthy so the
//! next few connections steer around it until the cooldown expires.
//!
//! - Least-active-connections selection by default, round-robin available
//! - Connect timeout (TCP + handshake): 2s default
//! - Unhealthy cooldown: 2s default

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::connector::{BackendConnector, BackendHandle};
use super::stream::BoxedStream;
use super::target::Target;
use super::upstream::{socks5_connect, Credentials, UpstreamError};
use crate::error::ConnectError;

/// Deadline for TCP connect plus the upstream SOCKS5 handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// How long a failed backend is skipped before it is tried again.
pub const DEFAULT_UNHEALTHY_COOLDOWN: Duration = Duration::from_secs(2);

/// Passive health, driven only by connect outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Last connect succeeded.
    Healthy,
    /// Last connect failed.
    Unhealthy,
    /// Not yet used.
    Unknown,
}

struct HealthState {
    status: HealthStatus,
    last_failure: Option<Instant>,
    consecutive_failures: u32,
}

/// Cumulative counters for a backend.
#[derive(Debug, Default)]
struct BackendMetrics {
    active_connections: AtomicU64,
    in_bytes: AtomicU64,
    out_bytes: AtomicU64,
    connect_attempts: AtomicU64,
    connect_failures: AtomicU64,
}

/// An upstream relay server.
pub struct Backend {
    name: String,
    /// `host:port` of the upstream, resolved on every connect.
    addr: String,
    credentials: Option<Credentials>,
    metrics: BackendMetrics,
    health: Mutex<HealthState>,
}

impl Backend {
    /// A relay with no credentials and unknown health.
    pub fn new(name: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            addr: addr.into(),
            credentials: None,
            metrics: BackendMetrics::default(),
            health: Mutex::new(HealthState {
                status: HealthStatus::Unknown,
                last_failure: None,
                consecutive_failures: 0,
            }),
        }
    }

    /// Require username/password auth on the upstream.
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn active_connections(&self) -> u64 {
        self.metrics.active_connections.load(Ordering::Relaxed)
    }

    pub fn health(&self) -> HealthStatus {
        self.health_state().status
    }

    fn health_state(&self) -> std::sync::MutexGuard<'_, HealthState> {
        self.health.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Eligible unless it failed recently.
    fn is_eligible(&self, cooldown: Duration) -> bool {
        let state = self.health_state();
        match (state.status, state.last_failure) {
            (HealthStatus::Unhealthy, Some(at)) => at.elapsed() >= cooldown,
            _ => true,
        }
    }

    fn mark_healthy(&self) {
        let mut state = self.health_state();
        state.status = HealthStatus::Healthy;
        state.consecutive_failures = 0;
    }

    fn mark_unhealthy(&self) {
        let mut state = self.health_state();
        state.status = HealthStatus::Unhealthy;
        state.last_failure = Some(Instant::now());
        state.consecutive_failures += 1;
    }

    /// Point-in-time view of this backend's counters.
    pub fn stats(&self) -> BackendStats {
        let (health, consecutive_failures) = {
            let state = self.health_state();
            (state.status, state.consecutive_failures)
        };
        BackendStats {
            name: self.name.clone(),
            addr: self.addr.clone(),
            health,
            consecutive_failures,
            active_connections: self.metrics.active_connections.load(Ordering::Relaxed),
            in_bytes: self.metrics.in_bytes.load(Ordering::Relaxed),
            out_bytes: self.metrics.out_bytes.load(Ordering::Relaxed),
            connect_attempts: self.metrics.connect_attempts.load(Ordering::Relaxed),
            connect_failures: self.metrics.connect_failures.load(Ordering::Relaxed),
        }
    }

    /// Open a tunnel to `target` through this backend.
    async fn open(&self, target: &Target, connect_timeout: Duration) -> Result<TcpStream, ConnectError> {
        debug!(backend = %self.name, backend_addr = %self.addr, target = %target, "Connecting to backend");

        let attempt = async {
            let mut stream = TcpStream::connect(&self.addr).await?;
            stream.set_nodelay(true)?;
            socks5_connect(&mut stream, target, self.credentials.as_ref()).await?;
            Ok::<_, UpstreamError>(stream)
        };

        match timeout(connect_timeout, attempt).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(UpstreamError::Io(source))) => Err(ConnectError::Io {
                backend: self.name.clone(),
                source,
            }),
            Ok(Err(e)) => Err(ConnectError::Rejected {
                backend: self.name.clone(),
                reason: e.to_string(),
            }),
            Err(_) => Err(ConnectError::Timeout {
                backend: self.name.clone(),
                timeout_ms: connect_timeout.as_millis() as u64,
            }),
        }
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("name", &self.name)
            .field("addr", &self.addr)
            .field("active_connections", &self.active_connections())
            .finish()
    }
}

impl BackendHandle for Backend {
    fn name(&self) -> &str {
        &self.name
    }

    fn increase_conn_count(&self) {
        self.metrics.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    fn decrease_conn_count(&self) {
        // Saturate rather than wrap if a caller ever unpairs.
        let _ = self.metrics.active_connections.fetch_update(
            Ordering::Relaxed,
            Ordering::Relaxed,
            |n| Some(n.saturating_sub(1)),
        );
    }

    fn add_in_bytes(&self, bytes: u64) {
        self.metrics.in_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    fn add_out_bytes(&self, bytes: u64) {
        self.metrics.out_bytes.fetch_add(bytes, Ordering::Relaxed);
    }
}

/// Serializable statistics for one backend.
#[derive(Debug, Clone, Serialize)]
pub struct BackendStats {
    pub name: String,
    pub addr: String,
    pub health: HealthStatus,
    pub consecutive_failures: u32,
    pub active_connections: u64,
    pub in_bytes: u64,
    pub out_bytes: u64,
    pub connect_attempts: u64,
    pub connect_failures: u64,
}

/// Strategy for choosing among eligible backends.
pub trait SelectionPolicy: Send + Sync + fmt::Debug {
    /// Name used in config and logs.
    fn name(&self) -> &'static str;

    /// Pick one of `candidates`, which is never empty.
    fn select(&self, candidates: &[Arc<Backend>]) -> Option<Arc<Backend>>;
}

/// Fewest active connections wins; ties go to the earlier backend.
#[derive(Debug, Default)]
pub struct LeastConnections;

impl SelectionPolicy for LeastConnections {
    fn name(&self) -> &'static str {
        "least-connections"
    }

    fn select(&self, candidates: &[Arc<Backend>]) -> Option<Arc<Backend>> {
        candidates
            .iter()
            .min_by_key(|b| b.active_connections())
            .cloned()
    }
}

/// Cycle through candidates in order.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl SelectionPolicy for RoundRobin {
    fn name(&self) -> &'static str {
        "round-robin"
    }

    fn select(&self, candidates: &[Arc<Backend>]) -> Option<Arc<Backend>> {
        if candidates.is_empty() {
            return None;
        }
        let idx = self.counter.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Some(Arc::clone(&candidates[idx]))
    }
}

/// Build a policy from its configured name.
pub fn policy_from_name(name: &str) -> Option<Arc<dyn SelectionPolicy>> {
    match name.trim().to_ascii_lowercase().as_str() {
        "least-connections" | "least_connections" | "least-conn" => {
            Some(Arc::new(LeastConnections))
        }
        "round-robin" | "round_robin" | "rr" => Some(Arc::new(RoundRobin::default())),
        _ => None,
    }
}

/// The set of backends the gateway can relay through.
pub struct BackendPool {
    backends: Vec<Arc<Backend>>,
    policy: Arc<dyn SelectionPolicy>,
    connect_timeout: Duration,
    unhealthy_cooldown: Duration,
}

impl BackendPool {
    /// Create a pool with least-connections selection and default timeouts.
    pub fn new(backends: Vec<Backend>) -> Self {
        Self {
            backends: backends.into_iter().map(Arc::new).collect(),
            policy: Arc::new(LeastConnections),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            unhealthy_cooldown: DEFAULT_UNHEALTHY_COOLDOWN,
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn SelectionPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn with_unhealthy_cooldown(mut self, cooldown: Duration) -> Self {
        self.unhealthy_cooldown = cooldown;
        self
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    /// Number of backends currently eligible for traffic.
    pub fn healthy_count(&self) -> usize {
        self.backends
            .iter()
            .filter(|b| b.is_eligible(self.unhealthy_cooldown))
            .count()
    }

    /// Choose the backend for the next connection.
    ///
    /// When every backend is cooling down, all of them are candidates again
    /// rather than refusing traffic outright.
    pub fn select(&self) -> Option<Arc<Backend>> {
        let eligible: Vec<_> = self
            .backends
            .iter()
            .filter(|b| b.is_eligible(self.unhealthy_cooldown))
            .cloned()
            .collect();

        if eligible.is_empty() {
            if !self.is_empty() {
                warn!("All backends unhealthy, selecting among all");
            }
            self.policy.select(&self.backends)
        } else {
            self.policy.select(&eligible)
        }
    }

    /// Select a backend and tunnel to `target` through it.
    pub async fn select_and_connect(
        &self,
        target: &Target,
    ) -> Result<(TcpStream, Arc<Backend>), ConnectError> {
        let backend = self.select().ok_or(ConnectError::NoBackends)?;
        backend.metrics.connect_attempts.fetch_add(1, Ordering::Relaxed);

        match backend.open(target, self.connect_timeout).await {
            Ok(stream) => {
                backend.mark_healthy();
                Ok((stream, backend))
            }
            Err(e) => {
                warn!(
                    backend = %backend.name,
                    backend_addr = %backend.addr,
                    target = %target,
                    reason = e.reason_code(),
                    error = %e,
                    "Backend connection failed"
                );
                backend.metrics.connect_failures.fetch_add(1, Ordering::Relaxed);
                backend.mark_unhealthy();
                Err(e)
            }
        }
    }

    /// Statistics for every backend, in configuration order.
    pub fn stats(&self) -> Vec<BackendStats> {
        self.backends.iter().map(|b| b.stats()).collect()
    }
}

#[async_trait]
impl BackendConnector for BackendPool {
    async fn connect(
        &self,
        target: &Target,
    ) -> Result<(BoxedStream, Arc<dyn BackendHandle>), ConnectError> {
        let (stream, backend) = self.select_and_connect(target).await?;
        Ok((Box::new(stream), backend as Arc<dyn BackendHandle>))
    }
}
