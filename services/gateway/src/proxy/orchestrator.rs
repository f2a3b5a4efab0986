//! Per-connection proxy lifecycle.
//!
//! [`Proxyer::do_proxy`] runs one client connection from backend connect to
//! teardown:
//!
//! ```text
//! connect backend -> track -> conn_count+1 -> preamble -> relay in/out
//!                                                          |
//!            close streams <- untrack <- conn_count-1 <- account bytes
//! ```
//!
//! Everything after a successful connect is released by a scope guard, so
//! the tracker entry and the backend's connection count are restored on
//! every exit path, including panics and the future being dropped.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, Instrument};

use super::connector::{BackendConnector, BackendHandle};
use super::relay::spawn_relay;
use super::stream::ProxyStream;
use super::target::Target;
use super::tracker::{ConnectionRecord, ConnectionTracker, TrackedConnection};
use crate::error::ProxyError;

/// Default idle timeout for each relay direction.
pub const DEFAULT_RELAY_TIMEOUT: Duration = Duration::from_secs(300);

/// Releases everything an orchestration holds once a backend is connected.
struct ActiveConnection {
    backend: Arc<dyn BackendHandle>,
    relays: Vec<JoinHandle<()>>,
    _tracked: TrackedConnection,
}

impl ActiveConnection {
    fn new(backend: Arc<dyn BackendHandle>, tracked: TrackedConnection) -> Self {
        backend.increase_conn_count();
        Self {
            backend,
            relays: Vec::with_capacity(2),
            _tracked: tracked,
        }
    }
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        // Aborting a finished task is a no-op; aborting a live one drops its
        // stream halves, which closes both sockets.
        for relay in &self.relays {
            relay.abort();
        }
        self.backend.decrease_conn_count();
        // `_tracked` unregisters when dropped right after this.
    }
}

/// Connection orchestrator shared by all listeners.
pub struct Proxyer {
    connector: Arc<dyn BackendConnector>,
    tracker: Arc<ConnectionTracker>,
    relay_timeout: Duration,
}

impl Proxyer {
    pub fn new(connector: Arc<dyn BackendConnector>, tracker: Arc<ConnectionTracker>) -> Self {
        Self {
            connector,
            tracker,
            relay_timeout: DEFAULT_RELAY_TIMEOUT,
        }
    }

    /// Set the idle timeout applied to each relay direction.
    pub fn with_relay_timeout(mut self, relay_timeout: Duration) -> Self {
        self.relay_timeout = relay_timeout;
        self
    }

    pub fn tracker(&self) -> &Arc<ConnectionTracker> {
        &self.tracker
    }

    /// Number of connections currently relaying.
    pub fn live_connection_count(&self) -> usize {
        self.tracker.live_count()
    }

    /// Proxy one accepted client connection to `target`.
    ///
    /// Returns an error only when no backend stream could be obtained; in
    /// that case nothing has been tracked or counted. Once a backend is
    /// connected the call always completes with `Ok(())`, however the relay
    /// ends.
    pub async fn do_proxy<S>(&self, target: Target, client: S) -> Result<(), ProxyError>
    where
        S: ProxyStream + 'static,
    {
        let started = Instant::now();
        let target_addr = target.addr();

        let (mut backend_stream, backend) = self.connector.connect(&target).await?;
        let latency_ms = started.elapsed().as_millis() as u64;

        let record = ConnectionRecord {
            local_local_addr: client.local_addr_string(),
            local_remote_addr: client.peer_addr_string(),
            remote_local_addr: backend_stream.local_addr_string(),
            remote_remote_addr: backend_stream.peer_addr_string(),
            target: target_addr.clone(),
            latency_ms,
            backend: backend.name().to_string(),
            started_at: Utc::now(),
        };
        let tracked = self.tracker.track(record);
        let conn_id = tracked.id();

        info!(
            conn_id,
            backend = %backend.name(),
            target = %target_addr,
            latency_ms,
            "Proxy established"
        );

        let mut active = ActiveConnection::new(Arc::clone(&backend), tracked);

        if let Some(preamble) = &target.preamble {
            let write = tokio::time::timeout(self.relay_timeout, backend_stream.write_all(preamble));
            match write.await {
                Ok(Ok(())) => debug!(conn_id, bytes = preamble.len(), "Forwarded buffered request"),
                Ok(Err(e)) => debug!(conn_id, error = %e, "Forwarding buffered request failed"),
                Err(_) => debug!(conn_id, "Forwarding buffered request timed out"),
            }
        }

        let (client_read, client_write) = tokio::io::split(client);
        let (backend_read, backend_write) = tokio::io::split(backend_stream);

        let span = tracing::debug_span!("relay", conn_id);
        let (in_task, mut in_rx) =
            spawn_relay(client_read, backend_write, "client => backend", self.relay_timeout);
        let (out_task, mut out_rx) =
            spawn_relay(backend_read, client_write, "backend => client", self.relay_timeout);
        active.relays.push(in_task);
        active.relays.push(out_task);

        let (mut in_bytes, mut out_bytes) = (None, None);
        async {
            while in_bytes.is_none() || out_bytes.is_none() {
                tokio::select! {
                    res = &mut in_rx, if in_bytes.is_none() => {
                        // A dropped sender means the relay task died; count it as nothing moved.
                        let bytes = res.unwrap_or(0);
                        backend.add_in_bytes(bytes);
                        in_bytes = Some(bytes);
                    }
                    res = &mut out_rx, if out_bytes.is_none() => {
                        let bytes = res.unwrap_or(0);
                        backend.add_out_bytes(bytes);
                        out_bytes = Some(bytes);
                    }
                }
            }
        }
        .instrument(span)
        .await;

        drop(active);

        info!(
            conn_id,
            backend = %backend.name(),
            target = %target_addr,
            in_bytes = in_bytes.unwrap_or(0),
            out_bytes = out_bytes.unwrap_or(0),
            duration_ms = started.elapsed().as_millis() as u64,
            "Proxy closed"
        );

        Ok(())
    }
}
