//! Admin HTTP surface and periodic stats sampling.
//!
//! - `GET /healthz`: liveness
//! - `GET /stats`: connection counts, per-backend and per-listener counters
//! - `GET /connections`: every live connection record

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;
use tracing::info;

use crate::proxy::{
    BackendPool, BackendStats, ConnId, ConnectionRecord, ListenerKind, ListenerStats,
    ListenerStatsSnapshot, Proxyer,
};

/// Shared state for admin handlers.
#[derive(Clone)]
pub struct AdminState {
    pub proxyer: Arc<Proxyer>,
    pub pool: Arc<BackendPool>,
    pub listeners: Vec<(ListenerKind, Arc<ListenerStats>)>,
}

/// Body of `GET /healthz`.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    pub timestamp: String,
}

/// Gateway-wide statistics.
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub live_connections: usize,
    pub total_connections: u64,
    pub selection: String,
    pub healthy_backends: usize,
    pub backends: Vec<BackendStats>,
    pub listeners: Vec<ListenerEntry>,
}

#[derive(Debug, Serialize)]
pub struct ListenerEntry {
    pub kind: ListenerKind,
    #[serde(flatten)]
    pub stats: ListenerStatsSnapshot,
}

/// A live connection as listed by `/connections`.
#[derive(Debug, Serialize)]
pub struct ConnectionEntry {
    pub id: ConnId,
    #[serde(flatten)]
    pub record: ConnectionRecord,
}

/// Create admin routes.
pub fn routes(state: AdminState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/stats", get(stats))
        .route("/connections", get(connections))
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".to_string(),
            service: "relaygate".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: Utc::now().to_rfc3339(),
        }),
    )
}

fn collect_stats(state: &AdminState) -> StatsResponse {
    StatsResponse {
        live_connections: state.proxyer.live_connection_count(),
        total_connections: state.proxyer.tracker().total_created(),
        selection: state.pool.policy_name().to_string(),
        healthy_backends: state.pool.healthy_count(),
        backends: state.pool.stats(),
        listeners: state
            .listeners
            .iter()
            .map(|(kind, stats)| ListenerEntry {
                kind: *kind,
                stats: stats.snapshot(),
            })
            .collect(),
    }
}

async fn stats(State(state): State<AdminState>) -> Json<StatsResponse> {
    Json(collect_stats(&state))
}

async fn connections(State(state): State<AdminState>) -> Json<Vec<ConnectionEntry>> {
    let entries = state
        .proxyer
        .tracker()
        .snapshot()
        .into_iter()
        .map(|(id, record)| ConnectionEntry {
            id,
            record: (*record).clone(),
        })
        .collect();
    Json(entries)
}

/// Serve the admin routes until the listener fails.
pub async fn serve(listener: tokio::net::TcpListener, state: AdminState) -> std::io::Result<()> {
    info!(addr = %listener.local_addr()?, "Admin server listening");
    axum::serve(listener, routes(state)).await
}

/// Log a stats sample every `interval`, with byte deltas per backend.
pub async fn run_sampler(state: AdminState, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut previous: HashMap<String, (u64, u64)> = HashMap::new();

    // First tick fires immediately; skip it so the first sample covers a full interval.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let sample = collect_stats(&state);

        info!(
            live_connections = sample.live_connections,
            total_connections = sample.total_connections,
            healthy_backends = sample.healthy_backends,
            "Stats sample"
        );

        for backend in &sample.backends {
            let (prev_in, prev_out) = previous
                .insert(backend.name.clone(), (backend.in_bytes, backend.out_bytes))
                .unwrap_or((0, 0));
            info!(
                backend = %backend.name,
                health = ?backend.health,
                active_connections = backend.active_connections,
                in_bytes_delta = backend.in_bytes.saturating_sub(prev_in),
                out_bytes_delta = backend.out_bytes.saturating_sub(prev_out),
                "Backend sample"
            );
        }
    }
}
