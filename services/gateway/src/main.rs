//! relaygate
//!
//! Local proxy gateway that relays SOCKS5 and HTTP-proxy clients through a
//! pool of upstream SOCKS5 relays.
//!
//! This service:
//! - Accepts SOCKS5 and HTTP-proxy connections on local listeners
//! - Selects a backend relay per connection
//! - Tunnels to the requested target and relays bytes both ways
//! - Tracks live connections and per-backend traffic
//! - Serves stats on an admin HTTP endpoint

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use relaygate_gateway::admin::{self, AdminState};
use relaygate_gateway::config::Config;
use relaygate_gateway::proxy::{
    BackendPool, ConnectionTracker, Listener, ListenerConfig, ListenerKind, Proxyer,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to RELAYGATE_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting relaygate");
    config.report();

    let pool = Arc::new(
        BackendPool::new(
            config
                .backends
                .iter()
                .cloned()
                .map(|spec| spec.into_backend())
                .collect(),
        )
        .with_policy(config.selection_policy())
        .with_connect_timeout(config.connect_timeout),
    );
    info!(
        backends = pool.len(),
        selection = pool.policy_name(),
        "Backend pool ready"
    );
    let tracker = Arc::new(ConnectionTracker::new());
    let proxyer = Arc::new(
        Proxyer::new(pool.clone(), tracker).with_relay_timeout(config.relay_timeout),
    );

    let mut bindings = Vec::new();
    if let Some(port) = config.socks_port {
        bindings.push((SocketAddr::new(config.listen_host, port), ListenerKind::Socks5));
    }
    if let Some(port) = config.http_port {
        bindings.push((SocketAddr::new(config.listen_host, port), ListenerKind::Http));
    }

    let mut listener_handles = Vec::new();
    let mut listener_stats = Vec::new();

    for (bind_addr, kind) in bindings {
        let mut listener_config = ListenerConfig::new(bind_addr, kind);
        listener_config.max_connections = config.max_connections;

        let listener = Listener::bind(listener_config, Arc::clone(&proxyer))
            .await
            .with_context(|| format!("Failed to bind {} listener on {}", kind.as_str(), bind_addr))?;
        listener_stats.push((listener.kind(), listener.stats()));

        let listener = Arc::new(listener);
        listener_handles.push(tokio::spawn(async move {
            let kind = listener.kind();
            if let Err(e) = listener.run().await {
                error!(kind = kind.as_str(), error = %e, "Listener error");
            }
        }));
    }

    let admin_state = AdminState {
        proxyer: Arc::clone(&proxyer),
        pool,
        listeners: listener_stats,
    };

    tokio::spawn(admin::run_sampler(admin_state.clone(), config.sample_interval));

    if let Some(admin_addr) = config.admin_addr {
        let admin_listener = tokio::net::TcpListener::bind(admin_addr)
            .await
            .with_context(|| format!("Failed to bind admin server on {}", admin_addr))?;
        tokio::spawn(async move {
            if let Err(e) = admin::serve(admin_listener, admin_state).await {
                error!(error = %e, "Admin server error");
            }
        });
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!(
                live_connections = proxyer.live_connection_count(),
                "Received shutdown signal"
            );
        }
        _ = futures_util::future::select_all(listener_handles) => {
            error!("Listener exited unexpectedly");
        }
    }

    Ok(())
}
