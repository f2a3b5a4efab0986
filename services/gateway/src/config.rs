//! Gateway configuration.
//!
//! Everything comes from `RELAYGATE_*` environment variables. Parsing goes
//! through a lookup closure so it can be tested without touching the process
//! environment.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::proxy::{
    policy_from_name, Backend, Credentials, SelectionPolicy, DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_RELAY_TIMEOUT,
};

/// One configured upstream relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendSpec {
    pub name: String,
    pub addr: String,
    pub credentials: Option<Credentials>,
}

impl BackendSpec {
    pub fn into_backend(self) -> Backend {
        let backend = Backend::new(self.name, self.addr);
        match self.credentials {
            Some(creds) => backend.with_credentials(creds),
            None => backend,
        }
    }
}

/// Gateway configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the client-facing listeners bind to.
    pub listen_host: IpAddr,

    /// SOCKS5 listener port. `None` disables it.
    pub socks_port: Option<u16>,

    /// HTTP-proxy listener port. `None` disables it.
    pub http_port: Option<u16>,

    /// Admin HTTP address. `None` disables the admin server.
    pub admin_addr: Option<SocketAddr>,

    /// Upstream relays.
    pub backends: Vec<BackendSpec>,

    /// Backend selection policy name.
    pub selection: String,

    /// Idle timeout for each relay direction.
    pub relay_timeout: Duration,

    /// Backend connect + handshake timeout.
    pub connect_timeout: Duration,

    /// Max concurrent connections per listener.
    pub max_connections: usize,

    /// Interval between stats samples in the log.
    pub sample_interval: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let listen_host: IpAddr = lookup("RELAYGATE_LISTEN_HOST")
            .unwrap_or_else(|| "127.0.0.1".to_string())
            .parse()
            .context("RELAYGATE_LISTEN_HOST must be an IP address.")?;

        let socks_port = parse_port(&lookup, "RELAYGATE_SOCKS_PORT", 1080)?;
        let http_port = parse_port(&lookup, "RELAYGATE_HTTP_PORT", 8118)?;

        let admin_addr = match lookup("RELAYGATE_ADMIN_ADDR") {
            Some(v) if v.trim().is_empty() => None,
            Some(v) => Some(
                v.trim()
                    .parse()
                    .context("RELAYGATE_ADMIN_ADDR must be a socket address (host:port).")?,
            ),
            None => Some(SocketAddr::from(([127, 0, 0, 1], 9090))),
        };

        let backends = parse_backends(
            &lookup("RELAYGATE_BACKENDS")
                .context("Missing backends. Set RELAYGATE_BACKENDS=name=host:port[,...].")?,
        )
        .context("RELAYGATE_BACKENDS is invalid.")?;

        let selection = lookup("RELAYGATE_SELECTION")
            .unwrap_or_else(|| "least-connections".to_string());
        if policy_from_name(&selection).is_none() {
            bail!(
                "RELAYGATE_SELECTION must be least-connections or round-robin, got {:?}.",
                selection
            );
        }

        let relay_timeout_secs: u64 = parse_number(
            &lookup,
            "RELAYGATE_RELAY_TIMEOUT_SECS",
            DEFAULT_RELAY_TIMEOUT.as_secs(),
        )?;
        let relay_timeout = Duration::from_secs(relay_timeout_secs.max(1));

        let connect_timeout_ms: u64 = parse_number(
            &lookup,
            "RELAYGATE_CONNECT_TIMEOUT_MS",
            DEFAULT_CONNECT_TIMEOUT.as_millis() as u64,
        )?;
        let connect_timeout = Duration::from_millis(connect_timeout_ms.max(50));

        let max_connections: usize = parse_number(&lookup, "RELAYGATE_MAX_CONNECTIONS", 10000)?;
        if max_connections == 0 {
            bail!("RELAYGATE_MAX_CONNECTIONS must be at least 1.");
        }

        let sample_interval_secs: u64 =
            parse_number(&lookup, "RELAYGATE_SAMPLE_INTERVAL_SECS", 60)?;
        let sample_interval = Duration::from_secs(sample_interval_secs.max(1));

        let log_level = lookup("RELAYGATE_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        if socks_port.is_none() && http_port.is_none() {
            bail!("Both RELAYGATE_SOCKS_PORT and RELAYGATE_HTTP_PORT are disabled.");
        }

        Ok(Self {
            listen_host,
            socks_port,
            http_port,
            admin_addr,
            backends,
            selection,
            relay_timeout,
            connect_timeout,
            max_connections,
            sample_interval,
            log_level,
        })
    }

    /// Selection policy instance for the configured name.
    pub fn selection_policy(&self) -> Arc<dyn SelectionPolicy> {
        // Validated in from_lookup; fall back to the default for hand-built configs.
        policy_from_name(&self.selection)
            .unwrap_or_else(|| Arc::new(crate::proxy::LeastConnections))
    }

    /// Log the effective configuration without credentials.
    pub fn report(&self) {
        tracing::info!(
            listen_host = %self.listen_host,
            socks_port = ?self.socks_port,
            http_port = ?self.http_port,
            admin_addr = ?self.admin_addr,
            backend_count = self.backends.len(),
            selection = %self.selection,
            relay_timeout_secs = self.relay_timeout.as_secs(),
            connect_timeout_ms = self.connect_timeout.as_millis() as u64,
            max_connections = self.max_connections,
            "Configuration loaded"
        );
        for backend in &self.backends {
            tracing::info!(
                backend = %backend.name,
                backend_addr = %backend.addr,
                auth = backend.credentials.is_some(),
                "Backend configured"
            );
        }
    }
}

fn parse_number<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .map(|v| v.trim().parse())
        .transpose()
        .with_context(|| format!("{} must be an integer.", key))
        .map(|v| v.unwrap_or(default))
}

/// `0` disables a listener.
fn parse_port<F>(lookup: &F, key: &str, default: u16) -> Result<Option<u16>>
where
    F: Fn(&str) -> Option<String>,
{
    let port: u16 = parse_number(lookup, key, default)?;
    Ok((port != 0).then_some(port))
}

/// Parse `name=[user:pass@]host:port` entries separated by commas.
pub fn parse_backends(raw: &str) -> Result<Vec<BackendSpec>> {
    let mut specs = Vec::new();

    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (name, location) = entry
            .split_once('=')
            .with_context(|| format!("backend entry {:?} is missing '='", entry))?;
        let name = name.trim();
        if name.is_empty() {
            bail!("backend entry {:?} has an empty name", entry);
        }
        if specs.iter().any(|s: &BackendSpec| s.name == name) {
            bail!("duplicate backend name {:?}", name);
        }

        let (credentials, addr) = match location.trim().rsplit_once('@') {
            Some((userinfo, addr)) => {
                let (username, password) = userinfo
                    .split_once(':')
                    .with_context(|| format!("backend {:?} credentials must be user:pass", name))?;
                (
                    Some(Credentials {
                        username: username.to_string(),
                        password: password.to_string(),
                    }),
                    addr,
                )
            }
            None => (None, location.trim()),
        };

        match addr.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {}
            _ => bail!("backend {:?} address {:?} must be host:port", name, addr),
        }

        specs.push(BackendSpec {
            name: name.to_string(),
            addr: addr.to_string(),
            credentials,
        });
    }

    if specs.is_empty() {
        bail!("no backends listed");
    }
    Ok(specs)
}
