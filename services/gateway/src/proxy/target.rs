//! Destination requested by a client.

use std::fmt;
use std::net::IpAddr;

use bytes::Bytes;

/// Where a client wants to go, plus any request bytes the listener had to
/// consume before the tunnel existed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Hostname or IP literal (IPv6 without brackets).
    pub host: String,
    /// Destination port.
    pub port: u16,
    /// Bytes that must reach the backend before any relayed client data.
    pub preamble: Option<Bytes>,
}

impl Target {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            preamble: None,
        }
    }

    /// Attach pre-read request bytes. Empty buffers are dropped.
    pub fn with_preamble(mut self, preamble: impl Into<Bytes>) -> Self {
        let preamble = preamble.into();
        self.preamble = if preamble.is_empty() {
            None
        } else {
            Some(preamble)
        };
        self
    }

    /// `host:port`, with IPv6 literals bracketed.
    pub fn addr(&self) -> String {
        self.to_string()
    }

    /// Parse an authority of the form `host:port` or `[v6]:port`.
    pub fn parse_authority(authority: &str, default_port: Option<u16>) -> Option<Self> {
        if let Some(rest) = authority.strip_prefix('[') {
            let (host, tail) = rest.split_once(']')?;
            host.parse::<std::net::Ipv6Addr>().ok()?;
            let port = match tail.strip_prefix(':') {
                Some(p) => p.parse().ok()?,
                None if tail.is_empty() => default_port?,
                None => return None,
            };
            return Some(Self::new(host, port));
        }

        match authority.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => {
                if host.is_empty() {
                    return None;
                }
                Some(Self::new(host, port.parse().ok()?))
            }
            Some(_) => None,
            None if !authority.is_empty() => Some(Self::new(authority, default_port?)),
            None => None,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.host.parse::<IpAddr>() {
            Ok(IpAddr::V6(_)) => write!(f, "[{}]:{}", self.host, self.port),
            _ => write!(f, "{}:{}", self.host, self.port),
        }
    }
}
