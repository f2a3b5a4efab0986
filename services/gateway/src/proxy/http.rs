//! HTTP proxy request handling.
//!
//! Two request shapes are accepted:
//! - `CONNECT host:port` opens a raw tunnel. The gateway answers `200` and
//!   relays whatever follows.
//! - Absolute-form requests (`GET http://host/path HTTP/1.1`). The request
//!   head is rewritten to origin-form and forwarded to the backend as the
//!   target's preamble, so the origin sees an ordinary request.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::listener::HandshakeError;
use super::target::Target;

/// Largest request head accepted, in bytes.
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

const DEFAULT_HTTP_PORT: u16 = 80;
const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";
const BAD_REQUEST: &[u8] =
    b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
const HEAD_TOO_LARGE: &[u8] = b"HTTP/1.1 431 Request Header Fields Too Large\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

/// Headers meant for the proxy itself, never forwarded.
const PROXY_HEADERS: &[&str] = &["proxy-connection", "proxy-authorization"];

/// A parsed proxy request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRequest {
    pub target: Target,
    /// `true` for CONNECT tunnels.
    pub tunnel: bool,
}

/// Parse a complete request head (terminator excluded) plus any bytes that
/// arrived after it.
pub fn parse_request(head: &[u8], rest: &[u8]) -> Result<ProxyRequest, String> {
    let head = std::str::from_utf8(head).map_err(|_| "request head is not UTF-8".to_string())?;
    let mut lines = head.split("\r\n");

    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let (method, uri, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(u), Some(v), None) if v.starts_with("HTTP/") => (m, u, v),
        _ => return Err(format!("bad request line: {:?}", request_line)),
    };

    let headers: Vec<(&str, &str)> = lines
        .filter(|l| !l.is_empty())
        .map(|l| {
            l.split_once(':')
                .map(|(k, v)| (k.trim(), v.trim()))
                .ok_or_else(|| format!("bad header line: {:?}", l))
        })
        .collect::<Result<_, _>>()?;

    if method.eq_ignore_ascii_case("CONNECT") {
        let target = Target::parse_authority(uri, None)
            .ok_or_else(|| format!("bad CONNECT authority: {:?}", uri))?
            .with_preamble(Bytes::copy_from_slice(rest));
        return Ok(ProxyRequest {
            target,
            tunnel: true,
        });
    }

    let (authority, path) = if let Some(stripped) = strip_scheme(uri, "http://") {
        match stripped.find(&['/', '?'][..]) {
            Some(idx) => (&stripped[..idx], &stripped[idx..]),
            None => (stripped, "/"),
        }
    } else if uri.starts_with('/') {
        let host = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("host"))
            .map(|(_, v)| *v)
            .ok_or_else(|| "origin-form request without Host header".to_string())?;
        (host, uri)
    } else {
        return Err(format!("unsupported request target: {:?}", uri));
    };

    // Strip userinfo, never forwarded.
    let authority = authority.rsplit_once('@').map_or(authority, |(_, h)| h);
    let target = Target::parse_authority(authority, Some(DEFAULT_HTTP_PORT))
        .ok_or_else(|| format!("bad host: {:?}", authority))?;

    let path = if path.starts_with('?') {
        format!("/{}", path)
    } else {
        path.to_string()
    };

    let mut preamble = BytesMut::with_capacity(head.len() + rest.len() + 4);
    preamble.extend_from_slice(format!("{} {} {}\r\n", method, path, version).as_bytes());
    for (name, value) in &headers {
        if PROXY_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h)) {
            continue;
        }
        preamble.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
    }
    preamble.extend_from_slice(b"\r\n");
    preamble.extend_from_slice(rest);

    Ok(ProxyRequest {
        target: target.with_preamble(preamble.freeze()),
        tunnel: false,
    })
}

fn strip_scheme<'a>(uri: &'a str, scheme: &str) -> Option<&'a str> {
    let prefix = uri.get(..scheme.len())?;
    prefix
        .eq_ignore_ascii_case(scheme)
        .then(|| &uri[scheme.len()..])
}

/// Read one proxy request from the client and answer CONNECT.
pub async fn accept_request<S>(stream: &mut S) -> Result<Target, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let mut buf = BytesMut::with_capacity(4096);
    let head_end = loop {
        if let Some(pos) = find_terminator(&buf) {
            break pos;
        }
        if buf.len() >= MAX_HEAD_SIZE {
            stream.write_all(HEAD_TOO_LARGE).await?;
            return Err(HandshakeError::HeadTooLarge(MAX_HEAD_SIZE));
        }
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(HandshakeError::Malformed(
                "connection closed before end of request head".to_string(),
            ));
        }
    };

    let head = &buf[..head_end];
    let rest = &buf[head_end + HEAD_TERMINATOR.len()..];

    let request = match parse_request(head, rest) {
        Ok(request) => request,
        Err(reason) => {
            stream.write_all(BAD_REQUEST).await?;
            return Err(HandshakeError::Malformed(reason));
        }
    };

    if request.tunnel {
        stream.write_all(CONNECT_ESTABLISHED).await?;
    }

    Ok(request.target)
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(HEAD_TERMINATOR.len())
        .position(|w| w == HEAD_TERMINATOR)
}
