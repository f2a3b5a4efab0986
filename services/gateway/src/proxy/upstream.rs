//! Client side of the SOCKS5 protocol, used to tunnel through a backend.
//!
//! Supports the NO AUTH and username/password (RFC 1929) methods and the
//! CONNECT command only.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::target::Target;

pub const SOCKS_VERSION: u8 = 0x05;
pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_USERNAME: u8 = 0x02;
pub const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;
pub const CMD_CONNECT: u8 = 0x01;
pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;
pub const REPLY_SUCCEEDED: u8 = 0x00;

const USERPASS_VERSION: u8 = 0x01;

/// Username/password for an upstream that requires RFC 1929 auth.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Failure while negotiating a tunnel with an upstream.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("unexpected protocol version {0:#04x}")]
    BadVersion(u8),

    #[error("no acceptable authentication method")]
    NoAcceptableMethod,

    #[error("authentication failed")]
    AuthFailed,

    #[error("credentials too long")]
    CredentialsTooLong,

    #[error("hostname too long: {0} bytes")]
    HostTooLong(usize),

    #[error("connect refused with reply code {0:#04x}")]
    Refused(u8),

    #[error("unsupported address type {0:#04x} in reply")]
    BadAddressType(u8),

    #[error("hostname is not valid UTF-8")]
    InvalidHostname,
}

/// Encode the destination part (ATYP, address, port) of a SOCKS5 request.
pub fn encode_destination(target: &Target) -> Result<Vec<u8>, UpstreamError> {
    let mut out = Vec::with_capacity(4 + target.host.len() + 2);
    match target.host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            out.push(ATYP_IPV4);
            out.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            out.push(ATYP_IPV6);
            out.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            let host = target.host.as_bytes();
            let len = u8::try_from(host.len()).map_err(|_| UpstreamError::HostTooLong(host.len()))?;
            out.push(ATYP_DOMAIN);
            out.push(len);
            out.extend_from_slice(host);
        }
    }
    out.extend_from_slice(&target.port.to_be_bytes());
    Ok(out)
}

/// Negotiate a CONNECT to `target` over an already-open upstream stream.
///
/// Returns once the upstream has replied `succeeded`; from then on the
/// stream carries the target's bytes.
pub async fn socks5_connect<S>(
    stream: &mut S,
    target: &Target,
    credentials: Option<&Credentials>,
) -> Result<(), UpstreamError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let method = if credentials.is_some() {
        METHOD_USERNAME
    } else {
        METHOD_NO_AUTH
    };
    stream.write_all(&[SOCKS_VERSION, 1, method]).await?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != SOCKS_VERSION {
        return Err(UpstreamError::BadVersion(choice[0]));
    }
    match (choice[1], credentials) {
        (METHOD_NO_AUTH, _) => {}
        (METHOD_USERNAME, Some(creds)) => authenticate(stream, creds).await?,
        _ => return Err(UpstreamError::NoAcceptableMethod),
    }

    let mut request = vec![SOCKS_VERSION, CMD_CONNECT, 0x00];
    request.extend_from_slice(&encode_destination(target)?);
    stream.write_all(&request).await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(UpstreamError::BadVersion(head[0]));
    }
    if head[1] != REPLY_SUCCEEDED {
        return Err(UpstreamError::Refused(head[1]));
    }

    // Bound address is not used, but has to be drained.
    let addr_len = match head[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => stream.read_u8().await? as usize,
        other => return Err(UpstreamError::BadAddressType(other)),
    };
    let mut bound = vec![0u8; addr_len + 2];
    stream.read_exact(&mut bound).await?;

    Ok(())
}

async fn authenticate<S>(stream: &mut S, creds: &Credentials) -> Result<(), UpstreamError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let user = creds.username.as_bytes();
    let pass = creds.password.as_bytes();
    let ulen = u8::try_from(user.len()).map_err(|_| UpstreamError::CredentialsTooLong)?;
    let plen = u8::try_from(pass.len()).map_err(|_| UpstreamError::CredentialsTooLong)?;

    let mut msg = Vec::with_capacity(3 + user.len() + pass.len());
    msg.push(USERPASS_VERSION);
    msg.push(ulen);
    msg.extend_from_slice(user);
    msg.push(plen);
    msg.extend_from_slice(pass);
    stream.write_all(&msg).await?;

    let mut status = [0u8; 2];
    stream.read_exact(&mut status).await?;
    if status[1] != 0x00 {
        return Err(UpstreamError::AuthFailed);
    }
    Ok(())
}

/// Decode the destination part of a SOCKS5 request from a reader.
///
/// Shared with the client-facing SOCKS5 listener.
pub async fn read_destination<R>(reader: &mut R, atyp: u8) -> Result<Target, UpstreamError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let host = match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            reader.read_exact(&mut octets).await?;
            Ipv4Addr::from(octets).to_string()
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            reader.read_exact(&mut octets).await?;
            Ipv6Addr::from(octets).to_string()
        }
        ATYP_DOMAIN => {
            let len = reader.read_u8().await? as usize;
            let mut name = vec![0u8; len];
            reader.read_exact(&mut name).await?;
            String::from_utf8(name).map_err(|_| UpstreamError::InvalidHostname)?
        }
        other => return Err(UpstreamError::BadAddressType(other)),
    };
    let port = reader.read_u16().await?;
    Ok(Target::new(host, port))
}
