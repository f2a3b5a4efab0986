//! Server side of SOCKS5 (RFC 1928), CONNECT only.
//!
//! The gateway offers NO AUTH and replies `succeeded` as soon as the request
//! parses. The backend connection is made afterwards by the orchestrator, so
//! a backend failure shows up to the client as the tunnel closing.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::listener::HandshakeError;
use super::target::Target;
use super::upstream::{
    read_destination, UpstreamError, ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6, CMD_CONNECT,
    METHOD_NONE_ACCEPTABLE, METHOD_NO_AUTH, SOCKS_VERSION,
};

/// SOCKS5 reply codes sent by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyCode {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

/// Reply with an all-zero IPv4 bound address.
pub fn build_reply(code: ReplyCode) -> [u8; 10] {
    [SOCKS_VERSION, code as u8, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0]
}

/// Run the server handshake and return the requested target.
pub async fn accept_handshake<S>(stream: &mut S) -> Result<Target, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let mut greeting = [0u8; 2];
    stream.read_exact(&mut greeting).await?;
    if greeting[0] != SOCKS_VERSION {
        return Err(HandshakeError::BadVersion(greeting[0]));
    }

    let mut methods = vec![0u8; greeting[1] as usize];
    stream.read_exact(&mut methods).await?;
    if !methods.contains(&METHOD_NO_AUTH) {
        stream
            .write_all(&[SOCKS_VERSION, METHOD_NONE_ACCEPTABLE])
            .await?;
        return Err(HandshakeError::NoAcceptableMethod);
    }
    stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(HandshakeError::BadVersion(head[0]));
    }
    if head[1] != CMD_CONNECT {
        stream
            .write_all(&build_reply(ReplyCode::CommandNotSupported))
            .await?;
        return Err(HandshakeError::UnsupportedCommand(head[1]));
    }
    if !matches!(head[3], ATYP_IPV4 | ATYP_DOMAIN | ATYP_IPV6) {
        stream
            .write_all(&build_reply(ReplyCode::AddressTypeNotSupported))
            .await?;
        return Err(HandshakeError::UnsupportedAddressType(head[3]));
    }

    let target = match read_destination(stream, head[3]).await {
        Ok(target) => target,
        Err(UpstreamError::Io(e)) => return Err(HandshakeError::Io(e)),
        Err(e) => {
            stream
                .write_all(&build_reply(ReplyCode::GeneralFailure))
                .await?;
            return Err(HandshakeError::Malformed(e.to_string()));
        }
    };
    if target.host.is_empty() {
        stream
            .write_all(&build_reply(ReplyCode::GeneralFailure))
            .await?;
        return Err(HandshakeError::Malformed("empty hostname".to_string()));
    }

    stream.write_all(&build_reply(ReplyCode::Succeeded)).await?;
    Ok(target)
}
