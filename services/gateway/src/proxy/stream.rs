//! Byte streams carried through the gateway.
//!
//! The orchestrator only needs three things from a stream: it can be read,
//! it can be written, and it can name both of its endpoints for the
//! connection record. TCP sockets satisfy this directly; anything else
//! (in-memory pipes, wrapped transports) can be adapted with
//! [`AddressedStream`].

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

/// A bidirectional stream that knows its endpoint addresses.
pub trait ProxyStream: AsyncRead + AsyncWrite + Unpin + Send {
    /// Address of this side of the stream.
    fn local_addr_string(&self) -> String;

    /// Address of the far side of the stream.
    fn peer_addr_string(&self) -> String;
}

/// Type-erased stream as handed out by backend connectors.
pub type BoxedStream = Box<dyn ProxyStream>;

impl ProxyStream for TcpStream {
    fn local_addr_string(&self) -> String {
        self.local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string())
    }

    fn peer_addr_string(&self) -> String {
        self.peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string())
    }
}

impl<S: ProxyStream + ?Sized> ProxyStream for Box<S> {
    fn local_addr_string(&self) -> String {
        (**self).local_addr_string()
    }

    fn peer_addr_string(&self) -> String {
        (**self).peer_addr_string()
    }
}

/// Attaches fixed endpoint labels to an arbitrary stream.
#[derive(Debug)]
pub struct AddressedStream<S> {
    inner: S,
    local: String,
    peer: String,
}

impl<S> AddressedStream<S> {
    pub fn new(inner: S, local: impl Into<String>, peer: impl Into<String>) -> Self {
        Self {
            inner,
            local: local.into(),
            peer: peer.into(),
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for AddressedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for AddressedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> ProxyStream for AddressedStream<S> {
    fn local_addr_string(&self) -> String {
        self.local.clone()
    }

    fn peer_addr_string(&self) -> String {
        self.peer.clone()
    }
}
