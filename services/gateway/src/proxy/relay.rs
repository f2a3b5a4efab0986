//! One-directional byte relay with idle timeout.
//!
//! Each direction of a proxied connection runs [`relay_direction`] on its own
//! task. Whatever ends the copy (end of stream, an I/O error, or the idle
//! timeout) the direction reports its byte count on a oneshot channel exactly
//! once. The orchestrator's wait depends on that.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::debug;

/// Copy buffer size per direction.
pub const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Why a direction stopped copying.
#[derive(Debug)]
pub enum RelayEnd {
    /// Source reached end of stream.
    Eof,
    /// Reading from the source failed.
    ReadError(io::Error),
    /// Writing to the destination failed.
    WriteError(io::Error),
    /// No read or write completed within the idle timeout.
    IdleTimeout,
}

/// Copy `src` into `dst` until EOF, error, or `idle_timeout` without progress.
///
/// Returns the number of bytes accepted by `dst` and the reason the copy
/// stopped. On EOF the write side of `dst` is shut down so the peer sees the
/// half-close.
pub async fn copy_with_idle_timeout<R, W>(
    src: &mut R,
    dst: &mut W,
    idle_timeout: Duration,
) -> (u64, RelayEnd)
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut total = 0u64;
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];

    loop {
        let n = match timeout(idle_timeout, src.read(&mut buf)).await {
            Err(_) => return (total, RelayEnd::IdleTimeout),
            Ok(Err(e)) => return (total, RelayEnd::ReadError(e)),
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => n,
        };

        // Count every partial write so a stalled or failing destination
        // still reports what it actually accepted.
        let mut off = 0;
        while off < n {
            match timeout(idle_timeout, dst.write(&buf[off..n])).await {
                Err(_) => return (total, RelayEnd::IdleTimeout),
                Ok(Err(e)) => return (total, RelayEnd::WriteError(e)),
                Ok(Ok(0)) => {
                    return (
                        total,
                        RelayEnd::WriteError(io::ErrorKind::WriteZero.into()),
                    )
                }
                Ok(Ok(written)) => {
                    off += written;
                    total += written as u64;
                }
            }
        }
    }

    let _ = timeout(idle_timeout, dst.shutdown()).await;
    (total, RelayEnd::Eof)
}

/// Run one direction to completion and report its byte count on `report`.
///
/// `label` only shows up in logs.
pub async fn relay_direction<R, W>(
    mut src: R,
    mut dst: W,
    label: &'static str,
    idle_timeout: Duration,
    report: oneshot::Sender<u64>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (bytes, end) = copy_with_idle_timeout(&mut src, &mut dst, idle_timeout).await;

    match &end {
        RelayEnd::Eof => debug!(direction = label, bytes, "Relay finished"),
        RelayEnd::IdleTimeout => debug!(
            direction = label,
            bytes,
            timeout_secs = idle_timeout.as_secs_f64(),
            "Relay idle timeout"
        ),
        RelayEnd::ReadError(e) | RelayEnd::WriteError(e) => {
            debug!(direction = label, bytes, error = %e, "Relay stopped on error")
        }
    }

    // The receiver may already be gone if the orchestration was abandoned.
    let _ = report.send(bytes);
}

/// Spawn [`relay_direction`] and return its task handle plus the receiving
/// end of its report channel.
pub fn spawn_relay<R, W>(
    src: R,
    dst: W,
    label: &'static str,
    idle_timeout: Duration,
) -> (JoinHandle<()>, oneshot::Receiver<u64>)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    let handle = tokio::spawn(relay_direction(src, dst, label, idle_timeout, tx));
    (handle, rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn test_immediate_eof_reports_zero_once() {
        let src = tokio::io::empty();
        let (dst, _keep) = tokio::io::duplex(64);
        let (handle, rx) = spawn_relay(src, dst, "test", Duration::from_secs(5));

        let bytes = timeout(Duration::from_millis(500), rx)
            .await
            .expect("relay must report promptly")
            .expect("relay must send");
        assert_eq!(bytes, 0);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_copies_until_eof_and_half_closes() {
        let src = tokio_test::io::Builder::new()
            .read(b"hello ")
            .read(b"world")
            .build();
        let (dst, mut peer) = tokio::io::duplex(64);
        let (tx, rx) = oneshot::channel();

        let mut received = Vec::new();
        let (_, read) = tokio::join!(
            relay_direction(src, dst, "test", Duration::from_secs(5), tx),
            peer.read_to_end(&mut received),
        );
        read.unwrap();

        assert_eq!(received, b"hello world");
        assert_eq!(rx.await.unwrap(), 11);
    }

    #[tokio::test]
    async fn test_idle_source_times_out() {
        let (src, _writer_kept_open) = tokio::io::duplex(64);
        let (dst, _peer) = tokio::io::duplex(64);
        let started = Instant::now();
        let (_handle, rx) = spawn_relay(src, dst, "idle", Duration::from_millis(200));

        assert_eq!(rx.await.unwrap(), 0);
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_read_error_reports_partial_count() {
        let mut src = tokio_test::io::Builder::new()
            .read(b"abcd")
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();
        let (mut dst, mut peer) = tokio::io::duplex(64);

        let (bytes, end) =
            copy_with_idle_timeout(&mut src, &mut dst, Duration::from_secs(5)).await;
        assert_eq!(bytes, 4);
        assert!(matches!(end, RelayEnd::ReadError(_)));

        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abcd");
    }

    #[tokio::test]
    async fn test_write_error_stops_copy() {
        let src = tokio_test::io::Builder::new().read(b"data").build();
        let (dst, peer) = tokio::io::duplex(64);
        drop(peer);
        let (tx, rx) = oneshot::channel();
        relay_direction(src, dst, "broken", Duration::from_secs(5), tx).await;

        assert_eq!(rx.await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stalled_destination_reports_partial_write() {
        let (src, mut feeder) = tokio::io::duplex(1024);
        feeder.write_all(&[9u8; 100]).await.unwrap();
        // Nobody drains `peer`, so only 64 bytes fit before writes stall.
        let (dst, mut peer) = tokio::io::duplex(64);
        let started = Instant::now();
        let (_handle, rx) = spawn_relay(src, dst, "stalled", Duration::from_millis(200));

        let bytes = timeout(Duration::from_secs(2), rx)
            .await
            .expect("relay must report after the idle timeout")
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(200));

        let mut delivered = vec![0u8; 128];
        let n = peer.read(&mut delivered).await.unwrap();
        assert_eq!(n, 64);
        assert_eq!(bytes, n as u64);
        drop(feeder);
    }

    #[tokio::test]
    async fn test_write_zero_is_a_write_error() {
        let mut src = tokio_test::io::Builder::new().read(b"data").build();
        let mut dst = ZeroWriter;

        let (bytes, end) =
            copy_with_idle_timeout(&mut src, &mut dst, Duration::from_secs(5)).await;
        assert_eq!(bytes, 0);
        assert!(
            matches!(end, RelayEnd::WriteError(ref e) if e.kind() == io::ErrorKind::WriteZero)
        );
    }

    struct ZeroWriter;

    impl AsyncWrite for ZeroWriter {
        fn poll_write(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &[u8],
        ) -> std::task::Poll<io::Result<usize>> {
            std::task::Poll::Ready(Ok(0))
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_dropped_receiver_does_not_panic() {
        let (tx, rx) = oneshot::channel();
        drop(rx);
        relay_direction(
            tokio::io::empty(),
            tokio::io::sink(),
            "orphan",
            Duration::from_secs(1),
            tx,
        )
        .await;
    }
}
