//! Stateless byte forwarding with an idle-data watchdog.
//!
//! P2P sources commonly stall without closing the connection, so the
//! watchdog fires on idle bytes rather than wall clock: the deadline is
//! pushed out after every non-empty write and a fire aborts the copy.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

/// Why a copy terminated. Exactly one cause is ever reported.
#[derive(Debug)]
pub enum CopyErrorKind {
    /// Source reached its natural end and everything was flushed.
    Completed,
    /// No non-empty write within the idle timeout.
    EmptyTimeout,
    /// Underlying read or write failure.
    Io(std::io::Error),
}

#[derive(Debug)]
pub struct CopyOutcome {
    pub bytes_copied: u64,
    pub kind: CopyErrorKind,
}

/// Pump bytes from `src` to `dst` until EOF, an I/O error, or the idle
/// watchdog fires. Flushes on every terminating path; dropping the halves
/// afterwards closes both endpoints. `bytes` is advanced after each
/// completed write and may be read concurrently from other tasks.
///
/// If the watchdog fires while an EOF races in, the timeout wins: the
/// watchdog branch is polled first, so a fired timer is always the
/// reported cause.
pub async fn run<R, W>(
    mut dst: W,
    mut src: R,
    idle_timeout: Duration,
    buffer_size: usize,
    bytes: Arc<AtomicU64>,
) -> CopyOutcome
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size.max(1)];
    let mut copied: u64 = 0;
    let mut deadline = Instant::now() + idle_timeout;

    let kind = loop {
        let step = async {
            let n = src.read(&mut buf).await?;
            if n > 0 {
                dst.write_all(&buf[..n]).await?;
            }
            Ok::<usize, std::io::Error>(n)
        };

        tokio::select! {
            biased;
            _ = tokio::time::sleep_until(deadline) => {
                break CopyErrorKind::EmptyTimeout;
            }
            result = step => match result {
                Ok(0) => break CopyErrorKind::Completed,
                Ok(n) => {
                    copied += n as u64;
                    bytes.fetch_add(n as u64, Ordering::Relaxed);
                    deadline = Instant::now() + idle_timeout;
                }
                Err(e) => break CopyErrorKind::Io(e),
            }
        }
    };

    let _ = dst.flush().await;
    CopyOutcome {
        bytes_copied: copied,
        kind,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn counter() -> Arc<AtomicU64> {
        Arc::new(AtomicU64::new(0))
    }

    #[tokio::test]
    async fn copies_until_eof_and_counts_bytes() {
        let (client, mut server) = tokio::io::duplex(1024);
        let (src_read, mut src_write) = tokio::io::simplex(1024);

        let bytes = counter();
        let copy = tokio::spawn(run(
            client,
            src_read,
            Duration::from_secs(5),
            8 * 1024,
            bytes.clone(),
        ));

        src_write.write_all(b"hello ").await.unwrap();
        src_write.write_all(b"world").await.unwrap();
        drop(src_write);

        let mut received = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut server, &mut received)
            .await
            .unwrap();
        assert_eq!(received, b"hello world");

        let outcome = copy.await.unwrap();
        assert!(matches!(outcome.kind, CopyErrorKind::Completed));
        assert_eq!(outcome.bytes_copied, 11);
        assert_eq!(bytes.load(Ordering::Relaxed), 11);
    }

    #[tokio::test]
    async fn idle_source_trips_the_watchdog() {
        let (client, _server) = tokio::io::duplex(1024);
        let (src_read, mut src_write) = tokio::io::simplex(1024);

        let bytes = counter();
        let copy = tokio::spawn(run(
            client,
            src_read,
            Duration::from_millis(80),
            8 * 1024,
            bytes.clone(),
        ));

        src_write.write_all(b"burst").await.unwrap();
        // Keep the writer open but silent: the source has stalled.
        let outcome = copy.await.unwrap();
        assert!(matches!(outcome.kind, CopyErrorKind::EmptyTimeout));
        assert_eq!(outcome.bytes_copied, 5);
        drop(src_write);
    }

    #[tokio::test]
    async fn data_flow_keeps_resetting_the_watchdog() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let (src_read, mut src_write) = tokio::io::simplex(1024);

        let bytes = counter();
        let copy = tokio::spawn(run(
            client,
            src_read,
            Duration::from_millis(120),
            8 * 1024,
            bytes.clone(),
        ));

        let reader = tokio::spawn(async move {
            let mut sink = Vec::new();
            tokio::io::AsyncReadExt::read_to_end(&mut server, &mut sink)
                .await
                .unwrap();
            sink.len()
        });

        // Five writes, each inside the idle window but spanning more than
        // one window in total.
        for _ in 0..5 {
            src_write.write_all(&[0u8; 100]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        drop(src_write);

        let outcome = copy.await.unwrap();
        assert!(matches!(outcome.kind, CopyErrorKind::Completed));
        assert_eq!(outcome.bytes_copied, 500);
        assert_eq!(reader.await.unwrap(), 500);
    }

    #[tokio::test]
    async fn closed_destination_reports_io_error() {
        let (client, server) = tokio::io::duplex(16);
        let (src_read, mut src_write) = tokio::io::simplex(1024);
        drop(server);

        let bytes = counter();
        let copy = tokio::spawn(run(
            client,
            src_read,
            Duration::from_secs(5),
            8 * 1024,
            bytes,
        ));

        // First write may land in the duplex buffer; keep pushing until the
        // broken pipe surfaces.
        for _ in 0..100 {
            if src_write.write_all(&[0u8; 512]).await.is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let outcome = copy.await.unwrap();
        assert!(matches!(outcome.kind, CopyErrorKind::Io(_)));
    }

    #[tokio::test]
    async fn bytes_counter_is_monotonic_while_copying() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let (src_read, mut src_write) = tokio::io::simplex(1024);

        let bytes = counter();
        let observer = bytes.clone();
        let copy = tokio::spawn(run(
            client,
            src_read,
            Duration::from_secs(5),
            8 * 1024,
            bytes,
        ));

        let mut last = 0;
        for chunk in 1..=4u64 {
            src_write.write_all(&[0u8; 256]).await.unwrap();
            let mut scratch = vec![0u8; 256];
            tokio::io::AsyncReadExt::read_exact(&mut server, &mut scratch)
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            let seen = observer.load(Ordering::Relaxed);
            assert!(seen >= last, "counter went backwards");
            assert!(seen <= chunk * 256);
            last = seen;
        }
        drop(src_write);

        let outcome = copy.await.unwrap();
        assert_eq!(outcome.bytes_copied, 1024);
    }
}
