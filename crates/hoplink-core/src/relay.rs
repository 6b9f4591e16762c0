//! The bidirectional byte pump underlying every tunnel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{ProxyError, ProxyResult};

const PUMP_BUF: usize = 16 * 1024;

struct PumpOutcome {
    bytes: u64,
    err: Option<std::io::Error>,
    finished_first: bool,
}

/// Pump bytes between two duplex endpoints until either side ends, then
/// close both.
///
/// Two tasks run, one per direction. The first to stop, whether at
/// end-of-stream or on an I/O error, shuts down the side it was writing
/// to and cancels its peer, so neither endpoint outlives the other.
/// Each task reports its outcome
/// through its join handle; only the first finisher's genuine error is
/// returned. An error on the second task is expected fallout of the
/// closure and is suppressed.
///
/// Returns bytes copied `a→b` and `b→a`.
pub async fn copy_bidirectional<A, B>(a: A, b: B) -> ProxyResult<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    B: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);

    let cancel = CancellationToken::new();
    let first_done = Arc::new(AtomicBool::new(false));

    let a_to_b = tokio::spawn(pump(a_read, b_write, cancel.clone(), first_done.clone()));
    let b_to_a = tokio::spawn(pump(b_read, a_write, cancel, first_done));

    let (forward, backward) = (join(a_to_b).await?, join(b_to_a).await?);

    for outcome in [&forward, &backward] {
        if outcome.finished_first {
            if let Some(err) = &outcome.err {
                return Err(ProxyError::Io(std::io::Error::new(
                    err.kind(),
                    err.to_string(),
                )));
            }
        }
    }

    debug!(
        forward_bytes = forward.bytes,
        backward_bytes = backward.bytes,
        "relay finished"
    );
    Ok((forward.bytes, backward.bytes))
}

async fn pump<R, W>(
    mut src: R,
    mut dst: W,
    cancel: CancellationToken,
    first_done: Arc<AtomicBool>,
) -> PumpOutcome
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; PUMP_BUF];
    let mut bytes = 0u64;
    let mut err = None;

    loop {
        let n = tokio::select! {
            read = src.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    err = Some(e);
                    break;
                }
            },
            _ = cancel.cancelled() => break,
        };
        let write = async {
            dst.write_all(&buf[..n]).await?;
            dst.flush().await
        };
        if let Err(e) = write.await {
            err = Some(e);
            break;
        }
        bytes += n as u64;
    }

    let finished_first = !first_done.swap(true, Ordering::SeqCst);
    cancel.cancel();
    let _ = dst.shutdown().await;

    PumpOutcome {
        bytes,
        err,
        finished_first,
    }
}

async fn join(handle: tokio::task::JoinHandle<PumpOutcome>) -> ProxyResult<PumpOutcome> {
    handle
        .await
        .map_err(|e| ProxyError::Protocol(format!("relay task failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

    /// Endpoint whose read side fails immediately with a genuine error.
    struct FailingRead;

    impl AsyncRead for FailingRead {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "injected failure",
            )))
        }
    }

    impl AsyncWrite for FailingRead {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            data: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Poll::Ready(Ok(data.len()))
        }
        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
        fn poll_shutdown(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn bytes_flow_both_directions() {
        let (client_near, client_far) = tokio::io::duplex(256);
        let (server_near, server_far) = tokio::io::duplex(256);

        let relay = tokio::spawn(copy_bidirectional(client_far, server_near));

        let (mut client, mut server) = (client_near, server_far);
        tokio::io::AsyncWriteExt::write_all(&mut client, b"ping").await.unwrap();
        let mut got = [0u8; 4];
        tokio::io::AsyncReadExt::read_exact(&mut server, &mut got).await.unwrap();
        assert_eq!(&got, b"ping");

        tokio::io::AsyncWriteExt::write_all(&mut server, b"pong").await.unwrap();
        tokio::io::AsyncReadExt::read_exact(&mut client, &mut got).await.unwrap();
        assert_eq!(&got, b"pong");

        // Ending one side ends the whole relay and closes the other.
        drop(client);
        let (forward, backward) = relay.await.unwrap().unwrap();
        assert_eq!(forward, 4);
        assert_eq!(backward, 4);
        let n = tokio::io::AsyncReadExt::read(&mut server, &mut got).await.unwrap();
        assert_eq!(n, 0, "peer endpoint should be closed");
    }

    #[tokio::test]
    async fn returns_once_both_directions_stop_even_without_traffic() {
        let (a, a_far) = tokio::io::duplex(64);
        let (b, _b_far) = tokio::io::duplex(64);
        drop(a_far);
        let (forward, backward) = copy_bidirectional(a, b).await.unwrap();
        assert_eq!((forward, backward), (0, 0));
    }

    #[tokio::test]
    async fn first_genuine_error_wins_over_closure_fallout() {
        let (b, _b_far) = tokio::io::duplex(64);
        let err = copy_bidirectional(FailingRead, b).await.unwrap_err();
        match err {
            ProxyError::Io(e) => {
                assert_eq!(e.kind(), std::io::ErrorKind::ConnectionReset);
                assert!(e.to_string().contains("injected failure"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
