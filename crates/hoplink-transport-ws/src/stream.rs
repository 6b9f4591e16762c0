//! Byte-stream adapter over a websocket connection.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use futures_util::{Sink, Stream};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

/// How long to wait for the websocket close handshake before giving up.
/// The connection is dropped either way; this only bounds politeness.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Adapts a websocket connection into a plain byte stream.
///
/// Every write becomes one binary message; reads drain incoming binary
/// messages through an internal buffer, so short reads are fine. A close
/// frame or an already-closed connection reads as end-of-stream rather
/// than an error, matching what a TCP peer hanging up looks like.
pub struct WsByteStream<S> {
    inner: WebSocketStream<S>,
    read_buf: BytesMut,
    read_eof: bool,
}

impl<S> WsByteStream<S> {
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self {
            inner,
            read_buf: BytesMut::new(),
            read_eof: false,
        }
    }
}

/// Close frames and post-close sends are normal teardown, not failures.
fn is_graceful_close(err: &WsError) -> bool {
    matches!(err, WsError::ConnectionClosed | WsError::AlreadyClosed)
}

fn to_io_error(err: WsError) -> io::Error {
    match err {
        WsError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::Other, other),
    }
}

impl<S> AsyncRead for WsByteStream<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        loop {
            if !me.read_buf.is_empty() {
                let n = me.read_buf.len().min(buf.remaining());
                buf.put_slice(&me.read_buf[..n]);
                me.read_buf.advance(n);
                return Poll::Ready(Ok(()));
            }
            if me.read_eof {
                return Poll::Ready(Ok(()));
            }
            match ready!(Pin::new(&mut me.inner).poll_next(cx)) {
                Some(Ok(Message::Binary(data))) => me.read_buf.extend_from_slice(&data),
                Some(Ok(Message::Text(text))) => me.read_buf.extend_from_slice(text.as_bytes()),
                Some(Ok(Message::Close(_))) | None => me.read_eof = true,
                // Pings and pongs are answered by the protocol layer.
                Some(Ok(_)) => {}
                Some(Err(e)) if is_graceful_close(&e) => me.read_eof = true,
                Some(Err(e)) => return Poll::Ready(Err(to_io_error(e))),
            }
        }
    }
}

impl<S> AsyncWrite for WsByteStream<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        if data.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let me = self.get_mut();
        ready!(Pin::new(&mut me.inner).poll_ready(cx)).map_err(to_io_error)?;
        Pin::new(&mut me.inner)
            .start_send(Message::Binary(data.to_vec()))
            .map_err(to_io_error)?;
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        match ready!(Pin::new(&mut me.inner).poll_flush(cx)) {
            Ok(()) => Poll::Ready(Ok(())),
            Err(e) if is_graceful_close(&e) => Poll::Ready(Ok(())),
            Err(e) => Poll::Ready(Err(to_io_error(e))),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        match ready!(Pin::new(&mut me.inner).poll_close(cx)) {
            Ok(()) => Poll::Ready(Ok(())),
            Err(e) if is_graceful_close(&e) => Poll::Ready(Ok(())),
            Err(e) => Poll::Ready(Err(to_io_error(e))),
        }
    }
}

/// Attempt a clean shutdown of the stream, bounded by `timeout`.
///
/// A peer that never answers the close handshake must not be able to pin
/// the task; on timeout the stream is simply dropped by the caller.
pub async fn close_with_timeout<S>(stream: &mut S, timeout: Duration)
where
    S: AsyncWrite + Send + Unpin,
{
    match tokio::time::timeout(timeout, stream.shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(error = %e, "stream shutdown failed"),
        Err(_) => debug!("stream shutdown timed out"),
    }
}
