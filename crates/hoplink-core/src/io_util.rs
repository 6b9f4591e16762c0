//! Small stream utilities.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// A duplex stream with bytes already read off it put back in front.
///
/// Parsing a message head can pull bytes that belong to whatever follows
/// (tunnel traffic, a response body). Wrapping the stream in `Prebuffered`
/// replays those bytes before any further reads, so the stream can be
/// handed onward as if nothing had been consumed.
pub struct Prebuffered<S> {
    buf: BytesMut,
    inner: S,
}

impl<S> Prebuffered<S> {
    pub fn new(buf: BytesMut, inner: S) -> Self {
        Self { buf, inner }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Prebuffered<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if !self.buf.is_empty() {
            let n = self.buf.len().min(buf.remaining());
            buf.put_slice(&self.buf.split_to(n));
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Prebuffered<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn replays_buffered_bytes_before_inner() {
        let (mut a, b) = tokio::io::duplex(64);
        tokio::io::AsyncWriteExt::write_all(&mut a, b"world").await.unwrap();
        drop(a);

        let mut stream = Prebuffered::new(BytesMut::from(&b"hello "[..]), b);
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn short_reads_drain_the_buffer_in_order() {
        let (_a, b) = tokio::io::duplex(64);
        let mut stream = Prebuffered::new(BytesMut::from(&b"abcdef"[..]), b);
        let mut chunk = [0u8; 4];
        let n = stream.read(&mut chunk).await.unwrap();
        assert_eq!(&chunk[..n], b"abcd");
        let n = stream.read(&mut chunk).await.unwrap();
        assert_eq!(&chunk[..n], b"ef");
    }
}
