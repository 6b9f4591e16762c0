//! Response sinks: where a processor writes status, headers and body.
//!
//! Two implementations exist. [`ConnectionSink`] owns the accepted client
//! connection and additionally supports hijacking it for tunnels.
//! [`RawResponseWriter`] serializes a response onto any write half; it is
//! the response serializer the bridge server uses when the "response
//! writer" is a wrapped transport rather than a client connection.

use async_trait::async_trait;
use http::header::{CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderValue, StatusCode};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::{ProxyError, ProxyResult};

/// A duplex byte stream usable as a tunnel endpoint.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: ?Sized + AsyncRead + AsyncWrite + Send + Unpin> ByteStream for T {}

pub type BoxedStream = Box<dyn ByteStream>;

/// Write side of one HTTP exchange.
///
/// Wire ordering is the implementor's contract: status before headers
/// before body bytes. `hijack` hands over exclusive ownership of the
/// underlying connection; sinks that cannot do that return
/// [`ProxyError::HijackUnsupported`].
#[async_trait]
pub trait ResponseSink: Send {
    async fn send_head(&mut self, status: StatusCode, headers: &HeaderMap) -> ProxyResult<()>;

    async fn write_body(&mut self, chunk: &[u8]) -> ProxyResult<()>;

    async fn flush(&mut self) -> ProxyResult<()>;

    fn hijack(&mut self) -> ProxyResult<BoxedStream> {
        Err(ProxyError::HijackUnsupported)
    }

    /// Write a complete plain-text error response.
    async fn send_error(&mut self, status: StatusCode, message: &str) -> ProxyResult<()> {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        headers.insert(CONTENT_LENGTH, HeaderValue::from(message.len() + 1));
        self.send_head(status, &headers).await?;
        self.write_body(message.as_bytes()).await?;
        self.write_body(b"\n").await?;
        self.flush().await
    }
}

/// Serialize a response head into wire bytes.
///
/// `transfer-encoding` is dropped: these sinks write raw bytes and cannot
/// re-chunk. A body-bearing response without `content-length` becomes
/// close-delimited and is marked `Connection: close`.
fn encode_head(status: StatusCode, headers: &HeaderMap) -> (Vec<u8>, bool) {
    let mut out = Vec::with_capacity(256);
    let reason = status.canonical_reason().unwrap_or("");
    out.extend_from_slice(format!("HTTP/1.1 {} {}\r\n", status.as_u16(), reason).as_bytes());

    let mut has_length = false;
    for (name, value) in headers {
        if name == TRANSFER_ENCODING {
            continue;
        }
        if name == CONTENT_LENGTH {
            has_length = true;
        }
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }

    let bodyless = status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED;
    let close_delimited = !has_length && !bodyless;
    if close_delimited && !headers.contains_key(CONNECTION) {
        out.extend_from_slice(b"connection: close\r\n");
    }
    out.extend_from_slice(b"\r\n");
    (out, close_delimited)
}

/// Response serializer over a raw write half.
pub struct RawResponseWriter<W> {
    writer: W,
    head_sent: bool,
    close_delimited: bool,
}

impl<W: AsyncWrite + Send + Unpin> RawResponseWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            head_sent: false,
            close_delimited: false,
        }
    }

    /// Whether the response body is delimited by connection close.
    pub fn close_delimited(&self) -> bool {
        self.close_delimited
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[async_trait]
impl<W: AsyncWrite + Send + Unpin> ResponseSink for RawResponseWriter<W> {
    async fn send_head(&mut self, status: StatusCode, headers: &HeaderMap) -> ProxyResult<()> {
        if self.head_sent {
            // Mirror of a response writer's "superfluous WriteHeader" guard.
            return Ok(());
        }
        let (head, close_delimited) = encode_head(status, headers);
        self.writer.write_all(&head).await?;
        self.head_sent = true;
        self.close_delimited = close_delimited;
        Ok(())
    }

    async fn write_body(&mut self, chunk: &[u8]) -> ProxyResult<()> {
        if !self.head_sent {
            self.send_head(StatusCode::OK, &HeaderMap::new()).await?;
        }
        self.writer.write_all(chunk).await?;
        Ok(())
    }

    async fn flush(&mut self) -> ProxyResult<()> {
        self.writer.flush().await?;
        Ok(())
    }
}

/// Sink backed by the accepted client connection. Supports hijacking.
pub struct ConnectionSink {
    stream: Option<BoxedStream>,
    head_sent: bool,
    close_delimited: bool,
}

impl ConnectionSink {
    pub fn new(stream: BoxedStream) -> Self {
        Self {
            stream: Some(stream),
            head_sent: false,
            close_delimited: false,
        }
    }

    pub fn was_hijacked(&self) -> bool {
        self.stream.is_none()
    }

    pub fn close_delimited(&self) -> bool {
        self.close_delimited
    }

    /// Reclaim the connection, unless a processor hijacked it.
    pub fn into_stream(self) -> Option<BoxedStream> {
        self.stream
    }

    fn stream_mut(&mut self) -> ProxyResult<&mut BoxedStream> {
        self.stream.as_mut().ok_or(ProxyError::AlreadyHijacked)
    }
}

#[async_trait]
impl ResponseSink for ConnectionSink {
    async fn send_head(&mut self, status: StatusCode, headers: &HeaderMap) -> ProxyResult<()> {
        if self.head_sent {
            return Ok(());
        }
        let (head, close_delimited) = encode_head(status, headers);
        self.stream_mut()?.write_all(&head).await?;
        self.head_sent = true;
        self.close_delimited = close_delimited;
        Ok(())
    }

    async fn write_body(&mut self, chunk: &[u8]) -> ProxyResult<()> {
        if !self.head_sent {
            self.send_head(StatusCode::OK, &HeaderMap::new()).await?;
        }
        self.stream_mut()?.write_all(chunk).await?;
        Ok(())
    }

    async fn flush(&mut self) -> ProxyResult<()> {
        self.stream_mut()?.flush().await?;
        Ok(())
    }

    fn hijack(&mut self) -> ProxyResult<BoxedStream> {
        self.stream.take().ok_or(ProxyError::AlreadyHijacked)
    }
}
