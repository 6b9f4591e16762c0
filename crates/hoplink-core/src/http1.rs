//! HTTP/1.1 wire handling over raw streams.
//!
//! The front end and the bridging protocol both carry requests in plain
//! HTTP/1.1 wire form, parsed with httparse off whatever stream they ride
//! on. Callers keep one [`BytesMut`] per connection so bytes read past a
//! message head are never lost between messages.

use bytes::BytesMut;
use http::header::{HeaderName, HeaderValue, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, Method, StatusCode, Uri, Version};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{ProxyError, ProxyRequest, ProxyResult, ResponseSink};

/// Upper bound on a message head.
pub const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Upper bound on a buffered request body.
pub const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

const READ_CHUNK: usize = 16 * 1024;

/// Read one request off `stream`.
///
/// Returns `Ok(None)` on clean end-of-stream before any request bytes.
/// The body is buffered in full. A chunked body is de-chunked and
/// re-framed with `content-length` since downstream hops forward framed
/// bodies, not chunk streams; other transfer encodings are refused.
pub async fn read_request<S>(
    stream: &mut S,
    buf: &mut BytesMut,
    peer_addr: &str,
) -> ProxyResult<Option<ProxyRequest>>
where
    S: AsyncRead + Unpin,
{
    let head = loop {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut parsed = httparse::Request::new(&mut headers);
        match parsed.parse(buf) {
            Ok(httparse::Status::Complete(head_len)) => {
                let method = parsed
                    .method
                    .and_then(|m| Method::from_bytes(m.as_bytes()).ok())
                    .ok_or_else(|| ProxyError::Protocol("invalid method".to_string()))?;
                let target: Uri = parsed
                    .path
                    .unwrap_or("/")
                    .parse()
                    .map_err(|_| ProxyError::Protocol("invalid request target".to_string()))?;
                let version = match parsed.version {
                    Some(0) => Version::HTTP_10,
                    _ => Version::HTTP_11,
                };
                let headers = collect_headers(parsed.headers)?;
                break (method, target, version, headers, head_len);
            }
            Ok(httparse::Status::Partial) => {
                if buf.len() > MAX_HEAD_BYTES {
                    return Err(ProxyError::Protocol("request head too large".to_string()));
                }
                let before = buf.len();
                buf.reserve(READ_CHUNK);
                let n = stream.read_buf(buf).await?;
                if n == 0 {
                    if before == 0 {
                        return Ok(None);
                    }
                    return Err(ProxyError::Protocol(
                        "connection closed mid request head".to_string(),
                    ));
                }
            }
            Err(e) => return Err(ProxyError::Protocol(e.to_string())),
        }
    };

    let (method, target, version, mut headers, head_len) = head;
    let _ = buf.split_to(head_len);

    let body = if method == Method::CONNECT {
        bytes::Bytes::new()
    } else if let Some(encoding) = headers.get(TRANSFER_ENCODING) {
        let chunked = encoding
            .to_str()
            .map(|v| v.trim().eq_ignore_ascii_case("chunked"))
            .unwrap_or(false);
        if !chunked {
            return Err(ProxyError::UnsupportedBody(
                String::from_utf8_lossy(encoding.as_bytes()).into_owned(),
            ));
        }
        let body = read_chunked_body(stream, buf).await?;
        headers.remove(TRANSFER_ENCODING);
        headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
        body
    } else {
        let len = content_length(&headers)?.unwrap_or(0) as usize;
        if len > MAX_BODY_BYTES {
            return Err(ProxyError::BodyTooLarge);
        }
        while buf.len() < len {
            buf.reserve(READ_CHUNK);
            let n = stream.read_buf(buf).await?;
            if n == 0 {
                return Err(ProxyError::Protocol(
                    "connection closed mid request body".to_string(),
                ));
            }
        }
        buf.split_to(len).freeze()
    };

    Ok(Some(ProxyRequest {
        method,
        target,
        version,
        headers,
        body,
        peer_addr: peer_addr.to_string(),
    }))
}

/// Buffer a chunked body until the terminating zero chunk, trailers
/// included. Chunk extensions and trailers are consumed and dropped.
async fn read_chunked_body<S>(stream: &mut S, buf: &mut BytesMut) -> ProxyResult<bytes::Bytes>
where
    S: AsyncRead + Unpin,
{
    let mut body = BytesMut::new();
    loop {
        let line = read_crlf_line(stream, buf).await?;
        let size_field = line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_field, 16)
            .map_err(|_| ProxyError::Protocol(format!("invalid chunk size {size_field:?}")))?;
        if body.len().saturating_add(size) > MAX_BODY_BYTES {
            return Err(ProxyError::BodyTooLarge);
        }
        if size == 0 {
            loop {
                if read_crlf_line(stream, buf).await?.is_empty() {
                    return Ok(body.freeze());
                }
            }
        }
        while buf.len() < size + 2 {
            fill(stream, buf, "connection closed mid chunk").await?;
        }
        body.extend_from_slice(&buf.split_to(size));
        if &buf[..2] != b"\r\n" {
            return Err(ProxyError::Protocol("chunk missing terminator".to_string()));
        }
        let _ = buf.split_to(2);
    }
}

async fn read_crlf_line<S>(stream: &mut S, buf: &mut BytesMut) -> ProxyResult<String>
where
    S: AsyncRead + Unpin,
{
    loop {
        if let Some(pos) = buf.windows(2).position(|w| w == b"\r\n") {
            let line = buf.split_to(pos);
            let _ = buf.split_to(2);
            return String::from_utf8(line.to_vec())
                .map_err(|_| ProxyError::Protocol("invalid chunk header".to_string()));
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(ProxyError::Protocol("chunk header too long".to_string()));
        }
        fill(stream, buf, "connection closed mid chunk").await?;
    }
}

async fn fill<S>(stream: &mut S, buf: &mut BytesMut, eof_msg: &str) -> ProxyResult<()>
where
    S: AsyncRead + Unpin,
{
    buf.reserve(READ_CHUNK);
    let n = stream.read_buf(buf).await?;
    if n == 0 {
        return Err(ProxyError::Protocol(eof_msg.to_string()));
    }
    Ok(())
}

/// A parsed response head. The reason phrase is kept as received so the
/// head can be relayed without rewriting it.
#[derive(Debug)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub reason: String,
    pub headers: HeaderMap,
}

impl ResponseHead {
    /// Serialize the head back into wire form, reason phrase and all.
    pub fn to_wire(&self) -> Vec<u8> {
        let reason = if self.reason.is_empty() {
            self.status.canonical_reason().unwrap_or("")
        } else {
            &self.reason
        };
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(format!("HTTP/1.1 {} {}\r\n", self.status.as_u16(), reason).as_bytes());
        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_str().as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out
    }
}

/// Read one response head off `stream`. Bytes past the head stay in `buf`.
pub async fn read_response_head<S>(
    stream: &mut S,
    buf: &mut BytesMut,
) -> ProxyResult<ResponseHead>
where
    S: AsyncRead + Unpin,
{
    loop {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut parsed = httparse::Response::new(&mut headers);
        match parsed.parse(buf) {
            Ok(httparse::Status::Complete(head_len)) => {
                let status = parsed
                    .code
                    .and_then(|c| StatusCode::from_u16(c).ok())
                    .ok_or_else(|| ProxyError::Protocol("invalid status code".to_string()))?;
                let reason = parsed.reason.unwrap_or("").to_string();
                let headers = collect_headers(parsed.headers)?;
                let _ = buf.split_to(head_len);
                return Ok(ResponseHead {
                    status,
                    reason,
                    headers,
                });
            }
            Ok(httparse::Status::Partial) => {
                if buf.len() > MAX_HEAD_BYTES {
                    return Err(ProxyError::Protocol("response head too large".to_string()));
                }
                buf.reserve(READ_CHUNK);
                let n = stream.read_buf(buf).await?;
                if n == 0 {
                    return Err(ProxyError::Protocol(
                        "connection closed before response head".to_string(),
                    ));
                }
            }
            Err(e) => return Err(ProxyError::Protocol(e.to_string())),
        }
    }
}

/// Serialize `req` in wire form: request line, headers, blank line, body.
pub async fn write_request<S>(stream: &mut S, req: &ProxyRequest) -> ProxyResult<()>
where
    S: AsyncWrite + Unpin,
{
    let mut out = Vec::with_capacity(256 + req.body.len());
    out.extend_from_slice(
        format!("{} {} HTTP/1.1\r\n", req.method, req.wire_target()).as_bytes(),
    );
    for (name, value) in &req.headers {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(&req.body);
    stream.write_all(&out).await?;
    stream.flush().await?;
    Ok(())
}

/// Stream a response body from `src` to `sink`, bounded by
/// `content_length` when known, end-of-stream otherwise.
pub async fn relay_body<S>(
    src: &mut S,
    content_length: Option<u64>,
    sink: &mut dyn ResponseSink,
) -> ProxyResult<()>
where
    S: AsyncRead + Unpin,
{
    let mut remaining = content_length;
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let want = match remaining {
            Some(0) => break,
            Some(n) => (n as usize).min(chunk.len()),
            None => chunk.len(),
        };
        let n = src.read(&mut chunk[..want]).await?;
        if n == 0 {
            if let Some(left) = remaining {
                if left > 0 {
                    return Err(ProxyError::Protocol(
                        "response body ended early".to_string(),
                    ));
                }
            }
            break;
        }
        sink.write_body(&chunk[..n]).await?;
        if let Some(left) = remaining.as_mut() {
            *left -= n as u64;
        }
    }
    sink.flush().await
}

/// Parse `content-length`, if present.
pub fn content_length(headers: &HeaderMap) -> ProxyResult<Option<u64>> {
    match headers.get(CONTENT_LENGTH) {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .map(Some)
            .ok_or_else(|| ProxyError::Protocol("invalid content-length".to_string())),
    }
}

fn collect_headers(parsed: &[httparse::Header<'_>]) -> ProxyResult<HeaderMap> {
    let mut headers = HeaderMap::with_capacity(parsed.len());
    for header in parsed {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|_| ProxyError::Protocol(format!("invalid header name {}", header.name)))?;
        let value = HeaderValue::from_bytes(header.value)
            .map_err(|_| ProxyError::Protocol(format!("invalid value for {}", header.name)))?;
        headers.append(name, value);
    }
    Ok(headers)
}
