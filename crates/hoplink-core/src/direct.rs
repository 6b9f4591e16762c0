//! The terminal forwarder: plain HTTP forwarding and CONNECT tunnels.

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderName, HOST};
use http::{HeaderMap, Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

use crate::request::format_authority;
use crate::sink::BoxedStream;
use crate::{relay, ProxyError, ProxyRequest, ProxyResult, RequestProcessor, ResponseSink};

/// Headers that describe the proxy-to-client hop, never forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Forwards requests straight to their destination.
pub struct DirectProxy {
    tls: TlsConnector,
}

impl DirectProxy {
    pub fn new() -> Self {
        Self {
            tls: crate::tls::webpki_connector(),
        }
    }

    /// CONNECT tunnel: dial the target, report establishment on the raw
    /// client stream, then pump bytes until either side ends.
    ///
    /// On dial failure a synthetic 504 status line is written to
    /// `client_stream` and the error returned; closing the stream is the
    /// caller's job on that path.
    pub async fn process_tunnel_request<C>(
        &self,
        request: &ProxyRequest,
        mut client_stream: C,
    ) -> ProxyResult<()>
    where
        C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let authority = request.tunnel_authority()?;

        let dest = match TcpStream::connect(&authority).await {
            Ok(dest) => dest,
            Err(e) => {
                let _ = client_stream
                    .write_all(b"HTTP/1.1 504 Gateway Timeout\r\n\r\n")
                    .await;
                let _ = client_stream.flush().await;
                return Err(ProxyError::Dial {
                    host: authority,
                    source: e,
                });
            }
        };

        client_stream
            .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .await?;
        client_stream.flush().await?;

        info!(target = %authority, peer = %request.peer_addr, "tunnel established");
        relay::copy_bidirectional(dest, client_stream).await?;
        Ok(())
    }

    /// Plain forwarding: one outbound HTTP/1.1 exchange, response relayed
    /// verbatim. Redirects are never followed and no state is carried
    /// between requests.
    pub async fn process_plain_request(
        &self,
        request: ProxyRequest,
        sink: &mut dyn ResponseSink,
    ) -> ProxyResult<()> {
        let scheme = request.target.scheme_str().unwrap_or("http");
        let https = scheme == "https";
        let host = request
            .host()
            .map(str::to_string)
            .ok_or_else(|| ProxyError::Protocol("request target has no host".to_string()))?;
        let port = request.port().unwrap_or(if https { 443 } else { 80 });
        let authority = format_authority(&host, port);

        let stream = match self.dial(&authority, &host, https).await {
            Ok(stream) => stream,
            Err(e) => {
                sink.send_error(
                    StatusCode::BAD_GATEWAY,
                    "Failed to reach the destination server",
                )
                .await?;
                return Err(e);
            }
        };

        let (mut sender, conn) = match http1::handshake(TokioIo::new(stream)).await {
            Ok(pair) => pair,
            Err(e) => {
                sink.send_error(
                    StatusCode::BAD_GATEWAY,
                    "Failed to reach the destination server",
                )
                .await?;
                return Err(ProxyError::Upstream(e.to_string()));
            }
        };
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("upstream connection closed: {}", e);
            }
        });

        let outbound = build_outbound(&request)?;
        debug!(method = %request.method, target = %request.target, "forwarding request");

        let response = match sender.send_request(outbound).await {
            Ok(response) => response,
            Err(e) => {
                sink.send_error(
                    StatusCode::BAD_GATEWAY,
                    "Failed to reach the destination server",
                )
                .await?;
                return Err(ProxyError::Upstream(e.to_string()));
            }
        };

        sink.send_head(response.status(), response.headers()).await?;

        let mut body = response.into_body();
        while let Some(frame) = body.frame().await {
            let frame = frame.map_err(|e| ProxyError::Upstream(e.to_string()))?;
            if let Ok(data) = frame.into_data() {
                sink.write_body(&data).await?;
            }
        }
        sink.flush().await
    }

    async fn dial(&self, authority: &str, host: &str, https: bool) -> ProxyResult<BoxedStream> {
        let tcp = TcpStream::connect(authority)
            .await
            .map_err(|e| ProxyError::Dial {
                host: authority.to_string(),
                source: e,
            })?;

        if !https {
            return Ok(Box::new(tcp));
        }

        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| ProxyError::Protocol(format!("invalid server name {host}")))?;
        let tls = self
            .tls
            .connect(server_name, tcp)
            .await
            .map_err(|e| ProxyError::Upstream(format!("TLS handshake failed: {e}")))?;
        Ok(Box::new(tls))
    }
}

impl Default for DirectProxy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RequestProcessor for DirectProxy {
    async fn process_request(
        &self,
        request: ProxyRequest,
        sink: &mut dyn ResponseSink,
    ) -> ProxyResult<()> {
        if request.method == Method::CONNECT {
            let client_stream = sink.hijack()?;
            self.process_tunnel_request(&request, client_stream).await
        } else {
            self.process_plain_request(request, sink).await
        }
    }
}

fn build_outbound(request: &ProxyRequest) -> ProxyResult<Request<Full<Bytes>>> {
    let path = request
        .target
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let mut builder = Request::builder()
        .method(request.method.clone())
        .uri(path);

    let headers = builder
        .headers_mut()
        .ok_or_else(|| ProxyError::Protocol("invalid outbound request".to_string()))?;
    *headers = strip_hop_by_hop(&request.headers);
    if !headers.contains_key(HOST) {
        let host = request
            .host()
            .ok_or_else(|| ProxyError::Protocol("request target has no host".to_string()))?;
        headers.insert(
            HOST,
            host.parse()
                .map_err(|_| ProxyError::Protocol("invalid host".to_string()))?,
        );
    }

    builder
        .body(Full::new(request.body.clone()))
        .map_err(|e| ProxyError::Protocol(e.to_string()))
}

fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        out.append::<HeaderName>(name.clone(), value.clone());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::HeaderValue;
    use http::{Uri, Version};

    fn request(method: Method, target: &str) -> ProxyRequest {
        ProxyRequest {
            method,
            target: target.parse::<Uri>().unwrap(),
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            peer_addr: "127.0.0.1:5000".to_string(),
        }
    }

    #[test]
    fn outbound_keeps_end_to_end_headers_only() {
        let mut req = request(Method::GET, "http://example.com/path?q=1");
        req.headers
            .insert(HOST, HeaderValue::from_static("example.com"));
        req.headers
            .insert("accept", HeaderValue::from_static("*/*"));
        req.headers
            .insert("proxy-connection", HeaderValue::from_static("keep-alive"));

        let out = build_outbound(&req).unwrap();
        assert_eq!(out.uri(), "/path?q=1");
        assert_eq!(out.headers().get(HOST).unwrap(), "example.com");
        assert_eq!(out.headers().get("accept").unwrap(), "*/*");
        assert!(out.headers().get("proxy-connection").is_none());
    }

    #[test]
    fn outbound_derives_host_when_absent() {
        let req = request(Method::GET, "http://example.com/");
        let out = build_outbound(&req).unwrap();
        assert_eq!(out.headers().get(HOST).unwrap(), "example.com");
    }

    #[tokio::test]
    async fn tunnel_dial_failure_writes_504_and_errors() {
        let proxy = DirectProxy::new();
        // Grab a loopback port and close it again so the dial is refused.
        let closed_port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let req = request(Method::CONNECT, &format!("127.0.0.1:{closed_port}"));
        let (near, far) = tokio::io::duplex(256);

        let result = proxy.process_tunnel_request(&req, far).await;
        assert!(matches!(result, Err(ProxyError::Dial { .. })));

        let mut out = Vec::new();
        let mut near = near;
        tokio::io::AsyncReadExt::read_to_end(&mut near, &mut out).await.unwrap();
        assert!(out.starts_with(b"HTTP/1.1 504 Gateway Timeout\r\n"));
    }
}
