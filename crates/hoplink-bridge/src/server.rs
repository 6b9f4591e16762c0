//! The accepting end of a bridge link.

use std::net::IpAddr;

use async_trait::async_trait;
use bytes::BytesMut;
use http::header::{SEC_WEBSOCKET_KEY, UPGRADE};
use http::StatusCode;
use tokio::io::AsyncWriteExt;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role as WsRole;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use hoplink_core::http1::read_request;
use hoplink_core::{
    BoxedStream, ConnectionSink, DirectProxy, Prebuffered, ProxyError, ProxyRequest, ProxyResult,
    RequestProcessor, ResponseSink,
};
use hoplink_transport_ws::{close_with_timeout, EncryptedStream, Role, WsByteStream, CLOSE_TIMEOUT};

/// Accepts websocket upgrades, unwraps the link and forwards the single
/// embedded request through the direct forwarder.
///
/// Without a secret configured only callers on private or loopback
/// addresses are served; an open relay reachable from the internet is
/// never the default. With a secret anyone may connect, since a caller
/// without the key cannot produce one valid record.
pub struct BridgeServer {
    secret: Option<Vec<u8>>,
    direct: DirectProxy,
}

impl BridgeServer {
    pub fn new(secret: Option<Vec<u8>>) -> ProxyResult<Self> {
        if let Some(secret) = &secret {
            if secret.len() != hoplink_transport_ws::KEY_LEN {
                return Err(ProxyError::Crypto(format!(
                    "bridge key must be {} bytes, got {}",
                    hoplink_transport_ws::KEY_LEN,
                    secret.len()
                )));
            }
        }
        Ok(Self {
            secret,
            direct: DirectProxy::new(),
        })
    }

    fn is_allowed(&self, peer_addr: &str) -> bool {
        if self.secret.is_some() {
            return true;
        }
        peer_addr
            .parse::<std::net::SocketAddr>()
            .map(|addr| is_private(addr.ip()))
            .unwrap_or(false)
    }
}

fn is_private(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => v6.is_loopback() || (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}

fn upgrade_key(request: &ProxyRequest) -> Option<&[u8]> {
    let upgrades = request
        .headers
        .get_all(UPGRADE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("websocket")));
    if !upgrades {
        return None;
    }
    request.headers.get(SEC_WEBSOCKET_KEY).map(|v| v.as_bytes())
}

#[async_trait]
impl RequestProcessor for BridgeServer {
    async fn process_request(
        &self,
        request: ProxyRequest,
        sink: &mut dyn ResponseSink,
    ) -> ProxyResult<()> {
        if !self.is_allowed(&request.peer_addr) {
            warn!(peer = %request.peer_addr, "rejected bridge caller");
            sink.send_error(StatusCode::FORBIDDEN, "Not allowed").await?;
            return Err(ProxyError::NotAllowed(request.peer_addr));
        }

        let key = match upgrade_key(&request) {
            Some(key) => derive_accept_key(key),
            None => {
                sink.send_error(StatusCode::BAD_REQUEST, "Expected a websocket upgrade")
                    .await?;
                return Ok(());
            }
        };

        let mut raw = sink.hijack()?;
        let response = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             upgrade: websocket\r\n\
             connection: Upgrade\r\n\
             sec-websocket-accept: {key}\r\n\r\n"
        );
        raw.write_all(response.as_bytes()).await?;
        raw.flush().await?;

        let ws = WebSocketStream::from_raw_socket(raw, WsRole::Server, None).await;
        let ws = WsByteStream::new(ws);
        let mut link: BoxedStream = match &self.secret {
            Some(secret) => Box::new(EncryptedStream::new(ws, secret, Role::Responder)?),
            None => Box::new(ws),
        };
        info!(peer = %request.peer_addr, "bridge link accepted");

        let mut buf = BytesMut::new();
        let embedded = match read_request(&mut link, &mut buf, &request.peer_addr).await? {
            Some(embedded) => embedded,
            // Link opened and closed without a request; nothing to do.
            None => return Ok(()),
        };
        debug!(peer = %request.peer_addr, method = %embedded.method, target = %embedded.wire_target(), "embedded request");

        let mut link_sink = ConnectionSink::new(Box::new(Prebuffered::new(buf, link)));
        let result = self.direct.process_request(embedded, &mut link_sink).await;

        if let Some(mut stream) = link_sink.into_stream() {
            close_with_timeout(&mut stream, CLOSE_TIMEOUT).await;
        }
        result
    }
}
