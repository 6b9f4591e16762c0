//! Forwarding provider that sends requests over a websocket link.

use async_trait::async_trait;
use bytes::BytesMut;
use http::{Method, StatusCode};
use tokio::io::AsyncWriteExt;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Error as WsError;
use tracing::{debug, info};

use hoplink_core::http1::{content_length, read_response_head, relay_body, write_request};
use hoplink_core::relay::copy_bidirectional;
use hoplink_core::{
    BoxedStream, Prebuffered, ProxyError, ProxyRequest, ProxyResult, RequestProcessor,
    ResponseSink,
};
use hoplink_transport_ws::{close_with_timeout, EncryptedStream, Role, WsByteStream, CLOSE_TIMEOUT};

const NEXT_HOP_UNREACHABLE: &str = "Failed to reach the next proxy";

/// Forwards requests to a bridge server at `endpoint`, one websocket link
/// per request. With a secret configured the link is encrypted end to end
/// of the hop, so an on-path websocket terminator sees only sealed
/// records.
#[derive(Debug)]
pub struct BridgeClient {
    endpoint: String,
    secret: Option<Vec<u8>>,
}

impl BridgeClient {
    /// The secret, when given, must be a full-length key; refusing a bad
    /// key at construction beats every request failing at dial time.
    pub fn new(endpoint: impl Into<String>, secret: Option<Vec<u8>>) -> ProxyResult<Self> {
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
            endpoint: endpoint.into(),
            secret,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn open_link(&self, sink: &mut dyn ResponseSink) -> ProxyResult<BoxedStream> {
        let (ws, _) = match connect_async(&self.endpoint).await {
            Ok(pair) => pair,
            Err(WsError::Http(response))
                if response.status() == StatusCode::PROXY_AUTHENTICATION_REQUIRED =>
            {
                sink.send_error(
                    StatusCode::PROXY_AUTHENTICATION_REQUIRED,
                    "Proxy authentication required",
                )
                .await?;
                return Err(ProxyError::ProxyAuthRequired);
            }
            Err(e) => {
                sink.send_error(StatusCode::BAD_GATEWAY, NEXT_HOP_UNREACHABLE)
                    .await?;
                return Err(ProxyError::Upstream(format!(
                    "websocket dial {} failed: {}",
                    self.endpoint, e
                )));
            }
        };

        let ws = WsByteStream::new(ws);
        match &self.secret {
            Some(secret) => Ok(Box::new(EncryptedStream::new(ws, secret, Role::Initiator)?)),
            None => Ok(Box::new(ws)),
        }
    }
}

#[async_trait]
impl RequestProcessor for BridgeClient {
    async fn process_request(
        &self,
        request: ProxyRequest,
        sink: &mut dyn ResponseSink,
    ) -> ProxyResult<()> {
        let mut link = self.open_link(sink).await?;
        debug!(endpoint = %self.endpoint, method = %request.method, target = %request.wire_target(), "link opened");

        if let Err(e) = write_request(&mut link, &request).await {
            sink.send_error(StatusCode::BAD_GATEWAY, NEXT_HOP_UNREACHABLE)
                .await?;
            return Err(e);
        }

        let mut buf = BytesMut::new();
        let head = match read_response_head(&mut link, &mut buf).await {
            Ok(head) => head,
            Err(e) => {
                sink.send_error(StatusCode::BAD_GATEWAY, "Invalid response from the next proxy")
                    .await?;
                return Err(e);
            }
        };

        if request.method == Method::CONNECT && head.status.is_success() {
            // The far end has its tunnel; relay its head as received,
            // then raw bytes from here on.
            let mut client = sink.hijack()?;
            client.write_all(&head.to_wire()).await?;
            client.flush().await?;
            info!(endpoint = %self.endpoint, target = %request.wire_target(), peer = %request.peer_addr, "bridged tunnel established");
            copy_bidirectional(client, Prebuffered::new(buf, link)).await?;
            return Ok(());
        }

        sink.send_head(head.status, &head.headers).await?;
        let mut remote = Prebuffered::new(buf, link);
        relay_body(&mut remote, content_length(&head.headers)?, sink).await?;
        close_with_timeout(&mut remote, CLOSE_TIMEOUT).await;
        Ok(())
    }
}
