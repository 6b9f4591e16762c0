//! TCP accept loop and per-connection HTTP serving.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::BytesMut;
use http::StatusCode;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use hoplink_core::http1::read_request;
use hoplink_core::{BoxedStream, ConnectionSink, ProxyError, ProxyResult, RequestProcessor, ResponseSink};

/// The listening front end. Accepts connections, optionally terminates
/// TLS, and serves each connection on its own task until Ctrl-C.
pub struct Server {
    listen: String,
    tls: Option<TlsAcceptor>,
    processor: Arc<dyn RequestProcessor>,
}

impl Server {
    pub fn new(listen: impl Into<String>, processor: Arc<dyn RequestProcessor>) -> Self {
        Self {
            listen: listen.into(),
            tls: None,
            processor,
        }
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }

    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(&self.listen)
            .await
            .with_context(|| format!("cannot bind {}", self.listen))?;
        info!(listen = %self.listen, tls = self.tls.is_some(), "proxy listening");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let processor = self.processor.clone();
                    let tls = self.tls.clone();
                    tokio::spawn(async move {
                        let result = match tls {
                            Some(acceptor) => match acceptor.accept(stream).await {
                                Ok(stream) => {
                                    serve_connection(Box::new(stream), peer, processor).await
                                }
                                Err(e) => {
                                    debug!(peer = %peer, error = %e, "TLS handshake failed");
                                    return;
                                }
                            },
                            None => serve_connection(Box::new(stream), peer, processor).await,
                        };
                        if let Err(e) = result {
                            debug!(peer = %peer, error = %e, "connection ended with error");
                        }
                    });
                }
                _ = signal::ctrl_c() => {
                    info!("shutting down");
                    return Ok(());
                }
            }
        }
    }
}

/// Serve requests off one client connection until it closes.
///
/// Requests are read and dispatched one at a time; the connection is kept
/// for the next request unless it was hijacked for a tunnel, the response
/// was close-delimited, or the client asked to close.
pub async fn serve_connection(
    mut stream: BoxedStream,
    peer: SocketAddr,
    processor: Arc<dyn RequestProcessor>,
) -> ProxyResult<()> {
    let peer_addr = peer.to_string();
    let mut buf = BytesMut::new();

    loop {
        let request = match read_request(&mut stream, &mut buf, &peer_addr).await {
            Ok(Some(request)) => request,
            Ok(None) => return Ok(()),
            Err(e) => {
                let refusal = match &e {
                    ProxyError::UnsupportedBody(_) => Some((
                        StatusCode::LENGTH_REQUIRED,
                        "Unsupported request body encoding",
                    )),
                    ProxyError::BodyTooLarge => {
                        Some((StatusCode::PAYLOAD_TOO_LARGE, "Request body too large"))
                    }
                    ProxyError::Protocol(_) => {
                        Some((StatusCode::BAD_REQUEST, "Malformed request"))
                    }
                    _ => None,
                };
                if let Some((status, message)) = refusal {
                    let mut sink = ConnectionSink::new(stream);
                    let _ = sink.send_error(status, message).await;
                }
                return Err(e);
            }
        };

        let wants_close = request.wants_close();
        let mut sink = ConnectionSink::new(stream);
        processor.process_request(request, &mut sink).await?;

        if sink.was_hijacked() {
            return Ok(());
        }
        let close = sink.close_delimited() || wants_close;
        match sink.into_stream() {
            Some(reclaimed) if !close => stream = reclaimed,
            _ => return Ok(()),
        }
    }
}
