//! Error types shared across the proxy chain.

use thiserror::Error;

/// Errors produced while processing a request.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to reach {host}: {source}")]
    Dial {
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed HTTP message: {0}")]
    Protocol(String),

    #[error("request body too large")]
    BodyTooLarge,

    #[error("request body framing not supported: {0}")]
    UnsupportedBody(String),

    #[error("connection hijacking not supported by this response sink")]
    HijackUnsupported,

    #[error("connection already hijacked")]
    AlreadyHijacked,

    #[error("connection from {0} not allowed")]
    NotAllowed(String),

    #[error("encryption setup failed: {0}")]
    Crypto(String),

    #[error("next proxy requires authentication")]
    ProxyAuthRequired,

    #[error("upstream request failed: {0}")]
    Upstream(String),
}

pub type ProxyResult<T> = Result<T, ProxyError>;
