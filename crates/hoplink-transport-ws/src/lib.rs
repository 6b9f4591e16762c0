//! WebSocket-backed byte transports for hop-to-hop links.
//!
//! [`WsByteStream`] turns a message-oriented websocket into an ordinary
//! [`AsyncRead`]/[`AsyncWrite`] duplex stream; [`EncryptedStream`] layers
//! authenticated encryption on top of any such stream. Stacked together
//! they carry proxied connections between hops without the rest of the
//! code knowing anything about websockets or ciphers.
//!
//! [`AsyncRead`]: tokio::io::AsyncRead
//! [`AsyncWrite`]: tokio::io::AsyncWrite

pub mod crypto;
pub mod stream;

pub use crypto::{EncryptedStream, Role, KEY_LEN};
pub use stream::{close_with_timeout, WsByteStream, CLOSE_TIMEOUT};
