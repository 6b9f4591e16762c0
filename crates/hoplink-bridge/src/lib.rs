//! Hop-to-hop bridging over websockets.
//!
//! [`BridgeClient`] forwards a request to the next hop by opening a
//! websocket link, writing the request in HTTP/1.1 wire form and relaying
//! whatever comes back. [`BridgeServer`] is the other end: it accepts the
//! upgrade, reads the embedded request off the link and hands it to the
//! direct forwarder. With a shared secret configured both ends seal the
//! link with authenticated encryption.

pub mod client;
pub mod server;

pub use client::BridgeClient;
pub use server::BridgeServer;
