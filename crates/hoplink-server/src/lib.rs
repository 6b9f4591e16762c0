//! The hoplink front end: listener, configuration and request tracking.

pub mod config;
pub mod serve;
pub mod tracking;

pub use config::{decode_key, Config, Mode, TlsConfig};
pub use serve::{serve_connection, Server};
pub use tracking::RequestTracker;
