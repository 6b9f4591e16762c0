//! Core request model and forwarding engine for the hoplink proxy chain.
//!
//! Everything that forwards a request implements [`RequestProcessor`]:
//! the direct forwarder, the bridge client/server, the routing wrapper,
//! and any decorator around them. The trait is the composition seam:
//! callers hold `Arc<dyn RequestProcessor>` and never a concrete type.

pub mod direct;
pub mod error;
pub mod http1;
pub mod io_util;
pub mod relay;
pub mod request;
pub mod sink;
pub mod tls;

pub use direct::DirectProxy;
pub use error::{ProxyError, ProxyResult};
pub use io_util::Prebuffered;
pub use request::ProxyRequest;
pub use sink::{BoxedStream, ByteStream, ConnectionSink, RawResponseWriter, ResponseSink};

use async_trait::async_trait;

/// Common contract for anything that can take a request and produce a
/// response on a sink.
///
/// Errors returned here mean the request genuinely failed. Anticipated
/// rejections (blocked callers, unknown providers) are resolved into a
/// client-visible status response and return `Ok`.
#[async_trait]
pub trait RequestProcessor: Send + Sync {
    async fn process_request(
        &self,
        request: ProxyRequest,
        sink: &mut dyn ResponseSink,
    ) -> ProxyResult<()>;
}
