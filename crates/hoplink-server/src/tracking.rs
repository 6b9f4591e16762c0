//! Request accounting around any processor.

use std::net::IpAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use hoplink_core::{ProxyRequest, ProxyResult, RequestProcessor, ResponseSink};

const NAME_TTL: Duration = Duration::from_secs(60 * 60);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Reverse name lookup for peer addresses. Left unset, peers are logged
/// by address only; resolution is pluggable so the proxy never blocks on
/// DNS it does not need.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn reverse(&self, ip: IpAddr) -> Option<String>;
}

struct CachedName {
    name: String,
    cached_at: Instant,
}

/// Decorator that counts requests in flight and logs one line per
/// finished request with its duration and caller.
///
/// Two background tasks run for the tracker's lifetime: a heartbeat that
/// logs the in-flight gauge every 30 seconds, and a sweeper that evicts
/// resolved names older than an hour. Both stop when the tracker drops.
pub struct RequestTracker {
    inner: Arc<dyn RequestProcessor>,
    in_flight: Arc<AtomicI64>,
    names: Arc<DashMap<IpAddr, CachedName>>,
    resolver: Option<Arc<dyn Resolver>>,
    tasks: Vec<JoinHandle<()>>,
}

impl RequestTracker {
    pub fn new(inner: Arc<dyn RequestProcessor>) -> Self {
        Self::with_resolver(inner, None)
    }

    pub fn with_resolver(
        inner: Arc<dyn RequestProcessor>,
        resolver: Option<Arc<dyn Resolver>>,
    ) -> Self {
        let in_flight = Arc::new(AtomicI64::new(0));
        let names: Arc<DashMap<IpAddr, CachedName>> = Arc::new(DashMap::new());

        let gauge = in_flight.clone();
        let heartbeat = tokio::spawn(async move {
            let mut tick = tokio::time::interval(HEARTBEAT_INTERVAL);
            tick.tick().await;
            loop {
                tick.tick().await;
                info!(in_flight = gauge.load(Ordering::SeqCst), "requests in flight");
            }
        });

        let cache = names.clone();
        let sweeper = tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            tick.tick().await;
            loop {
                tick.tick().await;
                cache.retain(|_, cached| cached.cached_at.elapsed() < NAME_TTL);
            }
        });

        Self {
            inner,
            in_flight,
            names,
            resolver,
            tasks: vec![heartbeat, sweeper],
        }
    }

    async fn peer_name(&self, peer_addr: &str) -> String {
        let ip = match peer_addr.parse::<std::net::SocketAddr>() {
            Ok(addr) => addr.ip(),
            Err(_) => return peer_addr.to_string(),
        };
        if let Some(cached) = self.names.get(&ip) {
            if cached.cached_at.elapsed() < NAME_TTL {
                return cached.name.clone();
            }
        }
        let resolver = match &self.resolver {
            Some(resolver) => resolver,
            None => return peer_addr.to_string(),
        };
        let name = resolver
            .reverse(ip)
            .await
            .unwrap_or_else(|| ip.to_string());
        self.names.insert(
            ip,
            CachedName {
                name: name.clone(),
                cached_at: Instant::now(),
            },
        );
        name
    }
}

impl Drop for RequestTracker {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[async_trait]
impl RequestProcessor for RequestTracker {
    async fn process_request(
        &self,
        request: ProxyRequest,
        sink: &mut dyn ResponseSink,
    ) -> ProxyResult<()> {
        let method = request.method.clone();
        let destination = request.wire_target();
        let source = self.peer_name(&request.peer_addr).await;
        let started = Instant::now();

        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(%method, %destination, %source, in_flight, "request started");

        let result = self.inner.process_request(request, sink).await;

        let in_flight = self.in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
        info!(
            %method,
            %destination,
            %source,
            duration_ms = started.elapsed().as_millis() as u64,
            in_flight,
            ok = result.is_ok(),
            "request finished"
        );
        result
    }
}
