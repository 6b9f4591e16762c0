//! The routing wrapper: rules verdict in, provider dispatch out.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use http::StatusCode;
use tracing::{debug, warn};

use hoplink_core::{ProxyRequest, ProxyResult, RequestProcessor, ResponseSink};

use crate::RulesEngine;

/// Registry name of the direct forwarder, always present.
pub const DIRECT_PROVIDER: &str = "DIRECT";

/// Composes the rules engine with a registry of named forwarding
/// providers: the direct proxy under [`DIRECT_PROVIDER`] and one bridge
/// client per exit node URL. Built once at startup, read-only afterwards.
pub struct Router {
    rules: RulesEngine,
    providers: HashMap<String, Arc<dyn RequestProcessor>>,
}

impl Router {
    pub fn new(rules: RulesEngine) -> Self {
        Self {
            rules,
            providers: HashMap::new(),
        }
    }

    pub fn add_provider(&mut self, name: impl Into<String>, provider: Arc<dyn RequestProcessor>) {
        self.providers.insert(name.into(), provider);
    }

    pub fn rules(&self) -> &RulesEngine {
        &self.rules
    }
}

#[async_trait]
impl RequestProcessor for Router {
    async fn process_request(
        &self,
        request: ProxyRequest,
        sink: &mut dyn ResponseSink,
    ) -> ProxyResult<()> {
        let host = request.host().unwrap_or("").to_string();
        let rule = self
            .rules
            .find_match(&host, request.port(), &request.peer_addr);
        debug!(target = %host, peer = %request.peer_addr, ?rule, "matched rule");

        if rule.block {
            sink.send_error(StatusCode::FORBIDDEN, "Forbidden").await?;
            return Ok(());
        }

        let provider_name = rule
            .exit
            .as_ref()
            .map(|exit| exit.url.as_str())
            .unwrap_or(DIRECT_PROVIDER);

        match self.providers.get(provider_name) {
            Some(provider) => provider.process_request(request, sink).await,
            None => {
                // A hole in the registry is a configuration error, not a
                // transport failure; answer the client and carry on.
                warn!(provider = provider_name, "proxy provider not found");
                sink.send_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Proxy provider not found",
                )
                .await?;
                Ok(())
            }
        }
    }
}
