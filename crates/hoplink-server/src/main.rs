//! hoplink - a chainable forwarding proxy.
//!
//! One binary, three shapes: a standalone proxy that forwards directly,
//! a bridge that sends everything to the next hop over websockets, and
//! an exit node that terminates those links. Configured rules replace
//! the mode's processor with per-rule routing.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hoplink_bridge::{BridgeClient, BridgeServer};
use hoplink_core::{DirectProxy, RequestProcessor};
use hoplink_rules::{Router, RulesEngine, DIRECT_PROVIDER};
use hoplink_server::{decode_key, Config, Mode, RequestTracker, Server};

#[derive(Parser, Debug)]
#[command(name = "hoplink")]
#[command(about = "A chainable forwarding proxy", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(long, short = 'c', env = "HOPLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address (overrides the configuration file)
    #[arg(long)]
    listen: Option<String>,

    /// Operating mode when no rules are configured
    #[arg(long, value_enum)]
    mode: Option<Mode>,

    /// Next hop websocket URL, bridge mode only
    #[arg(long)]
    next: Option<String>,

    /// Link encryption key, 64 hex characters
    #[arg(long, env = "HOPLINK_KEY")]
    key: Option<String>,

    /// TLS certificate for the listener (PEM)
    #[arg(long)]
    tls_cert: Option<PathBuf>,

    /// TLS private key for the listener (PEM)
    #[arg(long)]
    tls_key: Option<PathBuf>,

    /// Log level when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level)?;

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    apply_overrides(&mut config, &cli)?;
    if config.listen.is_empty() {
        config.listen = "0.0.0.0:8080".to_string();
    }

    let processor = build_processor(&config)?;
    let processor = Arc::new(RequestTracker::new(processor));

    let mut server = Server::new(config.listen.clone(), processor);
    if let Some(tls) = &config.tls {
        server = server.with_tls(tls.build_acceptor()?);
    }
    server.run().await
}

fn apply_overrides(config: &mut Config, cli: &Cli) -> Result<()> {
    if let Some(listen) = &cli.listen {
        config.listen = listen.clone();
    }
    if let Some(mode) = cli.mode {
        config.mode = mode;
    }
    if let Some(next) = &cli.next {
        config.next = next.clone();
    }
    if let Some(key) = &cli.key {
        config.ws_key = key.clone();
    }
    match (&cli.tls_cert, &cli.tls_key) {
        (Some(cert), Some(key)) => {
            config.tls = Some(hoplink_server::TlsConfig {
                cert: cert.display().to_string(),
                key: key.display().to_string(),
            });
        }
        (None, None) => {}
        _ => bail!("--tls-cert and --tls-key must be given together"),
    }
    Ok(())
}

fn build_processor(config: &Config) -> Result<Arc<dyn RequestProcessor>> {
    let key = decode_key(&config.ws_key)?;

    if !config.rules.is_empty() {
        let engine = RulesEngine::new(config.rules.clone());
        let mut providers: Vec<(String, Arc<dyn RequestProcessor>)> = Vec::new();
        for exit in engine.exit_nodes() {
            let exit_key = decode_key(&exit.key)?;
            providers.push((
                exit.url.clone(),
                Arc::new(BridgeClient::new(exit.url.clone(), exit_key)?),
            ));
        }
        let mut router = Router::new(engine);
        router.add_provider(DIRECT_PROVIDER, Arc::new(DirectProxy::new()));
        for (url, provider) in providers {
            router.add_provider(url, provider);
        }
        return Ok(Arc::new(router));
    }

    Ok(match config.mode {
        Mode::Standalone => Arc::new(DirectProxy::new()),
        Mode::Bridge => {
            if config.next.is_empty() {
                bail!("bridge mode requires a next hop URL");
            }
            Arc::new(BridgeClient::new(config.next.clone(), key)?)
        }
        Mode::Exit => Arc::new(BridgeServer::new(key)?),
    })
}

fn init_tracing(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))?;
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
    Ok(())
}
