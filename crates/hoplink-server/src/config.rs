//! YAML configuration and TLS material loading.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tokio_rustls::TlsAcceptor;

use hoplink_core::tls::ensure_crypto_provider;
use hoplink_rules::Rule;
use hoplink_transport_ws::KEY_LEN;

/// What the node does with requests when no rules are configured.
/// Configured rules take over routing entirely and make the mode moot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Forward directly to destinations.
    #[default]
    Standalone,
    /// Forward everything to the next hop over a websocket link.
    Bridge,
    /// Accept websocket links and forward their requests directly.
    Exit,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Listen address, e.g. `0.0.0.0:8080`.
    pub listen: String,
    pub mode: Mode,
    /// Next hop websocket URL, bridge mode only.
    pub next: String,
    /// Link encryption key as 64 hex characters.
    #[serde(rename = "wskey", alias = "wsKey")]
    pub ws_key: String,
    pub tls: Option<TlsConfig>,
    pub rules: Vec<Rule>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    pub cert: String,
    pub key: String,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("cannot open config file {}", path.display()))?;
        serde_yaml::from_reader(BufReader::new(file))
            .with_context(|| format!("invalid config file {}", path.display()))
    }
}

impl TlsConfig {
    pub fn build_acceptor(&self) -> Result<TlsAcceptor> {
        ensure_crypto_provider();
        let certs = load_certs(Path::new(&self.cert))?;
        let key = load_private_key(Path::new(&self.key))?;
        let server_crypto = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .context("invalid certificate or key")?;
        Ok(TlsAcceptor::from(Arc::new(server_crypto)))
    }
}

/// Decode a hex link key. Empty means no encryption; anything else must
/// decode to exactly [`KEY_LEN`] bytes.
pub fn decode_key(hex_key: &str) -> Result<Option<Vec<u8>>> {
    if hex_key.is_empty() {
        return Ok(None);
    }
    let bytes = hex::decode(hex_key).context("link key is not valid hex")?;
    if bytes.len() != KEY_LEN {
        bail!(
            "link key must be {} hex characters, got {}",
            KEY_LEN * 2,
            hex_key.len()
        );
    }
    Ok(Some(bytes))
}

fn load_certs(path: &Path) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let file = File::open(path)
        .with_context(|| format!("cannot open certificate file {}", path.display()))?;
    rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::io::Result<Vec<_>>>()
        .with_context(|| format!("invalid certificate file {}", path.display()))
}

fn load_private_key(path: &Path) -> Result<rustls::pki_types::PrivateKeyDer<'static>> {
    let file = File::open(path)
        .with_context(|| format!("cannot open key file {}", path.display()))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .with_context(|| format!("invalid key file {}", path.display()))?
        .with_context(|| format!("no private key found in {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_config_parses() {
        let yaml = r#"
listen: "0.0.0.0:8080"
mode: bridge
next: "ws://next-hop:8080"
wskey: "aabb"
tls:
  cert: "/etc/hoplink/cert.pem"
  key: "/etc/hoplink/key.pem"
rules:
  - target: ["internal.example.com"]
    block: true
  - exit:
      url: "ws://exit:8080"
      key: ""
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.listen, "0.0.0.0:8080");
        assert_eq!(config.mode, Mode::Bridge);
        assert_eq!(config.next, "ws://next-hop:8080");
        assert_eq!(config.ws_key, "aabb");
        assert_eq!(config.tls.unwrap().cert, "/etc/hoplink/cert.pem");
        assert_eq!(config.rules.len(), 2);
    }

    #[test]
    fn empty_config_means_standalone_defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.mode, Mode::Standalone);
        assert!(config.rules.is_empty());
        assert!(config.tls.is_none());
    }

    #[test]
    fn key_decoding_enforces_length() {
        assert_eq!(decode_key("").unwrap(), None);
        let key = decode_key(&"ab".repeat(KEY_LEN)).unwrap().unwrap();
        assert_eq!(key.len(), KEY_LEN);
        assert!(decode_key("abcd").is_err());
        assert!(decode_key("not hex at all").is_err());
    }
}
