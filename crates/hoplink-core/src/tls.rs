//! Shared rustls setup.

use std::sync::Arc;

use tokio_rustls::TlsConnector;

static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

/// Install the ring crypto provider exactly once per process.
pub fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("rustls crypto provider already installed");
        }
    });
}

/// Client connector trusting the webpki root set, for outbound https.
pub fn webpki_connector() -> TlsConnector {
    ensure_crypto_provider();

    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let client_crypto = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    TlsConnector::from(Arc::new(client_crypto))
}
