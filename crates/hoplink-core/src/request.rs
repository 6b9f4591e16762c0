//! The request value handed to every [`RequestProcessor`](crate::RequestProcessor).

use http::header::HOST;
use http::{HeaderMap, Method, Uri, Version};

use bytes::Bytes;

use crate::{ProxyError, ProxyResult};

/// One inbound proxy request: method, target, headers, buffered body and
/// the caller's address.
///
/// The target keeps the form it arrived in: authority-form for CONNECT
/// (`example.com:443`), absolute-form or origin-form otherwise. Helpers
/// below resolve host/port from the target or, failing that, the `Host`
/// header.
#[derive(Debug)]
pub struct ProxyRequest {
    pub method: Method,
    pub target: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub peer_addr: String,
}

impl ProxyRequest {
    /// Destination hostname, without port.
    pub fn host(&self) -> Option<&str> {
        if let Some(host) = self.target.host() {
            return Some(host);
        }
        self.host_header().map(|(host, _)| host)
    }

    /// Destination port, only when the target (or Host header) names one
    /// explicitly. Rule matching treats an absent port as "unspecified",
    /// so no scheme default is applied here.
    pub fn port(&self) -> Option<u16> {
        if self.target.host().is_some() {
            return self.target.port_u16();
        }
        self.host_header().and_then(|(_, port)| port)
    }

    /// `host:port` authority for tunnel dialing, defaulting to 443 when
    /// the request target carries no port.
    pub fn tunnel_authority(&self) -> ProxyResult<String> {
        let host = self
            .host()
            .ok_or_else(|| ProxyError::Protocol("request target has no host".to_string()))?;
        let port = self.port().unwrap_or(443);
        Ok(format_authority(host, port))
    }

    /// The request-target exactly as it should appear on the wire.
    pub fn wire_target(&self) -> String {
        if self.method == Method::CONNECT {
            self.target
                .authority()
                .map(|a| a.to_string())
                .unwrap_or_else(|| self.target.to_string())
        } else {
            self.target.to_string()
        }
    }

    /// Whether the client asked for the connection to be closed after
    /// this exchange.
    pub fn wants_close(&self) -> bool {
        if self.version == Version::HTTP_10 {
            return true;
        }
        self.headers
            .get(http::header::CONNECTION)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_ascii_lowercase().contains("close"))
            .unwrap_or(false)
    }

    fn host_header(&self) -> Option<(&str, Option<u16>)> {
        let value = self.headers.get(HOST)?.to_str().ok()?;
        Some(split_host_port(value))
    }
}

/// Split `host[:port]`, tolerating bracketed IPv6 literals.
pub fn split_host_port(value: &str) -> (&str, Option<u16>) {
    if let Some(rest) = value.strip_prefix('[') {
        // [::1]:8080 or [::1]
        if let Some(end) = rest.find(']') {
            let host = &rest[..end];
            let port = rest[end + 1..]
                .strip_prefix(':')
                .and_then(|p| p.parse().ok());
            return (host, port);
        }
        return (value, None);
    }
    match value.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => match port.parse() {
            Ok(port) => (host, Some(port)),
            Err(_) => (value, None),
        },
        _ => (value, None),
    }
}

/// `host:port`, bracketing IPv6 literals.
pub fn format_authority(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::HeaderValue;

    fn request(method: Method, target: &str) -> ProxyRequest {
        ProxyRequest {
            method,
            target: target.parse().unwrap(),
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            peer_addr: "127.0.0.1:9999".to_string(),
        }
    }

    #[test]
    fn connect_target_is_authority_form() {
        let req = request(Method::CONNECT, "internal.example.com:443");
        assert_eq!(req.host(), Some("internal.example.com"));
        assert_eq!(req.port(), Some(443));
        assert_eq!(req.wire_target(), "internal.example.com:443");
    }

    #[test]
    fn origin_form_falls_back_to_host_header() {
        let mut req = request(Method::GET, "/index.html");
        req.headers
            .insert(HOST, HeaderValue::from_static("example.com:8080"));
        assert_eq!(req.host(), Some("example.com"));
        assert_eq!(req.port(), Some(8080));
    }

    #[test]
    fn absolute_form_without_port_has_no_port() {
        let req = request(Method::GET, "http://example.com/path");
        assert_eq!(req.host(), Some("example.com"));
        assert_eq!(req.port(), None);
    }

    #[test]
    fn tunnel_authority_defaults_to_443() {
        let mut req = request(Method::CONNECT, "example.com:8443");
        assert_eq!(req.tunnel_authority().unwrap(), "example.com:8443");
        req.target = "http://example.com/".parse().unwrap();
        assert_eq!(req.tunnel_authority().unwrap(), "example.com:443");
    }

    #[test]
    fn split_host_port_handles_ipv6() {
        assert_eq!(split_host_port("[::1]:8080"), ("::1", Some(8080)));
        assert_eq!(split_host_port("[::1]"), ("::1", None));
        assert_eq!(split_host_port("example.com"), ("example.com", None));
    }

    #[test]
    fn wants_close_on_http10_or_header() {
        let mut req = request(Method::GET, "http://example.com/");
        assert!(!req.wants_close());
        req.headers
            .insert(http::header::CONNECTION, HeaderValue::from_static("close"));
        assert!(req.wants_close());
        req.headers.clear();
        req.version = Version::HTTP_10;
        assert!(req.wants_close());
    }
}
