//! `ws://`/`wss://` URL parsing for client-side connections: the scheme determines
//! the default port and whether the caller needs a TLS-wrapped stream, but this crate
//! only hands back the parsed pieces; dialing the TCP/TLS socket is the caller's job.

use crate::error::ClientError;
use url::Url;

/// A parsed `ws://`/`wss://` target, broken into the pieces the handshake and the
/// caller's own socket dialing need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsUrl {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub secure: bool,
}

impl WsUrl {
    pub fn parse(raw: &str) -> Result<Self, ClientError> {
        let parsed = Url::parse(raw).map_err(|e| ClientError::UrlParse(e.to_string()))?;

        let secure = match parsed.scheme() {
            "ws" => false,
            "wss" => true,
            _ => return Err(ClientError::InvalidScheme),
        };

        let host = parsed.host_str().ok_or(ClientError::NoHost)?.to_string();
        let default_port = if secure { 443 } else { 80 };
        let port = parsed.port().unwrap_or(default_port);

        let path = match parsed.query() {
            Some(query) => format!("{}?{}", parsed.path(), query),
            None => parsed.path().to_string(),
        };

        Ok(WsUrl {
            host,
            port,
            path,
            secure,
        })
    }

    /// The value to send as the handshake request's `Host` header: includes the port
    /// only when it differs from the scheme's default, matching ordinary HTTP clients.
    pub fn host_header(&self) -> String {
        let default_port = if self.secure { 443 } else { 80 };
        if self.port == default_port {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// `host:port`, suitable for passing straight to a TCP dialer.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_ws_url_with_default_port() {
        let url = WsUrl::parse("ws://example.com/chat").unwrap();
        assert_eq!(url.host, "example.com");
        assert_eq!(url.port, 80);
        assert_eq!(url.path, "/chat");
        assert!(!url.secure);
        assert_eq!(url.host_header(), "example.com");
    }

    #[test]
    fn parses_wss_url_with_explicit_port_and_query() {
        let url = WsUrl::parse("wss://example.com:9443/chat?room=1").unwrap();
        assert_eq!(url.port, 9443);
        assert_eq!(url.path, "/chat?room=1");
        assert!(url.secure);
        assert_eq!(url.host_header(), "example.com:9443");
        assert_eq!(url.authority(), "example.com:9443");
    }

    #[test]
    fn rejects_non_websocket_scheme() {
        assert_eq!(WsUrl::parse("http://example.com").unwrap_err(), ClientError::InvalidScheme);
    }

    #[test]
    fn root_path_defaults_to_slash() {
        let url = WsUrl::parse("ws://example.com").unwrap();
        assert_eq!(url.path, "/");
    }
}
