//! The opening handshake: parses and validates the HTTP/1.1 Upgrade
//! request on the server side, or the 101 response on the client side, using
//! `httparse` for the wire parsing and [`crate::utils`] for the accept-key
//! computation.

use std::time::Duration;

use tokio::time::timeout;

use crate::error::HandshakeError;
use crate::extensions::{format_permessage_deflate, PermessageDeflateParams};
use crate::stream::Stream;
use crate::url::WsUrl;
use crate::utils::{compute_accept_key, generate_websocket_key};

const MAX_HEADER_BYTES: usize = 16 * 1024;
const MAX_HEADERS: usize = 32;
const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// True iff `value` is a comma-separated list containing a token equal
/// (case-insensitively) to `upgrade`, per RFC 6455 §4.2.1/§4.1. Used to validate the
/// `Connection` header on both the server's incoming request and the client's
/// incoming response.
fn connection_header_has_upgrade_token(value: &str) -> bool {
    value
        .split(',')
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
}

/// The pieces of a validated client request the server needs to build its response
/// and configure the connection.
#[derive(Debug, Clone)]
pub struct ParsedRequest {
    pub key: String,
    pub path: String,
    pub subprotocols: Vec<String>,
    pub permessage_deflate_offer: Option<PermessageDeflateParams>,
}

/// Reads bytes from `stream` until the `\r\n\r\n` terminator (or `MAX_HEADER_BYTES` is
/// exceeded, or `READ_TIMEOUT` elapses), guarding the handshake against a peer that
/// opens the TCP connection and then never finishes it.
async fn read_http_head(stream: &mut impl Stream) -> Result<Vec<u8>, HandshakeError> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    let result = timeout(READ_TIMEOUT, async {
        loop {
            if buf.len() >= MAX_HEADER_BYTES {
                return Err(HandshakeError::MalformedRequest);
            }
            let n = stream
                .read(&mut chunk)
                .await
                .map_err(|_| HandshakeError::MalformedRequest)?;
            if n == 0 {
                return Err(HandshakeError::MalformedRequest);
            }
            buf.extend_from_slice(&chunk[..n]);
            if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                return Ok(());
            }
        }
    })
    .await;

    match result {
        Ok(Ok(())) => Ok(buf),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(HandshakeError::MalformedRequest),
    }
}

/// Parses and validates a client's Upgrade request per RFC 6455 §4.2.1: method,
/// Host, Upgrade, Connection, Sec-WebSocket-Key and -Version.
pub fn parse_request(buf: &[u8]) -> Result<ParsedRequest, HandshakeError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers);

    match request.parse(buf) {
        Ok(httparse::Status::Complete(_)) => {}
        _ => return Err(HandshakeError::MalformedRequest),
    }

    if request.method != Some("GET") {
        return Err(HandshakeError::MethodNotAllowed);
    }

    let find = |name: &str| -> Option<String> {
        request
            .headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| String::from_utf8_lossy(h.value).trim().to_string())
    };

    if find("Host").is_none() {
        return Err(HandshakeError::MissingHost);
    }

    match find("Upgrade") {
        Some(v) if v.eq_ignore_ascii_case("websocket") => {}
        _ => return Err(HandshakeError::BadUpgrade),
    }

    match find("Connection") {
        Some(v) if connection_header_has_upgrade_token(&v) => {}
        _ => return Err(HandshakeError::BadConnection),
    }

    let key = find("Sec-WebSocket-Key").ok_or(HandshakeError::BadKey)?;
    // A base64-encoded 16-byte nonce is always 24 characters; [20, 30] is the
    // sufficient sanity range rather than an exact length match.
    if !(20..=30).contains(&key.len()) {
        return Err(HandshakeError::BadKey);
    }

    match find("Sec-WebSocket-Version") {
        Some(v) if v == "13" => {}
        _ => return Err(HandshakeError::UnsupportedVersion),
    }

    let subprotocols = find("Sec-WebSocket-Protocol")
        .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
        .unwrap_or_default();

    let permessage_deflate_offer = find("Sec-WebSocket-Extensions")
        .map(|v| crate::extensions::parse_permessage_deflate(&v))
        .transpose()?
        .flatten();

    Ok(ParsedRequest {
        key,
        path: request.path.unwrap_or("/").to_string(),
        subprotocols,
        permessage_deflate_offer,
    })
}

/// Reads and validates a client request off `stream` in one step.
pub async fn read_request(stream: &mut impl Stream) -> Result<ParsedRequest, HandshakeError> {
    let buf = read_http_head(stream).await?;
    parse_request(&buf)
}

/// Server preference order: iterate the server's configured `supported` list
/// and return the first entry the client also offered, or `None` if nothing overlaps.
/// When `None`, the server omits `Sec-WebSocket-Protocol` from its response.
pub fn select_subprotocol(offered: &[String], supported: &[String]) -> Option<String> {
    supported.iter().find(|s| offered.contains(s)).cloned()
}

/// Builds the `101 Switching Protocols` response.
pub fn build_response(
    client_key: &str,
    subprotocol: Option<&str>,
    permessage_deflate: Option<&PermessageDeflateParams>,
) -> String {
    let accept = compute_accept_key(client_key);
    let mut response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n",
        accept
    );
    if let Some(protocol) = subprotocol {
        response.push_str(&format!("Sec-WebSocket-Protocol: {}\r\n", protocol));
    }
    if let Some(params) = permessage_deflate {
        response.push_str(&format!(
            "Sec-WebSocket-Extensions: {}\r\n",
            format_permessage_deflate(params)
        ));
    }
    response.push_str("\r\n");
    response
}

/// Builds a `400 Bad Request` response for a request that failed validation.
pub fn build_bad_request(reason: &str) -> String {
    format!(
        "HTTP/1.1 400 Bad Request\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        reason.len(),
        reason
    )
}

/// Everything a client needs to send its opening request and later validate the
/// response against it.
pub struct ClientHandshake {
    pub key: String,
    pub request: String,
}

/// Builds the client's opening request for `url`, generating a fresh nonce.
pub fn build_request(
    url: &WsUrl,
    subprotocols: &[String],
    permessage_deflate: Option<&PermessageDeflateParams>,
) -> ClientHandshake {
    let key = generate_websocket_key();
    let mut request = format!(
        "GET {} HTTP/1.1\r\n\
         Host: {}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {}\r\n\
         Sec-WebSocket-Version: 13\r\n",
        url.path,
        url.host_header(),
        key,
    );
    if !subprotocols.is_empty() {
        request.push_str(&format!(
            "Sec-WebSocket-Protocol: {}\r\n",
            subprotocols.join(", ")
        ));
    }
    if let Some(params) = permessage_deflate {
        request.push_str(&format!(
            "Sec-WebSocket-Extensions: {}\r\n",
            format_permessage_deflate(params)
        ));
    }
    request.push_str("\r\n");
    ClientHandshake { key, request }
}

/// The server's negotiated response, once validated against the request we sent.
#[derive(Debug, Clone)]
pub struct ServerHandshakeResponse {
    pub subprotocol: Option<String>,
    pub permessage_deflate: Option<PermessageDeflateParams>,
}

/// Validates the server's response: status 101, `Upgrade: websocket`, a `Connection`
/// header carrying the `upgrade` token, a matching Sec-WebSocket-Accept, and (if
/// present) a subprotocol that was actually offered.
pub fn validate_response(
    buf: &[u8],
    client_key: &str,
    offered_subprotocols: &[String],
) -> Result<ServerHandshakeResponse, HandshakeError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);

    match response.parse(buf) {
        Ok(httparse::Status::Complete(_)) => {}
        _ => return Err(HandshakeError::MalformedRequest),
    }

    match response.code {
        Some(101) => {}
        Some(code) => return Err(HandshakeError::UnexpectedStatus(code)),
        None => return Err(HandshakeError::MalformedRequest),
    }

    let find = |name: &str| -> Option<String> {
        response
            .headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| String::from_utf8_lossy(h.value).trim().to_string())
    };

    match find("Upgrade") {
        Some(v) if v.eq_ignore_ascii_case("websocket") => {}
        _ => return Err(HandshakeError::BadUpgrade),
    }

    match find("Connection") {
        Some(v) if connection_header_has_upgrade_token(&v) => {}
        _ => return Err(HandshakeError::BadConnection),
    }

    let expected_accept = compute_accept_key(client_key);
    match find("Sec-WebSocket-Accept") {
        Some(accept) if accept == expected_accept => {}
        _ => return Err(HandshakeError::InvalidAcceptKey),
    }

    let subprotocol = find("Sec-WebSocket-Protocol");
    if let Some(ref protocol) = subprotocol {
        if !offered_subprotocols.contains(protocol) {
            return Err(HandshakeError::UnofferedSubprotocol(protocol.clone()));
        }
    }

    let permessage_deflate = find("Sec-WebSocket-Extensions")
        .map(|v| crate::extensions::parse_permessage_deflate(&v))
        .transpose()?
        .flatten();

    Ok(ServerHandshakeResponse {
        subprotocol,
        permessage_deflate,
    })
}

/// Reads and validates the server's response off `stream` in one step.
pub async fn read_response(
    stream: &mut impl Stream,
    client_key: &str,
    offered_subprotocols: &[String],
) -> Result<ServerHandshakeResponse, HandshakeError> {
    let buf = read_http_head(stream).await?;
    validate_response(&buf, client_key, offered_subprotocols)
}
