//! The error taxonomy: a codec-level
//! [`ProtocolError`], a handshake-level [`HandshakeError`], the graceful/abnormal
//! [`Error::ConnectionClosed`], I/O failures, extension failures and client/URL
//! failures. The codec never raises I/O errors; only the connection and stream layers
//! do.

use crate::close_code::CloseCode;
use std::string::FromUtf8Error;
use thiserror::Error;

/// Wire-format or invariant violation detected locally, either by the codec or by the
/// connection state machine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("reserved bit set without a negotiated extension claiming it")]
    RsvNotZero,
    #[error("invalid opcode: {0:#x}")]
    InvalidOpcode(u8),
    #[error("control frames must not be fragmented")]
    ControlFrameFragmented,
    #[error("control frame payload exceeds 125 bytes: {0}")]
    ControlFramePayloadTooLarge(usize),
    #[error("64-bit length field has the most significant bit set")]
    LengthMsbSet,
    #[error("frame exceeds configured max_frame_size ({0} > {1})")]
    FrameTooLarge(usize, usize),
    #[error("message exceeds configured max_message_size ({0} > {1})")]
    MessageTooLarge(usize, usize),
    #[error("expected a masked frame but the frame was unmasked")]
    ExpectedMasked,
    #[error("expected an unmasked frame but the frame was masked")]
    ExpectedUnmasked,
    #[error("data frame received while a fragmented message is already in progress")]
    UnexpectedDataFrame,
    #[error("continuation frame received with no fragmented message in progress")]
    UnexpectedContinuation,
    #[error("text payload is not valid UTF-8")]
    InvalidUtf8,
    #[error("close frame payload must be empty, 2 bytes, or 2+N bytes, got {0}")]
    InvalidCloseFramePayload(usize),
    #[error("invalid close code: {0}")]
    InvalidCloseCode(u16),
}

/// HTTP upgrade request/response validation failure. No retries inside the library.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("request method must be GET")]
    MethodNotAllowed,
    #[error("Host header missing")]
    MissingHost,
    #[error("Upgrade header missing or not equal to \"websocket\"")]
    BadUpgrade,
    #[error("Connection header missing or does not contain the \"upgrade\" token")]
    BadConnection,
    #[error("Sec-WebSocket-Key missing or malformed")]
    BadKey,
    #[error("Sec-WebSocket-Version must be 13")]
    UnsupportedVersion,
    #[error("malformed HTTP request")]
    MalformedRequest,
    #[error("server responded with status {0}, expected 101")]
    UnexpectedStatus(u16),
    #[error("server response missing or invalid Sec-WebSocket-Accept")]
    InvalidAcceptKey,
    #[error("server selected a subprotocol that was never offered: {0}")]
    UnofferedSubprotocol(String),
    #[error("invalid Sec-WebSocket-Extensions offer: {0}")]
    InvalidExtensionOffer(#[from] ExtensionError),
}

/// A negotiated extension refused or mangled a frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtensionError {
    #[error("extension {0} rejected the frame: {1}")]
    Rejected(&'static str, String),
    #[error("max_window_bits must be between 8 and 15, got {0}")]
    InvalidMaxWindowBits(u8),
}

/// URL parsing or client handshake orchestration failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("invalid scheme in WebSocket URL, must be ws:// or wss://")]
    InvalidScheme,
    #[error("URL has no host")]
    NoHost,
    #[error("{0}")]
    UrlParse(String),
}

/// The top-level error type returned by every public, fallible operation.
#[derive(Error, Debug)]
pub enum Error {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("extension error: {0}")]
    Extension(#[from] ExtensionError),

    #[error("client error: {0}")]
    Client(#[from] ClientError),

    /// The connection is no longer usable. `code` is the observed close code
    /// (synthetic 1006 if the stream died without a Close frame being seen) and
    /// `reason` is the peer-provided UTF-8 reason, empty for abnormal closures.
    #[error("connection closed: {code:?} {reason:?}")]
    ConnectionClosed { code: CloseCode, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("payload is not valid UTF-8: {0}")]
    Utf8(#[from] FromUtf8Error),
}

impl Error {
    pub fn connection_closed(code: CloseCode, reason: impl Into<String>) -> Self {
        Error::ConnectionClosed {
            code,
            reason: reason.into(),
        }
    }

    pub fn abnormal_closure() -> Self {
        Error::connection_closed(CloseCode::ABNORMAL_CLOSURE, "")
    }
}
