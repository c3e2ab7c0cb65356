//! A transport-agnostic implementation of the [WebSocket Protocol (RFC
//! 6455)](https://datatracker.ietf.org/doc/html/rfc6455): framing, the opening and
//! closing handshakes, fragmentation/reassembly, and an optional priority send
//! buffer for backpressure, all built against [`tokio::io::AsyncRead`] +
//! [`tokio::io::AsyncWrite`] rather than any concrete socket type.
//!
//! [`stream::Stream`] is the seam: anything that implements the two Tokio I/O
//! traits (plain `TcpStream`, a TLS-wrapped stream, or `tokio::io::duplex` in
//! tests) works as the transport underneath a [`connection::Connection`]. Dialing
//! the socket and negotiating TLS are left to the caller; this crate starts once
//! bytes can be read and written.

pub mod backpressure;
pub mod close_code;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod extensions;
pub mod frame;
pub mod handshake;
pub mod message;
pub mod stream;
pub mod url;
pub mod utf8;
pub mod utils;

pub use close_code::CloseCode;
pub use config::{CloseDrainBudget, ConnectionConfig, Mode};
pub use connection::{Connection, ConnectionState};
pub use error::Error;
pub use message::{Message, MessageType};
pub use stream::Stream;
pub use url::WsUrl;
