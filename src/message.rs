//! A [`Message`] is what [`crate::connection::Connection::receive`] hands back to the
//! application once one or more frames have been reassembled.

use crate::close_code::CloseCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

/// A fully reassembled, validated application-level message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageType,
    pub data: Vec<u8>,
}

impl Message {
    pub fn text(data: impl Into<String>) -> Self {
        Message {
            kind: MessageType::Text,
            data: data.into().into_bytes(),
        }
    }

    pub fn binary(data: impl Into<Vec<u8>>) -> Self {
        Message {
            kind: MessageType::Binary,
            data: data.into(),
        }
    }

    pub fn ping(data: impl Into<Vec<u8>>) -> Self {
        Message {
            kind: MessageType::Ping,
            data: data.into(),
        }
    }

    pub fn pong(data: impl Into<Vec<u8>>) -> Self {
        Message {
            kind: MessageType::Pong,
            data: data.into(),
        }
    }

    /// Builds the close message's `data` from an optional `(code, reason)` pair,
    /// matching the wire layout: empty, or 2 bytes, or 2+N bytes.
    pub fn close(code_and_reason: Option<(CloseCode, String)>) -> Self {
        let data = match code_and_reason {
            None => Vec::new(),
            Some((code, reason)) => {
                let mut data = Vec::with_capacity(2 + reason.len());
                data.extend_from_slice(&code.0.to_be_bytes());
                data.extend_from_slice(reason.as_bytes());
                data
            }
        };
        Message {
            kind: MessageType::Close,
            data,
        }
    }

    /// Parses a Close message's payload into `(code, reason)`: zero bytes
    /// means no code was sent (represented here as `None`).
    pub fn close_code_and_reason(&self) -> Option<(CloseCode, String)> {
        if self.data.len() < 2 {
            return None;
        }
        let code = CloseCode(u16::from_be_bytes([self.data[0], self.data[1]]));
        let reason = String::from_utf8_lossy(&self.data[2..]).into_owned();
        Some((code, reason))
    }

    pub fn as_text(&self) -> Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_message_round_trips_code_and_reason() {
        let msg = Message::close(Some((CloseCode::NORMAL, "bye".to_string())));
        let (code, reason) = msg.close_code_and_reason().unwrap();
        assert_eq!(code, CloseCode::NORMAL);
        assert_eq!(reason, "bye");
    }

    #[test]
    fn close_message_with_no_code_parses_as_none() {
        let msg = Message::close(None);
        assert!(msg.close_code_and_reason().is_none());
    }
}
