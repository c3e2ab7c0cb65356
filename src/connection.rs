//! The connection state machine: turns a byte stream into typed
//! [`Message`]s, handling fragment reassembly, interleaved control frames, UTF-8
//! enforcement, and the close handshake. This is the module everything else in the
//! crate exists to support.

use std::time::Instant;

use bytes::BytesMut;
use tokio::time::{timeout, Instant as TokioInstant};

use crate::close_code::CloseCode;
use crate::codec::{decode_in_place_with_extensions, encode_into, DecodeOutcome};
use crate::config::ConnectionConfig;
use crate::error::{Error, ProtocolError};
use crate::frame::{Frame, OpCode, RsvBits};
use crate::message::{Message, MessageType};
use crate::stream::Stream;
use crate::utf8::is_valid_utf8;
use crate::utils::generate_mask_key;

/// Lifecycle of one connection. Once `Closed`, every public operation fails with
/// [`Error::ConnectionClosed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    /// We sent a Close frame and are waiting (bounded) for the peer's.
    ClosingLocal,
    /// The peer sent a Close frame; we must echo one and then terminate.
    ClosingRemote,
    Closed,
}

/// Drives one WebSocket connection over a stream that has already completed the
/// opening handshake. Not `Sync`: exactly one task should own a `Connection` and
/// drive both its sends and its `receive()` loop.
pub struct Connection<S: Stream> {
    stream: S,
    config: ConnectionConfig,
    state: ConnectionState,
    pending_opcode: Option<OpCode>,
    fragment_buffer: Vec<u8>,
    awaiting_pong: bool,
    last_pong_at: Option<Instant>,
    sent_close: bool,
    encode_scratch: Vec<u8>,
    /// Reused across every [`Connection::read_frame`] call instead of allocating a
    /// fresh buffer per frame. Its contents never outlive one `read_frame` call:
    /// `decode_in_place`'s borrow is converted to an owned [`Frame`] before this
    /// buffer is reused.
    decode_scratch: BytesMut,
    subprotocol: Option<String>,
}

impl<S: Stream> Connection<S> {
    pub fn new(stream: S, config: ConnectionConfig) -> Self {
        Connection {
            stream,
            config,
            state: ConnectionState::Open,
            pending_opcode: None,
            fragment_buffer: Vec::new(),
            awaiting_pong: false,
            last_pong_at: None,
            sent_close: false,
            encode_scratch: Vec::with_capacity(4096),
            decode_scratch: BytesMut::with_capacity(4096),
            subprotocol: None,
        }
    }

    pub fn with_subprotocol(mut self, subprotocol: Option<String>) -> Self {
        self.subprotocol = subprotocol;
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn connected(&self) -> bool {
        self.state != ConnectionState::Closed && self.stream.connected()
    }

    pub fn subprotocol(&self) -> Option<&str> {
        self.subprotocol.as_deref()
    }

    pub fn is_awaiting_pong(&self) -> bool {
        self.awaiting_pong
    }

    pub fn last_pong_at(&self) -> Option<Instant> {
        self.last_pong_at
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.state == ConnectionState::Open {
            Ok(())
        } else {
            Err(Error::abnormal_closure())
        }
    }

    fn allowed_rsv(&self) -> RsvBits {
        self.config
            .extensions
            .iter()
            .fold(RsvBits::NONE, |acc, ext| {
                let claimed = ext.claimed_rsv_bits();
                RsvBits {
                    rsv1: acc.rsv1 || claimed.rsv1,
                    rsv2: acc.rsv2 || claimed.rsv2,
                    rsv3: acc.rsv3 || claimed.rsv3,
                }
            })
    }

    /// Sends a single unfragmented Text frame. No outbound auto-fragmentation is
    /// performed in this core; use [`Connection::send_fragmented`] for large payloads.
    pub async fn send_text(&mut self, text: impl AsRef<str>) -> Result<(), Error> {
        self.ensure_open()?;
        self.write_data_frame(OpCode::Text, text.as_ref().as_bytes().to_vec())
            .await
    }

    /// Sends a single unfragmented Binary frame.
    pub async fn send_binary(&mut self, data: impl AsRef<[u8]>) -> Result<(), Error> {
        self.ensure_open()?;
        self.write_data_frame(OpCode::Binary, data.as_ref().to_vec())
            .await
    }

    /// Sends `chunks` as one message split across an explicit sequence of
    /// Text/Binary + Continuation frames. The library never fragments on its own, but
    /// offers this for callers who want to stream a large payload without buffering
    /// it whole.
    pub async fn send_fragmented(
        &mut self,
        kind: MessageType,
        chunks: &[&[u8]],
    ) -> Result<(), Error> {
        self.ensure_open()?;
        let opcode = match kind {
            MessageType::Text => OpCode::Text,
            MessageType::Binary => OpCode::Binary,
            _ => return Err(Error::Protocol(ProtocolError::InvalidOpcode(0))),
        };

        if chunks.is_empty() {
            return self.write_data_frame(opcode, Vec::new()).await;
        }

        let last = chunks.len() - 1;
        for (i, chunk) in chunks.iter().enumerate() {
            let frame_opcode = if i == 0 { opcode } else { OpCode::Continuation };
            let fin = i == last;
            self.write_frame(Frame::new(fin, frame_opcode, chunk.to_vec()))
                .await?;
        }
        Ok(())
    }

    async fn write_data_frame(&mut self, opcode: OpCode, payload: Vec<u8>) -> Result<(), Error> {
        self.write_frame(Frame::new(true, opcode, payload)).await
    }

    /// Sends a Ping, marking `awaiting_pong` so the caller can run its own heartbeat
    /// schedule against [`Connection::is_awaiting_pong`]/[`Connection::last_pong_at`].
    pub async fn ping(&mut self, payload: Vec<u8>) -> Result<(), Error> {
        self.ensure_open()?;
        if payload.len() > 125 {
            return Err(Error::Protocol(ProtocolError::ControlFramePayloadTooLarge(
                payload.len(),
            )));
        }
        self.awaiting_pong = true;
        self.write_frame(Frame::new(true, OpCode::Ping, payload))
            .await
    }

    pub async fn pong(&mut self, payload: Vec<u8>) -> Result<(), Error> {
        self.ensure_open()?;
        if payload.len() > 125 {
            return Err(Error::Protocol(ProtocolError::ControlFramePayloadTooLarge(
                payload.len(),
            )));
        }
        self.write_frame(Frame::new(true, OpCode::Pong, payload))
            .await
    }

    async fn write_frame(&mut self, mut frame: Frame) -> Result<(), Error> {
        if self.config.mode.masks_outgoing() {
            frame = frame.masked(generate_mask_key());
        }
        for ext in self.config.extensions.iter_mut() {
            frame = ext.on_outgoing(frame)?;
        }

        self.encode_scratch.clear();
        let bytes = encode_into(&frame, &mut self.encode_scratch)?;
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Reads exactly one frame off the stream: header, extended length, mask key,
    /// payload, in that order. `max_frame_size` is
    /// enforced as soon as the length is known, before the payload is read.
    async fn read_frame(&mut self) -> Result<Frame, Error> {
        let require_masked = self.config.mode.requires_masked_incoming();
        let allowed_rsv = self.allowed_rsv();

        let mut header = [0u8; 2];
        self.stream.read_exact(&mut header).await?;

        let base_len = (header[1] & 0b0111_1111) as usize;
        let masked = (header[1] & 0b1000_0000) != 0;

        let buf = &mut self.decode_scratch;
        buf.clear();
        buf.extend_from_slice(&header);

        let payload_len = match base_len {
            126 => {
                let mut ext = [0u8; 2];
                self.stream.read_exact(&mut ext).await?;
                buf.extend_from_slice(&ext);
                u16::from_be_bytes(ext) as usize
            }
            127 => {
                let mut ext = [0u8; 8];
                self.stream.read_exact(&mut ext).await?;
                buf.extend_from_slice(&ext);
                let raw = u64::from_be_bytes(ext);
                if raw & (1 << 63) != 0 {
                    return Err(Error::Protocol(ProtocolError::LengthMsbSet));
                }
                raw as usize
            }
            small => small,
        };

        if payload_len > self.config.max_frame_size {
            return Err(Error::Protocol(ProtocolError::FrameTooLarge(
                payload_len,
                self.config.max_frame_size,
            )));
        }

        if masked {
            let mut mask = [0u8; 4];
            self.stream.read_exact(&mut mask).await?;
            buf.extend_from_slice(&mask);
        }

        let payload_start = buf.len();
        buf.resize(payload_start + payload_len, 0);
        self.stream.read_exact(&mut buf[payload_start..]).await?;

        match decode_in_place_with_extensions(&mut self.decode_scratch[..], require_masked, allowed_rsv)? {
            DecodeOutcome::Complete { frame, .. } => Ok(frame.to_owned_frame()),
            DecodeOutcome::NeedMore { .. } => {
                unreachable!("buf was sized to exactly one frame's worth of bytes")
            }
        }
    }

    /// Drives the state machine until a data [`Message`] can be returned, or raises
    /// [`Error::ConnectionClosed`] once the close handshake completes (gracefully or
    /// abnormally).
    pub async fn receive(&mut self) -> Result<Message, Error> {
        loop {
            let mut frame = match self.read_frame().await {
                Ok(frame) => frame,
                Err(Error::Protocol(err)) => {
                    self.fail_with_protocol_error(CloseCode::PROTOCOL_ERROR, err.clone()).await;
                    return Err(Error::Protocol(err));
                }
                Err(Error::Io(_)) => {
                    self.state = ConnectionState::Closed;
                    return Err(Error::abnormal_closure());
                }
                Err(other) => return Err(other),
            };

            for ext in self.config.extensions.iter_mut() {
                frame = ext.on_incoming(frame)?;
            }

            if frame.opcode.is_control() {
                match frame.opcode {
                    OpCode::Ping => {
                        if self.config.auto_reply_ping {
                            self.write_frame(Frame::new(true, OpCode::Pong, frame.payload))
                                .await?;
                        } else {
                            return Ok(Message {
                                kind: MessageType::Ping,
                                data: frame.payload,
                            });
                        }
                    }
                    OpCode::Pong => {
                        self.awaiting_pong = false;
                        self.last_pong_at = Some(Instant::now());
                    }
                    OpCode::Close => {
                        return Err(self.handle_incoming_close(frame.payload).await);
                    }
                    _ => unreachable!("is_control() only matches Ping/Pong/Close"),
                }
                continue;
            }

            if let Some(message) = self.reassemble(frame).await? {
                return Ok(message);
            }
        }
    }

    async fn fail_with_protocol_error(&mut self, code: CloseCode, err: ProtocolError) {
        log::debug!("protocol error on receive, closing with {code:?}: {err}");
        self.close(code, &err.to_string()).await;
    }

    async fn handle_incoming_close(&mut self, payload: Vec<u8>) -> Error {
        let (code, reason) = match parse_close_payload(&payload) {
            Ok(parsed) => parsed,
            Err(err) => {
                self.fail_with_protocol_error(CloseCode::PROTOCOL_ERROR, err.clone())
                    .await;
                return Error::Protocol(err);
            }
        };
        let already_closing_local = self.state == ConnectionState::ClosingLocal;
        self.state = ConnectionState::ClosingRemote;

        if !already_closing_local && !self.sent_close {
            if let Err(e) = self.send_close_frame(code, &reason).await {
                log::debug!("failed to echo close frame: {e}");
            }
        }

        self.state = ConnectionState::Closed;
        if let Err(e) = self.stream.close().await {
            log::debug!("failed to close stream after close handshake: {e}");
        }

        Error::connection_closed(code, reason)
    }

    /// Appends `frame`'s payload to the fragment buffer, enforcing the
    /// continuation/new-message invariants and `max_message_size`, and returns the
    /// reassembled [`Message`] once `frame.fin` finalizes it.
    async fn reassemble(&mut self, frame: Frame) -> Result<Option<Message>, Error> {
        match frame.opcode {
            OpCode::Text | OpCode::Binary => {
                if self.pending_opcode.is_some() {
                    let err = ProtocolError::UnexpectedDataFrame;
                    self.fail_with_protocol_error(CloseCode::PROTOCOL_ERROR, err.clone()).await;
                    return Err(Error::Protocol(err));
                }
                self.pending_opcode = Some(frame.opcode);
                self.fragment_buffer.clear();
                self.fragment_buffer.extend_from_slice(&frame.payload);
            }
            OpCode::Continuation => {
                if self.pending_opcode.is_none() {
                    let err = ProtocolError::UnexpectedContinuation;
                    self.fail_with_protocol_error(CloseCode::PROTOCOL_ERROR, err.clone()).await;
                    return Err(Error::Protocol(err));
                }
                self.fragment_buffer.extend_from_slice(&frame.payload);
            }
            _ => unreachable!("control opcodes are handled before reassemble() is called"),
        }

        if self.fragment_buffer.len() > self.config.max_message_size {
            let err = ProtocolError::MessageTooLarge(
                self.fragment_buffer.len(),
                self.config.max_message_size,
            );
            self.pending_opcode = None;
            self.fragment_buffer.clear();
            self.fail_with_protocol_error(CloseCode::MESSAGE_TOO_BIG, err.clone())
                .await;
            return Err(Error::Protocol(err));
        }

        if !frame.fin {
            return Ok(None);
        }

        let opcode = self.pending_opcode.take().expect("set above");
        let data = std::mem::take(&mut self.fragment_buffer);

        if opcode == OpCode::Text && !is_valid_utf8(&data) {
            let err = ProtocolError::InvalidUtf8;
            self.fail_with_protocol_error(CloseCode::INVALID_PAYLOAD, err.clone())
                .await;
            return Err(Error::Protocol(err));
        }

        let kind = if opcode == OpCode::Text {
            MessageType::Text
        } else {
            MessageType::Binary
        };
        Ok(Some(Message { kind, data }))
    }

    async fn send_close_frame(&mut self, code: CloseCode, reason: &str) -> Result<(), Error> {
        let payload = if code.is_synthetic() {
            Vec::new()
        } else {
            let mut data = Vec::with_capacity(2 + reason.len());
            data.extend_from_slice(&code.0.to_be_bytes());
            data.extend_from_slice(reason.as_bytes());
            data
        };
        self.sent_close = true;
        self.write_frame(Frame::new(true, OpCode::Close, payload))
            .await
    }

    /// Idempotent. Sends a Close frame (if one hasn't already gone out), drains
    /// incoming frames up to [`crate::config::CloseDrainBudget`] looking for the
    /// peer's Close, then shuts down the stream. Never raises: failures are logged at
    /// debug level and swallowed. Callers observe the outcome only via
    /// [`Connection::connected`].
    pub async fn close(&mut self, code: CloseCode, reason: &str) {
        if self.state == ConnectionState::Closed {
            return;
        }

        if self.state == ConnectionState::Open {
            self.state = ConnectionState::ClosingLocal;
            if let Err(e) = self.send_close_frame(code, reason).await {
                log::debug!("failed to send close frame: {e}");
            }
            self.drain_until_peer_close().await;
        }

        self.state = ConnectionState::Closed;
        if let Err(e) = self.stream.close().await {
            log::debug!("failed to close stream: {e}");
        }
    }

    async fn drain_until_peer_close(&mut self) {
        let budget = self.config.close_drain_budget;
        let deadline = TokioInstant::now() + budget.max_wall_clock;

        for _ in 0..budget.max_frames {
            let now = TokioInstant::now();
            if now >= deadline {
                break;
            }
            match timeout(deadline - now, self.read_frame()).await {
                Ok(Ok(frame)) if frame.opcode == OpCode::Close => break,
                Ok(Ok(_)) => continue,
                Ok(Err(_)) | Err(_) => break,
            }
        }
    }
}

impl<S: Stream + Send + 'static> Connection<S> {
    /// Spawns a task that drives [`Connection::receive`] in a loop and forwards each
    /// outcome over a channel, returning the consumer half as a
    /// [`tokio_stream::wrappers::ReceiverStream`], a pull-based `Stream` adapter for
    /// callers that want to `.next().await` instead of calling `receive()` directly,
    /// without the receive loop ever blocking the task that's driving it.
    ///
    /// The stream ends after the first `Err` it forwards, matching `receive()`'s
    /// contract that a `ConnectionClosed` or protocol error is terminal.
    pub fn into_message_stream(
        mut self,
    ) -> tokio_stream::wrappers::ReceiverStream<Result<Message, Error>> {
        let (tx, rx) = tokio::sync::mpsc::channel(16);
        tokio::spawn(async move {
            loop {
                let outcome = self.receive().await;
                let is_err = outcome.is_err();
                if tx.send(outcome).await.is_err() {
                    break;
                }
                if is_err {
                    break;
                }
            }
        });
        tokio_stream::wrappers::ReceiverStream::new(rx)
    }
}

/// Per §6, a Close frame payload is either empty, exactly 2 bytes (a code with no
/// reason), or 2+N bytes (a code followed by a UTF-8 reason). A single leftover byte
/// is malformed and rejected rather than treated as "no status".
fn parse_close_payload(payload: &[u8]) -> Result<(CloseCode, String), ProtocolError> {
    if payload.is_empty() {
        return Ok((CloseCode::NO_STATUS_RECEIVED, String::new()));
    }
    if payload.len() == 1 {
        return Err(ProtocolError::InvalidCloseFramePayload(payload.len()));
    }
    let code = CloseCode(u16::from_be_bytes([payload[0], payload[1]])).validate()?;
    if !is_valid_utf8(&payload[2..]) {
        return Err(ProtocolError::InvalidUtf8);
    }
    let reason = String::from_utf8_lossy(&payload[2..]).into_owned();
    Ok((code, reason))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Mode;

    fn server_connection(stream: tokio::io::DuplexStream) -> Connection<tokio::io::DuplexStream> {
        Connection::new(stream, ConnectionConfig::new(Mode::Server))
    }

    fn client_connection(stream: tokio::io::DuplexStream) -> Connection<tokio::io::DuplexStream> {
        Connection::new(stream, ConnectionConfig::new(Mode::Client))
    }

    #[tokio::test]
    async fn client_to_server_small_text_frame() {
        let (client_io, server_io) = tokio::io::duplex(1024);
        let mut client = client_connection(client_io);
        let mut server = server_connection(server_io);

        client.send_text("Hi").await.unwrap();
        let message = server.receive().await.unwrap();
        assert_eq!(message.kind, MessageType::Text);
        assert_eq!(message.data, b"Hi");
    }

    #[tokio::test]
    async fn fragmented_binary_reassembles_into_one_message() {
        let (client_io, server_io) = tokio::io::duplex(1024);
        let mut server = server_connection(client_io);
        let mut client = client_connection(server_io);

        let chunk_a = vec![1u8; 100];
        let chunk_b = vec![2u8; 100];
        server
            .send_fragmented(MessageType::Binary, &[&chunk_a, &chunk_b])
            .await
            .unwrap();

        let message = client.receive().await.unwrap();
        assert_eq!(message.kind, MessageType::Binary);
        assert_eq!(message.data.len(), 200);
        assert_eq!(&message.data[..100], &chunk_a[..]);
        assert_eq!(&message.data[100..], &chunk_b[..]);
    }

    #[tokio::test]
    async fn ping_triggers_auto_pong_and_does_not_surface() {
        let (client_io, server_io) = tokio::io::duplex(1024);
        let mut client = client_connection(client_io);
        let mut server = server_connection(server_io);

        client.ping(vec![0xDE, 0xAD]).await.unwrap();
        client.send_text("after ping").await.unwrap();

        let message = server.receive().await.unwrap();
        assert_eq!(message.kind, MessageType::Text);
        assert_eq!(message.data, b"after ping");
    }

    #[tokio::test]
    async fn invalid_utf8_closes_with_1007() {
        let (client_io, server_io) = tokio::io::duplex(1024);
        let mut server = server_connection(client_io);
        let mut client = client_connection(server_io);

        // Build the frame directly: overlong encoding [0xC0, 0x81] as Text.
        client.send_binary_as_text_for_test(&[0xC0, 0x81]).await.unwrap();

        let err = server.receive().await.unwrap_err();
        match err {
            Error::Protocol(ProtocolError::InvalidUtf8) => {}
            other => panic!("expected Protocol(InvalidUtf8), got {other:?}"),
        }
    }

    #[tokio::test]
    async fn interleaved_ping_between_continuations_still_reassembles() {
        let (client_io, server_io) = tokio::io::duplex(1024);
        let mut server = server_connection(client_io);
        let mut client = client_connection(server_io);

        client
            .write_frame(Frame::new(false, OpCode::Text, b"Hel".to_vec()))
            .await
            .unwrap();
        client.ping(Vec::new()).await.unwrap();
        client
            .write_frame(Frame::new(true, OpCode::Continuation, b"lo".to_vec()))
            .await
            .unwrap();

        let message = server.receive().await.unwrap();
        assert_eq!(message.kind, MessageType::Text);
        assert_eq!(message.data, b"Hello");
    }

    impl<S: Stream> Connection<S> {
        /// Test-only helper: sends raw bytes tagged as a finalized Text frame,
        /// bypassing UTF-8 validation on the sender side (which this crate doesn't
        /// perform), to exercise the receiver's UTF-8 enforcement.
        #[cfg(test)]
        async fn send_binary_as_text_for_test(&mut self, payload: &[u8]) -> Result<(), Error> {
            self.write_frame(Frame::new(true, OpCode::Text, payload.to_vec()))
                .await
        }

        /// Test-only helper: sends a Close frame with an arbitrary raw payload,
        /// bypassing [`Connection::close`]'s code/reason encoding, to exercise the
        /// receiver's close-payload validation.
        #[cfg(test)]
        async fn send_raw_close_for_test(&mut self, payload: &[u8]) -> Result<(), Error> {
            self.write_frame(Frame::new(true, OpCode::Close, payload.to_vec()))
                .await
        }
    }

    #[tokio::test]
    async fn one_byte_close_payload_is_rejected() {
        let (client_io, server_io) = tokio::io::duplex(1024);
        let mut server = server_connection(client_io);
        let mut client = client_connection(server_io);

        client.send_raw_close_for_test(&[0x03]).await.unwrap();

        let err = server.receive().await.unwrap_err();
        match err {
            Error::Protocol(ProtocolError::InvalidCloseFramePayload(1)) => {}
            other => panic!("expected Protocol(InvalidCloseFramePayload(1)), got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reserved_close_code_is_rejected() {
        let (client_io, server_io) = tokio::io::duplex(1024);
        let mut server = server_connection(client_io);
        let mut client = client_connection(server_io);

        client.send_raw_close_for_test(&999u16.to_be_bytes()).await.unwrap();

        let err = server.receive().await.unwrap_err();
        match err {
            Error::Protocol(ProtocolError::InvalidCloseCode(999)) => {}
            other => panic!("expected Protocol(InvalidCloseCode(999)), got {other:?}"),
        }
    }

    #[tokio::test]
    async fn message_stream_yields_messages_and_ends_on_close() {
        use tokio_stream::StreamExt;

        let (client_io, server_io) = tokio::io::duplex(1024);
        let mut client = client_connection(client_io);
        let server = server_connection(server_io);

        client.send_text("one").await.unwrap();
        client.send_text("two").await.unwrap();

        let mut stream = server.into_message_stream();

        // `close()` blocks draining for the peer's echoed Close frame, which only
        // arrives once the spawned receive loop behind `stream` observes it and
        // auto-replies, so it must run concurrently with consuming the stream rather
        // than being awaited to completion first.
        let close = tokio::spawn(async move {
            client.close(CloseCode::NORMAL, "bye").await;
        });

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.data, b"one");
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.data, b"two");
        let third = stream.next().await.unwrap();
        assert!(third.is_err());
        assert!(stream.next().await.is_none());

        close.await.unwrap();
    }
}
