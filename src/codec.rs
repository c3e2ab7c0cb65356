//! Bit-exact encoding/decoding of a single WebSocket frame (RFC 6455 §5.2):
//! masking, minimal length-field selection, and a streaming decoder that never
//! blocks, reporting how many more bytes it needs instead.
//!
//! `encode`/`encode_into` and `decode`/`decode_in_place` are pure: no I/O, no
//! suspension. `decode_in_place` is the hot path used by [`crate::connection`]. When
//! the frame is masked it unmasks the payload in the caller's buffer and borrows from
//! it instead of copying.

use crate::error::ProtocolError;
use crate::frame::{Frame, OpCode, RsvBits};

const MAX_CONTROL_PAYLOAD: usize = 125;

/// XOR `data[i] ^= key[i % 4]`. Masking is its own inverse, so the same function
/// masks and unmasks. A word-at-a-time fast path over 8-byte chunks keeps hot-path
/// throughput comparable to a byte loop without behaving differently on the tail.
pub fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    let key64 = u64::from_ne_bytes([
        key[0], key[1], key[2], key[3], key[0], key[1], key[2], key[3],
    ]);

    let mut chunks = data.chunks_exact_mut(8);
    for chunk in &mut chunks {
        let word = u64::from_ne_bytes(chunk.try_into().unwrap());
        chunk.copy_from_slice(&(word ^ key64).to_ne_bytes());
    }

    let remainder_offset = data.len() - chunks.into_remainder().len();
    for (i, byte) in data[remainder_offset..].iter_mut().enumerate() {
        *byte ^= key[(remainder_offset + i) % 4];
    }
}

fn validate_for_encode(frame: &Frame) -> Result<(), ProtocolError> {
    if frame.opcode.is_control() {
        if !frame.fin {
            return Err(ProtocolError::ControlFrameFragmented);
        }
        if frame.payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(ProtocolError::ControlFramePayloadTooLarge(
                frame.payload.len(),
            ));
        }
    }
    if frame.masked && frame.mask_key.is_none() {
        return Err(ProtocolError::ExpectedMasked);
    }
    Ok(())
}

/// Size, in bytes, of `encode(frame)` for a frame with the given payload length and
/// masking flag. Used by callers (e.g. the backpressure layer) to pre-size buffers
/// without building a `Frame`.
pub fn encoded_size(payload_len: usize, masked: bool) -> usize {
    let header_len = 2 + extended_len_overhead(payload_len);
    let mask_overhead = if masked { 4 } else { 0 };
    header_len + mask_overhead + payload_len
}

fn extended_len_overhead(payload_len: usize) -> usize {
    if payload_len <= MAX_CONTROL_PAYLOAD {
        0
    } else if payload_len <= u16::MAX as usize {
        2
    } else {
        8
    }
}

fn write_header(buf: &mut Vec<u8>, frame: &Frame) {
    let first_byte = (frame.fin as u8) << 7
        | (frame.rsv.rsv1 as u8) << 6
        | (frame.rsv.rsv2 as u8) << 5
        | (frame.rsv.rsv3 as u8) << 4
        | frame.opcode.as_u8();
    buf.push(first_byte);

    let mask_bit = if frame.masked { 0b1000_0000 } else { 0 };
    let payload_len = frame.payload.len();

    if payload_len <= MAX_CONTROL_PAYLOAD {
        buf.push(mask_bit | payload_len as u8);
    } else if payload_len <= u16::MAX as usize {
        buf.push(mask_bit | 126);
        buf.extend_from_slice(&(payload_len as u16).to_be_bytes());
    } else {
        buf.push(mask_bit | 127);
        buf.extend_from_slice(&(payload_len as u64).to_be_bytes());
    }

    if let Some(key) = frame.mask_key {
        buf.extend_from_slice(&key);
    }
}

/// Encode `frame` into a freshly allocated buffer.
pub fn encode(frame: &Frame) -> Result<Vec<u8>, ProtocolError> {
    validate_for_encode(frame)?;
    let mut buf = Vec::with_capacity(encoded_size(
        frame.payload.len(),
        frame.masked,
    ));
    write_header(&mut buf, frame);
    let payload_start = buf.len();
    buf.extend_from_slice(&frame.payload);
    if let Some(key) = frame.mask_key {
        apply_mask(&mut buf[payload_start..], key);
    }
    Ok(buf)
}

/// Encode `frame` into the end of the caller-supplied buffer, returning the slice
/// that was just written. Enables a zero-allocation send path when `buf` is a reused
/// scratch buffer.
pub fn encode_into<'b>(
    frame: &Frame,
    buf: &'b mut Vec<u8>,
) -> Result<&'b [u8], ProtocolError> {
    validate_for_encode(frame)?;
    let start = buf.len();
    write_header(buf, frame);
    let payload_start = buf.len();
    buf.extend_from_slice(&frame.payload);
    if let Some(key) = frame.mask_key {
        apply_mask(&mut buf[payload_start..], key);
    }
    Ok(&buf[start..])
}

/// Outcome of a streaming decode attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum DecodeOutcome<T> {
    /// A full frame was parsed; `consumed` bytes of the input were used.
    Complete { frame: T, consumed: usize },
    /// Not enough bytes were available; at least `additional` more bytes are needed
    /// before trying again. `additional` is a lower bound derived from whatever
    /// header has been parsed so far (2 when nothing is yet known).
    NeedMore { additional: usize },
}

struct ParsedHeader {
    fin: bool,
    rsv: RsvBits,
    opcode: OpCode,
    masked: bool,
    header_len: usize,
    payload_len: usize,
}

/// Parses the base 2-byte header plus whatever extended length/mask-key fields are
/// present, reporting `NeedMore` at each point more bytes are required instead of
/// panicking on a short buffer. `allowed_rsv` is the set of reserved bits a
/// negotiated extension has claimed; any bit set outside that set is a protocol
/// error (RFC 6455 §5.2).
fn parse_header(
    buf: &[u8],
    allowed_rsv: RsvBits,
) -> Result<Result<ParsedHeader, usize>, ProtocolError> {
    if buf.len() < 2 {
        return Ok(Err(2 - buf.len()));
    }

    let fin = (buf[0] & 0b1000_0000) != 0;
    let rsv = RsvBits {
        rsv1: (buf[0] & 0b0100_0000) != 0,
        rsv2: (buf[0] & 0b0010_0000) != 0,
        rsv3: (buf[0] & 0b0001_0000) != 0,
    };
    let opcode = OpCode::from_byte(buf[0] & 0b0000_1111)?;

    if (rsv.rsv1 && !allowed_rsv.rsv1)
        || (rsv.rsv2 && !allowed_rsv.rsv2)
        || (rsv.rsv3 && !allowed_rsv.rsv3)
    {
        return Err(ProtocolError::RsvNotZero);
    }

    if !fin && opcode.is_control() {
        return Err(ProtocolError::ControlFrameFragmented);
    }

    let masked = (buf[1] & 0b1000_0000) != 0;
    let base_len = (buf[1] & 0b0111_1111) as usize;

    if base_len > MAX_CONTROL_PAYLOAD && opcode.is_control() {
        return Err(ProtocolError::ControlFramePayloadTooLarge(base_len));
    }

    let extended_bytes = match base_len {
        126 => 2,
        127 => 8,
        _ => 0,
    };
    let mask_bytes = if masked { 4 } else { 0 };
    let header_len = 2 + extended_bytes + mask_bytes;

    if buf.len() < header_len {
        return Ok(Err(header_len - buf.len()));
    }

    let payload_len = match base_len {
        126 => u16::from_be_bytes(buf[2..4].try_into().unwrap()) as usize,
        127 => {
            let raw = u64::from_be_bytes(buf[2..10].try_into().unwrap());
            if raw & (1 << 63) != 0 {
                return Err(ProtocolError::LengthMsbSet);
            }
            raw as usize
        }
        small => small,
    };

    Ok(Ok(ParsedHeader {
        fin,
        rsv,
        opcode,
        masked,
        header_len,
        payload_len,
    }))
}

fn mask_key_at(buf: &[u8], parsed: &ParsedHeader) -> Option<[u8; 4]> {
    if !parsed.masked {
        return None;
    }
    let start = parsed.header_len - 4;
    Some(buf[start..start + 4].try_into().unwrap())
}

/// Decode one frame from the front of `buf`, copying the payload into an owned
/// `Frame`. `require_masked` enforces the RFC's masking direction: servers must
/// reject unmasked client frames, clients must reject masked server frames. No
/// reserved bits are permitted; use [`decode_with_extensions`] when extensions have
/// claimed some.
pub fn decode(
    buf: &[u8],
    require_masked: bool,
) -> Result<DecodeOutcome<Frame>, ProtocolError> {
    decode_with_extensions(buf, require_masked, RsvBits::NONE)
}

/// Same as [`decode`], but `allowed_rsv` marks which reserved bits a negotiated
/// extension has claimed and are therefore not rejected.
pub fn decode_with_extensions(
    buf: &[u8],
    require_masked: bool,
    allowed_rsv: RsvBits,
) -> Result<DecodeOutcome<Frame>, ProtocolError> {
    let parsed = match parse_header(buf, allowed_rsv)? {
        Ok(p) => p,
        Err(additional) => return Ok(DecodeOutcome::NeedMore { additional }),
    };

    if parsed.masked != require_masked {
        return Err(if require_masked {
            ProtocolError::ExpectedMasked
        } else {
            ProtocolError::ExpectedUnmasked
        });
    }

    let total_len = parsed.header_len + parsed.payload_len;
    if buf.len() < total_len {
        return Ok(DecodeOutcome::NeedMore {
            additional: total_len - buf.len(),
        });
    }

    let mask_key = mask_key_at(buf, &parsed);
    let mut payload = buf[parsed.header_len..total_len].to_vec();
    if let Some(key) = mask_key {
        apply_mask(&mut payload, key);
    }

    Ok(DecodeOutcome::Complete {
        frame: Frame {
            fin: parsed.fin,
            rsv: parsed.rsv,
            opcode: parsed.opcode,
            masked: parsed.masked,
            mask_key,
            payload,
        },
        consumed: total_len,
    })
}

/// A frame whose payload borrows from the buffer passed to [`decode_in_place`]. If
/// the frame was masked, the payload has already been unmasked in place.
#[derive(Debug)]
pub struct BorrowedFrame<'b> {
    pub fin: bool,
    pub rsv: RsvBits,
    pub opcode: OpCode,
    pub masked: bool,
    pub mask_key: Option<[u8; 4]>,
    pub payload: &'b [u8],
}

impl<'b> BorrowedFrame<'b> {
    pub fn to_owned_frame(&self) -> Frame {
        Frame {
            fin: self.fin,
            rsv: self.rsv,
            opcode: self.opcode,
            masked: self.masked,
            mask_key: self.mask_key,
            payload: self.payload.to_vec(),
        }
    }
}

/// Same contract as [`decode`], but unmasks in place inside `buf` and borrows the
/// payload from it instead of allocating. The hot path used by
/// [`crate::connection::Connection::receive`].
pub fn decode_in_place<'b>(
    buf: &'b mut [u8],
    require_masked: bool,
) -> Result<DecodeOutcome<BorrowedFrame<'b>>, ProtocolError> {
    decode_in_place_with_extensions(buf, require_masked, RsvBits::NONE)
}

/// Same as [`decode_in_place`], with the extension-claimed RSV bits supplied.
pub fn decode_in_place_with_extensions<'b>(
    buf: &'b mut [u8],
    require_masked: bool,
    allowed_rsv: RsvBits,
) -> Result<DecodeOutcome<BorrowedFrame<'b>>, ProtocolError> {
    let parsed = match parse_header(buf, allowed_rsv)? {
        Ok(p) => p,
        Err(additional) => return Ok(DecodeOutcome::NeedMore { additional }),
    };

    if parsed.masked != require_masked {
        return Err(if require_masked {
            ProtocolError::ExpectedMasked
        } else {
            ProtocolError::ExpectedUnmasked
        });
    }

    let total_len = parsed.header_len + parsed.payload_len;
    if buf.len() < total_len {
        return Ok(DecodeOutcome::NeedMore {
            additional: total_len - buf.len(),
        });
    }

    let mask_key = mask_key_at(buf, &parsed);
    if let Some(key) = mask_key {
        apply_mask(&mut buf[parsed.header_len..total_len], key);
    }

    Ok(DecodeOutcome::Complete {
        frame: BorrowedFrame {
            fin: parsed.fin,
            rsv: parsed.rsv,
            opcode: parsed.opcode,
            masked: parsed.masked,
            mask_key,
            payload: &buf[parsed.header_len..total_len],
        },
        consumed: total_len,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::OpCode;

    fn sample_key() -> [u8; 4] {
        [0x12, 0x34, 0x56, 0x78]
    }

    #[test]
    fn mask_is_an_involution() {
        let original = b"the quick brown fox jumps over the lazy dog, 12345".to_vec();
        let key = sample_key();
        let mut data = original.clone();
        apply_mask(&mut data, key);
        assert_ne!(data, original);
        apply_mask(&mut data, key);
        assert_eq!(data, original);
    }

    #[test]
    fn mask_is_correct_at_every_tail_length() {
        for len in 0..=16 {
            let original: Vec<u8> = (0..len as u8).collect();
            let key = sample_key();
            let mut data = original.clone();
            apply_mask(&mut data, key);
            apply_mask(&mut data, key);
            assert_eq!(data, original, "failed at len={len}");
        }
    }

    #[test]
    fn round_trip_small_unmasked_frame() {
        let frame = Frame::new(true, OpCode::Text, b"Hi".to_vec());
        let encoded = encode(&frame).unwrap();
        match decode(&encoded, false).unwrap() {
            DecodeOutcome::Complete { frame: decoded, consumed } => {
                assert_eq!(consumed, encoded.len());
                assert_eq!(decoded.payload, frame.payload);
                assert_eq!(decoded.opcode, frame.opcode);
                assert_eq!(decoded.fin, frame.fin);
            }
            other => panic!("expected Complete, got {other:?}"),
        }
    }

    #[test]
    fn round_trip_masked_frame() {
        let frame = Frame::new(true, OpCode::Text, b"Hi".to_vec()).masked(sample_key());
        let encoded = encode(&frame).unwrap();
        // wire layout: 81 82 <mask x4> <masked payload x2>
        assert_eq!(encoded[0], 0x81);
        assert_eq!(encoded[1], 0x82);
        match decode(&encoded, true).unwrap() {
            DecodeOutcome::Complete { frame: decoded, .. } => {
                assert_eq!(decoded.payload, b"Hi");
            }
            other => panic!("expected Complete, got {other:?}"),
        }
    }

    #[test]
    fn length_encoding_is_minimal() {
        assert_eq!(encoded_size(0, false), 2);
        assert_eq!(encoded_size(125, false), 2 + 125);
        assert_eq!(encoded_size(126, false), 2 + 2 + 126);
        assert_eq!(encoded_size(65535, false), 2 + 2 + 65535);
        assert_eq!(encoded_size(65536, false), 2 + 8 + 65536);
        assert_eq!(encoded_size(125, true), 2 + 4 + 125);
    }

    #[test]
    fn streaming_decode_reports_need_more_monotonically() {
        let frame = Frame::new(true, OpCode::Binary, vec![7u8; 200]);
        let encoded = encode(&frame).unwrap();

        for cut in 0..encoded.len() {
            let prefix = &encoded[..cut];
            match decode(prefix, false).unwrap() {
                DecodeOutcome::NeedMore { additional } => {
                    assert!(additional > 0);
                    assert!(cut + additional <= encoded.len());
                }
                DecodeOutcome::Complete { consumed, .. } => {
                    assert!(consumed <= encoded.len());
                }
            }
        }

        match decode(&encoded, false).unwrap() {
            DecodeOutcome::Complete { consumed, .. } => assert_eq!(consumed, encoded.len()),
            other => panic!("expected Complete, got {other:?}"),
        }
    }

    #[test]
    fn decode_in_place_unmasks_and_borrows() {
        let frame = Frame::new(true, OpCode::Text, b"Hi".to_vec()).masked(sample_key());
        let mut encoded = encode(&frame).unwrap();
        match decode_in_place(&mut encoded, true).unwrap() {
            DecodeOutcome::Complete { frame: decoded, .. } => {
                assert_eq!(decoded.payload, b"Hi");
            }
            other => panic!("expected Complete, got {other:?}"),
        }
    }

    #[test]
    fn rsv_bit_without_extension_is_rejected() {
        let mut encoded = encode(&Frame::new(true, OpCode::Text, b"hi".to_vec())).unwrap();
        encoded[0] |= 0b0100_0000; // set RSV1
        assert!(decode(&encoded, false).is_err());
    }

    #[test]
    fn rsv_bit_claimed_by_extension_is_accepted() {
        let mut encoded = encode(&Frame::new(true, OpCode::Text, b"hi".to_vec())).unwrap();
        encoded[0] |= 0b0100_0000; // set RSV1
        let allowed = RsvBits {
            rsv1: true,
            ..RsvBits::NONE
        };
        match decode_with_extensions(&encoded, false, allowed).unwrap() {
            DecodeOutcome::Complete { frame, .. } => assert!(frame.rsv.rsv1),
            other => panic!("expected Complete, got {other:?}"),
        }
    }

    #[test]
    fn control_frame_fin_false_is_rejected_on_decode() {
        let mut header = vec![0x09, 0x00]; // Ping, fin=0
        assert!(decode(&header, false).is_err());
        header[0] = 0x08; // Close, fin=0
        assert!(decode(&header, false).is_err());
    }

    #[test]
    fn control_frame_oversized_payload_is_rejected_at_encode_and_decode() {
        let oversized = Frame::new(true, OpCode::Ping, vec![0u8; 126]);
        assert!(encode(&oversized).is_err());

        let mut wire = vec![0x89u8, 126]; // Ping, length marker 126 (extended)
        wire.extend_from_slice(&[0u8; 2]);
        assert!(decode(&wire, false).is_err());
    }

    #[test]
    fn length_msb_set_is_rejected() {
        let mut wire = vec![0x82u8, 127];
        wire.extend_from_slice(&(1u64 << 63).to_be_bytes());
        assert!(decode(&wire, false).is_err());
    }

    #[test]
    fn server_rejects_unmasked_and_client_rejects_masked() {
        let unmasked = encode(&Frame::new(true, OpCode::Text, b"hi".to_vec())).unwrap();
        assert!(decode(&unmasked, true).is_err());

        let masked =
            encode(&Frame::new(true, OpCode::Text, b"hi".to_vec()).masked(sample_key())).unwrap();
        assert!(decode(&masked, false).is_err());
    }
}
