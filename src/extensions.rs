//! The extension hook: an ordered chain of
//! [`FrameTransform`]s run before encode and after decode, plus the
//! `Sec-WebSocket-Extensions` negotiation parameter grammar
//! (`permessage-deflate`, `*_no_context_takeover`, `*_max_window_bits`).
//!
//! The concrete permessage-deflate compressor ([`PermessageDeflate`]) is a
//! pluggable, off-by-default [`FrameTransform`] gated by the `permessage-deflate`
//! Cargo feature, built on `flate2`'s raw-deflate `Compress`/`Decompress` streams,
//! stateful across calls so context takeover (or its absence) actually means
//! something.

use crate::error::ExtensionError;
#[cfg(feature = "permessage-deflate")]
use crate::frame::OpCode;
use crate::frame::{Frame, RsvBits};

/// A single negotiated extension's hook into the frame pipeline. `claimed_rsv_bits`
/// tells the connection which reserved bits this transform may set, so the decoder's
/// "RSV must be zero" check can be relaxed for exactly those bits.
pub trait FrameTransform: Send + Sync {
    fn name(&self) -> &'static str;
    fn claimed_rsv_bits(&self) -> RsvBits;
    fn on_outgoing(&mut self, frame: Frame) -> Result<Frame, ExtensionError>;
    fn on_incoming(&mut self, frame: Frame) -> Result<Frame, ExtensionError>;
}

/// Parsed `Sec-WebSocket-Extensions: permessage-deflate[; params]` parameters.
/// Some of these affect both compression and decompression
/// (`client_no_context_takeover`, `server_no_context_takeover`), while others affect
/// only compression (`client_max_window_bits`, `server_max_window_bits`). Larger
/// window sizes (closer to 15) compress better but use more memory; smaller ones
/// (closer to 8) are faster and lighter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermessageDeflateParams {
    pub client_no_context_takeover: bool,
    pub server_no_context_takeover: bool,
    pub client_max_window_bits: Option<u8>,
    pub server_max_window_bits: Option<u8>,
}

const PERMESSAGE_DEFLATE: &str = "permessage-deflate";
const CLIENT_NO_CONTEXT_TAKEOVER: &str = "client_no_context_takeover";
const SERVER_NO_CONTEXT_TAKEOVER: &str = "server_no_context_takeover";
const CLIENT_MAX_WINDOW_BITS: &str = "client_max_window_bits";
const SERVER_MAX_WINDOW_BITS: &str = "server_max_window_bits";

/// Parses one `Sec-WebSocket-Extensions` offer (already split on `,` by the caller)
/// into its permessage-deflate parameters, or `None` if the offer doesn't name
/// permessage-deflate at all.
pub fn parse_permessage_deflate(
    offer: &str,
) -> Result<Option<PermessageDeflateParams>, ExtensionError> {
    let mut params = PermessageDeflateParams::default();
    let mut saw_permessage_deflate = false;

    for part in offer.split(';') {
        let part = part.trim();
        if part == PERMESSAGE_DEFLATE {
            saw_permessage_deflate = true;
        } else if part == CLIENT_NO_CONTEXT_TAKEOVER {
            params.client_no_context_takeover = true;
        } else if part == SERVER_NO_CONTEXT_TAKEOVER {
            params.server_no_context_takeover = true;
        } else if let Some(value) = part.strip_prefix(CLIENT_MAX_WINDOW_BITS) {
            params.client_max_window_bits = Some(parse_window_bits(value)?);
        } else if let Some(value) = part.strip_prefix(SERVER_MAX_WINDOW_BITS) {
            params.server_max_window_bits = Some(parse_window_bits(value)?);
        }
    }

    Ok(saw_permessage_deflate.then_some(params))
}

/// Parses a `*_max_window_bits` value. An omitted value defaults to 15 (RFC 7692
/// §7.1.2.1); an explicit value outside 8..=15 is rejected.
fn parse_window_bits(value: &str) -> Result<u8, ExtensionError> {
    let bits = match value.trim().strip_prefix('=') {
        Some(number) => number.trim().parse::<u8>().unwrap_or(15),
        None => return Ok(15),
    };
    if (8..=15).contains(&bits) {
        Ok(bits)
    } else {
        Err(ExtensionError::InvalidMaxWindowBits(bits))
    }
}

/// Merges a server's configured parameters with a client's offer, favoring the more
/// conservative (smaller) window size and requiring both sides to agree before
/// enabling no-context-takeover.
pub fn merge_permessage_deflate(
    server: &PermessageDeflateParams,
    client: &PermessageDeflateParams,
) -> PermessageDeflateParams {
    PermessageDeflateParams {
        client_no_context_takeover: server.client_no_context_takeover
            || client.client_no_context_takeover,
        server_no_context_takeover: server.server_no_context_takeover
            || client.server_no_context_takeover,
        client_max_window_bits: min_option(
            server.client_max_window_bits,
            client.client_max_window_bits,
        ),
        server_max_window_bits: min_option(
            server.server_max_window_bits,
            client.server_max_window_bits,
        ),
    }
}

fn min_option(a: Option<u8>, b: Option<u8>) -> Option<u8> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

/// Serializes `params` back into a `Sec-WebSocket-Extensions` header value.
pub fn format_permessage_deflate(params: &PermessageDeflateParams) -> String {
    let mut out = String::from(PERMESSAGE_DEFLATE);
    if params.client_no_context_takeover {
        out.push_str("; ");
        out.push_str(CLIENT_NO_CONTEXT_TAKEOVER);
    }
    if params.server_no_context_takeover {
        out.push_str("; ");
        out.push_str(SERVER_NO_CONTEXT_TAKEOVER);
    }
    if let Some(bits) = params.client_max_window_bits {
        out.push_str(&format!("; {}={}", CLIENT_MAX_WINDOW_BITS, bits));
    }
    if let Some(bits) = params.server_max_window_bits {
        out.push_str(&format!("; {}={}", SERVER_MAX_WINDOW_BITS, bits));
    }
    out
}

/// RFC 7692's per-frame trailer: a compressor that ends a message with these four
/// bytes has them stripped before the wire; a decompressor expects them appended
/// back on before the final flush.
#[cfg(feature = "permessage-deflate")]
const DEFLATE_TRAILER: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// The `permessage-deflate` extension: compresses outgoing Text/Binary messages and
/// decompresses incoming ones whose first frame carries RSV1. Only the first frame
/// of a fragmented message carries RSV1 (RFC 7692 §7.2.3); continuation frames
/// inherit whether the message as a whole is compressed.
#[cfg(feature = "permessage-deflate")]
pub struct PermessageDeflate {
    params: PermessageDeflateParams,
    is_server: bool,
    compressor: flate2::Compress,
    decompressor: flate2::Decompress,
    incoming_message_compressed: bool,
}

#[cfg(feature = "permessage-deflate")]
impl PermessageDeflate {
    pub fn new(params: PermessageDeflateParams, is_server: bool) -> Self {
        PermessageDeflate {
            params,
            is_server,
            compressor: flate2::Compress::new(flate2::Compression::default(), false),
            decompressor: flate2::Decompress::new(false),
            incoming_message_compressed: false,
        }
    }

    fn outgoing_no_context_takeover(&self) -> bool {
        if self.is_server {
            self.params.server_no_context_takeover
        } else {
            self.params.client_no_context_takeover
        }
    }

    fn incoming_no_context_takeover(&self) -> bool {
        if self.is_server {
            self.params.client_no_context_takeover
        } else {
            self.params.server_no_context_takeover
        }
    }

    fn compress_chunk(&mut self, payload: &[u8], fin: bool) -> Result<Vec<u8>, ExtensionError> {
        use flate2::Status;

        let mut out = Vec::with_capacity(payload.len());
        let flush = if fin {
            flate2::FlushCompress::Sync
        } else {
            flate2::FlushCompress::None
        };
        let status = self
            .compressor
            .compress_vec(payload, &mut out, flush)
            .map_err(|e| ExtensionError::Rejected("permessage-deflate", e.to_string()))?;
        if !matches!(status, Status::Ok | Status::StreamEnd) {
            return Err(ExtensionError::Rejected(
                "permessage-deflate",
                "compressor did not consume the full frame".to_string(),
            ));
        }
        if fin && out.ends_with(&DEFLATE_TRAILER) {
            out.truncate(out.len() - DEFLATE_TRAILER.len());
        }
        if fin && self.outgoing_no_context_takeover() {
            self.compressor.reset();
        }
        Ok(out)
    }

    fn decompress_chunk(&mut self, payload: &[u8], fin: bool) -> Result<Vec<u8>, ExtensionError> {
        use flate2::Status;

        let mut input = payload.to_vec();
        if fin {
            input.extend_from_slice(&DEFLATE_TRAILER);
        }
        let mut out = Vec::with_capacity(payload.len() * 2);
        let flush = if fin {
            flate2::FlushDecompress::Sync
        } else {
            flate2::FlushDecompress::None
        };
        let status = self
            .decompressor
            .decompress_vec(&input, &mut out, flush)
            .map_err(|e| ExtensionError::Rejected("permessage-deflate", e.to_string()))?;
        if !matches!(status, Status::Ok | Status::StreamEnd) {
            return Err(ExtensionError::Rejected(
                "permessage-deflate",
                "decompressor did not consume the full frame".to_string(),
            ));
        }
        if fin && self.incoming_no_context_takeover() {
            self.decompressor.reset(false);
        }
        Ok(out)
    }
}

#[cfg(feature = "permessage-deflate")]
impl FrameTransform for PermessageDeflate {
    fn name(&self) -> &'static str {
        "permessage-deflate"
    }

    fn claimed_rsv_bits(&self) -> RsvBits {
        RsvBits {
            rsv1: true,
            rsv2: false,
            rsv3: false,
        }
    }

    fn on_outgoing(&mut self, frame: Frame) -> Result<Frame, ExtensionError> {
        if frame.opcode.is_control() {
            return Ok(frame);
        }
        let is_first_frame = !matches!(frame.opcode, OpCode::Continuation);
        let compressed = self.compress_chunk(&frame.payload, frame.fin)?;

        Ok(Frame {
            rsv: RsvBits {
                rsv1: is_first_frame,
                ..frame.rsv
            },
            payload: compressed,
            ..frame
        })
    }

    fn on_incoming(&mut self, frame: Frame) -> Result<Frame, ExtensionError> {
        if frame.opcode.is_control() {
            return Ok(frame);
        }
        if !matches!(frame.opcode, OpCode::Continuation) {
            self.incoming_message_compressed = frame.rsv.rsv1;
        }
        if !self.incoming_message_compressed {
            return Ok(frame);
        }

        let decompressed = self.decompress_chunk(&frame.payload, frame.fin)?;
        Ok(Frame {
            rsv: RsvBits {
                rsv1: false,
                ..frame.rsv
            },
            payload: decompressed,
            ..frame
        })
    }
}
