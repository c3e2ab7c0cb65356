//! Small stateless helpers shared by the handshake and connection layers: the
//! Sec-WebSocket-Accept computation and client nonce/mask-key generation.

use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use rand::Rng;

/// The fixed GUID from RFC 6455 §1.3, concatenated onto the client key before
/// hashing. A compile-time constant; there is no other process-wide state in this
/// crate.
pub(crate) const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// `Base64(SHA1(client_key || GUID))`. The client key is used exactly as received;
/// implementations must not normalize it.
pub fn compute_accept_key(client_key: &str) -> String {
    use sha1::{Digest, Sha1};
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    BASE64_STANDARD.encode(hasher.finalize())
}

/// A fresh 16-byte cryptographically-random nonce, base64-encoded for use as
/// `Sec-WebSocket-Key`.
pub fn generate_websocket_key() -> String {
    let bytes: [u8; 16] = rand::rng().random();
    BASE64_STANDARD.encode(bytes)
}

/// A fresh 4-byte mask key from a cryptographic-quality source. Keys must not be
/// reused across frames sent by the same endpoint.
pub fn generate_mask_key() -> [u8; 4] {
    rand::rng().random()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_key_matches_rfc6455_test_vector() {
        assert_eq!(
            compute_accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn generated_keys_are_16_bytes_base64() {
        let key = generate_websocket_key();
        let decoded = BASE64_STANDARD.decode(&key).unwrap();
        assert_eq!(decoded.len(), 16);
    }

    #[test]
    fn mask_keys_vary() {
        let a = generate_mask_key();
        let b = generate_mask_key();
        // Statistically near-certain; guards against an accidental constant key.
        assert_ne!(a, b);
    }
}
