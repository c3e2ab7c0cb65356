#![no_main]

use libfuzzer_sys::fuzz_target;
use wsframe::handshake::parse_request;

// Arbitrary bytes prefixed with a minimal valid request line exercise header parsing
// and validation without ever needing a real socket. Only cares that parsing never
// panics; the `Result` itself is uninteresting.
fuzz_target!(|data: &[u8]| {
    let mut request = b"GET / HTTP/1.1\r\n".to_vec();
    request.extend_from_slice(data);
    let _ = parse_request(&request);
});
