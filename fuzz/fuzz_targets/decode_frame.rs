#![no_main]

use libfuzzer_sys::fuzz_target;
use wsframe::codec::{decode, DecodeOutcome};

// The codec never performs I/O, so it fuzzes directly: feed arbitrary bytes and make
// sure decode() only ever returns Ok(..) or a ProtocolError, never panics, and that a
// reported `NeedMore`/`Complete` never claims to have consumed more bytes than were
// given.
fuzz_target!(|data: &[u8]| {
    for require_masked in [false, true] {
        if let Ok(outcome) = decode(data, require_masked) {
            match outcome {
                DecodeOutcome::Complete { consumed, .. } => assert!(consumed <= data.len()),
                DecodeOutcome::NeedMore { additional } => assert!(additional > 0),
            }
        }
    }
});
