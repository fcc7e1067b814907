//! Fuzz target for wire packet decoding.
//!
//! Arbitrary bytes must never panic the decoder, and anything that does
//! decode must re-encode and decode to the same packet.

#![no_main]

use libfuzzer_sys::fuzz_target;
use treemesh::wire::{decode_packet, encode_packet};

fuzz_target!(|data: &[u8]| {
    let Ok(packet) = decode_packet(data) else {
        return;
    };
    // Re-encoding may legitimately fail (e.g. an oversized heartbeat),
    // but when it succeeds the roundtrip must be exact.
    if let Ok(bytes) = encode_packet(&packet) {
        let again = decode_packet(&bytes).expect("re-encoded packet must decode");
        assert_eq!(again, packet);
    }
});
