//! Fuzz target for archive body decompression.
//!
//! Corrupted or truncated compressed data must produce an error, never a
//! panic or unbounded allocation.

#![no_main]

use libfuzzer_sys::fuzz_target;
use treemesh::wire::maybe_decompress;

fuzz_target!(|data: &[u8]| {
    match maybe_decompress(data) {
        Ok(out) => {
            // Pass-through data comes back verbatim.
            if data.len() < 4 || data[..4] != [0x28, 0xB5, 0x2F, 0xFD] {
                assert_eq!(out, data);
            }
        }
        Err(_) => {
            // Only zstd-framed data may fail.
            assert!(data.len() >= 4 && data[..4] == [0x28, 0xB5, 0x2F, 0xFD]);
        }
    }
});
