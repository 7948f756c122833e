#![no_main]
use chunkfile_rs::core::backend::fs::{decode_journal, encode_journal};
use libfuzzer_sys::fuzz_target;

// Arbitrary journal bytes must decode or fail cleanly, never panic
fuzz_target!(|input: &[u8]| {
    if let Ok(batch) = decode_journal(input, "fuzz.journal") {
        let frame = encode_journal(&batch).unwrap();
        assert!(decode_journal(&frame, "fuzz.journal").is_ok());
    }
});
