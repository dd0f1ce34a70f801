//! Fuzz target for wire record decoding.
//!
//! Tests that `maybe_decompress` and `decode_entry` never panic on
//! arbitrary bodies, whether or not they carry the zstd magic.

#![no_main]

use cdc_replication::codec::{compute_content_hash, decode_entry, maybe_decompress, EncodedRecord};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = maybe_decompress(data);

    // Once with a hash that cannot match, once with the real one so the
    // JSON path is reached too.
    let mut record = EncodedRecord {
        cache: "c".to_string(),
        key: "k".to_string(),
        data: data.to_vec(),
        hash: String::new(),
    };
    let _ = decode_entry(&record);

    if let Ok(body) = maybe_decompress(data) {
        record.hash = compute_content_hash(&body);
        let _ = decode_entry(&record);
    }
});
