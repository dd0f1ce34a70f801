//! Fuzz target for offset parsing.
//!
//! `compare_offsets`, `parse_offset_timestamp` and `offset_lag_ms` see
//! whatever the transport hands back and must never panic.

#![no_main]

use cdc_replication::transport::{compare_offsets, offset_lag_ms, parse_offset_timestamp};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (&str, &str, u64)| {
    let (a, b, now) = data;

    let _ = parse_offset_timestamp(a);
    let _ = offset_lag_ms(a, now);

    // Comparison stays antisymmetric on any input.
    assert_eq!(compare_offsets(a, b), compare_offsets(b, a).reverse());
});
