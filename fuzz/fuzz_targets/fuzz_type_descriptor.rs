//! Fuzz target for metadata topic records.

#![no_main]

use cdc_replication::codec::TypeDescriptor;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(descriptor) = TypeDescriptor::decode(data) {
        let encoded = descriptor.encode().expect("decoded descriptor re-encodes");
        assert_eq!(TypeDescriptor::decode(&encoded).ok(), Some(descriptor));
    }
});
