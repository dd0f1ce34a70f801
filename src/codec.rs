// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Wire format for data and metadata records.
//!
//! A data record carries one [`VersionedEntry`] serialized as JSON. Bodies
//! above the configured threshold are zstd-compressed; the decoder detects
//! compression by the zstd magic bytes, so either side can change the
//! threshold independently.
//!
//! # Content Hash Validation
//!
//! Each record carries the SHA256 of the uncompressed body. The decoder
//! verifies it, which turns truncation, bit flips and compression bugs into a
//! [`CdcError::Codec`] on that single record instead of a corrupt write.

use crate::entry::VersionedEntry;
use crate::error::{CdcError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Read;

/// zstd magic bytes for decompression detection
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

const ZSTD_LEVEL: i32 = 3;

/// A data record as it travels through the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedRecord {
    pub cache: String,
    pub key: String,
    /// JSON body, possibly zstd-compressed.
    pub data: Vec<u8>,
    /// SHA256 hex of the uncompressed body.
    pub hash: String,
}

impl EncodedRecord {
    /// Bytes this record contributes to the `I2K_BYTES_SNT` counter.
    pub fn size_bytes(&self) -> usize {
        self.cache.len() + self.key.len() + self.data.len() + self.hash.len()
    }
}

/// Serialize an entry of `cache` into a wire record.
pub fn encode_entry(cache: &str, entry: &VersionedEntry, compression_threshold: usize) -> Result<EncodedRecord> {
    let body = serde_json::to_vec(entry)
        .map_err(|e| CdcError::Codec(format!("serialize key '{}': {}", entry.key, e)))?;
    let hash = compute_content_hash(&body);
    let data = maybe_compress(body, compression_threshold)?;

    Ok(EncodedRecord {
        cache: cache.to_string(),
        key: entry.key.clone(),
        data,
        hash,
    })
}

/// Decode and verify a wire record.
pub fn decode_entry(record: &EncodedRecord) -> Result<VersionedEntry> {
    let body = maybe_decompress(&record.data)?;

    let computed = compute_content_hash(&body);
    if computed != record.hash {
        return Err(CdcError::Codec(format!(
            "Content hash mismatch for key '{}': expected {}, got {}",
            record.key, record.hash, computed
        )));
    }

    let entry: VersionedEntry = serde_json::from_slice(&body)
        .map_err(|e| CdcError::Codec(format!("deserialize key '{}': {}", record.key, e)))?;

    if entry.key != record.key {
        return Err(CdcError::Codec(format!(
            "record key '{}' does not match entry key '{}'",
            record.key, entry.key
        )));
    }

    Ok(entry)
}

/// Schema descriptor published on the metadata topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDescriptor {
    pub type_id: u32,
    pub type_name: String,
    /// Top-level payload fields, sorted.
    pub fields: Vec<String>,
}

impl TypeDescriptor {
    /// Describe the type of an entry, if it has one.
    pub fn from_entry(entry: &VersionedEntry) -> Option<Self> {
        let type_name = entry.type_name.as_ref()?;
        let mut fields: Vec<String> = entry
            .value
            .as_ref()
            .and_then(|v| v.as_object())
            .map(|obj| obj.keys().cloned().collect())
            .unwrap_or_default();
        fields.sort();

        Some(Self {
            type_id: type_id_for(type_name),
            type_name: type_name.clone(),
            fields,
        })
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields.iter().any(|f| f == name)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| CdcError::Codec(format!("serialize type '{}': {}", self.type_name, e)))
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| CdcError::Codec(format!("deserialize type descriptor: {}", e)))
    }
}

/// Stable type id: first four bytes of SHA256 of the type name.
pub fn type_id_for(type_name: &str) -> u32 {
    let digest = Sha256::digest(type_name.as_bytes());
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Compress with zstd when the body exceeds `threshold` bytes (0 disables).
pub fn maybe_compress(data: Vec<u8>, threshold: usize) -> Result<Vec<u8>> {
    if threshold == 0 || data.len() <= threshold {
        return Ok(data);
    }
    zstd::encode_all(&data[..], ZSTD_LEVEL).map_err(|e| CdcError::Codec(format!("zstd encode: {}", e)))
}

/// Decompress zstd data if it has the magic header, otherwise return as-is.
pub fn maybe_decompress(data: &[u8]) -> Result<Vec<u8>> {
    if data.len() >= 4 && data[..4] == ZSTD_MAGIC {
        let mut decoder = zstd::Decoder::new(data)
            .map_err(|e| CdcError::Decompression(format!("zstd init: {}", e)))?;
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| CdcError::Decompression(format!("zstd decode: {}", e)))?;
        Ok(decompressed)
    } else {
        Ok(data.to_vec())
    }
}

/// Compute SHA256 content hash as hex string.
pub fn compute_content_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
