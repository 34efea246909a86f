//! Content checksums over canonical JSON.

use serde_json::Value;

use super::backend::ChecksumProvider;
use crate::domain::sha256_hex;

/// SHA-256 of the compact JSON encoding. Object keys serialize in sorted
/// order, so equal documents always hash equal.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Checksum;

impl ChecksumProvider for Sha256Checksum {
    fn checksum(&self, data: &Value) -> String {
        let bytes = serde_json::to_vec(data).unwrap_or_default();
        sha256_hex(&bytes)
    }
}
