//! BLAKE3 integrity digests and SHA-256 storage digests
//!
//! The BLAKE3 digest over ciphertext is what the backend confirms chunks
//! against. The SHA-256 digest (base64) is the form S3-compatible stores
//! accept as a checksum header.

use std::path::Path;

use anyhow::Context;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha2::{Digest, Sha256};
use zkd_core::ZkdResult;

pub type Hash = blake3::Hash;

pub fn hash_bytes(data: &[u8]) -> Hash {
    blake3::hash(data)
}

/// Lowercase hex, 64 chars
pub fn hash_to_hex(hash: &Hash) -> String {
    hash.to_hex().to_string()
}

/// BLAKE3 of `ciphertext` as hex
pub fn integrity_digest(ciphertext: &[u8]) -> String {
    hash_to_hex(&hash_bytes(ciphertext))
}

/// SHA-256 of `data`, base64 encoded
pub fn content_digest(data: &[u8]) -> String {
    STANDARD.encode(Sha256::digest(data))
}

/// Hash a file with the streaming interface, without reading it whole.
pub fn hash_file_streaming(path: &Path) -> ZkdResult<Hash> {
    use std::io::Read;

    let mut file = std::fs::File::open(path)
        .with_context(|| format!("opening file for streaming hash: {}", path.display()))?;

    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hasher.finalize())
}
