//! Per-object compressibility check and zstd codec
//!
//! Compression is decided once per object: either the name marks the data
//! as already compressed, or a leading sample is compressed and the savings
//! compared against a threshold. Chunks then follow that decision, except
//! that a chunk which would grow is stored raw.

use std::path::Path;

use serde::{Deserialize, Serialize};
use zkd_core::config::ChunkingConfig;
use zkd_core::types::MAX_CHUNK_BYTES;
use zkd_core::{ZkdError, ZkdResult};

/// Extensions whose content is already compressed
const PRECOMPRESSED_EXTENSIONS: &[&str] = &[
    // images
    "jpg", "jpeg", "png", "gif", "webp", "heic", "heif", "avif",
    // video / audio
    "mp4", "mov", "mkv", "webm", "avi", "m4v", "mp3", "aac", "m4a", "ogg", "opus", "flac",
    // archives
    "zip", "gz", "tgz", "bz2", "xz", "zst", "7z", "rar",
    // compressed document containers
    "pdf", "docx", "xlsx", "pptx", "odt", "ods", "epub",
];

/// The object-wide compression choice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum CompressionDecision {
    Zstd { level: i32 },
    Skip,
}

impl CompressionDecision {
    pub fn is_enabled(&self) -> bool {
        matches!(self, CompressionDecision::Zstd { .. })
    }
}

pub fn is_precompressed(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            PRECOMPRESSED_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// Decide compression for an object from its name and leading bytes.
pub fn assess_compression(name: &str, sample: &[u8], cfg: &ChunkingConfig) -> CompressionDecision {
    if is_precompressed(name) {
        tracing::debug!(name, "skipping compression: pre-compressed format");
        return CompressionDecision::Skip;
    }
    let sample_len = (cfg.compression_sample_bytes as usize).min(sample.len());
    let sample = &sample[..sample_len];
    if sample.is_empty() {
        return CompressionDecision::Skip;
    }

    let compressed_len = match zstd::bulk::compress(sample, cfg.zstd_level) {
        Ok(c) => c.len(),
        Err(e) => {
            tracing::warn!("compression check failed, storing raw: {e}");
            return CompressionDecision::Skip;
        }
    };

    let savings_pct = 100.0 * (1.0 - compressed_len as f64 / sample.len() as f64);
    let decision = if savings_pct >= f64::from(cfg.min_compression_savings_pct) {
        CompressionDecision::Zstd {
            level: cfg.zstd_level,
        }
    } else {
        CompressionDecision::Skip
    };
    tracing::debug!(
        name,
        sample = sample.len(),
        compressed = compressed_len,
        savings_pct = %format!("{savings_pct:.1}"),
        ?decision,
        "compression check"
    );
    decision
}

pub fn compress(data: &[u8], level: i32) -> ZkdResult<Vec<u8>> {
    zstd::bulk::compress(data, level).map_err(|e| ZkdError::Other(anyhow::anyhow!("zstd compress: {e}")))
}

/// Decompress a chunk whose original size is recorded in its metadata.
///
/// The output buffer is sized from `original_size`, so it is capped at
/// [`MAX_CHUNK_BYTES`] before zstd sees it.
pub fn decompress(data: &[u8], original_size: u64) -> ZkdResult<Vec<u8>> {
    if original_size > MAX_CHUNK_BYTES {
        return Err(ZkdError::DecryptionFailed(format!(
            "decompressed size {original_size} exceeds the {MAX_CHUNK_BYTES}-byte chunk limit"
        )));
    }
    let out = zstd::bulk::decompress(data, original_size as usize)
        .map_err(|e| ZkdError::DecryptionFailed(format!("zstd decompress: {e}")))?;
    if out.len() as u64 != original_size {
        return Err(ZkdError::DecryptionFailed(format!(
            "decompressed {} bytes, metadata says {original_size}",
            out.len()
        )));
    }
    Ok(out)
}
