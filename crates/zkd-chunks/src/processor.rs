use std::sync::Arc;

use zkd_core::types::{ChunkInfo, CompressionAlgorithm, CompressionMeta, MAX_CHUNK_BYTES};
use zkd_core::{ZkdError, ZkdResult};
use zkd_crypto::{decrypt_chunk, encrypt_chunk, Cek};

use crate::compress::{self, CompressionDecision};
use crate::hash::{content_digest, integrity_digest};

/// One chunk ready for upload
#[derive(Debug, Clone)]
pub struct ProcessedChunk {
    pub info: ChunkInfo,
    pub ciphertext: Vec<u8>,
    /// SHA-256 (base64) of the ciphertext for storage-level checksum headers
    pub content_digest: String,
}

/// Per-object chunk transform: compress → encrypt → hash, and back.
///
/// Holds the object's CEK and its compression decision; shared between
/// worker threads behind an `Arc`.
pub struct ChunkProcessor {
    object_id: String,
    cek: Arc<Cek>,
    compression: CompressionDecision,
}

impl std::fmt::Debug for ChunkProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkProcessor")
            .field("object_id", &self.object_id)
            .field("compression", &self.compression)
            .finish_non_exhaustive()
    }
}

impl ChunkProcessor {
    pub fn new(object_id: impl Into<String>, cek: Arc<Cek>, compression: CompressionDecision) -> Self {
        Self {
            object_id: object_id.into(),
            cek,
            compression,
        }
    }

    pub fn object_id(&self) -> &str {
        &self.object_id
    }

    pub fn compression(&self) -> CompressionDecision {
        self.compression
    }

    /// Transform one plaintext chunk into its stored form.
    ///
    /// A chunk that does not shrink under compression is stored raw.
    /// Cipher failures propagate; the caller owns retries.
    pub fn process(&self, index: u64, plaintext: &[u8]) -> ZkdResult<ProcessedChunk> {
        let plaintext_size = plaintext.len() as u64;

        let compressed = match self.compression {
            CompressionDecision::Zstd { level } if !plaintext.is_empty() => {
                let c = compress::compress(plaintext, level)?;
                (c.len() < plaintext.len()).then_some(c)
            }
            _ => None,
        };

        let (payload, compression) = match compressed.as_deref() {
            Some(c) => (
                c,
                Some(CompressionMeta {
                    algorithm: CompressionAlgorithm::Zstd,
                    original_size: plaintext_size,
                    compressed_size: c.len() as u64,
                }),
            ),
            None => (plaintext, None),
        };

        let original_size = compression.as_ref().map(|m| m.original_size);
        let sealed = encrypt_chunk(&self.cek, index, &self.object_id, original_size, payload)?;
        let info = ChunkInfo {
            index,
            plaintext_size,
            encrypted_size: sealed.ciphertext.len() as u64,
            nonce: sealed.nonce.to_vec(),
            integrity_digest: integrity_digest(&sealed.ciphertext),
            compression,
        };

        tracing::trace!(
            object_id = %self.object_id,
            index,
            plaintext_size,
            encrypted_size = info.encrypted_size,
            compressed = info.is_compressed(),
            "chunk processed"
        );

        Ok(ProcessedChunk {
            content_digest: content_digest(&sealed.ciphertext),
            ciphertext: sealed.ciphertext,
            info,
        })
    }

    /// Verify, decrypt and decompress a fetched chunk.
    ///
    /// Descriptor sizes come from the server: they are bounded before any
    /// allocation, and a compressed chunk's original size is authenticated
    /// through the AEAD.
    pub fn restore(&self, info: &ChunkInfo, ciphertext: &[u8]) -> ZkdResult<Vec<u8>> {
        if info.plaintext_size > MAX_CHUNK_BYTES {
            return Err(ZkdError::DecryptionFailed(format!(
                "chunk {}: declared size {} exceeds the {MAX_CHUNK_BYTES}-byte limit",
                info.index, info.plaintext_size
            )));
        }
        if !info.integrity_digest.is_empty() {
            let actual = integrity_digest(ciphertext);
            if actual != info.integrity_digest {
                return Err(ZkdError::DecryptionFailed(format!(
                    "chunk {}: integrity digest mismatch",
                    info.index
                )));
            }
        }

        let original_size = match &info.compression {
            Some(meta) if meta.algorithm == CompressionAlgorithm::Zstd => {
                if meta.original_size != info.plaintext_size {
                    return Err(ZkdError::DecryptionFailed(format!(
                        "chunk {}: compressed length {} disagrees with plaintext size {}",
                        info.index, meta.original_size, info.plaintext_size
                    )));
                }
                Some(meta.original_size)
            }
            _ => None,
        };

        let payload = decrypt_chunk(
            &self.cek,
            info.index,
            &self.object_id,
            original_size,
            &info.nonce,
            ciphertext,
        )?;

        let plain = match original_size {
            Some(size) => compress::decompress(&payload, size)?,
            None => payload,
        };
        if plain.len() as u64 != info.plaintext_size {
            return Err(ZkdError::DecryptionFailed(format!(
                "chunk {}: {} bytes, descriptor says {}",
                info.index,
                plain.len(),
                info.plaintext_size
            )));
        }
        Ok(plain)
    }
}
