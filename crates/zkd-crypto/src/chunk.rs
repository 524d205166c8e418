//! Per-chunk XChaCha20-Poly1305 encryption/decryption
//!
//! Stored chunk format:
//! ```text
//! [N bytes: ciphertext][16 bytes: Poly1305 tag]
//! nonce (24 bytes) travels in the chunk descriptor
//! AAD = chunk_index (8 bytes, big-endian) || object_id (UTF-8)
//!       [|| 0x01 || original_size (8 bytes, big-endian)]   zstd payloads only
//! ```
//!
//! The AAD binds each chunk to its position and object, so a chunk replayed
//! at another index or spliced from another object fails authentication.
//! A compressed payload also binds its decompressed length, so the size in
//! the (server-held) descriptor cannot be rewritten.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use zkd_core::{ZkdError, ZkdResult};

use crate::keys::Cek;
use crate::{NONCE_SIZE, TAG_SIZE};

/// Output of [`encrypt_chunk`]
#[derive(Debug, Clone)]
pub struct SealedChunk {
    pub nonce: [u8; NONCE_SIZE],
    /// Ciphertext including the trailing tag
    pub ciphertext: Vec<u8>,
}

/// Encrypt a single chunk under the object CEK with a fresh random nonce.
///
/// `original_size` is `Some(n)` when `plaintext` is a zstd frame that
/// decompresses to `n` bytes.
pub fn encrypt_chunk(
    cek: &Cek,
    chunk_index: u64,
    object_id: &str,
    original_size: Option<u64>,
    plaintext: &[u8],
) -> ZkdResult<SealedChunk> {
    let cipher = XChaCha20Poly1305::new(cek.as_bytes().into());

    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);

    let aad = build_aad(chunk_index, object_id, original_size);
    let ciphertext = cipher
        .encrypt(
            XNonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: &aad,
            },
        )
        .map_err(|e| ZkdError::Crypto(format!("chunk encryption failed: {e}")))?;

    Ok(SealedChunk { nonce, ciphertext })
}

/// Decrypt a single chunk. Any authentication failure is `DecryptionFailed`.
pub fn decrypt_chunk(
    cek: &Cek,
    chunk_index: u64,
    object_id: &str,
    original_size: Option<u64>,
    nonce: &[u8],
    ciphertext: &[u8],
) -> ZkdResult<Vec<u8>> {
    if nonce.len() != NONCE_SIZE {
        return Err(ZkdError::DecryptionFailed(format!(
            "chunk {chunk_index}: nonce is {} bytes, expected {NONCE_SIZE}",
            nonce.len()
        )));
    }
    if ciphertext.len() < TAG_SIZE {
        return Err(ZkdError::DecryptionFailed(format!(
            "chunk {chunk_index}: {} bytes is shorter than the tag",
            ciphertext.len()
        )));
    }

    let cipher = XChaCha20Poly1305::new(cek.as_bytes().into());
    let aad = build_aad(chunk_index, object_id, original_size);

    cipher
        .decrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: &aad,
            },
        )
        .map_err(|_| {
            ZkdError::DecryptionFailed(format!(
                "chunk {chunk_index} of {object_id}: authentication tag mismatch"
            ))
        })
}

fn build_aad(chunk_index: u64, object_id: &str, original_size: Option<u64>) -> Vec<u8> {
    let mut aad = Vec::with_capacity(8 + object_id.len() + 9);
    aad.extend_from_slice(&chunk_index.to_be_bytes());
    aad.extend_from_slice(object_id.as_bytes());
    if let Some(size) = original_size {
        aad.push(0x01);
        aad.extend_from_slice(&size.to_be_bytes());
    }
    aad
}
