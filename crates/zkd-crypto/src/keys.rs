//! Content encryption keys and their KEM-based wrapping envelope

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroize;
use zkd_core::types::b64;
use zkd_core::{ZkdError, ZkdResult};

use crate::pq;
use crate::{KEY_SIZE, NONCE_SIZE};

const WRAP_INFO: &[u8] = b"zkd-cek-wrap-v1";

/// A per-object 256-bit content encryption key. Zeroized on drop.
#[derive(Clone)]
pub struct Cek {
    bytes: [u8; KEY_SIZE],
}

impl Cek {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for Cek {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for Cek {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cek").field("bytes", &"[REDACTED]").finish()
    }
}

/// Generate a random 256-bit CEK.
pub fn generate_cek() -> Cek {
    let mut bytes = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut bytes);
    Cek::from_bytes(bytes)
}

/// A CEK encrypted for one recipient's KEM public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyWrapEnvelope {
    #[serde(with = "b64")]
    pub kem_ciphertext: Vec<u8>,
    /// CEK ciphertext + Poly1305 tag
    #[serde(with = "b64")]
    pub wrapped_cek: Vec<u8>,
    #[serde(with = "b64")]
    pub wrap_nonce: Vec<u8>,
    #[serde(with = "b64")]
    pub kem_public_key: Vec<u8>,
}

/// Wrap `cek` for the holder of `recipient_kem_public_key`.
///
/// ML-KEM encapsulation yields a shared secret, expanded with HKDF-SHA256
/// into a wrap key; the CEK is sealed with XChaCha20-Poly1305 under a fresh
/// nonce, with the KEM ciphertext as associated data.
pub fn wrap_cek(cek: &Cek, recipient_kem_public_key: &[u8]) -> ZkdResult<KeyWrapEnvelope> {
    let (kem_ciphertext, shared_secret) = pq::kem_encapsulate(recipient_kem_public_key)?;
    let mut wrap_key = derive_wrap_key(&shared_secret, &kem_ciphertext)?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);

    let cipher = XChaCha20Poly1305::new((&wrap_key).into());
    wrap_key.zeroize();
    let wrapped_cek = cipher
        .encrypt(
            XNonce::from_slice(&nonce_bytes),
            Payload {
                msg: cek.as_bytes(),
                aad: &kem_ciphertext,
            },
        )
        .map_err(|e| ZkdError::Crypto(format!("CEK wrapping failed: {e}")))?;

    Ok(KeyWrapEnvelope {
        kem_ciphertext,
        wrapped_cek,
        wrap_nonce: nonce_bytes.to_vec(),
        kem_public_key: recipient_kem_public_key.to_vec(),
    })
}

/// Recover the CEK from `envelope` with the recipient's KEM secret key.
///
/// Any missing field or tag mismatch is `UnwrapFailed`.
pub fn unwrap_cek(envelope: &KeyWrapEnvelope, kem_secret_key: &[u8]) -> ZkdResult<Cek> {
    if envelope.kem_ciphertext.is_empty()
        || envelope.wrapped_cek.is_empty()
        || envelope.wrap_nonce.len() != NONCE_SIZE
    {
        return Err(ZkdError::UnwrapFailed);
    }

    let shared_secret = pq::kem_decapsulate(kem_secret_key, &envelope.kem_ciphertext)?;
    let mut wrap_key = derive_wrap_key(&shared_secret, &envelope.kem_ciphertext)?;

    let cipher = XChaCha20Poly1305::new((&wrap_key).into());
    wrap_key.zeroize();
    let mut plaintext = cipher
        .decrypt(
            XNonce::from_slice(&envelope.wrap_nonce),
            Payload {
                msg: &envelope.wrapped_cek,
                aad: &envelope.kem_ciphertext,
            },
        )
        .map_err(|_| ZkdError::UnwrapFailed)?;

    if plaintext.len() != KEY_SIZE {
        plaintext.zeroize();
        return Err(ZkdError::UnwrapFailed);
    }

    let mut key_bytes = [0u8; KEY_SIZE];
    key_bytes.copy_from_slice(&plaintext);
    plaintext.zeroize();
    Ok(Cek::from_bytes(key_bytes))
}

/// Derive the object-name key from a CEK via HKDF-SHA256.
pub fn derive_name_key(cek: &Cek) -> ZkdResult<[u8; KEY_SIZE]> {
    hkdf_derive(cek.as_bytes(), None, b"zkd-names")
}

fn derive_wrap_key(shared_secret: &[u8], kem_ciphertext: &[u8]) -> ZkdResult<[u8; KEY_SIZE]> {
    hkdf_derive(shared_secret, Some(kem_ciphertext), WRAP_INFO)
}

/// HKDF-SHA256 key derivation with a domain-specific info string.
pub(crate) fn hkdf_derive(ikm: &[u8], salt: Option<&[u8]>, info: &[u8]) -> ZkdResult<[u8; KEY_SIZE]> {
    let hkdf = Hkdf::<Sha256>::new(salt, ikm);
    let mut okm = [0u8; KEY_SIZE];
    hkdf.expand(info, &mut okm)
        .map_err(|e| ZkdError::Crypto(format!("HKDF expand failed: {e}")))?;
    Ok(okm)
}

/// Seal `plaintext` under a raw 256-bit key.
///
/// Output: `[24-byte nonce][ciphertext + 16-byte tag]`
pub(crate) fn seal(key: &[u8; KEY_SIZE], plaintext: &[u8]) -> ZkdResult<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(key.into());

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);

    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|e| ZkdError::Crypto(format!("sealing failed: {e}")))?;

    let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

/// Inverse of [`seal`]; a wrong key or corrupted input is `UnwrapFailed`.
pub(crate) fn open(key: &[u8; KEY_SIZE], sealed: &[u8]) -> ZkdResult<Vec<u8>> {
    if sealed.len() < NONCE_SIZE + crate::TAG_SIZE {
        return Err(ZkdError::UnwrapFailed);
    }
    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_SIZE);
    let cipher = XChaCha20Poly1305::new(key.into());
    cipher
        .decrypt(XNonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| ZkdError::UnwrapFailed)
}
