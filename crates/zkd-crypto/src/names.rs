//! AES-SIV object-name encryption
//!
//! Names are encrypted deterministically under a key derived from the
//! object CEK, so the backend only ever sees an opaque hex label while
//! equal names under the same CEK map to the same label.

use aes_siv::{
    aead::{Aead, KeyInit},
    Aes256SivAead, Nonce,
};
use zkd_core::{ZkdError, ZkdResult};

use crate::keys::{derive_name_key, Cek};

fn siv_cipher(cek: &Cek) -> ZkdResult<Aes256SivAead> {
    // AES-256-SIV takes a 64-byte key
    let name_key = derive_name_key(cek)?;
    let mut double_key = [0u8; 64];
    hkdf::Hkdf::<sha2::Sha256>::new(None, &name_key)
        .expand(b"zkd-name-aes-siv", &mut double_key)
        .map_err(|e| ZkdError::Crypto(format!("HKDF expand for AES-SIV: {e}")))?;
    Ok(Aes256SivAead::new((&double_key).into()))
}

/// Encrypt an object name; returns hex ciphertext.
pub fn encrypt_name(cek: &Cek, plaintext_name: &str) -> ZkdResult<String> {
    let cipher = siv_cipher(cek)?;
    let ciphertext = cipher
        .encrypt(&Nonce::default(), plaintext_name.as_bytes())
        .map_err(|e| ZkdError::Crypto(format!("name encryption failed: {e}")))?;
    Ok(hex::encode(ciphertext))
}

/// Decrypt a hex name produced by [`encrypt_name`].
pub fn decrypt_name(cek: &Cek, encrypted_hex: &str) -> ZkdResult<String> {
    let ciphertext = hex::decode(encrypted_hex)
        .map_err(|e| ZkdError::DecryptionFailed(format!("encrypted name is not hex: {e}")))?;
    let cipher = siv_cipher(cek)?;
    let plaintext = cipher
        .decrypt(&Nonce::default(), ciphertext.as_ref())
        .map_err(|_| ZkdError::DecryptionFailed("name: wrong key or corrupted data".into()))?;
    String::from_utf8(plaintext)
        .map_err(|e| ZkdError::DecryptionFailed(format!("decrypted name is not UTF-8: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::generate_cek;

    #[test]
    fn test_roundtrip() {
        let cek = generate_cek();
        let enc = encrypt_name(&cek, "my-photo.jpg").unwrap();
        assert_eq!(decrypt_name(&cek, &enc).unwrap(), "my-photo.jpg");
    }

    #[test]
    fn test_deterministic() {
        let cek = generate_cek();
        assert_eq!(
            encrypt_name(&cek, "report.pdf").unwrap(),
            encrypt_name(&cek, "report.pdf").unwrap()
        );
    }

    #[test]
    fn test_different_ceks_differ() {
        let a = encrypt_name(&generate_cek(), "same.txt").unwrap();
        let b = encrypt_name(&generate_cek(), "same.txt").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_cek_fails() {
        let enc = encrypt_name(&generate_cek(), "secret.txt").unwrap();
        assert!(matches!(
            decrypt_name(&generate_cek(), &enc),
            Err(ZkdError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn test_not_hex() {
        assert!(decrypt_name(&generate_cek(), "zz-not-hex").is_err());
    }

    #[test]
    fn test_unicode_name() {
        let cek = generate_cek();
        let name = "résumé 2026 — 日本語.pdf";
        let enc = encrypt_name(&cek, name).unwrap();
        assert_eq!(decrypt_name(&cek, &enc).unwrap(), name);
    }
}
