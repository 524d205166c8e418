//! zkd-crypto: client-side E2E encryption for zkd
//!
//! Pipeline: plaintext chunk → (zstd) → XChaCha20-Poly1305 under the object CEK → upload
//!
//! Key hierarchy:
//! ```text
//! Master Key (256-bit, Argon2id from passphrase)
//!   └── Keyring (sealed at rest): Ed25519 + ML-DSA-65 signing keys, ML-KEM-768 keypair
//!         └── CEK (per object, 256-bit random)
//!               ├── wrapped via ML-KEM-768 encapsulation → HKDF-SHA256 → XChaCha20-Poly1305
//!               ├── Chunk AEAD: XChaCha20-Poly1305 (nonce=random 192-bit, AAD=index||object_id)
//!               └── Name key (HKDF from CEK, domain="zkd-names", AES-SIV)
//! ```
//!
//! Object metadata is bound to its signer by a canonical manifest whose
//! SHA-256 is signed with both Ed25519 and ML-DSA-65.

pub mod chunk;
pub mod kdf;
pub mod keyring;
pub mod keys;
pub mod manager;
pub mod manifest;
pub mod names;
pub mod pq;

pub use chunk::{decrypt_chunk, encrypt_chunk, SealedChunk};
pub use kdf::{derive_master_key, KdfParams, MasterKey};
pub use keyring::{EncryptedKeyring, PublicKeys, UserKeypairs};
pub use keys::{generate_cek, unwrap_cek, wrap_cek, Cek, KeyWrapEnvelope};
pub use manager::KeyManager;
pub use manifest::{ManifestFields, ManifestSignatures, ManifestSigner, SignedManifest};
pub use names::{decrypt_name, encrypt_name};

/// Size of a symmetric key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of an XChaCha20-Poly1305 nonce (192-bit)
pub const NONCE_SIZE: usize = 24;

/// Size of a Poly1305 authentication tag
pub const TAG_SIZE: usize = 16;

/// Fixed ciphertext expansion of the chunk AEAD (nonce travels separately)
pub const AEAD_OVERHEAD: u64 = TAG_SIZE as u64;
