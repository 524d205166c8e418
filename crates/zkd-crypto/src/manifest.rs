//! Canonical object manifest and its dual (Ed25519 + ML-DSA-65) signature
//!
//! The canonical form is compact JSON with fields in declaration order and
//! `created_at` as integer seconds. Both ends of an upload session must
//! produce byte-identical output from the same fields, so nothing here may
//! depend on map ordering or float formatting.

use ed25519_dalek::{Signature, Signer, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zkd_core::types::b64;
use zkd_core::{ZkdError, ZkdResult};

use crate::keyring::{PublicKeys, UserKeypairs};
use crate::pq;

pub const MANIFEST_FORMAT_VERSION: u32 = 1;

/// Identifies the primitive suite: XChaCha20-Poly1305 / ML-KEM-768 / Ed25519+ML-DSA-65
pub const ALGORITHM_VERSION: u32 = 1;

/// Metadata bound by the manifest signature. Field order is the wire order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFields {
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    pub content_hash: Option<String>,
    /// Unix seconds, fixed at session initialization
    pub created_at: u64,
    pub format_version: u32,
    pub algorithm_version: u32,
}

impl ManifestFields {
    pub fn new(name: impl Into<String>, size: u64, mime_type: impl Into<String>, created_at: u64) -> Self {
        Self {
            name: name.into(),
            size,
            mime_type: mime_type.into(),
            content_hash: None,
            created_at,
            format_version: MANIFEST_FORMAT_VERSION,
            algorithm_version: ALGORITHM_VERSION,
        }
    }

    pub fn with_content_hash(mut self, hash: impl Into<String>) -> Self {
        self.content_hash = Some(hash.into());
        self
    }

    pub fn canonical_bytes(&self) -> ZkdResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// SHA-256 of the canonical bytes, hex encoded
    pub fn manifest_hash(&self) -> ZkdResult<String> {
        Ok(hex::encode(Sha256::digest(self.canonical_bytes()?)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestSignatures {
    #[serde(with = "b64")]
    pub classical: Vec<u8>,
    #[serde(with = "b64")]
    pub post_quantum: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedManifest {
    pub manifest_hash: String,
    pub signatures: ManifestSignatures,
}

pub struct ManifestSigner;

impl ManifestSigner {
    /// Hash the canonical manifest and sign the digest with both schemes.
    pub fn build_and_sign(fields: &ManifestFields, keypairs: &UserKeypairs) -> ZkdResult<SignedManifest> {
        let manifest_hash = fields.manifest_hash()?;
        let digest = decode_hash(&manifest_hash)?;

        let classical = keypairs.classical.sign(&digest).to_bytes().to_vec();
        let post_quantum = pq::sign(&keypairs.post_quantum.secret_key, &digest)?;

        tracing::debug!(%manifest_hash, "manifest signed");
        Ok(SignedManifest {
            manifest_hash,
            signatures: ManifestSignatures {
                classical,
                post_quantum,
            },
        })
    }

    /// True only if both signatures verify over `manifest_hash`.
    pub fn verify(manifest_hash: &str, signatures: &ManifestSignatures, public_keys: &PublicKeys) -> bool {
        let Ok(digest) = decode_hash(manifest_hash) else {
            return false;
        };
        verify_classical(&digest, &signatures.classical, &public_keys.classical)
            && pq::verify(&public_keys.post_quantum, &digest, &signatures.post_quantum)
    }

    /// Recompute the hash of `fields`, compare it to `signed`, then verify both signatures.
    pub fn verify_fields(
        fields: &ManifestFields,
        signed: &SignedManifest,
        public_keys: &PublicKeys,
    ) -> ZkdResult<()> {
        let actual = fields.manifest_hash()?;
        if actual != signed.manifest_hash {
            return Err(ZkdError::ManifestMismatch {
                expected: signed.manifest_hash.clone(),
                actual,
            });
        }
        if !Self::verify(&actual, &signed.signatures, public_keys) {
            return Err(ZkdError::SignatureInvalid(format!(
                "manifest {actual} is not signed by both keys"
            )));
        }
        Ok(())
    }
}

fn decode_hash(manifest_hash: &str) -> ZkdResult<Vec<u8>> {
    let digest = hex::decode(manifest_hash)
        .map_err(|e| ZkdError::SignatureInvalid(format!("manifest hash is not hex: {e}")))?;
    if digest.len() != 32 {
        return Err(ZkdError::SignatureInvalid(format!(
            "manifest hash is {} bytes",
            digest.len()
        )));
    }
    Ok(digest)
}

fn verify_classical(message: &[u8], signature: &[u8], public_key: &[u8]) -> bool {
    let Ok(pk_bytes) = <[u8; 32]>::try_from(public_key) else {
        return false;
    };
    let Ok(vk) = VerifyingKey::from_bytes(&pk_bytes) else {
        return false;
    };
    let Ok(sig) = Signature::from_slice(signature) else {
        return false;
    };
    vk.verify(message, &sig).is_ok()
}
