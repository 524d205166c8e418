//! Post-quantum primitives via liboqs: ML-KEM-768 and ML-DSA-65

use oqs::{kem, sig};
use zeroize::Zeroizing;
use zkd_core::{ZkdError, ZkdResult};

/// KEM used to wrap content keys
pub const KEM_ALGORITHM: kem::Algorithm = kem::Algorithm::MlKem768;

/// Post-quantum half of the manifest dual signature
pub const SIG_ALGORITHM: sig::Algorithm = sig::Algorithm::MlDsa65;

fn oqs_err(context: &str, e: oqs::Error) -> ZkdError {
    ZkdError::Crypto(format!("{context}: {e}"))
}

fn kem_instance() -> ZkdResult<kem::Kem> {
    oqs::init();
    kem::Kem::new(KEM_ALGORITHM).map_err(|e| oqs_err("ML-KEM unavailable", e))
}

fn sig_instance() -> ZkdResult<sig::Sig> {
    oqs::init();
    sig::Sig::new(SIG_ALGORITHM).map_err(|e| oqs_err("ML-DSA unavailable", e))
}

/// Raw PQ keypair bytes. The secret half is zeroized on drop.
#[derive(Clone)]
pub struct PqKeypair {
    pub public_key: Vec<u8>,
    pub secret_key: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for PqKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PqKeypair")
            .field("public_key_len", &self.public_key.len())
            .field("secret_key", &"[REDACTED]")
            .finish()
    }
}

/// Generate an ML-KEM-768 keypair.
pub fn kem_keygen() -> ZkdResult<PqKeypair> {
    let kem = kem_instance()?;
    let (pk, sk) = kem.keypair().map_err(|e| oqs_err("ML-KEM keygen", e))?;
    Ok(PqKeypair {
        public_key: pk.into_vec(),
        secret_key: Zeroizing::new(sk.into_vec()),
    })
}

/// Encapsulate against `public_key`, returning `(kem_ciphertext, shared_secret)`.
pub fn kem_encapsulate(public_key: &[u8]) -> ZkdResult<(Vec<u8>, Zeroizing<Vec<u8>>)> {
    let kem = kem_instance()?;
    let pk = kem
        .public_key_from_bytes(public_key)
        .ok_or_else(|| ZkdError::Crypto(format!("invalid ML-KEM public key ({} bytes)", public_key.len())))?;
    let (ct, ss) = kem
        .encapsulate(pk)
        .map_err(|e| oqs_err("ML-KEM encapsulate", e))?;
    Ok((ct.into_vec(), Zeroizing::new(ss.into_vec())))
}

/// Decapsulate `ciphertext` with `secret_key`.
///
/// A malformed secret key or ciphertext is an unwrap failure, never a warning.
pub fn kem_decapsulate(secret_key: &[u8], ciphertext: &[u8]) -> ZkdResult<Zeroizing<Vec<u8>>> {
    let kem = kem_instance()?;
    let sk = kem
        .secret_key_from_bytes(secret_key)
        .ok_or(ZkdError::UnwrapFailed)?;
    let ct = kem
        .ciphertext_from_bytes(ciphertext)
        .ok_or(ZkdError::UnwrapFailed)?;
    let ss = kem.decapsulate(sk, ct).map_err(|_| ZkdError::UnwrapFailed)?;
    Ok(Zeroizing::new(ss.into_vec()))
}

/// Generate an ML-DSA-65 signing keypair.
pub fn sig_keygen() -> ZkdResult<PqKeypair> {
    let sig = sig_instance()?;
    let (pk, sk) = sig.keypair().map_err(|e| oqs_err("ML-DSA keygen", e))?;
    Ok(PqKeypair {
        public_key: pk.into_vec(),
        secret_key: Zeroizing::new(sk.into_vec()),
    })
}

/// Sign `message` with an ML-DSA-65 secret key.
pub fn sign(secret_key: &[u8], message: &[u8]) -> ZkdResult<Vec<u8>> {
    let sig = sig_instance()?;
    let sk = sig
        .secret_key_from_bytes(secret_key)
        .ok_or_else(|| ZkdError::Crypto("invalid ML-DSA secret key".into()))?;
    let signature = sig
        .sign(message, sk)
        .map_err(|e| oqs_err("ML-DSA sign", e))?;
    Ok(signature.into_vec())
}

/// Verify an ML-DSA-65 signature. Malformed inputs verify as `false`.
pub fn verify(public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
    let Ok(sig) = sig_instance() else {
        return false;
    };
    let (Some(pk), Some(s)) = (
        sig.public_key_from_bytes(public_key),
        sig.signature_from_bytes(signature),
    ) else {
        return false;
    };
    sig.verify(message, s, pk).is_ok()
}
