//! User keypairs and their passphrase-sealed at-rest form
//!
//! The keyring holds three keypairs: Ed25519 and ML-DSA-65 for the manifest
//! dual signature, ML-KEM-768 for CEK wrapping. At rest the secret halves
//! are serialised and sealed under the Argon2id master key; the public
//! halves stay readable so others can wrap keys for this user.

use std::path::Path;

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;
use zkd_core::types::b64;
use zkd_core::{ZkdError, ZkdResult};

use crate::kdf::{derive_master_key, generate_salt, KdfParams, MasterKey, SALT_SIZE};
use crate::keys::{open, seal};
use crate::pq::{self, PqKeypair};

const KEYRING_VERSION: u32 = 1;

/// Decrypted signing and KEM keypairs, held only in memory.
pub struct UserKeypairs {
    pub classical: SigningKey,
    pub post_quantum: PqKeypair,
    pub kem: PqKeypair,
}

impl std::fmt::Debug for UserKeypairs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserKeypairs")
            .field("classical", &"[REDACTED]")
            .field("post_quantum", &self.post_quantum)
            .field("kem", &self.kem)
            .finish()
    }
}

/// Public halves of a user's keypairs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeys {
    /// Ed25519 verifying key
    #[serde(with = "b64")]
    pub classical: Vec<u8>,
    /// ML-DSA-65 public key
    #[serde(with = "b64")]
    pub post_quantum: Vec<u8>,
    /// ML-KEM-768 public key
    #[serde(with = "b64")]
    pub kem: Vec<u8>,
}

impl UserKeypairs {
    pub fn generate() -> ZkdResult<Self> {
        Ok(Self {
            classical: SigningKey::generate(&mut OsRng),
            post_quantum: pq::sig_keygen()?,
            kem: pq::kem_keygen()?,
        })
    }

    pub fn public_keys(&self) -> PublicKeys {
        PublicKeys {
            classical: self.classical.verifying_key().to_bytes().to_vec(),
            post_quantum: self.post_quantum.public_key.clone(),
            kem: self.kem.public_key.clone(),
        }
    }
}

/// Serialised secret material; only ever lives inside a `Zeroizing` buffer.
#[derive(Serialize, Deserialize)]
struct SecretBundle {
    #[serde(with = "b64")]
    classical: Vec<u8>,
    #[serde(with = "b64")]
    pq_public: Vec<u8>,
    #[serde(with = "b64")]
    pq_secret: Vec<u8>,
    #[serde(with = "b64")]
    kem_public: Vec<u8>,
    #[serde(with = "b64")]
    kem_secret: Vec<u8>,
}

impl Drop for SecretBundle {
    fn drop(&mut self) {
        use zeroize::Zeroize;
        self.classical.zeroize();
        self.pq_secret.zeroize();
        self.kem_secret.zeroize();
    }
}

/// The at-rest keyring file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedKeyring {
    pub version: u32,
    #[serde(with = "b64")]
    pub salt: Vec<u8>,
    pub kdf: KdfParams,
    pub public_keys: PublicKeys,
    /// `[nonce][ciphertext+tag]` of the JSON secret bundle
    #[serde(with = "b64")]
    pub sealed: Vec<u8>,
}

impl EncryptedKeyring {
    /// Generate fresh keypairs and seal them under `passphrase`.
    ///
    /// Returns the keyring together with the derived master key so the
    /// caller can unlock a session without paying for Argon2id twice.
    pub fn create(
        passphrase: &SecretString,
        params: &KdfParams,
    ) -> ZkdResult<(Self, MasterKey, UserKeypairs)> {
        let keypairs = UserKeypairs::generate()?;
        let salt = generate_salt();
        let master = derive_master_key(passphrase, &salt, params)?;
        let keyring = Self::seal(&keypairs, &master, &salt, params)?;
        Ok((keyring, master, keypairs))
    }

    pub fn seal(
        keypairs: &UserKeypairs,
        master: &MasterKey,
        salt: &[u8; SALT_SIZE],
        params: &KdfParams,
    ) -> ZkdResult<Self> {
        let bundle = SecretBundle {
            classical: keypairs.classical.to_bytes().to_vec(),
            pq_public: keypairs.post_quantum.public_key.clone(),
            pq_secret: keypairs.post_quantum.secret_key.to_vec(),
            kem_public: keypairs.kem.public_key.clone(),
            kem_secret: keypairs.kem.secret_key.to_vec(),
        };
        let plaintext = Zeroizing::new(serde_json::to_vec(&bundle)?);
        let sealed = seal(master.as_bytes(), &plaintext)?;

        Ok(Self {
            version: KEYRING_VERSION,
            salt: salt.to_vec(),
            kdf: params.clone(),
            public_keys: keypairs.public_keys(),
            sealed,
        })
    }

    /// Re-derive the master key for this keyring from a passphrase.
    pub fn derive_key(&self, passphrase: &SecretString) -> ZkdResult<MasterKey> {
        let salt: [u8; SALT_SIZE] = self
            .salt
            .as_slice()
            .try_into()
            .map_err(|_| ZkdError::Crypto(format!("keyring salt is {} bytes", self.salt.len())))?;
        derive_master_key(passphrase, &salt, &self.kdf)
    }

    /// Decrypt the keypairs. A wrong master key is `UnwrapFailed`.
    pub fn open(&self, master: &MasterKey) -> ZkdResult<UserKeypairs> {
        if self.version != KEYRING_VERSION {
            return Err(ZkdError::Crypto(format!(
                "unsupported keyring version {}",
                self.version
            )));
        }
        let plaintext = Zeroizing::new(open(master.as_bytes(), &self.sealed)?);
        let bundle: SecretBundle = serde_json::from_slice(&plaintext)?;

        let classical_bytes: [u8; 32] = bundle
            .classical
            .as_slice()
            .try_into()
            .map_err(|_| ZkdError::Crypto("keyring: malformed Ed25519 key".into()))?;
        let classical = SigningKey::from_bytes(&classical_bytes);

        if classical.verifying_key().to_bytes().as_slice() != self.public_keys.classical.as_slice() {
            return Err(ZkdError::Crypto(
                "keyring: sealed keys do not match the published public keys".into(),
            ));
        }

        Ok(UserKeypairs {
            classical,
            post_quantum: PqKeypair {
                public_key: bundle.pq_public.clone(),
                secret_key: Zeroizing::new(bundle.pq_secret.clone()),
            },
            kem: PqKeypair {
                public_key: bundle.kem_public.clone(),
                secret_key: Zeroizing::new(bundle.kem_secret.clone()),
            },
        })
    }

    pub fn load(path: &Path) -> ZkdResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Write atomically (temp file + rename).
    pub fn save(&self, path: &Path) -> ZkdResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        tracing::debug!(path = %path.display(), "keyring saved");
        Ok(())
    }
}
