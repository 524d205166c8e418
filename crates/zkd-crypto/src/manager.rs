use std::sync::{Arc, RwLock};

use zkd_core::{ZkdError, ZkdResult};

use crate::kdf::MasterKey;
use crate::keyring::{EncryptedKeyring, PublicKeys, UserKeypairs};
use crate::keys::{self, Cek, KeyWrapEnvelope};

/// Session-scoped owner of key material.
///
/// Created once per application context and passed by reference to the
/// upload and download paths. `clear()` drops every cached secret.
#[derive(Default)]
pub struct KeyManager {
    master: RwLock<Option<MasterKey>>,
    keyring: RwLock<Option<EncryptedKeyring>>,
    keypairs: RwLock<Option<Arc<UserKeypairs>>>,
}

impl std::fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyManager")
            .field("unlocked", &self.is_unlocked())
            .finish()
    }
}

impl KeyManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache the session master key and the sealed keyring it opens.
    pub fn unlock(&self, master: MasterKey, keyring: EncryptedKeyring) {
        if let Ok(mut slot) = self.keypairs.write() {
            *slot = None;
        }
        if let Ok(mut slot) = self.keyring.write() {
            *slot = Some(keyring);
        }
        if let Ok(mut slot) = self.master.write() {
            *slot = Some(master);
        }
        tracing::debug!("key manager unlocked");
    }

    pub fn is_unlocked(&self) -> bool {
        self.master.read().map(|m| m.is_some()).unwrap_or(false)
    }

    /// Decrypt the user's keypairs on first use, then serve them from cache.
    pub fn get_or_decrypt_user_keypairs(&self) -> ZkdResult<Arc<UserKeypairs>> {
        if let Some(cached) = self.keypairs.read().ok().and_then(|k| k.clone()) {
            return Ok(cached);
        }

        let mut slot = self
            .keypairs
            .write()
            .map_err(|_| ZkdError::Crypto("key cache lock poisoned".into()))?;
        if let Some(cached) = slot.as_ref() {
            return Ok(cached.clone());
        }

        let master = self.master.read().map_err(|_| ZkdError::KeyUnavailable)?;
        let master = master.as_ref().ok_or(ZkdError::KeyUnavailable)?;
        let keyring = self.keyring.read().map_err(|_| ZkdError::KeyUnavailable)?;
        let keyring = keyring.as_ref().ok_or(ZkdError::KeyUnavailable)?;

        let keypairs = Arc::new(keyring.open(master)?);
        *slot = Some(keypairs.clone());
        tracing::debug!("user keypairs decrypted and cached");
        Ok(keypairs)
    }

    /// Public keys of the unlocked user, readable without decrypting.
    pub fn public_keys(&self) -> ZkdResult<PublicKeys> {
        let keyring = self.keyring.read().map_err(|_| ZkdError::KeyUnavailable)?;
        keyring
            .as_ref()
            .map(|k| k.public_keys.clone())
            .ok_or(ZkdError::KeyUnavailable)
    }

    pub fn generate_cek(&self) -> Cek {
        keys::generate_cek()
    }

    pub fn wrap_cek(&self, cek: &Cek, recipient_kem_public_key: &[u8]) -> ZkdResult<KeyWrapEnvelope> {
        keys::wrap_cek(cek, recipient_kem_public_key)
    }

    pub fn unwrap_cek(&self, envelope: &KeyWrapEnvelope, kem_secret_key: &[u8]) -> ZkdResult<Cek> {
        keys::unwrap_cek(envelope, kem_secret_key)
    }

    /// Wrap for the session user's own KEM key.
    pub fn wrap_cek_for_self(&self, cek: &Cek) -> ZkdResult<KeyWrapEnvelope> {
        let keypairs = self.get_or_decrypt_user_keypairs()?;
        keys::wrap_cek(cek, &keypairs.kem.public_key)
    }

    /// Unwrap with the session user's own KEM secret key.
    pub fn unwrap_cek_for_self(&self, envelope: &KeyWrapEnvelope) -> ZkdResult<Cek> {
        let keypairs = self.get_or_decrypt_user_keypairs()?;
        keys::unwrap_cek(envelope, &keypairs.kem.secret_key)
    }

    /// Discard all cached key material (logout).
    ///
    /// Secrets zeroize on drop; keypairs still borrowed by an in-flight
    /// operation are released when that operation finishes.
    pub fn clear(&self) {
        if let Ok(mut slot) = self.keypairs.write() {
            *slot = None;
        }
        if let Ok(mut slot) = self.keyring.write() {
            *slot = None;
        }
        if let Ok(mut slot) = self.master.write() {
            *slot = None;
        }
        tracing::info!("key material cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kdf::fast_params;
    use secrecy::SecretString;

    fn unlocked() -> KeyManager {
        let (keyring, master, _) =
            EncryptedKeyring::create(&SecretString::from("pw"), &fast_params()).unwrap();
        let km = KeyManager::new();
        km.unlock(master, keyring);
        km
    }

    #[test]
    fn test_locked_manager_has_no_keys() {
        let km = KeyManager::new();
        assert!(!km.is_unlocked());
        assert!(matches!(
            km.get_or_decrypt_user_keypairs(),
            Err(ZkdError::KeyUnavailable)
        ));
    }

    #[test]
    fn test_keypairs_are_cached() {
        let km = unlocked();
        let a = km.get_or_decrypt_user_keypairs().unwrap();
        let b = km.get_or_decrypt_user_keypairs().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_self_wrap_roundtrip() {
        let km = unlocked();
        let cek = km.generate_cek();
        let env = km.wrap_cek_for_self(&cek).unwrap();
        let back = km.unwrap_cek_for_self(&env).unwrap();
        assert_eq!(cek.as_bytes(), back.as_bytes());
    }

    #[test]
    fn test_fresh_cek_per_call() {
        let km = KeyManager::new();
        assert_ne!(km.generate_cek().as_bytes(), km.generate_cek().as_bytes());
    }

    #[test]
    fn test_clear_forgets_keys() {
        let km = unlocked();
        km.get_or_decrypt_user_keypairs().unwrap();
        km.clear();
        assert!(!km.is_unlocked());
        assert!(matches!(
            km.get_or_decrypt_user_keypairs(),
            Err(ZkdError::KeyUnavailable)
        ));
        assert!(matches!(km.public_keys(), Err(ZkdError::KeyUnavailable)));
    }
}
