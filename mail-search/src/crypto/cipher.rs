//! AES-256-GCM record cipher

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, SearchError};

/// Key size for AES-256
pub const KEY_LEN: usize = 32;

/// Seals and opens index records for a single user
pub struct Cipher {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl Cipher {
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.len() != KEY_LEN {
            return Err(SearchError::KeyProvisioning(format!(
                "expected {} byte key, got {}",
                KEY_LEN,
                key.len()
            )));
        }
        let unbound = UnboundKey::new(&AES_256_GCM, key)
            .map_err(|_| SearchError::KeyProvisioning("invalid AES-256 key".to_string()))?;

        Ok(Self {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }

    /// Generate a fresh random key
    pub fn generate_key() -> Result<[u8; KEY_LEN]> {
        let mut key = [0u8; KEY_LEN];
        SystemRandom::new()
            .fill(&mut key)
            .map_err(|_| SearchError::KeyProvisioning("random generator failed".to_string()))?;
        Ok(key)
    }

    /// Encrypt raw bytes, returning `(iv, ciphertext || tag)`
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
        let mut iv = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut iv)
            .map_err(|_| SearchError::Encryption("nonce generation failed".to_string()))?;

        let mut in_out = plaintext.to_vec();
        self.key
            .seal_in_place_append_tag(Nonce::assume_unique_for_key(iv), Aad::empty(), &mut in_out)
            .map_err(|_| SearchError::Encryption("AES-GCM seal failed".to_string()))?;

        Ok((iv.to_vec(), in_out))
    }

    /// Decrypt bytes produced by [`Cipher::encrypt`]. Fails closed on any
    /// tampering or key mismatch.
    pub fn decrypt(&self, iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let nonce = Nonce::try_assume_unique_for_key(iv)
            .map_err(|_| SearchError::Decryption(format!("invalid IV length {}", iv.len())))?;

        let mut in_out = ciphertext.to_vec();
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| SearchError::Decryption("AES-GCM authentication failed".to_string()))?;

        Ok(plaintext.to_vec())
    }

    pub fn encrypt_record<T: Serialize>(&self, record: &T) -> Result<(Vec<u8>, Vec<u8>)> {
        let bytes = serde_json::to_vec(record)?;
        self.encrypt(&bytes)
    }

    pub fn decrypt_record<T: DeserializeOwned>(&self, iv: &[u8], ciphertext: &[u8]) -> Result<T> {
        let bytes = self.decrypt(iv, ciphertext)?;
        serde_json::from_slice(&bytes).map_err(|e| SearchError::Decryption(e.to_string()))
    }
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cipher").finish_non_exhaustive()
    }
}
