//! Per-user index key provisioning

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

use super::cipher::{Cipher, KEY_LEN};
use crate::config::check_user_id;
use crate::error::{Result, SearchError};

/// Host secure storage for index keys (keychain, keystore, ...)
#[cfg_attr(test, mockall::automock)]
pub trait SecureKeyStorage: Send + Sync {
    fn get(&self, user_id: &str) -> Result<Option<Vec<u8>>>;
    fn set(&self, user_id: &str, key: &[u8]) -> Result<()>;
    fn remove(&self, user_id: &str) -> Result<()>;
}

/// Volatile key storage, mostly for tests and embedding
#[derive(Default)]
pub struct MemoryKeyStorage {
    keys: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryKeyStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecureKeyStorage for MemoryKeyStorage {
    fn get(&self, user_id: &str) -> Result<Option<Vec<u8>>> {
        let keys = self
            .keys
            .lock()
            .map_err(|_| SearchError::KeyProvisioning("key storage poisoned".to_string()))?;
        Ok(keys.get(user_id).cloned())
    }

    fn set(&self, user_id: &str, key: &[u8]) -> Result<()> {
        let mut keys = self
            .keys
            .lock()
            .map_err(|_| SearchError::KeyProvisioning("key storage poisoned".to_string()))?;
        keys.insert(user_id.to_string(), key.to_vec());
        Ok(())
    }

    fn remove(&self, user_id: &str) -> Result<()> {
        let mut keys = self
            .keys
            .lock()
            .map_err(|_| SearchError::KeyProvisioning("key storage poisoned".to_string()))?;
        keys.remove(user_id);
        Ok(())
    }
}

/// Stores each user's key base64-encoded in its own owner-only file
pub struct FileKeyStorage {
    directory: PathBuf,
}

impl FileKeyStorage {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    fn key_path(&self, user_id: &str) -> Result<PathBuf> {
        check_user_id(user_id)?;
        Ok(self.directory.join(format!("{}.key", user_id)))
    }
}

impl SecureKeyStorage for FileKeyStorage {
    fn get(&self, user_id: &str) -> Result<Option<Vec<u8>>> {
        let path = self.key_path(user_id)?;
        if !path.exists() {
            return Ok(None);
        }
        let encoded = std::fs::read_to_string(&path)?;
        let key = BASE64
            .decode(encoded.trim())
            .map_err(|e| SearchError::KeyProvisioning(format!("corrupt key file: {}", e)))?;
        Ok(Some(key))
    }

    fn set(&self, user_id: &str, key: &[u8]) -> Result<()> {
        let path = self.key_path(user_id)?;
        std::fs::create_dir_all(&self.directory)?;

        let mut options = std::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
            options.mode(0o600);
            // mode only applies on creation
            if path.exists() {
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
            }
        }

        let mut file = options.open(&path)?;
        file.write_all(BASE64.encode(key).as_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    fn remove(&self, user_id: &str) -> Result<()> {
        let path = self.key_path(user_id)?;
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}

/// Hands out one [`Cipher`] per user, creating the key on first use
pub struct KeyProvider {
    storage: Arc<dyn SecureKeyStorage>,
    ciphers: AsyncMutex<HashMap<String, Arc<Cipher>>>,
}

impl KeyProvider {
    pub fn new(storage: Arc<dyn SecureKeyStorage>) -> Self {
        Self {
            storage,
            ciphers: AsyncMutex::new(HashMap::new()),
        }
    }

    pub async fn cipher_for(&self, user_id: &str) -> Result<Arc<Cipher>> {
        check_user_id(user_id)?;

        let mut ciphers = self.ciphers.lock().await;
        if let Some(cipher) = ciphers.get(user_id) {
            return Ok(Arc::clone(cipher));
        }

        let key = match self.storage.get(user_id)? {
            Some(key) if key.len() == KEY_LEN => {
                debug!("Loaded search index key for {}", user_id);
                key
            }
            Some(key) => {
                return Err(SearchError::KeyProvisioning(format!(
                    "stored key for {} has length {}",
                    user_id,
                    key.len()
                )));
            }
            None => {
                info!("Generating search index key for {}", user_id);
                let key = Cipher::generate_key()?;
                self.storage.set(user_id, &key)?;
                key.to_vec()
            }
        };

        let cipher = Arc::new(Cipher::new(&key)?);
        ciphers.insert(user_id.to_string(), Arc::clone(&cipher));
        Ok(cipher)
    }

    /// Forget the key, e.g. after the user's index was deleted
    pub async fn forget(&self, user_id: &str) -> Result<()> {
        self.ciphers.lock().await.remove(user_id);
        self.storage.remove(user_id)
    }
}
