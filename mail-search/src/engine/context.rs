use std::sync::Arc;

use crate::config::SearchConfig;
use crate::crypto::{Cipher, KeyProvider};
use crate::error::{Result, SearchError};
use crate::index::IndexStore;

/// Everything bound to the active user: their store handle and index key
///
/// Created explicitly when a user becomes active and dropped on switch.
#[derive(Clone)]
pub struct UserContext {
    pub user_id: String,
    pub store: Arc<IndexStore>,
    pub cipher: Arc<Cipher>,
}

impl UserContext {
    pub async fn open(config: &SearchConfig, keys: &KeyProvider, user_id: &str) -> Result<Self> {
        if user_id.is_empty() {
            return Err(SearchError::MissingUser);
        }

        let cipher = keys.cipher_for(user_id).await?;
        let store = IndexStore::open(config, user_id).await?;

        Ok(Self {
            user_id: user_id.to_string(),
            store: Arc::new(store),
            cipher,
        })
    }
}

impl std::fmt::Debug for UserContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserContext")
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}
