use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::types::{CacheInfo, CachedMessage};
use crate::config::CacheConfig;
use crate::crypto::Cipher;
use crate::error::Result;
use crate::index::{DecryptedContent, IndexStore, RecencyCursor};
use crate::resources::MemoryProbe;
use crate::search::types::{HitSource, SearchHit, SearchState};

/// Entries read from the index per round trip while building
const BUILD_BATCH: usize = 500;

/// Decrypted messages of one user, newest last
pub struct MessageCache {
    user_id: String,
    generation: u64,
    messages: BTreeMap<RecencyCursor, CachedMessage>,
    keys: HashMap<String, RecencyCursor>,
    size_bytes: usize,
    partial: bool,
    built: bool,
    /// Oldest index entry loaded by the build
    loaded_until: Option<RecencyCursor>,
}

impl MessageCache {
    fn new(user_id: &str, generation: u64) -> Self {
        Self {
            user_id: user_id.to_string(),
            generation,
            messages: BTreeMap::new(),
            keys: HashMap::new(),
            size_bytes: 0,
            partial: false,
            built: false,
            loaded_until: None,
        }
    }

    fn upsert(&mut self, message: CachedMessage) {
        self.remove(message.message_id());
        self.size_bytes += message.size_bytes();
        self.keys
            .insert(message.message_id().to_string(), message.key.clone());
        self.messages.insert(message.key.clone(), message);
    }

    fn remove(&mut self, message_id: &str) -> bool {
        let Some(key) = self.keys.remove(message_id) else {
            return false;
        };
        if let Some(old) = self.messages.remove(&key) {
            self.size_bytes = self.size_bytes.saturating_sub(old.size_bytes());
        }
        true
    }

    /// Advance `state` through the cache, newest first, collecting up to
    /// `batch_size` hits
    fn search(&self, state: &mut SearchState, batch_size: usize, context: usize) -> Vec<SearchHit> {
        let iter: Box<dyn Iterator<Item = (&RecencyCursor, &CachedMessage)> + '_> =
            match &state.cache_cursor {
                None => Box::new(self.messages.iter().rev()),
                Some(cursor) => Box::new(self.messages.range(..cursor.clone()).rev()),
            };

        let mut hits = Vec::new();
        let mut last = None;
        let mut exhausted = true;
        for (key, message) in iter {
            last = Some(key);
            if message.matches(&state.query) {
                hits.push(message.to_hit(&state.query, context, HitSource::Cache));
                if hits.len() >= batch_size {
                    exhausted = false;
                    break;
                }
            }
        }

        if let Some(last) = last {
            state.cache_cursor = Some(last.clone());
        }
        if exhausted {
            state.cache_search_done = true;
        }
        hits
    }

    fn info(&self) -> CacheInfo {
        CacheInfo {
            user_id: self.user_id.clone(),
            generation: self.generation,
            len: self.messages.len(),
            size_bytes: self.size_bytes,
            partial: self.partial,
        }
    }
}

/// How much of the index a cache covers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheCoverage {
    pub partial: bool,
    pub loaded_until: Option<RecencyCursor>,
}

/// Owns the single in-memory cache
pub struct CacheManager {
    config: CacheConfig,
    probe: Arc<dyn MemoryProbe>,
    cache: Arc<RwLock<Option<MessageCache>>>,
    generations: AtomicU64,
}

impl CacheManager {
    pub fn new(config: CacheConfig, probe: Arc<dyn MemoryProbe>) -> Self {
        Self {
            config,
            probe,
            cache: Arc::new(RwLock::new(None)),
            generations: AtomicU64::new(0),
        }
    }

    /// Build the cache for the store's user, reusing a complete cache of the
    /// same user
    pub async fn build(&self, store: &IndexStore, cipher: &Cipher) -> Result<CacheInfo> {
        let user_id = store.user_id();
        let mut slot = self.cache.write().await;

        if let Some(cache) = slot.as_ref() {
            if cache.user_id == user_id && cache.built {
                debug!("Reusing search cache of {}", user_id);
                return Ok(cache.info());
            }
        }

        // Tear down any other user's cache before building
        *slot = None;

        let budget = (self.probe.available_bytes() as f64 * self.config.heap_fraction) as usize;
        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        let mut cache = MessageCache::new(user_id, generation);

        let mut cursor: Option<RecencyCursor> = None;
        'outer: loop {
            let entries = store.page_by_recency(cursor.as_ref(), BUILD_BATCH).await?;
            let Some(last) = entries.last() else {
                break;
            };
            cursor = Some(last.recency_key());

            for entry in entries {
                let content: DecryptedContent =
                    match cipher.decrypt_record(&entry.iv, &entry.ciphertext) {
                        Ok(content) => content,
                        Err(e) => {
                            warn!("Skipping undecryptable index entry {}: {}", entry.message_id, e);
                            continue;
                        }
                    };

                let message = CachedMessage::from_entry(&entry, content);
                if cache.size_bytes + message.size_bytes() > budget {
                    cache.partial = true;
                    break 'outer;
                }
                cache.loaded_until = Some(message.key.clone());
                cache.upsert(message);
            }
        }

        cache.built = true;
        let info = cache.info();
        info!(
            "Built search cache for {}: {} messages, {} bytes{}",
            user_id,
            info.len,
            info.size_bytes,
            if info.partial { " (partial)" } else { "" }
        );
        *slot = Some(cache);
        Ok(info)
    }

    pub async fn info(&self) -> Option<CacheInfo> {
        self.cache.read().await.as_ref().map(MessageCache::info)
    }

    pub async fn is_built_for(&self, user_id: &str) -> bool {
        matches!(self.cache.read().await.as_ref(), Some(c) if c.user_id == user_id && c.built)
    }

    pub async fn coverage(&self, user_id: &str) -> Option<CacheCoverage> {
        let slot = self.cache.read().await;
        let cache = slot.as_ref().filter(|c| c.user_id == user_id && c.built)?;
        Some(CacheCoverage {
            partial: cache.partial,
            loaded_until: cache.loaded_until.clone(),
        })
    }

    /// Insert or replace a message if the user's cache exists
    pub async fn upsert(&self, user_id: &str, message: CachedMessage) -> bool {
        let mut slot = self.cache.write().await;
        match slot.as_mut() {
            Some(cache) if cache.user_id == user_id => {
                cache.upsert(message);
                true
            }
            _ => false,
        }
    }

    pub async fn remove(&self, user_id: &str, message_id: &str) -> bool {
        let mut slot = self.cache.write().await;
        match slot.as_mut() {
            Some(cache) if cache.user_id == user_id => cache.remove(message_id),
            _ => false,
        }
    }

    /// Search the cache; a missing cache counts as exhausted
    pub async fn search(
        &self,
        state: &mut SearchState,
        batch_size: usize,
        context: usize,
    ) -> Vec<SearchHit> {
        let slot = self.cache.read().await;
        match slot.as_ref() {
            Some(cache) if cache.user_id == state.user_id && cache.built => {
                cache.search(state, batch_size, context)
            }
            _ => {
                state.cache_search_done = true;
                Vec::new()
            }
        }
    }

    pub async fn clear(&self) {
        let mut slot = self.cache.write().await;
        if let Some(cache) = slot.take() {
            debug!("Dropped search cache of {}", cache.user_id);
        }
    }
}
