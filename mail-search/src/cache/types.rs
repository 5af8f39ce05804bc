//! Cache types

use crate::index::{DecryptedContent, RecencyCursor, SearchIndexEntry};
use crate::search::query::SearchQuery;
use crate::search::types::{HitSource, SearchHit};

/// Fixed per-message bookkeeping counted on top of the text
const MESSAGE_OVERHEAD: usize = 256;

/// Decrypted projection of one index entry
#[derive(Debug, Clone)]
pub struct CachedMessage {
    pub key: RecencyCursor,
    pub label_ids: Vec<String>,
    pub unread: bool,
    pub starred: Option<bool>,
    pub location: i64,
    pub decryption_failed: bool,
    pub content: DecryptedContent,
    text: String,
}

impl CachedMessage {
    pub fn from_entry(entry: &SearchIndexEntry, content: DecryptedContent) -> Self {
        let text = content.searchable_text();
        Self {
            key: entry.recency_key(),
            label_ids: entry.label_ids.clone(),
            unread: entry.unread,
            starred: entry.starred,
            location: entry.location,
            decryption_failed: entry.decryption_failed,
            content,
            text,
        }
    }

    pub fn message_id(&self) -> &str {
        &self.key.message_id
    }

    pub fn matches(&self, query: &SearchQuery) -> bool {
        query.matches(&self.text)
    }

    /// Approximate heap footprint
    pub fn size_bytes(&self) -> usize {
        let body = self.content.body.as_ref().map_or(0, |b| b.len());
        MESSAGE_OVERHEAD + self.text.len() + body + self.content.subject.len()
    }

    pub fn to_hit(&self, query: &SearchQuery, context: usize, source: HitSource) -> SearchHit {
        let preview = self
            .content
            .body
            .as_deref()
            .map(|body| query.preview(body, context))
            .unwrap_or_default();
        let matches = query.keyword_ranges(&preview);

        SearchHit {
            message_id: self.key.message_id.clone(),
            time: self.key.time,
            subject: self.content.subject.clone(),
            sender: self.content.sender.clone(),
            label_ids: self.label_ids.clone(),
            unread: self.unread,
            starred: self.starred,
            preview,
            matches,
            source,
        }
    }
}

/// Snapshot of the cache for status and telemetry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheInfo {
    pub user_id: String,
    /// Distinguishes cache instances; changes only on rebuild
    pub generation: u64,
    pub len: usize,
    pub size_bytes: usize,
    pub partial: bool,
}
