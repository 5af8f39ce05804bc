//! Search types and data structures

use serde::Serialize;
use std::collections::HashSet;
use std::time::Duration;

use super::query::SearchQuery;
use crate::index::RecencyCursor;
use crate::remote::Recipient;

/// Where a hit was found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HitSource {
    Cache,
    Index,
}

/// Search result entry
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub message_id: String,
    pub time: i64,
    pub subject: String,
    pub sender: Recipient,
    pub label_ids: Vec<String>,
    pub unread: bool,
    pub starred: Option<bool>,
    /// Body snippet around the first keyword
    pub preview: String,
    /// Merged keyword occurrences in `preview`, as half-open char ranges
    pub matches: Vec<(usize, usize)>,
    pub source: HitSource,
}

/// Cursor of one query across cache and index
///
/// Reuse it to fetch the following page of the same query; start a new one
/// when the query or the user changes.
#[derive(Debug, Clone)]
pub struct SearchState {
    pub user_id: String,
    pub query: SearchQuery,
    pub cache_cursor: Option<RecencyCursor>,
    pub cache_search_done: bool,
    pub index_cursor: Option<RecencyCursor>,
    pub index_search_complete: bool,
    /// Index batches read so far, bounded by the entry count
    pub index_batches: usize,
    pub pages_served: usize,
    /// Ids already returned, so cache and index never report one twice
    pub seen: HashSet<String>,
}

impl SearchState {
    pub fn new(user_id: impl Into<String>, query: &str) -> Self {
        Self {
            user_id: user_id.into(),
            query: SearchQuery::parse(query),
            cache_cursor: None,
            cache_search_done: false,
            index_cursor: None,
            index_search_complete: false,
            index_batches: 0,
            pages_served: 0,
            seen: HashSet::new(),
        }
    }

    /// Whether this state still describes `query` for `user_id`
    pub fn is_for(&self, user_id: &str, query: &str) -> bool {
        self.user_id == user_id && self.query == SearchQuery::parse(query)
    }

    pub fn is_exhausted(&self) -> bool {
        self.cache_search_done && self.index_search_complete
    }
}

/// Incremental notifications published while a page is assembled
#[derive(Debug, Clone)]
pub enum SearchEvent {
    Results(Vec<SearchHit>),
    /// Raised when nothing was found within the slow-search delay and
    /// cleared with the first results
    SlowSearch(bool),
}

/// One page of results
#[derive(Debug, Clone)]
pub struct SearchPage {
    pub hits: Vec<SearchHit>,
    /// No further page can produce results
    pub exhausted: bool,
    pub duration: Duration,
}
