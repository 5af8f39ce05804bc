//! Persisted encrypted search index

pub mod store;
pub mod types;

pub use store::IndexStore;
pub use types::{DecryptedContent, RecencyCursor, SearchIndexEntry};
