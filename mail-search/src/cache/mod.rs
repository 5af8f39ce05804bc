//! In-memory decrypted cache of the active user's index

pub mod manager;
pub mod types;

pub use manager::{CacheCoverage, CacheManager};
pub use types::{CacheInfo, CachedMessage};
