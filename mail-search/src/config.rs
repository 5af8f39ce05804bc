use crate::error::{Result, SearchError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SearchConfig {
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub search: SearchSettings,
    #[serde(default)]
    pub resources: ResourceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IndexConfig {
    /// Directory holding one index file per user
    pub directory: PathBuf,
    pub file_prefix: String,
    pub file_extension: String,
    /// Ciphertexts larger than this are written next to the index file
    pub externalize_threshold: usize,
    /// Maximum index size in bytes, -1 for unlimited
    pub storage_limit: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct IndexingConfig {
    pub page_size: usize,
    pub full_speed_workers: usize,
    pub throttled_workers: usize,
    pub empty_page_threshold: usize,
    pub max_rate_limit_retries: u32,
    pub progress_interval_secs: u64,
    /// Label whose messages are indexed ("all mail")
    pub label: String,
    /// Index headers only, without downloading bodies
    pub metadata_only: bool,
    /// Process memory share (percent) above which pages shrink to one per worker
    pub memory_pressure_percent: u8,
    /// Process memory share (percent) above which messages go one at a time
    pub memory_critical_percent: u8,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Share of available memory the cache may occupy
    pub heap_fraction: f64,
    pub estimated_message_bytes: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SearchSettings {
    /// Number of results after which a page is considered full
    pub page_size: usize,
    pub batch_heap_fraction: f64,
    pub slow_search_secs: u64,
    pub preview_context: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResourceConfig {
    pub low_storage_bytes: u64,
    pub wifi_only: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./data/search"),
            file_prefix: "encryptedSearchIndex".to_string(),
            file_extension: "sqlite3".to_string(),
            externalize_threshold: 256 * 1024,
            storage_limit: -1,
        }
    }
}

impl Default for IndexingConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|p| p.get())
            .unwrap_or(4);
        Self {
            page_size: 50,
            full_speed_workers: cpus,
            throttled_workers: 2,
            empty_page_threshold: 5,
            max_rate_limit_retries: 5,
            progress_interval_secs: 2,
            label: "5".to_string(),
            metadata_only: false,
            memory_pressure_percent: 10,
            memory_critical_percent: 15,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            heap_fraction: 0.2,
            estimated_message_bytes: 14_000.0,
        }
    }
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            page_size: 50,
            batch_heap_fraction: 0.1,
            slow_search_secs: 5,
            preview_context: 100,
        }
    }
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            low_storage_bytes: 100 * 1024 * 1024, // 100MB
            wifi_only: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            index: IndexConfig::default(),
            indexing: IndexingConfig::default(),
            cache: CacheConfig::default(),
            search: SearchSettings::default(),
            resources: ResourceConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl SearchConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| SearchError::Config(e.to_string()))?;

        let config: Self = toml::from_str(&content).map_err(|e| SearchError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.indexing.page_size == 0 {
            return Err(SearchError::Config("indexing.page_size must be > 0".to_string()));
        }
        if self.indexing.full_speed_workers == 0 || self.indexing.throttled_workers == 0 {
            return Err(SearchError::Config("worker counts must be > 0".to_string()));
        }
        if !(0.0..=1.0).contains(&self.cache.heap_fraction)
            || !(0.0..=1.0).contains(&self.search.batch_heap_fraction)
        {
            return Err(SearchError::Config("heap fractions must be within 0..=1".to_string()));
        }
        if self.cache.estimated_message_bytes <= 0.0 {
            return Err(SearchError::Config(
                "cache.estimated_message_bytes must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Path of the index file for a user, whose id must pass [`check_user_id`]
    pub fn index_path(&self, user_id: &str) -> PathBuf {
        self.index.directory.join(format!(
            "{}_{}.{}",
            self.index.file_prefix, user_id, self.index.file_extension
        ))
    }
}

/// User ids end up in file names, so they must stay a single plain path
/// component
pub fn check_user_id(user_id: &str) -> Result<()> {
    if user_id.is_empty() {
        return Err(SearchError::MissingUser);
    }
    let unsafe_char = user_id
        .chars()
        .any(|c| matches!(c, '/' | '\\' | ':' | '\0') || c.is_control());
    if unsafe_char || user_id.starts_with('.') {
        return Err(SearchError::InvalidUser(user_id.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_ids_that_escape_the_directory_are_rejected() {
        assert!(check_user_id("alice@example.com").is_ok());
        assert!(matches!(check_user_id(""), Err(SearchError::MissingUser)));
        for id in ["../alice", "a/b", "..", ".hidden", "a\\b", "c:x"] {
            assert!(
                matches!(check_user_id(id), Err(SearchError::InvalidUser(_))),
                "{} accepted",
                id
            );
        }
    }

    #[test]
    fn test_index_path_is_deterministic() {
        let config = SearchConfig::default();
        let path = config.index_path("user-1");
        assert_eq!(
            path,
            PathBuf::from("./data/search/encryptedSearchIndex_user-1.sqlite3")
        );
        assert_eq!(path, config.index_path("user-1"));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: SearchConfig = toml::from_str(
            r#"
            [indexing]
            page_size = 10
            full_speed_workers = 8
            throttled_workers = 1
            empty_page_threshold = 5
            max_rate_limit_retries = 3
            progress_interval_secs = 1
            label = "5"
            "#,
        )
        .unwrap();

        assert_eq!(config.indexing.page_size, 10);
        assert_eq!(config.search.page_size, 50);
        assert_eq!(config.index.file_prefix, "encryptedSearchIndex");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_page_size() {
        let mut config = SearchConfig::default();
        config.indexing.page_size = 0;
        assert!(matches!(config.validate(), Err(SearchError::Config(_))));
    }
}
