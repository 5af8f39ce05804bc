use mail_search::config::SearchConfig;
use mail_search::error::SearchError;
use std::io::Write;
use tempfile::NamedTempFile;

#[test]
fn test_partial_config_file_keeps_defaults() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[index]
directory = "/var/lib/mail-search"
file_prefix = "idx"
file_extension = "db"
externalize_threshold = 1024
storage_limit = 500000000

[search]
page_size = 20
batch_heap_fraction = 0.05
slow_search_secs = 3
preview_context = 40

[logging]
level = "debug"
format = "json"
"#
    )
    .unwrap();

    let config = SearchConfig::from_file(file.path()).unwrap();
    assert_eq!(config.index.storage_limit, 500_000_000);
    assert_eq!(config.search.page_size, 20);
    assert_eq!(config.logging.format, "json");
    assert_eq!(config.indexing.empty_page_threshold, 5);
    assert_eq!(config.cache.heap_fraction, 0.2);
    assert!(config
        .index_path("dave")
        .ends_with("idx_dave.db"));
}

#[test]
fn test_invalid_values_are_rejected() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[cache]
heap_fraction = 1.5
estimated_message_bytes = 14000.0
"#
    )
    .unwrap();

    assert!(matches!(
        SearchConfig::from_file(file.path()),
        Err(SearchError::Config(_))
    ));
}
