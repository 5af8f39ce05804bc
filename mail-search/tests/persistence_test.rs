use mail_search::config::SearchConfig;
use mail_search::crypto::FileKeyStorage;
use mail_search::engine::{Collaborators, EncryptedSearch};
use mail_search::index::IndexStore;
use mail_search::remote::{MemoryTransport, MessageDetail, MessageHeader, PlaintextDecrypter};
use mail_search::resources::FixedMemoryProbe;
use mail_search::search::SearchState;
use mail_search::state::IndexingState;
use mail_search::telemetry::NoopTelemetry;
use std::sync::Arc;
use tempfile::TempDir;

const USER: &str = "carol";

fn long_message(i: i64) -> MessageDetail {
    let paragraph = format!("<p>Shipment {} left the warehouse on time.</p>", i);
    MessageDetail {
        header: MessageHeader {
            id: format!("long-{}", i),
            time: 1_000 + i,
            order: i,
            subject: format!("Delivery {}", i),
            ..Default::default()
        },
        body: paragraph.repeat(20),
        mime_type: "text/html".to_string(),
    }
}

fn config(dir: &TempDir) -> SearchConfig {
    let mut config = SearchConfig::default();
    config.index.directory = dir.path().join("index");
    config.index.externalize_threshold = 256;
    config
}

fn service(dir: &TempDir, messages: Vec<MessageDetail>) -> EncryptedSearch {
    let collaborators = Collaborators::new(
        Arc::new(MemoryTransport::new(messages)),
        Arc::new(PlaintextDecrypter),
        Arc::new(FileKeyStorage::new(dir.path().join("keys"))),
    )
    .with_telemetry(Arc::new(NoopTelemetry))
    .with_memory_probe(Arc::new(FixedMemoryProbe(1 << 30)));

    EncryptedSearch::new(config(dir), collaborators).unwrap()
}

/// Large records live next to the index file and survive a restart
#[tokio::test]
async fn test_externalized_content_survives_restart() {
    let dir = TempDir::new().unwrap();
    let messages: Vec<_> = (1..=3).map(long_message).collect();

    {
        let search = service(&dir, messages.clone());
        search.open_user(USER).await.unwrap();
        search.enable().await.unwrap();
        let status = search.wait_for_build().await;
        assert_eq!(status.state, IndexingState::Complete);
        search.close().await;
    }

    let store = IndexStore::open(&config(&dir), USER).await.unwrap();
    let entry = store.get("long-2").await.unwrap().unwrap();
    let file = entry.ciphertext_file.clone().unwrap();
    assert!(file.exists());
    assert_eq!(entry.ciphertext.len(), entry.ciphertext_size);
    assert!(store.size_on_disk().unwrap() > std::fs::metadata(store.path()).unwrap().len());
    store.close().await;

    let search = service(&dir, messages);
    search.open_user(USER).await.unwrap();
    let mut state = SearchState::new(USER, "shipment 2 left");
    let page = search.search(&mut state, None).await.unwrap();
    assert_eq!(page.hits.len(), 1);
    assert_eq!(page.hits[0].message_id, "long-2");
    assert!(page.hits[0].preview.contains("Shipment 2"));

    search.delete_index().await.unwrap();
    assert!(!file.exists());
    assert!(!IndexStore::exists_for(&config(&dir), USER));
}

/// The index key is kept in the key directory until search is disabled
#[tokio::test]
async fn test_disable_forgets_key() {
    let dir = TempDir::new().unwrap();
    let search = service(&dir, vec![long_message(1)]);
    search.open_user(USER).await.unwrap();
    search.enable().await.unwrap();
    search.wait_for_build().await;

    let keys = dir.path().join("keys");
    assert_eq!(std::fs::read_dir(&keys).unwrap().count(), 1);

    search.disable().await.unwrap();
    assert_eq!(std::fs::read_dir(&keys).unwrap().count(), 0);
    assert_eq!(search.status().await.state, IndexingState::Disabled);
}
