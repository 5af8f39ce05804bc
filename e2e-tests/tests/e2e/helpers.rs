#![allow(dead_code)]

use mail_search::config::SearchConfig;
use mail_search::crypto::MemoryKeyStorage;
use mail_search::engine::{Collaborators, EncryptedSearch};
use mail_search::error::{Result, SearchError};
use mail_search::index::IndexStore;
use mail_search::remote::{MemoryTransport, MessageDecrypter, MessageDetail, MessageHeader, Recipient};
use mail_search::remote::PlaintextDecrypter;
use mail_search::resources::MemoryProbe;
use mail_search::telemetry::NoopTelemetry;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

pub const USER: &str = "alice@example.com";

/// Memory probe the test can turn down between cache builds
pub struct AdjustableMemory(AtomicU64);

impl AdjustableMemory {
    pub fn new(bytes: u64) -> Self {
        Self(AtomicU64::new(bytes))
    }

    pub fn set(&self, bytes: u64) {
        self.0.store(bytes, Ordering::SeqCst);
    }
}

impl MemoryProbe for AdjustableMemory {
    fn available_bytes(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Fails to decrypt one message, passes the others through
pub struct BrokenMessage(pub String);

impl MessageDecrypter for BrokenMessage {
    fn decrypt_body(&self, _user_id: &str, detail: &MessageDetail) -> Result<String> {
        if detail.id() == self.0 {
            Err(SearchError::Decryption("session key mismatch".to_string()))
        } else {
            Ok(detail.body.clone())
        }
    }
}

/// Test environment: a temporary index directory and an in-memory mailbox
pub struct TestEnv {
    pub dir: TempDir,
    pub config: SearchConfig,
    pub transport: Arc<MemoryTransport>,
    pub memory: Arc<AdjustableMemory>,
    /// Shared so that a restarted service finds the same index key
    pub keys: Arc<MemoryKeyStorage>,
}

impl TestEnv {
    pub fn new(messages: Vec<MessageDetail>) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let mut config = SearchConfig::default();
        config.index.directory = dir.path().to_path_buf();
        config.indexing.page_size = 10;
        config.cache.heap_fraction = 1.0;

        Self {
            dir,
            config,
            transport: Arc::new(MemoryTransport::new(messages)),
            memory: Arc::new(AdjustableMemory::new(1 << 30)),
            keys: Arc::new(MemoryKeyStorage::new()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        self.collaborators_with(Arc::new(PlaintextDecrypter))
    }

    pub fn collaborators_with(&self, decrypter: Arc<dyn MessageDecrypter>) -> Collaborators {
        Collaborators::new(
            self.transport.clone(),
            decrypter,
            self.keys.clone(),
        )
        .with_telemetry(Arc::new(NoopTelemetry))
        .with_memory_probe(self.memory.clone())
    }

    /// Service with `USER` opened
    pub async fn service(&self) -> EncryptedSearch {
        self.service_with(self.collaborators()).await
    }

    pub async fn service_with(&self, collaborators: Collaborators) -> EncryptedSearch {
        let search = EncryptedSearch::new(self.config.clone(), collaborators)
            .expect("search service");
        search.open_user(USER).await.expect("open user");
        search
    }

    /// Second handle on the user's index, for inspecting rows
    pub async fn store(&self) -> IndexStore {
        IndexStore::open(&self.config, USER).await.expect("open store")
    }

    /// Export the mailbox the way the CLI reads it
    pub fn write_mailbox(&self, messages: &[MessageDetail]) -> PathBuf {
        let path = self.dir.path().join("mailbox.json");
        let json = serde_json::to_string(messages).expect("serialize mailbox");
        std::fs::write(&path, json).expect("write mailbox");
        path
    }
}

/// Message `i`, newer for larger `i`
pub fn message(i: i64, subject: &str) -> MessageDetail {
    MessageDetail {
        header: MessageHeader {
            id: format!("msg-{:02}", i),
            time: 1_700_000_000 + i * 60,
            order: i,
            subject: subject.to_string(),
            sender: Recipient::new("Bob", "bob@example.com"),
            to_list: vec![Recipient::new("Alice", USER)],
            ..Default::default()
        },
        body: format!("<div>Message body {:02}</div>", i),
        mime_type: "text/html".to_string(),
    }
}

pub fn mailbox(n: i64) -> Vec<MessageDetail> {
    (1..=n).map(|i| message(i, &format!("Subject {:02}", i))).collect()
}

/// Test result helper
#[derive(Debug)]
pub struct TestResult {
    pub name: String,
    pub duration: Duration,
}

impl TestResult {
    pub fn start(name: &str) -> (String, Instant) {
        println!("\n🚀 Starting: {}", name);
        println!("{}", "=".repeat(80));
        (name.to_string(), Instant::now())
    }

    pub fn success(name: String, started: Instant) -> Self {
        Self {
            name,
            duration: started.elapsed(),
        }
    }

    pub fn print(&self) {
        println!("\n{}", "=".repeat(80));
        println!("📝 Test: {}", self.name);
        println!("⏱️  Duration: {:?}", self.duration);
        println!("✅ Test passed");
        println!("{}", "=".repeat(80));
    }
}
