//! Paged download of a mailbox into the encrypted index

use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::extract::PlaintextExtractor;
use super::session::{IndexingSession, PageCursor};
use crate::config::{IndexConfig, IndexingConfig};
use crate::engine::UserContext;
use crate::error::{Result, SearchError};
use crate::index::{DecryptedContent, SearchIndexEntry};
use crate::remote::{DetailResponse, MailTransport, MessageDecrypter, MessageDetail, MessageHeader};
use crate::resources::MemoryProbe;

/// Indexing stops this many bytes before the storage limit
const STORAGE_LIMIT_MARGIN: i64 = 2_000;

/// Headers per page when no bodies are downloaded
const METADATA_PAGE_SIZE: usize = 150;

/// Why a build run returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildOutcome {
    /// Every remote message is indexed
    Complete,
    /// The remote kept returning empty pages before the total was reached
    RemoteExhausted,
    /// Pages kept failing or yielding nothing new
    Stalled,
    /// The index reached its configured size limit
    StorageLimit,
    /// The run was cancelled and can be resumed from the session cursor
    Cancelled,
}

/// Worker pool width, switchable between full speed and throttled
#[derive(Debug)]
pub struct Throttle {
    width: AtomicUsize,
    full: usize,
    throttled: usize,
}

impl Throttle {
    pub fn new(config: &IndexingConfig) -> Self {
        Self {
            width: AtomicUsize::new(config.full_speed_workers),
            full: config.full_speed_workers,
            throttled: config.throttled_workers,
        }
    }

    pub fn set_full_speed(&self, full: bool) {
        let width = if full { self.full } else { self.throttled };
        if self.width.swap(width, Ordering::SeqCst) != width {
            debug!("Indexing worker width set to {}", width);
        }
    }

    pub fn width(&self) -> usize {
        self.width.load(Ordering::SeqCst).max(1)
    }

    pub fn is_full_speed(&self) -> bool {
        self.width() == self.full
    }
}

/// Outcome of indexing a single message
enum MessageResult {
    Indexed,
    IndexedWithoutBody,
    Failed,
}

pub struct IndexBuilder {
    config: IndexingConfig,
    storage_limit: AtomicI64,
    transport: Arc<dyn MailTransport>,
    decrypter: Arc<dyn MessageDecrypter>,
    extractor: PlaintextExtractor,
    throttle: Arc<Throttle>,
    memory: Arc<dyn MemoryProbe>,
}

impl IndexBuilder {
    pub fn new(
        config: IndexingConfig,
        index_config: &IndexConfig,
        transport: Arc<dyn MailTransport>,
        decrypter: Arc<dyn MessageDecrypter>,
        throttle: Arc<Throttle>,
        memory: Arc<dyn MemoryProbe>,
    ) -> Result<Self> {
        Ok(Self {
            config,
            storage_limit: AtomicI64::new(index_config.storage_limit),
            transport,
            decrypter,
            extractor: PlaintextExtractor::new()?,
            throttle,
            memory,
        })
    }

    pub fn throttle(&self) -> &Arc<Throttle> {
        &self.throttle
    }

    /// Page size and worker width for the next page
    ///
    /// Metadata-only runs take large pages. Otherwise pages shrink as this
    /// process holds more of the machine's memory.
    pub fn pace(&self) -> (usize, usize) {
        let width = self.throttle.width();
        if self.config.metadata_only {
            return (METADATA_PAGE_SIZE, width);
        }

        let usage = self.memory.process_usage_percent();
        if usage > self.config.memory_critical_percent {
            debug!("Memory usage at {}%, indexing one message at a time", usage);
            (1, 1)
        } else if usage > self.config.memory_pressure_percent {
            let page = self.config.full_speed_workers.min(self.config.page_size).max(1);
            (page, width.min(page))
        } else {
            (self.config.page_size, width)
        }
    }

    /// Change the index size limit in bytes, -1 for unlimited
    pub fn set_storage_limit(&self, limit: i64) {
        self.storage_limit.store(limit, Ordering::SeqCst);
    }

    /// Download until done, stalled, over the size limit or cancelled
    ///
    /// Store failures are returned; everything scoped to a single message or
    /// page is logged and absorbed.
    pub async fn run(
        &self,
        ctx: &UserContext,
        session: &Mutex<IndexingSession>,
        cancel: &CancellationToken,
    ) -> Result<BuildOutcome> {
        let total = self.transport.fetch_total_count(&self.config.label).await?;
        let processed = ctx.store.count().await?;

        {
            let mut session = session.lock().await;
            session.total = total;
            session.processed = processed;
            session.observe_indexed_time(ctx.store.newest_time().await?);
        }

        if processed >= total {
            info!("Search index of {} is complete ({} messages)", ctx.user_id, processed);
            return Ok(BuildOutcome::Complete);
        }

        let mut cursor = self.initial_cursor(ctx, session, processed).await?;
        let mut no_progress = 0;
        let mut last_reason = BuildOutcome::Stalled;

        info!(
            "Indexing {} messages for {} ({} already indexed)",
            total - processed,
            ctx.user_id,
            processed
        );

        loop {
            if cancel.is_cancelled() {
                return Ok(BuildOutcome::Cancelled);
            }
            if self.over_storage_limit(ctx)? {
                warn!("Search index of {} reached its storage limit", ctx.user_id);
                return Ok(BuildOutcome::StorageLimit);
            }

            let (page_size, width) = self.pace();
            let fetch = self.transport.fetch_message_page(
                &self.config.label,
                cursor.end_time(),
                page_size,
            );
            let page = tokio::select! {
                _ = cancel.cancelled() => return Ok(BuildOutcome::Cancelled),
                page = fetch => page,
            };

            let (next, inserted) = match page {
                Ok(headers) if headers.is_empty() => {
                    if let PageCursor::Newer { .. } = cursor {
                        (self.older_cursor(ctx).await?, 0)
                    } else {
                        last_reason = BuildOutcome::RemoteExhausted;
                        (cursor, 0)
                    }
                }
                Ok(headers) => {
                    let inserted = self.index_page(ctx, session, &headers, width).await?;
                    last_reason = BuildOutcome::Stalled;
                    (self.next_cursor(ctx, cursor, &headers, page_size).await?, inserted)
                }
                Err(e) => {
                    warn!("Fetching message page for {} failed: {}", ctx.user_id, e);
                    last_reason = BuildOutcome::Stalled;
                    (cursor, 0)
                }
            };
            cursor = next;

            let processed = ctx.store.count().await?;
            let newest = ctx.store.newest_time().await?;
            let done = {
                let mut session = session.lock().await;
                session.processed = processed;
                session.cursor = Some(cursor);
                session.observe_indexed_time(newest);
                session.is_complete()
            };

            if done {
                info!("Indexed all {} messages for {}", processed, ctx.user_id);
                return Ok(BuildOutcome::Complete);
            }

            if inserted == 0 {
                no_progress += 1;
                if no_progress >= self.config.empty_page_threshold {
                    warn!(
                        "Stopping build for {} after {} pages without progress ({:?})",
                        ctx.user_id, no_progress, last_reason
                    );
                    return Ok(last_reason);
                }
            } else {
                no_progress = 0;
            }
        }
    }

    async fn initial_cursor(
        &self,
        ctx: &UserContext,
        session: &Mutex<IndexingSession>,
        processed: usize,
    ) -> Result<PageCursor> {
        let mut session = session.lock().await;
        if let Some(cursor) = session.cursor {
            debug!("Resuming build for {} at {:?}", ctx.user_id, cursor);
            return Ok(cursor);
        }

        let cursor = match ctx.store.newest_time().await? {
            Some(floor) if processed > 0 => {
                session.refresh = true;
                PageCursor::Newer {
                    end_time: None,
                    floor,
                }
            }
            _ => PageCursor::Older { end_time: None },
        };
        session.cursor = Some(cursor);
        Ok(cursor)
    }

    async fn older_cursor(&self, ctx: &UserContext) -> Result<PageCursor> {
        Ok(PageCursor::Older {
            end_time: ctx.store.oldest_time().await?,
        })
    }

    async fn next_cursor(
        &self,
        ctx: &UserContext,
        cursor: PageCursor,
        headers: &[MessageHeader],
        page_size: usize,
    ) -> Result<PageCursor> {
        let min_time = headers.iter().map(|h| h.time).min().unwrap_or(i64::MIN);
        let short_page = headers.len() < page_size;

        match cursor {
            PageCursor::Newer { floor, .. } if min_time <= floor || short_page => {
                self.older_cursor(ctx).await
            }
            PageCursor::Newer { end_time, floor } => Ok(PageCursor::Newer {
                end_time: Some(step_back(end_time, min_time)),
                floor,
            }),
            PageCursor::Older { end_time } => Ok(PageCursor::Older {
                end_time: Some(step_back(end_time, min_time)),
            }),
        }
    }

    fn over_storage_limit(&self, ctx: &UserContext) -> Result<bool> {
        let limit = self.storage_limit.load(Ordering::SeqCst);
        if limit <= 0 {
            return Ok(false);
        }
        let size = ctx.store.size_on_disk()? as i64;
        Ok(size > limit - STORAGE_LIMIT_MARGIN)
    }

    /// Index the messages of a page not yet in the store, returning how many
    /// were written
    async fn index_page(
        &self,
        ctx: &UserContext,
        session: &Mutex<IndexingSession>,
        headers: &[MessageHeader],
        width: usize,
    ) -> Result<usize> {
        let mut seen = HashSet::new();
        let mut fresh = Vec::new();
        for header in headers {
            if seen.insert(header.id.as_str()) && !ctx.store.contains(&header.id).await? {
                fresh.push(header.clone());
            }
        }

        if fresh.is_empty() {
            return Ok(0);
        }

        debug!(
            "Indexing {} new messages of page for {} with {} workers",
            fresh.len(),
            ctx.user_id,
            width
        );

        let results: Vec<Result<MessageResult>> = stream::iter(fresh)
            .map(|header| self.index_message(ctx, session, header))
            .buffer_unordered(width)
            .collect()
            .await;

        let mut inserted = 0;
        let mut failed = 0;
        for result in results {
            match result {
                Ok(MessageResult::Indexed) | Ok(MessageResult::IndexedWithoutBody) => inserted += 1,
                Ok(MessageResult::Failed) => failed += 1,
                Err(e) => return Err(e),
            }
        }

        if failed > 0 {
            session.lock().await.failed_messages += failed;
        }
        Ok(inserted)
    }

    async fn index_message(
        &self,
        ctx: &UserContext,
        session: &Mutex<IndexingSession>,
        header: MessageHeader,
    ) -> Result<MessageResult> {
        let message_id = header.id.clone();
        if self.config.metadata_only {
            let content = DecryptedContent::metadata_only(&header);
            let (iv, ciphertext) = match ctx.cipher.encrypt_record(&content) {
                Ok(sealed) => sealed,
                Err(e) => {
                    warn!("Failed to encrypt index record {}: {}", message_id, e);
                    return Ok(MessageResult::Failed);
                }
            };
            let entry = SearchIndexEntry::new(&header, false, false, iv, ciphertext);
            ctx.store.insert(&entry).await?;
            return Ok(MessageResult::IndexedWithoutBody);
        }

        let detail = match MessageDetail::from_downloaded(header) {
            Some(detail) => detail,
            None => match self.fetch_detail(session, &message_id).await {
                Ok(detail) => detail,
                Err(e) => {
                    warn!("Skipping message {} of {}: {}", message_id, ctx.user_id, e);
                    return Ok(MessageResult::Failed);
                }
            },
        };

        let (entry, _) = match self.seal(ctx, &detail) {
            Ok(sealed) => sealed,
            Err(e) => {
                warn!("Failed to encrypt index record {}: {}", message_id, e);
                return Ok(MessageResult::Failed);
            }
        };
        ctx.store.insert(&entry).await?;

        Ok(if entry.has_body {
            MessageResult::Indexed
        } else {
            MessageResult::IndexedWithoutBody
        })
    }

    /// Decrypt, clean and seal one message into an index entry
    ///
    /// A body that cannot be decrypted yields a metadata-only entry flagged
    /// as failed rather than an error.
    pub fn seal(
        &self,
        ctx: &UserContext,
        detail: &MessageDetail,
    ) -> Result<(SearchIndexEntry, DecryptedContent)> {
        let (content, has_body, decryption_failed) =
            match self.decrypter.decrypt_body(&ctx.user_id, detail) {
                Ok(body) => {
                    let text = self.extractor.extract(&body, &detail.mime_type);
                    (DecryptedContent::with_body(&detail.header, text), true, false)
                }
                Err(e) => {
                    warn!("Indexing metadata only for {}: {}", detail.id(), e);
                    (DecryptedContent::metadata_only(&detail.header), false, true)
                }
            };

        let (iv, ciphertext) = ctx.cipher.encrypt_record(&content)?;
        let entry = SearchIndexEntry::new(&detail.header, has_body, decryption_failed, iv, ciphertext);
        Ok((entry, content))
    }

    /// Fetch a message detail, waiting out rate limits as the server asks
    pub async fn fetch_detail(
        &self,
        session: &Mutex<IndexingSession>,
        message_id: &str,
    ) -> Result<MessageDetail> {
        let mut retries = 0;
        loop {
            match self.transport.fetch_message_detail(message_id).await? {
                DetailResponse::Detail(detail) => return Ok(detail),
                DetailResponse::RateLimited {
                    retry_after: Some(seconds),
                } if retries < self.config.max_rate_limit_retries => {
                    retries += 1;
                    session.lock().await.rate_limit_retries += 1;
                    debug!(
                        "Rate limited fetching {}, retrying in {}s ({}/{})",
                        message_id, seconds, retries, self.config.max_rate_limit_retries
                    );
                    tokio::time::sleep(Duration::from_secs(seconds)).await;
                }
                DetailResponse::RateLimited { retry_after } => {
                    return Err(SearchError::RateLimited {
                        retry_after: retry_after.unwrap_or(0),
                    });
                }
            }
        }
    }
}

/// Next inclusive end time: the page's oldest time, or one second earlier
/// when the page did not move the cursor
fn step_back(previous: Option<i64>, min_time: i64) -> i64 {
    match previous {
        Some(previous) if min_time >= previous => previous - 1,
        _ => min_time,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SearchConfig;
    use crate::crypto::{KeyProvider, MemoryKeyStorage};
    use crate::remote::{MemoryTransport, PlaintextDecrypter};
    use crate::resources::FixedMemoryProbe;
    use tempfile::TempDir;

    struct FailingDecrypter(&'static str);

    impl MessageDecrypter for FailingDecrypter {
        fn decrypt_body(&self, _user_id: &str, detail: &MessageDetail) -> Result<String> {
            if detail.id() == self.0 {
                Err(SearchError::Decryption("bad session key".to_string()))
            } else {
                Ok(detail.body.clone())
            }
        }
    }

    fn message(i: i64) -> MessageDetail {
        MessageDetail {
            header: MessageHeader {
                id: format!("m{}", i),
                time: 1_000 + i,
                subject: format!("Subject {}", i),
                ..Default::default()
            },
            body: format!("<p>body {}</p>", i),
            mime_type: "text/html".to_string(),
        }
    }

    async fn setup(
        dir: &TempDir,
        page_size: usize,
    ) -> (SearchConfig, UserContext, Mutex<IndexingSession>) {
        let mut config = SearchConfig::default();
        config.index.directory = dir.path().to_path_buf();
        config.indexing.page_size = page_size;
        let keys = KeyProvider::new(Arc::new(MemoryKeyStorage::new()));
        let ctx = UserContext::open(&config, &keys, "user-1").await.unwrap();
        (config, ctx, Mutex::new(IndexingSession::new("user-1")))
    }

    fn builder(
        config: &SearchConfig,
        transport: Arc<MemoryTransport>,
        decrypter: Arc<dyn MessageDecrypter>,
    ) -> IndexBuilder {
        IndexBuilder::new(
            config.indexing.clone(),
            &config.index,
            transport,
            decrypter,
            Arc::new(Throttle::new(&config.indexing)),
            Arc::new(FixedMemoryProbe(1 << 30)),
        )
        .unwrap()
    }

    struct BusyProcess(u8);

    impl MemoryProbe for BusyProcess {
        fn available_bytes(&self) -> u64 {
            1 << 30
        }

        fn process_usage_percent(&self) -> u8 {
            self.0
        }
    }

    fn paced_builder(config: &SearchConfig, usage: u8) -> IndexBuilder {
        IndexBuilder::new(
            config.indexing.clone(),
            &config.index,
            Arc::new(MemoryTransport::new(Vec::new())),
            Arc::new(PlaintextDecrypter),
            Arc::new(Throttle::new(&config.indexing)),
            Arc::new(BusyProcess(usage)),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_full_build_over_several_pages() {
        let dir = TempDir::new().unwrap();
        let (config, ctx, session) = setup(&dir, 4).await;
        let transport = Arc::new(MemoryTransport::new((0..10).map(message).collect()));
        let builder = builder(&config, transport.clone(), Arc::new(PlaintextDecrypter));

        let outcome = builder
            .run(&ctx, &session, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, BuildOutcome::Complete);
        assert_eq!(ctx.store.count().await.unwrap(), 10);
        assert_eq!(session.lock().await.last_indexed_time, Some(1_009));
        assert_eq!(transport.page_requests()[0], None);
        assert_eq!(transport.page_requests()[1], Some(1_006));
    }

    #[tokio::test]
    async fn test_complete_index_is_not_rebuilt() {
        let dir = TempDir::new().unwrap();
        let (config, ctx, session) = setup(&dir, 50).await;
        let transport = Arc::new(MemoryTransport::new((0..3).map(message).collect()));
        let builder = builder(&config, transport.clone(), Arc::new(PlaintextDecrypter));
        builder.run(&ctx, &session, &CancellationToken::new()).await.unwrap();
        let fetches = transport.detail_fetches();

        let session = Mutex::new(IndexingSession::new("user-1"));
        let outcome = builder.run(&ctx, &session, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, BuildOutcome::Complete);
        assert_eq!(transport.detail_fetches(), fetches);
        assert_eq!(transport.page_requests().len(), 1);
    }

    #[tokio::test]
    async fn test_decryption_failure_indexes_metadata() {
        let dir = TempDir::new().unwrap();
        let (config, ctx, session) = setup(&dir, 50).await;
        let transport = Arc::new(MemoryTransport::new((0..4).map(message).collect()));
        let builder = builder(&config, transport, Arc::new(FailingDecrypter("m2")));

        let outcome = builder.run(&ctx, &session, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, BuildOutcome::Complete);

        let failed = ctx.store.get("m2").await.unwrap().unwrap();
        assert!(failed.decryption_failed);
        assert!(!failed.has_body);
        let content: DecryptedContent = ctx.cipher.decrypt_record(&failed.iv, &failed.ciphertext).unwrap();
        assert!(content.body.is_none());

        let ok = ctx.store.get("m1").await.unwrap().unwrap();
        assert!(!ok.decryption_failed);
        assert!(ok.has_body);
    }

    #[tokio::test]
    async fn test_rate_limit_is_retried() {
        let dir = TempDir::new().unwrap();
        let (config, ctx, session) = setup(&dir, 50).await;
        let transport = Arc::new(MemoryTransport::new((0..2).map(message).collect()));
        transport.rate_limit("m1", 2, Some(0));
        let builder = builder(&config, transport.clone(), Arc::new(PlaintextDecrypter));

        let outcome = builder.run(&ctx, &session, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, BuildOutcome::Complete);
        assert_eq!(session.lock().await.rate_limit_retries, 2);
    }

    #[tokio::test]
    async fn test_rate_limit_without_retry_after_fails_message() {
        let dir = TempDir::new().unwrap();
        let (config, ctx, session) = setup(&dir, 50).await;
        let transport = Arc::new(MemoryTransport::new((0..3).map(message).collect()));
        transport.rate_limit("m1", 100, None);
        let builder = builder(&config, transport, Arc::new(PlaintextDecrypter));

        // The remote runs dry while one message is still missing
        let outcome = builder.run(&ctx, &session, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, BuildOutcome::RemoteExhausted);
        assert_eq!(ctx.store.count().await.unwrap(), 2);
        assert!(session.lock().await.failed_messages >= 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_page() {
        let dir = TempDir::new().unwrap();
        let (config, ctx, session) = setup(&dir, 50).await;
        let transport = Arc::new(MemoryTransport::new((0..3).map(message).collect()));
        let builder = builder(&config, transport.clone(), Arc::new(PlaintextDecrypter));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = builder.run(&ctx, &session, &cancel).await.unwrap();
        assert_eq!(outcome, BuildOutcome::Cancelled);
        assert!(transport.page_requests().is_empty());
    }

    #[tokio::test]
    async fn test_storage_limit_stops_build() {
        let dir = TempDir::new().unwrap();
        let (mut config, ctx, session) = setup(&dir, 50).await;
        config.index.storage_limit = 100;
        let transport = Arc::new(MemoryTransport::new((0..3).map(message).collect()));
        let builder = builder(&config, transport, Arc::new(PlaintextDecrypter));

        let outcome = builder.run(&ctx, &session, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, BuildOutcome::StorageLimit);
    }

    #[test]
    fn test_memory_pressure_shrinks_pages() {
        let mut config = SearchConfig::default();
        config.indexing.page_size = 50;
        config.indexing.full_speed_workers = 8;
        config.indexing.throttled_workers = 2;

        assert_eq!(paced_builder(&config, 5).pace(), (50, 8));
        assert_eq!(paced_builder(&config, 12).pace(), (8, 8));
        assert_eq!(paced_builder(&config, 20).pace(), (1, 1));

        let throttled = paced_builder(&config, 12);
        throttled.throttle().set_full_speed(false);
        assert_eq!(throttled.pace(), (8, 2));

        config.indexing.metadata_only = true;
        assert_eq!(paced_builder(&config, 20).pace(), (METADATA_PAGE_SIZE, 8));
    }

    #[tokio::test]
    async fn test_metadata_only_build_skips_bodies() {
        let dir = TempDir::new().unwrap();
        let (mut config, ctx, session) = setup(&dir, 50).await;
        config.indexing.metadata_only = true;
        let transport = Arc::new(MemoryTransport::new((0..5).map(message).collect()));
        let builder = builder(&config, transport.clone(), Arc::new(PlaintextDecrypter));

        let outcome = builder.run(&ctx, &session, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, BuildOutcome::Complete);
        assert_eq!(transport.detail_fetches(), 0);
        assert_eq!(transport.page_requests().len(), 1);

        let entry = ctx.store.get("m3").await.unwrap().unwrap();
        assert!(!entry.has_body);
        assert!(!entry.decryption_failed);
    }

    #[test]
    fn test_throttle_switches_width() {
        let mut config = IndexingConfig::default();
        config.full_speed_workers = 8;
        config.throttled_workers = 2;
        let throttle = Throttle::new(&config);
        assert_eq!(throttle.width(), 8);
        throttle.set_full_speed(false);
        assert_eq!(throttle.width(), 2);
        assert!(!throttle.is_full_speed());
    }

    #[test]
    fn test_step_back() {
        assert_eq!(step_back(None, 10), 10);
        assert_eq!(step_back(Some(20), 10), 10);
        assert_eq!(step_back(Some(10), 10), 9);
    }
}
