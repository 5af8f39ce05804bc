//! Per-user encrypted index table backed by SQLite

use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::types::{RecencyCursor, SearchIndexEntry};
use crate::config::{check_user_id, SearchConfig};
use crate::error::{Result, SearchError};

#[derive(sqlx::FromRow)]
struct EntryRow {
    message_id: String,
    time: i64,
    msg_order: i64,
    label_ids: String,
    location: i64,
    unread: bool,
    starred: Option<bool>,
    has_body: bool,
    decryption_failed: bool,
    iv: Vec<u8>,
    ciphertext: Vec<u8>,
    ciphertext_file: Option<String>,
    size: i64,
}

const SELECT_ENTRY: &str = r#"
    SELECT message_id, time, msg_order, label_ids, location, unread, starred,
           has_body, decryption_failed, iv, ciphertext, ciphertext_file, size
    FROM search_index
"#;

/// Encrypted index of one user
///
/// Writes (insert, delete, compaction) go through a single writer lock.
/// Reads share a gate that only eviction takes exclusively.
pub struct IndexStore {
    user_id: String,
    path: PathBuf,
    content_dir: PathBuf,
    externalize_threshold: usize,
    pool: SqlitePool,
    writer: Mutex<()>,
    gate: RwLock<()>,
}

fn write_err(e: sqlx::Error) -> SearchError {
    SearchError::StoreWrite(e.to_string())
}

fn read_err(e: sqlx::Error) -> SearchError {
    SearchError::StoreRead(e.to_string())
}

fn remove_content_file(file: &str) {
    if let Err(e) = std::fs::remove_file(file) {
        warn!("Failed to remove index content file {}: {}", file, e);
    }
}

impl IndexStore {
    /// Open (creating if needed) the index file of `user_id`
    pub async fn open(config: &SearchConfig, user_id: &str) -> Result<Self> {
        check_user_id(user_id)?;

        let path = config.index_path(user_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SearchError::StoreOpen(format!("{}: {}", parent.display(), e)))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Delete)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| SearchError::StoreOpen(format!("{}: {}", path.display(), e)))?;

        let content_dir = path.with_extension("content");

        let store = Self {
            user_id: user_id.to_string(),
            path,
            content_dir,
            externalize_threshold: config.index.externalize_threshold,
            pool,
            writer: Mutex::new(()),
            gate: RwLock::new(()),
        };
        store.init_db().await?;

        debug!("Opened search index for {} at {}", user_id, store.path.display());
        Ok(store)
    }

    /// Whether an index file exists for `user_id`
    pub fn exists_for(config: &SearchConfig, user_id: &str) -> bool {
        check_user_id(user_id).is_ok() && config.index_path(user_id).exists()
    }

    async fn init_db(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS search_index (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id TEXT NOT NULL UNIQUE,
                time INTEGER NOT NULL,
                msg_order INTEGER NOT NULL,
                label_ids TEXT NOT NULL,
                location INTEGER NOT NULL,
                unread INTEGER NOT NULL,
                starred INTEGER,
                has_body INTEGER NOT NULL,
                decryption_failed INTEGER NOT NULL,
                iv BLOB NOT NULL,
                ciphertext BLOB NOT NULL,
                ciphertext_file TEXT,
                size INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| SearchError::StoreOpen(e.to_string()))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_search_index_recency ON search_index(time, msg_order, message_id)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| SearchError::StoreOpen(e.to_string()))?;

        Ok(())
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    fn content_path(&self, message_id: &str) -> PathBuf {
        let digest = Sha256::digest(message_id.as_bytes());
        self.content_dir.join(format!("{:x}.bin", digest))
    }

    /// Insert or replace the entry for its message id, returning the row id
    pub async fn insert(&self, entry: &SearchIndexEntry) -> Result<i64> {
        let _writer = self.writer.lock().await;

        let previous = sqlx::query_as::<_, (Option<String>,)>(
            "SELECT ciphertext_file FROM search_index WHERE message_id = ?",
        )
        .bind(&entry.message_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(write_err)?
        .and_then(|(file,)| file);

        let (blob, file): (&[u8], Option<String>) =
            if entry.ciphertext.len() > self.externalize_threshold {
                std::fs::create_dir_all(&self.content_dir)?;
                let file = self.content_path(&entry.message_id);
                std::fs::write(&file, &entry.ciphertext)
                    .map_err(|e| SearchError::StoreWrite(format!("{}: {}", file.display(), e)))?;
                (&[], Some(file.to_string_lossy().into_owned()))
            } else {
                (&entry.ciphertext, None)
            };

        let written = sqlx::query(
            r#"
            INSERT INTO search_index (
                message_id, time, msg_order, label_ids, location, unread, starred,
                has_body, decryption_failed, iv, ciphertext, ciphertext_file, size
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(message_id) DO UPDATE SET
                time = excluded.time,
                msg_order = excluded.msg_order,
                label_ids = excluded.label_ids,
                location = excluded.location,
                unread = excluded.unread,
                starred = excluded.starred,
                has_body = excluded.has_body,
                decryption_failed = excluded.decryption_failed,
                iv = excluded.iv,
                ciphertext = excluded.ciphertext,
                ciphertext_file = excluded.ciphertext_file,
                size = excluded.size
            "#,
        )
        .bind(&entry.message_id)
        .bind(entry.time)
        .bind(entry.order)
        .bind(entry.label_ids.join(";"))
        .bind(entry.location)
        .bind(entry.unread)
        .bind(entry.starred)
        .bind(entry.has_body)
        .bind(entry.decryption_failed)
        .bind(&entry.iv)
        .bind(blob)
        .bind(&file)
        .bind(entry.ciphertext.len() as i64)
        .execute(&self.pool)
        .await;

        if let Err(e) = written {
            // A file that replaced an existing row's content stays for that row
            if let (Some(file), None) = (&file, &previous) {
                remove_content_file(file);
            }
            return Err(write_err(e));
        }
        if let Some(previous) = previous {
            if file.as_deref() != Some(previous.as_str()) {
                remove_content_file(&previous);
            }
        }

        let (id,) = sqlx::query_as::<_, (i64,)>("SELECT id FROM search_index WHERE message_id = ?")
            .bind(&entry.message_id)
            .fetch_one(&self.pool)
            .await
            .map_err(write_err)?;

        Ok(id)
    }

    /// Replace the sealed content of an existing entry; false if absent
    pub async fn update_content(&self, entry: &SearchIndexEntry) -> Result<bool> {
        if !self.contains(&entry.message_id).await? {
            return Ok(false);
        }
        self.insert(entry).await?;
        Ok(true)
    }

    pub async fn delete(&self, message_id: &str) -> Result<bool> {
        let _writer = self.writer.lock().await;
        self.delete_locked(message_id).await
    }

    async fn delete_locked(&self, message_id: &str) -> Result<bool> {
        let file = sqlx::query_as::<_, (Option<String>,)>(
            "SELECT ciphertext_file FROM search_index WHERE message_id = ?",
        )
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(write_err)?;

        let Some((file,)) = file else {
            return Ok(false);
        };

        sqlx::query("DELETE FROM search_index WHERE message_id = ?")
            .bind(message_id)
            .execute(&self.pool)
            .await
            .map_err(write_err)?;

        if let Some(file) = file {
            remove_content_file(&file);
        }

        Ok(true)
    }

    pub async fn count(&self) -> Result<usize> {
        let _gate = self.gate.read().await;
        let (count,) = sqlx::query_as::<_, (i64,)>("SELECT COUNT(*) FROM search_index")
            .fetch_one(&self.pool)
            .await
            .map_err(read_err)?;
        Ok(count as usize)
    }

    pub async fn contains(&self, message_id: &str) -> Result<bool> {
        let _gate = self.gate.read().await;
        let row = sqlx::query_as::<_, (i64,)>("SELECT 1 FROM search_index WHERE message_id = ?")
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(read_err)?;
        Ok(row.is_some())
    }

    pub async fn oldest_time(&self) -> Result<Option<i64>> {
        let _gate = self.gate.read().await;
        let (time,) = sqlx::query_as::<_, (Option<i64>,)>("SELECT MIN(time) FROM search_index")
            .fetch_one(&self.pool)
            .await
            .map_err(read_err)?;
        Ok(time)
    }

    pub async fn newest_time(&self) -> Result<Option<i64>> {
        let _gate = self.gate.read().await;
        let (time,) = sqlx::query_as::<_, (Option<i64>,)>("SELECT MAX(time) FROM search_index")
            .fetch_one(&self.pool)
            .await
            .map_err(read_err)?;
        Ok(time)
    }

    pub async fn get(&self, message_id: &str) -> Result<Option<SearchIndexEntry>> {
        let _gate = self.gate.read().await;
        let row = sqlx::query_as::<_, EntryRow>(&format!("{} WHERE message_id = ?", SELECT_ENTRY))
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(read_err)?;

        row.map(Self::entry_from_row).transpose()
    }

    /// Entries strictly after `cursor` in (time desc, order desc, id desc) order
    ///
    /// Rows whose content can no longer be read are skipped.
    pub async fn page_by_recency(
        &self,
        cursor: Option<&RecencyCursor>,
        limit: usize,
    ) -> Result<Vec<SearchIndexEntry>> {
        let _gate = self.gate.read().await;

        let rows = match cursor {
            None => {
                sqlx::query_as::<_, EntryRow>(&format!(
                    "{} ORDER BY time DESC, msg_order DESC, message_id DESC LIMIT ?",
                    SELECT_ENTRY
                ))
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
            }
            Some(cursor) => {
                sqlx::query_as::<_, EntryRow>(&format!(
                    r#"{}
                    WHERE time < ?
                       OR (time = ? AND msg_order < ?)
                       OR (time = ? AND msg_order = ? AND message_id < ?)
                    ORDER BY time DESC, msg_order DESC, message_id DESC
                    LIMIT ?"#,
                    SELECT_ENTRY
                ))
                .bind(cursor.time)
                .bind(cursor.time)
                .bind(cursor.order)
                .bind(cursor.time)
                .bind(cursor.order)
                .bind(&cursor.message_id)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(read_err)?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let message_id = row.message_id.clone();
            match Self::entry_from_row(row) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!("Skipping unreadable index row {}: {}", message_id, e),
            }
        }
        Ok(entries)
    }

    /// Ids of entries with `time >= since`
    pub async fn message_ids_since(&self, since: i64) -> Result<Vec<String>> {
        let _gate = self.gate.read().await;
        let rows = sqlx::query_as::<_, (String,)>(
            "SELECT message_id FROM search_index WHERE time >= ? ORDER BY time DESC",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(read_err)?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    fn entry_from_row(row: EntryRow) -> Result<SearchIndexEntry> {
        let ciphertext = match &row.ciphertext_file {
            Some(file) => std::fs::read(file)
                .map_err(|e| SearchError::StoreRead(format!("{}: {}", file, e)))?,
            None => row.ciphertext,
        };

        if ciphertext.len() as i64 != row.size {
            return Err(SearchError::StoreRead(format!(
                "ciphertext of {} has {} bytes, expected {}",
                row.message_id,
                ciphertext.len(),
                row.size
            )));
        }

        Ok(SearchIndexEntry {
            message_id: row.message_id,
            time: row.time,
            order: row.msg_order,
            label_ids: row
                .label_ids
                .split(';')
                .filter(|l| !l.is_empty())
                .map(String::from)
                .collect(),
            starred: row.starred,
            unread: row.unread,
            location: row.location,
            has_body: row.has_body,
            decryption_failed: row.decryption_failed,
            iv: row.iv,
            ciphertext,
            ciphertext_file: row.ciphertext_file.map(PathBuf::from),
            ciphertext_size: row.size as usize,
        })
    }

    /// Bytes used by the index file and its side files
    pub fn size_on_disk(&self) -> Result<u64> {
        let mut size = 0;
        for path in [
            self.path.clone(),
            PathBuf::from(format!("{}-journal", self.path.display())),
            PathBuf::from(format!("{}-wal", self.path.display())),
        ] {
            if let Ok(meta) = std::fs::metadata(&path) {
                size += meta.len();
            }
        }

        if self.content_dir.is_dir() {
            for file in std::fs::read_dir(&self.content_dir)? {
                let file = file?;
                size += file.metadata()?.len();
            }
        }

        Ok(size)
    }

    /// Reclaim space left by deletions
    pub async fn compact(&self) -> Result<()> {
        let _writer = self.writer.lock().await;
        self.vacuum().await
    }

    async fn vacuum(&self) -> Result<()> {
        sqlx::query("VACUUM")
            .execute(&self.pool)
            .await
            .map_err(write_err)?;
        Ok(())
    }

    /// Evict the oldest entries until the store fits in `target_bytes` or is
    /// empty. Returns the number of evicted entries.
    pub async fn resize(&self, target_bytes: u64) -> Result<usize> {
        let _writer = self.writer.lock().await;
        let _gate = self.gate.write().await;

        let mut removed = 0;
        loop {
            let size = self.size_on_disk()?;
            if size <= target_bytes {
                break;
            }

            let oldest = sqlx::query_as::<_, (String,)>(
                "SELECT message_id FROM search_index ORDER BY time ASC LIMIT 1",
            )
            .fetch_optional(&self.pool)
            .await
            .map_err(write_err)?;

            let Some((message_id,)) = oldest else {
                break;
            };

            self.delete_locked(&message_id).await?;
            self.vacuum().await?;
            removed += 1;
        }

        if removed > 0 {
            info!(
                "Evicted {} entries from search index of {} (target {} bytes)",
                removed, self.user_id, target_bytes
            );
        }
        Ok(removed)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Close the store and remove every file belonging to it
    pub async fn delete_all(&self) -> Result<()> {
        let _writer = self.writer.lock().await;
        let _gate = self.gate.write().await;

        self.pool.close().await;

        for path in [
            self.path.clone(),
            PathBuf::from(format!("{}-journal", self.path.display())),
            PathBuf::from(format!("{}-wal", self.path.display())),
            PathBuf::from(format!("{}-shm", self.path.display())),
        ] {
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
        }
        if self.content_dir.exists() {
            std::fs::remove_dir_all(&self.content_dir)?;
        }

        info!("Deleted search index of {}", self.user_id);
        Ok(())
    }
}
