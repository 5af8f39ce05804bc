//! Query execution over the cache, then the encrypted index

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use super::types::{HitSource, SearchEvent, SearchHit, SearchPage, SearchState};
use crate::cache::{CacheManager, CachedMessage};
use crate::config::SearchSettings;
use crate::engine::UserContext;
use crate::error::Result;
use crate::index::DecryptedContent;
use crate::resources::{records_for_budget, MemoryProbe};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlowState {
    Waiting,
    Raised,
    Found,
}

/// Raises the slow-search flag when no result arrived in time and clears it
/// with the first result
///
/// The state is checked and the event sent under one lock, so a late timer
/// can never raise the flag after results went out.
struct SlowSearchSignal {
    state: Arc<Mutex<SlowState>>,
    events: Option<UnboundedSender<SearchEvent>>,
    timer: Option<tokio::task::JoinHandle<()>>,
}

fn lock_state(state: &Mutex<SlowState>) -> std::sync::MutexGuard<'_, SlowState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SlowSearchSignal {
    fn start(delay: Duration, events: Option<UnboundedSender<SearchEvent>>) -> Self {
        let state = Arc::new(Mutex::new(SlowState::Waiting));

        let timer = events.clone().map(|tx| {
            let state = state.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let mut state = lock_state(&state);
                if *state == SlowState::Waiting {
                    *state = SlowState::Raised;
                    let _ = tx.send(SearchEvent::SlowSearch(true));
                }
            })
        });

        Self {
            state,
            events,
            timer,
        }
    }

    fn publish(&self, hits: &[SearchHit]) {
        if hits.is_empty() {
            return;
        }
        let mut state = lock_state(&self.state);
        let was = std::mem::replace(&mut *state, SlowState::Found);
        if let Some(tx) = &self.events {
            if was == SlowState::Raised {
                let _ = tx.send(SearchEvent::SlowSearch(false));
            }
            let _ = tx.send(SearchEvent::Results(hits.to_vec()));
        }
    }
}

impl Drop for SlowSearchSignal {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

pub struct SearchExecutor {
    settings: SearchSettings,
    estimated_message_bytes: f64,
    probe: Arc<dyn MemoryProbe>,
    cache: Arc<CacheManager>,
}

impl SearchExecutor {
    pub fn new(
        settings: SearchSettings,
        estimated_message_bytes: f64,
        probe: Arc<dyn MemoryProbe>,
        cache: Arc<CacheManager>,
    ) -> Self {
        Self {
            settings,
            estimated_message_bytes,
            probe,
            cache,
        }
    }

    /// Number of index entries decrypted per batch
    pub fn index_batch_size(&self) -> usize {
        records_for_budget(
            self.probe.as_ref(),
            self.settings.batch_heap_fraction,
            self.estimated_message_bytes,
        )
    }

    /// Produce the next page of `state`'s query
    ///
    /// Partial batches go to `events` as soon as they are found.
    pub async fn execute(
        &self,
        ctx: &UserContext,
        state: &mut SearchState,
        events: Option<UnboundedSender<SearchEvent>>,
    ) -> Result<SearchPage> {
        let started = Instant::now();

        if state.query.is_empty() {
            state.cache_search_done = true;
            state.index_search_complete = true;
            return Ok(SearchPage {
                hits: Vec::new(),
                exhausted: true,
                duration: started.elapsed(),
            });
        }

        let signal = SlowSearchSignal::start(Duration::from_secs(self.settings.slow_search_secs), events);
        let threshold = self.settings.page_size;
        let context = self.settings.preview_context;
        let mut hits: Vec<SearchHit> = Vec::new();

        if state.pages_served == 0 {
            self.position_index_cursor(state).await;
        }

        while hits.len() < threshold && !state.cache_search_done {
            let batch = self.cache.search(state, threshold - hits.len(), context).await;
            let batch = Self::unseen(state, batch);
            signal.publish(&batch);
            hits.extend(batch);
        }

        if hits.len() < threshold && !state.index_search_complete {
            self.search_index(ctx, state, &signal, &mut hits, threshold).await?;
        }

        state.pages_served += 1;
        debug!(
            "Search page {} for {}: {} hits in {:?}",
            state.pages_served,
            ctx.user_id,
            hits.len(),
            started.elapsed()
        );

        Ok(SearchPage {
            hits,
            exhausted: state.is_exhausted(),
            duration: started.elapsed(),
        })
    }

    /// Skip the part of the index the cache already covers
    async fn position_index_cursor(&self, state: &mut SearchState) {
        match self.cache.coverage(&state.user_id).await {
            Some(coverage) if !coverage.partial => state.index_search_complete = true,
            Some(coverage) => state.index_cursor = coverage.loaded_until,
            None => {}
        }
    }

    async fn search_index(
        &self,
        ctx: &UserContext,
        state: &mut SearchState,
        signal: &SlowSearchSignal,
        hits: &mut Vec<SearchHit>,
        threshold: usize,
    ) -> Result<()> {
        let batch_size = self.index_batch_size();
        let entry_count = ctx.store.count().await?;
        let context = self.settings.preview_context;

        while hits.len() < threshold && !state.index_search_complete {
            // Guards against a cursor that stops advancing
            if state.index_batches > entry_count {
                warn!("Index search for {} exceeded {} batches", ctx.user_id, entry_count);
                state.index_search_complete = true;
                break;
            }

            let entries = ctx
                .store
                .page_by_recency(state.index_cursor.as_ref(), batch_size)
                .await?;
            state.index_batches += 1;

            if entries.is_empty() {
                state.index_search_complete = true;
                break;
            }

            let fetched = entries.len();
            let mut consumed = 0;
            let mut batch = Vec::new();
            for entry in entries {
                consumed += 1;
                state.index_cursor = Some(entry.recency_key());

                let content: DecryptedContent =
                    match ctx.cipher.decrypt_record(&entry.iv, &entry.ciphertext) {
                        Ok(content) => content,
                        Err(e) => {
                            warn!("Skipping undecryptable index entry {}: {}", entry.message_id, e);
                            continue;
                        }
                    };

                let message = CachedMessage::from_entry(&entry, content);
                if message.matches(&state.query) && !state.seen.contains(message.message_id()) {
                    state.seen.insert(message.message_id().to_string());
                    batch.push(message.to_hit(&state.query, context, HitSource::Index));
                    if hits.len() + batch.len() >= threshold {
                        break;
                    }
                }
            }

            if consumed == fetched && fetched < batch_size {
                state.index_search_complete = true;
            }

            signal.publish(&batch);
            hits.extend(batch);
        }

        Ok(())
    }

    fn unseen(state: &mut SearchState, batch: Vec<SearchHit>) -> Vec<SearchHit> {
        batch
            .into_iter()
            .filter(|hit| state.seen.insert(hit.message_id.clone()))
            .collect()
    }
}
