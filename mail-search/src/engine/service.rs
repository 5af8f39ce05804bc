//! Encrypted search service for the signed-in user
//!
//! Ties the per-user context to the state machine: transitions decide when
//! the build task runs, the task reports back when it stops, and everything
//! the user sees goes out as an [`IndexStatus`] on a watch channel.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::context::UserContext;
use super::status::IndexStatus;
use crate::cache::{CacheInfo, CacheManager, CachedMessage};
use crate::config::{check_user_id, SearchConfig};
use crate::crypto::{KeyProvider, SecureKeyStorage};
use crate::error::{Result, SearchError};
use crate::index::{DecryptedContent, IndexStore};
use crate::indexing::{
    format_eta, percentage, BuildOutcome, IndexBuilder, IndexingSession, ProgressEstimator,
    Throttle,
};
use crate::remote::{BackgroundExecution, MailTransport, MessageDecrypter, NoBackgroundExecution};
use crate::resources::{MemoryProbe, ResourceMonitor, ResourceSignal, SystemMemoryProbe};
use crate::search::{SearchEvent, SearchExecutor, SearchPage, SearchState};
use crate::state::{
    BuildAction, IndexingState, IndexingStateMachine, MessageMutation, PauseReasons, Transition,
};
use crate::telemetry::{
    dispatch, IndexTelemetry, SearchTelemetry, TelemetryEvent, TelemetrySink, TracingTelemetry,
};

/// Host services the search engine depends on
pub struct Collaborators {
    pub transport: Arc<dyn MailTransport>,
    pub decrypter: Arc<dyn MessageDecrypter>,
    pub key_storage: Arc<dyn SecureKeyStorage>,
    pub background: Arc<dyn BackgroundExecution>,
    pub telemetry: Arc<dyn TelemetrySink>,
    pub memory: Arc<dyn MemoryProbe>,
}

impl Collaborators {
    pub fn new(
        transport: Arc<dyn MailTransport>,
        decrypter: Arc<dyn MessageDecrypter>,
        key_storage: Arc<dyn SecureKeyStorage>,
    ) -> Self {
        Self {
            transport,
            decrypter,
            key_storage,
            background: Arc::new(NoBackgroundExecution),
            telemetry: Arc::new(TracingTelemetry),
            memory: Arc::new(SystemMemoryProbe::new()),
        }
    }

    pub fn with_background(mut self, background: Arc<dyn BackgroundExecution>) -> Self {
        self.background = background;
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn with_memory_probe(mut self, memory: Arc<dyn MemoryProbe>) -> Self {
        self.memory = memory;
        self
    }
}

/// What became of a message change handed to the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOutcome {
    Applied,
    /// Queued until the running build finishes
    Buffered,
    /// Search is off for the user
    Ignored,
}

struct BuildTask {
    id: u64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct UserState {
    user_id: String,
    ctx: Option<UserContext>,
    machine: IndexingStateMachine,
    session: Arc<Mutex<IndexingSession>>,
    task: Option<BuildTask>,
    /// Cancelled task that may still be finishing its last page
    stopping: Option<BuildTask>,
    estimator: Option<ProgressEstimator>,
    eta: Option<String>,
    original_estimate: Option<u64>,
    /// Speed stays reduced after a background window ran out
    downgraded: bool,
    searched: bool,
    last_error: Option<String>,
}

impl UserState {
    fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            ctx: None,
            machine: IndexingStateMachine::new(IndexingState::Disabled),
            session: Arc::new(Mutex::new(IndexingSession::new(user_id))),
            task: None,
            stopping: None,
            estimator: None,
            eta: None,
            original_estimate: None,
            downgraded: false,
            searched: false,
            last_error: None,
        }
    }

    fn reset_session(&mut self) {
        self.session = Arc::new(Mutex::new(IndexingSession::new(&self.user_id)));
        self.estimator = None;
        self.eta = None;
        self.original_estimate = None;
    }

    fn context(&self) -> Result<UserContext> {
        self.ctx
            .clone()
            .ok_or_else(|| SearchError::Disabled(self.user_id.clone()))
    }

    fn is_running(&self) -> bool {
        self.task.is_some() || self.stopping.is_some()
    }
}

struct Inner {
    config: SearchConfig,
    keys: KeyProvider,
    transport: Arc<dyn MailTransport>,
    background: Arc<dyn BackgroundExecution>,
    telemetry: Arc<dyn TelemetrySink>,
    cache: Arc<CacheManager>,
    executor: SearchExecutor,
    builder: IndexBuilder,
    monitor: Mutex<ResourceMonitor>,
    interactive: AtomicBool,
    user: Mutex<Option<UserState>>,
    /// Tasks of users switched away from, still finishing their last page
    detached: Mutex<HashMap<String, Vec<JoinHandle<()>>>>,
    status: watch::Sender<IndexStatus>,
    build_done: Notify,
    task_ids: AtomicU64,
}

/// Client-side encrypted search over one user's mailbox at a time
#[derive(Clone)]
pub struct EncryptedSearch {
    inner: Arc<Inner>,
}

impl EncryptedSearch {
    pub fn new(config: SearchConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;

        let throttle = Arc::new(Throttle::new(&config.indexing));
        let cache = Arc::new(CacheManager::new(
            config.cache.clone(),
            Arc::clone(&collaborators.memory),
        ));
        let executor = SearchExecutor::new(
            config.search.clone(),
            config.cache.estimated_message_bytes,
            Arc::clone(&collaborators.memory),
            Arc::clone(&cache),
        );
        let builder = IndexBuilder::new(
            config.indexing.clone(),
            &config.index,
            Arc::clone(&collaborators.transport),
            collaborators.decrypter,
            throttle,
            Arc::clone(&collaborators.memory),
        )?;
        let (status, _) = watch::channel(IndexStatus::idle());

        Ok(Self {
            inner: Arc::new(Inner {
                keys: KeyProvider::new(collaborators.key_storage),
                transport: collaborators.transport,
                background: collaborators.background,
                telemetry: collaborators.telemetry,
                monitor: Mutex::new(ResourceMonitor::new(&config.resources)),
                config,
                cache,
                executor,
                builder,
                interactive: AtomicBool::new(false),
                user: Mutex::new(None),
                detached: Mutex::new(HashMap::new()),
                status,
                build_done: Notify::new(),
                task_ids: AtomicU64::new(0),
            }),
        })
    }

    /// Make `user_id` the active user
    ///
    /// Switching users stops the previous user's build and drops their cache;
    /// their index stays on disk.
    pub async fn open_user(&self, user_id: &str) -> Result<IndexStatus> {
        check_user_id(user_id)?;
        let inner = &self.inner;
        let mut slot = inner.user.lock().await;

        if let Some(user) = slot.as_mut() {
            if user.user_id == user_id {
                return Ok(inner.publish(user).await);
            }
        }
        if let Some(mut previous) = slot.take() {
            info!("Switching search user from {} to {}", previous.user_id, user_id);
            let handles = inner.take_tasks(&mut previous);
            if !handles.is_empty() {
                inner
                    .detached
                    .lock()
                    .await
                    .entry(previous.user_id.clone())
                    .or_default()
                    .extend(handles);
            }
            inner.cache.clear().await;
        }

        let mut user = UserState::new(user_id);
        let leftover = inner.detached.lock().await.remove(user_id);
        if let Some(handles) = leftover {
            inner.adopt_detached(&mut user, handles);
        }
        if IndexStore::exists_for(&inner.config, user_id) {
            match UserContext::open(&inner.config, &inner.keys, user_id).await {
                Ok(ctx) => {
                    let initial = if ctx.store.count().await? > 0 {
                        IndexingState::Partial
                    } else {
                        IndexingState::Undetermined
                    };
                    user.machine = IndexingStateMachine::new(initial);
                    user.ctx = Some(ctx);
                }
                Err(e) => {
                    warn!("Search index of {} cannot be opened: {}", user_id, e);
                    user.machine = IndexingStateMachine::new(IndexingState::Undetermined);
                    user.last_error = Some(e.to_string());
                }
            }
        }

        let reasons = inner.monitor.lock().await.reasons();
        user.machine.update_reasons(reasons);
        inner.update_speed(&user);

        let status = inner.publish(&mut user).await;
        *slot = Some(user);
        Ok(status)
    }

    pub async fn active_user(&self) -> Option<String> {
        self.inner
            .user
            .lock()
            .await
            .as_ref()
            .map(|user| user.user_id.clone())
    }

    /// Turn search on for the active user and start the first build
    pub async fn enable(&self) -> Result<IndexStatus> {
        let inner = &self.inner;
        let mut slot = inner.user.lock().await;
        let user = slot.as_mut().ok_or(SearchError::MissingUser)?;

        if user.machine.state() != IndexingState::Disabled {
            return Err(SearchError::InvalidState(format!(
                "search of {} is already {}",
                user.user_id,
                user.machine.state()
            )));
        }
        if user.ctx.is_none() {
            user.ctx = Some(UserContext::open(&inner.config, &inner.keys, &user.user_id).await?);
        }

        user.reset_session();
        user.last_error = None;
        let t = user.machine.enable()?;
        inner.apply_transition(user, t);
        Ok(inner.publish(user).await)
    }

    /// Build or refresh the index of the active user
    ///
    /// A complete index whose entry count matches the remote total is left
    /// untouched. Running or paused builds are not restarted.
    pub async fn build(&self) -> Result<IndexStatus> {
        let inner = &self.inner;
        let mut slot = inner.user.lock().await;
        let user = slot.as_mut().ok_or(SearchError::MissingUser)?;

        let state = user.machine.state();
        if state == IndexingState::Disabled {
            return Err(SearchError::Disabled(user.user_id.clone()));
        }
        if state.is_building() || state.is_paused() {
            debug!("Build of {} already {}", user.user_id, state);
            return Ok(inner.publish(user).await);
        }

        let ctx = match user.ctx.clone() {
            Some(ctx) => ctx,
            None => {
                let ctx = UserContext::open(&inner.config, &inner.keys, &user.user_id).await?;
                user.ctx = Some(ctx.clone());
                ctx
            }
        };

        let indexed = ctx.store.count().await?;
        if state == IndexingState::Complete {
            let total = inner
                .transport
                .fetch_total_count(&inner.config.indexing.label)
                .await?;
            if indexed >= total {
                debug!("Search index of {} is already complete", user.user_id);
                return Ok(inner.publish(user).await);
            }
        }

        user.reset_session();
        let t = user.machine.start_build(indexed > 0);
        inner.apply_transition(user, t);
        Ok(inner.publish(user).await)
    }

    /// Stop building and delete the active user's index, keeping the key
    pub async fn delete_index(&self) -> Result<()> {
        let inner = &self.inner;
        let (handles, ctx, user_id) = {
            let mut slot = inner.user.lock().await;
            let user = slot.as_mut().ok_or(SearchError::MissingUser)?;

            user.machine.disable();
            let handles = inner.take_tasks(user);
            user.reset_session();
            user.last_error = None;
            let ctx = user.ctx.take();
            inner.publish(user).await;
            (handles, ctx, user.user_id.clone())
        };

        for handle in handles {
            let _ = handle.await;
        }
        inner.cache.clear().await;
        if let Some(ctx) = ctx {
            ctx.store.delete_all().await?;
        }

        info!("Deleted search index of {}", user_id);
        Ok(())
    }

    /// Turn search off: delete the index and forget its key
    pub async fn disable(&self) -> Result<()> {
        self.delete_index().await?;
        if let Some(user_id) = self.active_user().await {
            self.inner.keys.forget(&user_id).await?;
        }
        Ok(())
    }

    pub async fn pause_by_user(&self) -> Result<IndexStatus> {
        self.set_user_paused(true).await
    }

    pub async fn resume_by_user(&self) -> Result<IndexStatus> {
        self.set_user_paused(false).await
    }

    async fn set_user_paused(&self, paused: bool) -> Result<IndexStatus> {
        let inner = &self.inner;
        let mut slot = inner.user.lock().await;
        let user = slot.as_mut().ok_or(SearchError::MissingUser)?;

        let t = user.machine.set_user_paused(paused);
        inner.apply_transition(user, t);
        Ok(inner.publish(user).await)
    }

    /// Feed a device signal (network, power, thermal, storage)
    pub async fn on_resource_signal(&self, signal: ResourceSignal) -> IndexStatus {
        let inner = &self.inner;
        let reasons = inner.monitor.lock().await.apply(signal);

        let mut slot = inner.user.lock().await;
        match slot.as_mut() {
            Some(user) => {
                let reasons = PauseReasons {
                    user: user.machine.reasons().user,
                    ..reasons
                };
                let t = user.machine.update_reasons(reasons);
                inner.apply_transition(user, t);
                inner.publish(user).await
            }
            None => inner.status.borrow().clone(),
        }
    }

    /// The app left the foreground
    pub async fn enter_background(&self) -> IndexStatus {
        let inner = &self.inner;
        let window = inner.background.request_window().await;
        match window {
            Some(duration) => debug!("Background window of {:?} granted", duration),
            None => debug!("No background window granted"),
        }

        let mut slot = inner.user.lock().await;
        match slot.as_mut() {
            Some(user) => {
                user.downgraded = false;
                let t = user.machine.enter_background(window.is_some());
                inner.apply_transition(user, t);
                inner.publish(user).await
            }
            None => inner.status.borrow().clone(),
        }
    }

    /// The host withdrew the background window
    ///
    /// Work stops; when some remains a new window is requested and building
    /// continues at reduced speed.
    pub async fn background_window_expired(&self) -> IndexStatus {
        let inner = &self.inner;
        let mut slot = inner.user.lock().await;
        let Some(user) = slot.as_mut() else {
            return inner.status.borrow().clone();
        };

        let t = user.machine.window_expired();
        user.downgraded = true;
        inner.apply_transition(user, t);

        if t.action == BuildAction::Stop {
            if let Some(duration) = inner.background.request_window().await {
                debug!("Follow-up background window of {:?} granted", duration);
                let t = user.machine.window_granted();
                inner.apply_transition(user, t);
            }
        }
        inner.publish(user).await
    }

    pub async fn enter_foreground(&self) -> IndexStatus {
        let inner = &self.inner;
        let mut slot = inner.user.lock().await;
        match slot.as_mut() {
            Some(user) => {
                user.downgraded = false;
                let t = user.machine.enter_foreground();
                inner.apply_transition(user, t);
                inner.publish(user).await
            }
            None => inner.status.borrow().clone(),
        }
    }

    /// The user is busy elsewhere in the app; index at reduced speed
    pub async fn set_interactive(&self, interactive: bool) {
        let inner = &self.inner;
        inner.interactive.store(interactive, Ordering::SeqCst);
        if let Some(user) = inner.user.lock().await.as_ref() {
            inner.update_speed(user);
        }
    }

    /// Apply a message change, or queue it while a build runs
    pub async fn apply_mutation(&self, mutation: MessageMutation) -> Result<MutationOutcome> {
        let inner = &self.inner;
        let mut slot = inner.user.lock().await;
        let user = slot.as_mut().ok_or(SearchError::MissingUser)?;

        let Some(ctx) = user.ctx.clone() else {
            return Ok(MutationOutcome::Ignored);
        };
        if user.machine.state() == IndexingState::Disabled {
            return Ok(MutationOutcome::Ignored);
        }
        if user.machine.should_buffer() {
            user.machine.buffer(mutation);
            return Ok(MutationOutcome::Buffered);
        }

        // Leftovers of a failed build go first
        inner.replay(user).await;
        inner.apply_now(&ctx, mutation).await?;
        Ok(MutationOutcome::Applied)
    }

    /// Next page of results for `state`
    ///
    /// The first page builds the cache if needed; partial results go to
    /// `events` while the page is assembled.
    pub async fn search(
        &self,
        state: &mut SearchState,
        events: Option<UnboundedSender<SearchEvent>>,
    ) -> Result<SearchPage> {
        let inner = &self.inner;
        let (ctx, first_search, building) = {
            let mut slot = inner.user.lock().await;
            let user = slot.as_mut().ok_or(SearchError::MissingUser)?;
            if state.user_id != user.user_id {
                return Err(SearchError::InvalidState(format!(
                    "search state belongs to {}",
                    state.user_id
                )));
            }
            let ctx = user.context()?;
            let first_search = !user.searched;
            user.searched = true;
            (ctx, first_search, user.machine.state().is_building())
        };

        if state.pages_served == 0 && !state.query.is_empty() {
            // The index grows under a running build
            if building {
                inner.cache.clear().await;
            }
            inner.cache.build(&ctx.store, &ctx.cipher).await?;
        }

        let page = inner.executor.execute(&ctx, state, events).await?;
        if state.pages_served == 1 {
            inner.report_search(&ctx, first_search, &page).await;
        }
        Ok(page)
    }

    /// Drop and rebuild the active user's cache
    pub async fn refresh_cache(&self) -> Result<CacheInfo> {
        let ctx = {
            let slot = self.inner.user.lock().await;
            slot.as_ref().ok_or(SearchError::MissingUser)?.context()?
        };
        self.inner.cache.clear().await;
        self.inner.cache.build(&ctx.store, &ctx.cipher).await
    }

    pub async fn cache_info(&self) -> Option<CacheInfo> {
        self.inner.cache.info().await
    }

    pub async fn status(&self) -> IndexStatus {
        let inner = &self.inner;
        let mut slot = inner.user.lock().await;
        match slot.as_mut() {
            Some(user) => inner.publish(user).await,
            None => IndexStatus::idle(),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<IndexStatus> {
        self.inner.status.subscribe()
    }

    /// Apply a new size limit in bytes, evicting the oldest entries
    ///
    /// Returns how many entries were removed; a negative limit lifts it.
    pub async fn resize_index(&self, limit: i64) -> Result<usize> {
        let inner = &self.inner;
        let mut slot = inner.user.lock().await;
        let user = slot.as_mut().ok_or(SearchError::MissingUser)?;
        let ctx = user.context()?;

        inner.builder.set_storage_limit(limit);
        if limit < 0 {
            return Ok(0);
        }

        let removed = ctx.store.resize(limit as u64).await?;
        if removed > 0 {
            user.machine.mark_partial();
            inner.cache.clear().await;
        }
        inner.publish(user).await;
        Ok(removed)
    }

    /// Wait until no build task of the active user is running
    pub async fn wait_for_build(&self) -> IndexStatus {
        let inner = &self.inner;
        loop {
            let notified = inner.build_done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut slot = inner.user.lock().await;
                match slot.as_mut() {
                    Some(user) if user.is_running() => {}
                    Some(user) => return inner.publish(user).await,
                    None => return IndexStatus::idle(),
                }
            }
            notified.await;
        }
    }

    /// Stop any build and release the active user's store
    pub async fn close(&self) {
        let inner = &self.inner;
        let (handles, ctx) = {
            let mut slot = inner.user.lock().await;
            match slot.as_mut() {
                Some(user) => (inner.take_tasks(user), user.ctx.clone()),
                None => return,
            }
        };
        for handle in handles {
            let _ = handle.await;
        }
        if let Some(ctx) = ctx {
            ctx.store.close().await;
        }
    }
}

impl Inner {
    fn apply_transition(self: &Arc<Self>, user: &mut UserState, t: Transition) {
        match t.action {
            BuildAction::Start => self.spawn_build(user),
            BuildAction::Stop => self.stop_build(user),
            BuildAction::None => {}
        }
        self.update_speed(user);
    }

    fn update_speed(&self, user: &UserState) {
        let full = match user.machine.state() {
            IndexingState::Background => !user.downgraded,
            _ => user.machine.is_foreground() && !self.interactive.load(Ordering::SeqCst),
        };
        self.builder.throttle().set_full_speed(full);
    }

    fn spawn_build(self: &Arc<Self>, user: &mut UserState) {
        if user.task.is_some() {
            return;
        }
        let Some(ctx) = user.ctx.clone() else {
            warn!("Cannot build search index of {} without a store", user.user_id);
            return;
        };

        let id = self.task_ids.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        let previous = user.stopping.take();
        let session = Arc::clone(&user.session);
        let token = cancel.clone();
        let inner = Arc::clone(self);

        let handle = tokio::spawn(async move {
            // The cancelled run may still be writing its last page
            if let Some(previous) = previous {
                let _ = previous.handle.await;
            }
            let result = inner.builder.run(&ctx, &session, &token).await;
            inner.on_build_finished(&ctx.user_id, id, result).await;
        });

        debug!("Started build task {} for {}", id, user.user_id);
        self.spawn_ticker(id, cancel.child_token());
        user.task = Some(BuildTask { id, cancel, handle });
    }

    fn stop_build(&self, user: &mut UserState) {
        if let Some(task) = user.task.take() {
            debug!("Stopping build task {} for {}", task.id, user.user_id);
            task.cancel.cancel();
            user.stopping = Some(task);
        }
    }

    /// Tasks left behind by an earlier visit of this user must end before
    /// a new build writes to the same index
    fn adopt_detached(self: &Arc<Self>, user: &mut UserState, handles: Vec<JoinHandle<()>>) {
        let handles: Vec<_> = handles.into_iter().filter(|h| !h.is_finished()).collect();
        if handles.is_empty() {
            return;
        }

        let id = self.task_ids.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let inner = Arc::clone(self);
        let user_id = user.user_id.clone();
        debug!("Waiting for {} earlier build tasks of {}", handles.len(), user_id);

        let handle = tokio::spawn(async move {
            for handle in handles {
                let _ = handle.await;
            }
            inner
                .on_build_finished(&user_id, id, Ok(BuildOutcome::Cancelled))
                .await;
        });
        user.stopping = Some(BuildTask { id, cancel, handle });
    }

    fn take_tasks(&self, user: &mut UserState) -> Vec<JoinHandle<()>> {
        user.task
            .take()
            .into_iter()
            .chain(user.stopping.take())
            .map(|task| {
                task.cancel.cancel();
                task.handle
            })
            .collect()
    }

    /// Refresh progress and ETA until the task stops
    fn spawn_ticker(self: &Arc<Self>, id: u64, cancel: CancellationToken) {
        let inner = Arc::clone(self);
        let period = Duration::from_secs(self.config.indexing.progress_interval_secs.max(1));

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let mut slot = inner.user.lock().await;
                let Some(user) = slot.as_mut() else {
                    break;
                };
                if user.task.as_ref().map(|task| task.id) != Some(id) {
                    break;
                }
                inner.tick_progress(user).await;
            }
        });
    }

    async fn tick_progress(&self, user: &mut UserState) {
        let (processed, total) = {
            let session = user.session.lock().await;
            (session.processed, session.total)
        };

        let estimator = user
            .estimator
            .get_or_insert_with(|| ProgressEstimator::new(processed));
        if let Some(seconds) = estimator.estimate(processed, total) {
            user.eta = Some(format_eta(seconds));
            if user.original_estimate.is_none() {
                user.original_estimate = estimator.original_estimate();
            }
        }
        self.publish(user).await;
    }

    async fn on_build_finished(&self, user_id: &str, id: u64, result: Result<BuildOutcome>) {
        {
            let mut slot = self.user.lock().await;
            match slot.as_mut() {
                Some(user) if user.user_id == user_id => {
                    if user.stopping.as_ref().map(|task| task.id) == Some(id) {
                        user.stopping = None;
                    }
                    if user.task.as_ref().map(|task| task.id) == Some(id) {
                        if let Some(task) = user.task.take() {
                            task.cancel.cancel();
                        }
                        self.settle(user, result).await;
                    } else if let Err(e) = result {
                        debug!("Stopped build task {} of {} ended with: {}", id, user_id, e);
                    }
                    self.publish(user).await;
                }
                _ => debug!("Build task {} of inactive user {} finished", id, user_id),
            }
        }
        self.build_done.notify_waiters();
    }

    async fn settle(&self, user: &mut UserState, result: Result<BuildOutcome>) {
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Building search index of {} failed: {}", user.user_id, e);
                user.last_error = Some(e.to_string());
                if e.is_fatal_for_user() {
                    user.machine.fail();
                    return;
                }
                BuildOutcome::Stalled
            }
        };

        let t = user.machine.finish_build(outcome);
        match t.to {
            IndexingState::Complete if t.from != IndexingState::Complete => {
                if let Err(e) = self.complete(user).await {
                    warn!("Finishing search index of {} failed: {}", user.user_id, e);
                    user.last_error = Some(e.to_string());
                }
            }
            IndexingState::Partial => {
                info!("Search index of {} is partial ({:?})", user.user_id, outcome);
                self.replay(user).await;
            }
            _ => {}
        }
    }

    async fn complete(&self, user: &mut UserState) -> Result<()> {
        let ctx = user.context()?;
        ctx.store.compact().await?;

        if self.cache.is_built_for(&user.user_id).await {
            self.cache.clear().await;
            self.cache.build(&ctx.store, &ctx.cipher).await?;
        }
        self.report_index(user, &ctx).await;

        user.machine.begin_replay();
        self.replay(user).await;
        user.machine.end_replay();
        user.last_error = None;
        Ok(())
    }

    /// Apply buffered mutations in arrival order
    async fn replay(&self, user: &mut UserState) {
        let Some(ctx) = user.ctx.clone() else {
            return;
        };

        let mut replayed = 0;
        while let Some(mutation) = user.machine.next_buffered() {
            let message_id = mutation.message_id().to_string();
            if let Err(e) = self.apply_now(&ctx, mutation).await {
                warn!("Failed to replay change of {}: {}", message_id, e);
            }
            replayed += 1;
        }
        if replayed > 0 {
            info!("Replayed {} buffered changes for {}", replayed, user.user_id);
        }
    }

    async fn apply_now(&self, ctx: &UserContext, mutation: MessageMutation) -> Result<()> {
        match mutation {
            MessageMutation::Insert(detail) | MessageMutation::Update(detail) => {
                let (entry, content) = self.builder.seal(ctx, &detail)?;
                ctx.store.insert(&entry).await?;
                self.cache
                    .upsert(&ctx.user_id, CachedMessage::from_entry(&entry, content))
                    .await;
            }
            MessageMutation::Move {
                message_id,
                label_ids,
                location,
            } => {
                let Some(mut entry) = ctx.store.get(&message_id).await? else {
                    debug!("Ignoring move of unindexed message {}", message_id);
                    return Ok(());
                };
                entry.label_ids = label_ids;
                entry.location = location;
                ctx.store.insert(&entry).await?;

                match ctx
                    .cipher
                    .decrypt_record::<DecryptedContent>(&entry.iv, &entry.ciphertext)
                {
                    Ok(content) => {
                        self.cache
                            .upsert(&ctx.user_id, CachedMessage::from_entry(&entry, content))
                            .await;
                    }
                    Err(e) => {
                        warn!("Dropping unreadable {} from cache: {}", message_id, e);
                        self.cache.remove(&ctx.user_id, &message_id).await;
                    }
                }
            }
            MessageMutation::Delete(message_id) => {
                ctx.store.delete(&message_id).await?;
                self.cache.remove(&ctx.user_id, &message_id).await;
            }
        }
        Ok(())
    }

    async fn report_index(&self, user: &UserState, ctx: &UserContext) {
        let session = user.session.lock().await.clone();
        let event = TelemetryEvent::Index(IndexTelemetry {
            num_messages_indexed: session.processed,
            index_size: ctx.store.size_on_disk().unwrap_or(0),
            index_time: (Utc::now() - session.started_at).num_seconds().max(0) as u64,
            original_estimate: user.original_estimate,
            num_pauses: user.machine.pauses(),
            num_interruptions: user.machine.interruptions(),
            is_refreshed: session.refresh,
        });
        dispatch(&self.telemetry, event);
    }

    async fn report_search(&self, ctx: &UserContext, first_search: bool, page: &SearchPage) {
        let info = self.cache.info().await;
        let event = TelemetryEvent::Search(SearchTelemetry {
            num_messages_indexed: ctx.store.count().await.unwrap_or(0),
            index_size: ctx.store.size_on_disk().unwrap_or(0),
            cache_size: info.as_ref().map_or(0, |info| info.size_bytes),
            is_first_search: first_search,
            is_cache_limited: info.as_ref().map_or(false, |info| info.partial),
            search_time: page.duration.as_millis() as u64,
        });
        dispatch(&self.telemetry, event);
    }

    async fn snapshot(&self, user: &mut UserState) -> IndexStatus {
        let state = user.machine.state();
        let reporting = state.reports_progress();
        if !reporting {
            user.estimator = None;
            user.eta = None;
        }

        let (processed, total) = {
            let session = user.session.lock().await;
            (session.processed, session.total)
        };
        let (entries, index_size) = match &user.ctx {
            Some(ctx) => (
                ctx.store.count().await.unwrap_or(processed),
                ctx.store.size_on_disk().unwrap_or(0),
            ),
            None => (0, 0),
        };
        let pause = if state.is_paused() {
            user.machine.reasons().describe()
        } else {
            None
        };

        IndexStatus {
            user_id: Some(user.user_id.clone()),
            state,
            processed,
            total,
            progress: reporting.then(|| percentage(processed, total)),
            eta: user.eta.clone(),
            pause_reason: pause.map(|(reason, _)| reason.to_string()),
            pause_advice: pause.map(|(_, advice)| advice.to_string()),
            index_size,
            entries,
            last_error: user.last_error.clone(),
        }
    }

    async fn publish(&self, user: &mut UserState) -> IndexStatus {
        let status = self.snapshot(user).await;
        self.status.send_replace(status.clone());
        status
    }
}
