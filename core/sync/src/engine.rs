//! Sync orchestrator: owns the engine state and drives every drain.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tether_common::{ConflictId, EntityType, Error, OperationId, Result};
use tether_storage::{LocalStore, StateStore};

use crate::adapter::{dispatch, push_resolved, AdapterError, AdapterRegistry, EntitySyncAdapter};
use crate::conflict::{Conflict, Resolution};
use crate::notify::{SyncNotifier, TracingNotifier};
use crate::queue::{Operation, OperationKind, OperationStatus};
use crate::retry::{RetryConfig, RetryExecutor};
use crate::scheduler::{SyncMode, SyncResult, SyncScheduler};
use crate::state::{EngineState, PersistedState, SyncMetrics, SyncStatus};
use crate::strategy::{self, suggest_merge};

/// Configuration for the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Background scheduling.
    pub sync_mode: SyncMode,
    /// Key the state is persisted under.
    pub namespace: String,
    /// Connectivity assumed when the engine opens.
    pub start_online: bool,
    /// Re-queue failed operations once their backoff has elapsed.
    pub auto_retry_failed: bool,
    /// Abandon an operation after this many failed attempts.
    pub max_attempts: Option<u32>,
    /// Immediate re-issues of a transiently failing remote call.
    pub call_retries: u32,
    /// Backoff curve shared by re-queues and in-call retries.
    pub retry: RetryConfig,
    /// Resolution applied as soon as a conflict is recorded.
    pub auto_resolve: Option<Resolution>,
    /// Write server-accepted payloads back into the local store.
    pub reconcile_accepted: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_mode: SyncMode::default(),
            namespace: "tether-sync".to_string(),
            start_online: true,
            auto_retry_failed: true,
            max_attempts: None,
            call_retries: 0,
            retry: RetryConfig::default(),
            auto_resolve: None,
            reconcile_accepted: true,
        }
    }
}

impl SyncConfig {
    /// Check the configuration for values the engine cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.namespace.trim().is_empty() {
            return Err(Error::InvalidInput("Namespace cannot be empty".to_string()));
        }
        if self.max_attempts == Some(0) {
            return Err(Error::InvalidInput(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.auto_resolve == Some(Resolution::Manual) {
            return Err(Error::InvalidInput(
                "Manual resolution needs a payload and cannot run automatically".to_string(),
            ));
        }
        Ok(())
    }

    fn call_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.call_retries,
            ..self.retry.clone()
        }
    }
}

/// Builder for [`SyncEngine`].
pub struct SyncEngineBuilder {
    store: Arc<dyn StateStore>,
    local: Arc<dyn LocalStore>,
    config: SyncConfig,
    adapters: AdapterRegistry,
    notifier: Arc<dyn SyncNotifier>,
}

impl SyncEngineBuilder {
    /// Start a builder over the persistence and local-store collaborators.
    pub fn new(store: Arc<dyn StateStore>, local: Arc<dyn LocalStore>) -> Self {
        Self {
            store,
            local,
            config: SyncConfig::default(),
            adapters: AdapterRegistry::new(),
            notifier: Arc::new(TracingNotifier),
        }
    }

    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Register one entity adapter.
    pub fn adapter(mut self, adapter: Arc<dyn EntitySyncAdapter>) -> Result<Self> {
        self.adapters.register(adapter)?;
        Ok(self)
    }

    /// Replace the adapter registry.
    pub fn adapters(mut self, adapters: AdapterRegistry) -> Self {
        self.adapters = adapters;
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn SyncNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Validate the configuration, load persisted state and build the engine.
    pub async fn open(self) -> Result<SyncEngine> {
        self.config.validate()?;

        let state = match self.store.load(&self.config.namespace).await? {
            Some(bytes) => {
                let persisted = PersistedState::from_json(&bytes)?;
                EngineState::from_persisted(persisted, self.config.start_online)
            }
            None => EngineState::new(self.config.start_online),
        };

        info!(
            "Opened sync engine '{}' on {} store: {} operations, {} unresolved conflicts",
            self.config.namespace,
            self.store.name(),
            state.operations.len(),
            state.conflicts.unresolved_count()
        );

        let (state_tx, _) = watch::channel(Arc::new(state));
        let call_executor = RetryExecutor::new(self.config.call_retry_config());
        let persist_executor = RetryExecutor::new(
            RetryConfig::new(2)
                .with_initial_delay(Duration::from_millis(50))
                .with_max_delay(Duration::from_millis(500)),
        );

        Ok(SyncEngine {
            inner: Arc::new(Inner {
                config: self.config,
                adapters: self.adapters,
                store: self.store,
                local: self.local,
                notifier: self.notifier,
                call_executor,
                persist_executor,
                state: state_tx,
                write_lock: Mutex::new(()),
                pass_running: AtomicBool::new(false),
                stop_requested: AtomicBool::new(false),
                resolve_lock: tokio::sync::Mutex::new(()),
                persist_lock: tokio::sync::Mutex::new(()),
                background: Mutex::new(Vec::new()),
                delayed: Mutex::new(None),
                scheduler: Mutex::new(None),
            }),
        })
    }
}

struct Inner {
    config: SyncConfig,
    adapters: AdapterRegistry,
    store: Arc<dyn StateStore>,
    local: Arc<dyn LocalStore>,
    notifier: Arc<dyn SyncNotifier>,
    call_executor: RetryExecutor,
    persist_executor: RetryExecutor,
    /// Latest published snapshot.
    state: watch::Sender<Arc<EngineState>>,
    /// Serializes clone-mutate-publish cycles.
    write_lock: Mutex<()>,
    pass_running: AtomicBool,
    stop_requested: AtomicBool,
    resolve_lock: tokio::sync::Mutex<()>,
    persist_lock: tokio::sync::Mutex<()>,
    background: Mutex<Vec<JoinHandle<()>>>,
    delayed: Mutex<Option<JoinHandle<()>>>,
    scheduler: Mutex<Option<SyncScheduler>>,
}

impl Inner {
    /// Apply a mutation to a copy of the state and publish the copy.
    fn update<R>(&self, mutate: impl FnOnce(&mut EngineState) -> R) -> R {
        let _guard = lock(&self.write_lock);
        let mut draft = EngineState::clone(&self.state.borrow());
        let out = mutate(&mut draft);
        self.state.send_replace(Arc::new(draft));
        out
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Held for the duration of a pass; clears the running flag on drop.
struct PassGuard {
    inner: Arc<Inner>,
}

impl Drop for PassGuard {
    fn drop(&mut self) {
        self.inner.pass_running.store(false, Ordering::Release);
    }
}

/// Offline-first sync engine.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<Inner>,
}

impl SyncEngine {
    /// Shorthand for [`SyncEngineBuilder::new`].
    pub fn builder(store: Arc<dyn StateStore>, local: Arc<dyn LocalStore>) -> SyncEngineBuilder {
        SyncEngineBuilder::new(store, local)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// Current state snapshot.
    pub fn snapshot(&self) -> Arc<EngineState> {
        self.inner.state.borrow().clone()
    }

    /// Receive every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Arc<EngineState>> {
        self.inner.state.subscribe()
    }

    pub fn metrics(&self) -> SyncMetrics {
        self.snapshot().metrics()
    }

    /// Conflicts still waiting for a resolution, in detection order.
    pub fn unresolved_conflicts(&self) -> Vec<Conflict> {
        self.snapshot().conflicts.unresolved().cloned().collect()
    }

    /// Queue a local mutation for delivery.
    ///
    /// Persists the operation before returning and starts a drain in the
    /// background when online. Nothing is queued if the save fails.
    ///
    /// # Errors
    /// - `InvalidInput` if `entity_id` is blank
    pub async fn enqueue(
        &self,
        kind: OperationKind,
        entity_type: EntityType,
        entity_id: impl Into<String>,
        payload: Value,
    ) -> Result<OperationId> {
        let entity_id = entity_id.into();
        if entity_id.trim().is_empty() {
            return Err(Error::InvalidInput("Entity id cannot be empty".to_string()));
        }

        let id = self.inner.update(|state| OperationId::new(state.next_sequence()));
        let operation = Operation::new(id, kind, entity_type, entity_id, payload);
        self.commit(|state| {
            state.operations.push(operation.clone());
            Ok(())
        })
        .await?;

        debug!("Enqueued {}", id);
        self.trigger_sync();
        Ok(id)
    }

    /// Cancel an operation regardless of its status.
    pub async fn remove(&self, id: OperationId) -> Result<Operation> {
        let removed = self.commit(|state| state.operations.remove(id)).await?;
        debug!("Removed {}", id);
        Ok(removed)
    }

    /// Move a failed or abandoned operation back to pending.
    pub async fn retry(&self, id: OperationId) -> Result<()> {
        let now = Utc::now();
        self.commit(|state| state.operations.retry(id, now)).await?;
        debug!("Re-queued {}", id);
        self.trigger_sync();
        Ok(())
    }

    /// Drop every completed operation. Returns how many were removed.
    pub async fn clear_completed(&self) -> Result<usize> {
        if self.snapshot().operations.count_with_status(OperationStatus::Completed) == 0 {
            return Ok(0);
        }
        self.commit(|state| Ok(state.operations.clear_completed())).await
    }

    /// Record connectivity. Coming back online with due work starts a drain.
    pub fn set_online_status(&self, online: bool) {
        let was_online = self.inner.update(|state| {
            let was = state.is_online;
            state.is_online = online;
            was
        });

        if was_online == online {
            return;
        }
        info!("Connectivity changed: {}", if online { "online" } else { "offline" });

        if online && self.has_due_work() {
            self.trigger_sync();
        }
    }

    /// Run one drain pass and wait for it.
    ///
    /// Returns `None` without doing anything when offline or when another pass
    /// is already running. Per-operation failures are recorded on the
    /// operations; only engine-level failures are returned as errors.
    pub async fn start_sync(&self) -> Result<Option<SyncResult>> {
        if !self.snapshot().is_online {
            debug!("Offline, skipping sync");
            return Ok(None);
        }
        let Some(guard) = self.try_begin_pass() else {
            debug!("Sync already in progress");
            return Ok(None);
        };

        let result = self.run_pass(guard).await?;
        self.follow_up();
        Ok(Some(result))
    }

    /// Same as [`start_sync`](Self::start_sync).
    pub async fn force_sync(&self) -> Result<Option<SyncResult>> {
        self.start_sync().await
    }

    /// Ask the running pass to stop between operations.
    ///
    /// An in-flight remote call is never cancelled.
    pub fn stop_sync(&self) {
        if self.inner.pass_running.load(Ordering::Acquire) {
            self.inner.stop_requested.store(true, Ordering::Release);
        }
        self.inner.update(|state| {
            state.sync_status = SyncStatus::Idle;
            state.progress = 0;
        });
        info!("Sync stop requested");
    }

    /// Start a drain in the background if online and idle.
    pub fn trigger_sync(&self) {
        if !self.snapshot().is_online {
            return;
        }
        let Some(guard) = self.try_begin_pass() else {
            return;
        };

        let engine = self.clone();
        let handle = tokio::spawn(async move {
            match engine.run_pass(guard).await {
                Ok(_) => engine.follow_up(),
                Err(e) => debug!("Background sync aborted: {}", e),
            }
        });

        let mut background = lock(&self.inner.background);
        background.retain(|h| !h.is_finished());
        background.push(handle);
    }

    /// Arm a one-off drain after `delay`, replacing any earlier one.
    pub fn schedule_next_sync(&self, delay: Duration) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                SyncEngine { inner }.trigger_sync();
            }
        });

        if let Some(previous) = lock(&self.inner.delayed).replace(handle) {
            previous.abort();
        }
        debug!("Next sync scheduled in {:?}", delay);
    }

    /// Start the background scheduler loop for the configured mode.
    pub fn spawn_scheduler(&self) -> SyncScheduler {
        let (scheduler, handle) = SyncScheduler::new(self.inner.config.sync_mode.clone());
        let weak = Arc::downgrade(&self.inner);

        tokio::spawn(handle.run(move || {
            if let Some(inner) = weak.upgrade() {
                SyncEngine { inner }.background_tick();
            }
        }));

        if let Some(previous) = lock(&self.inner.scheduler).replace(scheduler.clone()) {
            tokio::spawn(async move { previous.shutdown().await });
        }
        scheduler
    }

    /// Wait until no background drain is running.
    pub async fn wait_for_background(&self) {
        loop {
            let handles = std::mem::take(&mut *lock(&self.inner.background));
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                if let Err(e) = handle.await {
                    warn!("Background sync task failed: {}", e);
                }
            }
        }
    }

    /// Stop the scheduler, drop the delayed drain and wait for running passes.
    pub async fn shutdown(&self) {
        let scheduler = lock(&self.inner.scheduler).take();
        if let Some(scheduler) = scheduler {
            scheduler.shutdown().await;
        }
        let delayed = lock(&self.inner.delayed).take();
        if let Some(delayed) = delayed {
            delayed.abort();
        }
        self.wait_for_background().await;
        info!("Sync engine shut down");
    }

    /// Record a divergence between local and remote state.
    pub async fn record_conflict(
        &self,
        kind: OperationKind,
        entity_type: EntityType,
        entity_id: impl Into<String>,
        local_payload: Value,
        remote_payload: Value,
    ) -> Result<ConflictId> {
        let id = self.inner.update(|state| ConflictId::new(state.next_sequence()));
        let conflict = Conflict::new(id, kind, entity_type, entity_id, local_payload, remote_payload);
        self.commit(|state| {
            add_conflict(state, conflict.clone());
            Ok(())
        })
        .await?;

        self.inner.notifier.conflict_detected(&conflict);
        Ok(conflict.id)
    }

    /// Resolve a conflict and apply the final payload.
    ///
    /// Resolutions are serialized. The operation that raised the conflict is
    /// dropped from the queue. When the last unresolved conflict is resolved,
    /// draining resumes.
    ///
    /// # Errors
    /// - `NotFound` if no conflict has this id
    /// - `AlreadyResolved` if it was resolved before; nothing is re-applied
    /// - `InvalidInput` for `Manual` without a payload
    /// - `Adapter` / `Storage` if applying the payload fails; the conflict
    ///   stays unresolved
    pub async fn resolve_conflict(
        &self,
        id: ConflictId,
        resolution: Resolution,
        merged_payload: Option<Value>,
    ) -> Result<()> {
        let _serial = self.inner.resolve_lock.lock().await;

        let conflict = self
            .snapshot()
            .conflicts
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Conflict {} not found", id)))?;
        if conflict.is_resolved() {
            return Err(Error::AlreadyResolved(format!(
                "Conflict {} is already resolved",
                id
            )));
        }

        let adapter = self.inner.adapters.get(&conflict.entity_type);
        let plan = strategy::plan(&conflict, resolution, merged_payload, |local, remote| {
            match &adapter {
                Some(adapter) => adapter.merge(local, remote),
                None => suggest_merge(local, remote),
            }
        })?;

        if plan.apply_remote {
            let adapter = adapter.ok_or_else(|| {
                Error::Adapter(format!(
                    "No adapter registered for '{}'",
                    conflict.entity_type
                ))
            })?;
            push_resolved(
                adapter.as_ref(),
                conflict.kind,
                &conflict.entity_id,
                &plan.payload,
            )
            .await?;
        }

        if plan.apply_local {
            if plan.payload.is_null() {
                self.inner
                    .local
                    .remove(&conflict.entity_type, &conflict.entity_id)
                    .await?;
            } else {
                self.inner
                    .local
                    .apply(&conflict.entity_type, &conflict.entity_id, &plan.payload)
                    .await?;
            }
        }

        let now = Utc::now();
        let pass_running = &self.inner.pass_running;
        let remaining = self
            .commit(|state| {
                if let Some(stored) = state.conflicts.get_mut(id) {
                    stored.mark_resolved(resolution, plan.payload.clone(), now);
                }
                // the resolution settles what the operation asked for
                if let Some(op_id) = conflict.operation_id {
                    state.operations.remove(op_id).ok();
                }
                let remaining = state.conflicts.unresolved_count();
                if remaining == 0
                    && state.sync_status == SyncStatus::Conflict
                    && !pass_running.load(Ordering::Acquire)
                {
                    state.sync_status = SyncStatus::Idle;
                }
                Ok(remaining)
            })
            .await?;

        info!("Resolved {} with {:?}", id, resolution);
        if remaining == 0 {
            self.trigger_sync();
        }
        Ok(())
    }

    /// Resolve every unresolved conflict with the same strategy.
    ///
    /// Returns the number of conflicts resolved.
    pub async fn resolve_all_conflicts(&self, resolution: Resolution) -> Result<usize> {
        if resolution == Resolution::Manual {
            return Err(Error::InvalidInput(
                "Manual resolution needs a payload per conflict".to_string(),
            ));
        }

        let mut resolved = 0;
        for id in self.snapshot().conflicts.unresolved_ids() {
            match self.resolve_conflict(id, resolution, None).await {
                Ok(()) => resolved += 1,
                Err(Error::AlreadyResolved(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(resolved)
    }

    fn try_begin_pass(&self) -> Option<PassGuard> {
        self.inner
            .pass_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        self.inner.stop_requested.store(false, Ordering::Release);
        self.inner.update(|state| {
            if state.sync_status.is_outcome() {
                state.sync_status = SyncStatus::Idle;
            }
        });
        Some(PassGuard {
            inner: self.inner.clone(),
        })
    }

    fn stop_requested(&self) -> bool {
        self.inner.stop_requested.load(Ordering::Acquire)
    }

    /// Pending operations, or failed ones whose backoff has elapsed.
    fn has_due_work(&self) -> bool {
        let state = self.snapshot();
        if state.has_work(false) {
            return true;
        }
        if !self.inner.config.auto_retry_failed {
            return false;
        }
        let blocked = state.conflicts.blocked_operations();
        state
            .operations
            .next_retry_at(&blocked)
            .is_some_and(|at| at <= Utc::now())
    }

    fn background_tick(&self) {
        if self.snapshot().is_online && self.has_due_work() {
            self.trigger_sync();
        }
    }

    /// Chain the next drain after a pass that ended normally.
    fn follow_up(&self) {
        if self.stop_requested() {
            return;
        }
        let state = self.snapshot();
        if !state.is_online {
            return;
        }

        if state.has_work(false) {
            self.trigger_sync();
            return;
        }

        if self.inner.config.auto_retry_failed {
            let blocked = state.conflicts.blocked_operations();
            if let Some(at) = state.operations.next_retry_at(&blocked) {
                let delay = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                self.schedule_next_sync(delay);
            }
        }
    }

    async fn run_pass(&self, _guard: PassGuard) -> Result<SyncResult> {
        let start = Instant::now();
        let config = &self.inner.config;
        let mut result = SyncResult::default();

        let pending = self.inner.update(|state| {
            if config.auto_retry_failed {
                let blocked = state.conflicts.blocked_operations();
                let requeued = state.operations.requeue_due(Utc::now(), &blocked);
                if !requeued.is_empty() {
                    debug!("Re-queued {} failed operations", requeued.len());
                }
            }
            state.sync_status = SyncStatus::Syncing;
            state.progress = 0;
            state.last_error = None;
            state.operations.pending_ids()
        });

        let total = pending.len();
        info!("Starting sync of {} operations", total);

        for (index, id) in pending.into_iter().enumerate() {
            if self.stop_requested() {
                info!("Sync stopped after {} of {} operations", index, total);
                break;
            }

            let op = self
                .snapshot()
                .operations
                .get(id)
                .filter(|op| op.is_pending())
                .cloned();

            if let Some(op) = op {
                let outcome = self.push(&op).await;
                self.settle(&op, outcome, &mut result).await;
            } else {
                debug!("{} is no longer pending, skipping", id);
            }

            if !self.stop_requested() {
                let progress = ((index + 1) as f64 / total as f64 * 100.0).round() as u8;
                self.inner.update(|state| state.progress = progress);
            }

            if let Err(e) = self.persist().await {
                return Err(self.abort(e));
            }
        }

        let stopped = self.stop_requested();
        self.inner.update(|state| {
            if stopped {
                state.sync_status = SyncStatus::Idle;
                state.progress = 0;
            } else {
                state.last_sync_at = Some(Utc::now());
                state.sync_status = if state.conflicts.unresolved_count() > 0 {
                    SyncStatus::Conflict
                } else {
                    SyncStatus::Success
                };
            }
        });
        if let Err(e) = self.persist().await {
            return Err(self.abort(e));
        }

        result.duration = start.elapsed();
        self.inner.notifier.sync_completed(&result);
        Ok(result)
    }

    /// Issue the remote call for one operation.
    async fn push(&self, op: &Operation) -> std::result::Result<Value, AdapterError> {
        let Some(adapter) = self.inner.adapters.get(&op.entity_type) else {
            return Err(AdapterError::Rejected(format!(
                "No adapter registered for '{}'",
                op.entity_type
            )));
        };
        let adapter: &dyn EntitySyncAdapter = adapter.as_ref();

        self.inner
            .call_executor
            .execute_with_condition(
                move || dispatch(adapter, op.kind, &op.entity_id, &op.payload),
                AdapterError::is_transient,
            )
            .await
    }

    /// Record the outcome of one push.
    async fn settle(
        &self,
        op: &Operation,
        outcome: std::result::Result<Value, AdapterError>,
        result: &mut SyncResult,
    ) {
        let config = &self.inner.config;

        let accepted = match outcome {
            Ok(accepted) => accepted,
            Err(err) => {
                let now = Utc::now();
                let conflict = self.inner.update(|state| {
                    let current = state.operations.get_mut(op.id)?;
                    let next_attempt_at = if err.is_conflict() {
                        None
                    } else {
                        let delay = config.retry.delay_for_attempt(current.retry_count);
                        chrono::Duration::from_std(delay).ok().map(|d| now + d)
                    };
                    current.mark_failed(err.to_string(), now, next_attempt_at, config.max_attempts);
                    if current.status == OperationStatus::Abandoned {
                        warn!("{} abandoned after {} attempts", op.id, current.retry_count);
                    }

                    let remote = err.remote_payload()?.clone();
                    let id = ConflictId::new(state.next_sequence());
                    let conflict = Conflict::new(
                        id,
                        op.kind,
                        op.entity_type.clone(),
                        op.entity_id.clone(),
                        op.payload.clone(),
                        remote,
                    )
                    .with_operation(op.id);
                    add_conflict(state, conflict.clone());
                    Some(conflict)
                });

                match conflict {
                    Some(conflict) => {
                        result.conflicts_found += 1;
                        self.inner.notifier.conflict_detected(&conflict);
                        if let Some(resolution) = config.auto_resolve {
                            if let Err(e) = self.resolve_conflict(conflict.id, resolution, None).await {
                                warn!("Automatic resolution of {} failed: {}", conflict.id, e);
                            }
                        }
                    }
                    None => {
                        result.operations_failed += 1;
                        warn!("{} failed: {}", op.id, err);
                    }
                }
                return;
            }
        };

        let marked = self.inner.update(|state| match state.operations.get_mut(op.id) {
            Some(current) => current.mark_completed(),
            None => Ok(()),
        });
        if let Err(e) = marked {
            warn!("Accepted push not recorded: {}", e);
        }
        result.operations_synced += 1;
        debug!("{} synced", op.id);

        if config.reconcile_accepted
            && op.kind != OperationKind::Delete
            && !accepted.is_null()
            && accepted != op.payload
        {
            if let Err(e) = self
                .inner
                .local
                .apply(&op.entity_type, &op.entity_id, &accepted)
                .await
            {
                warn!(
                    "Failed to reconcile accepted payload for {} {}: {}",
                    op.entity_type, op.entity_id, e
                );
            }
        }
    }

    /// Mark the current pass as failed on an engine-level error.
    fn abort(&self, err: Error) -> Error {
        let message = err.to_string();
        self.inner.update(|state| {
            state.sync_status = SyncStatus::Error;
            state.progress = 0;
            state.last_error = Some(message);
        });
        self.inner.notifier.sync_failed(&err);
        err
    }

    /// Write the durable part of the current snapshot.
    async fn persist(&self) -> Result<()> {
        let _guard = self.inner.persist_lock.lock().await;
        self.save(&self.snapshot()).await
    }

    /// Save a mutated copy of the state first and publish the mutation only
    /// once the save succeeded.
    ///
    /// `mutate` runs on the copy and then on the live state, so it must be
    /// repeatable. Ids are allocated by the caller beforehand.
    async fn commit<R>(&self, mutate: impl Fn(&mut EngineState) -> Result<R>) -> Result<R> {
        let _guard = self.inner.persist_lock.lock().await;
        let mut draft = EngineState::clone(&self.snapshot());
        mutate(&mut draft)?;
        self.save(&draft).await?;
        self.inner.update(|state| mutate(state))
    }

    async fn save(&self, state: &EngineState) -> Result<()> {
        let data = state.to_persisted().to_json()?;

        self.inner
            .persist_executor
            .execute(|| {
                let store = self.inner.store.clone();
                let namespace = self.inner.config.namespace.clone();
                let data = data.clone();
                async move { store.save(&namespace, data).await }
            })
            .await
    }
}

fn add_conflict(state: &mut EngineState, conflict: Conflict) {
    state.conflicts.push(conflict);
    state.sync_status = SyncStatus::Conflict;
}
