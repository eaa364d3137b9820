//! Orchestrator behavior against scripted remote and local collaborators.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::{watch, Notify};

use tether_common::{EntityType, Error};
use tether_storage::{FileStore, LocalStore, MemoryStore};
use tether_sync::{
    AdapterError, AdapterResult, Conflict, EngineState, EntitySyncAdapter, OperationKind,
    OperationStatus,
    Resolution, RetryConfig, SyncConfig, SyncEngine, SyncMode, SyncNotifier, SyncResult,
    SyncStatus,
};

fn task() -> EntityType {
    EntityType::new("task").unwrap()
}

#[derive(Debug, Clone, PartialEq)]
struct Call {
    method: &'static str,
    entity_id: String,
    payload: Value,
}

/// Blocks the first remote call until released.
#[derive(Default)]
struct Gate {
    entered: Notify,
    release: Notify,
}

/// Adapter answering from a script, then accepting everything as sent.
struct ScriptedAdapter {
    entity_type: EntityType,
    calls: Mutex<Vec<Call>>,
    responses: Mutex<VecDeque<AdapterResult<Value>>>,
    gate: Mutex<Option<Arc<Gate>>>,
    /// Engine status seen at each call, once observed.
    observer: OnceLock<watch::Receiver<Arc<EngineState>>>,
    statuses: Mutex<Vec<SyncStatus>>,
}

impl ScriptedAdapter {
    fn new() -> Self {
        Self {
            entity_type: task(),
            calls: Mutex::new(Vec::new()),
            responses: Mutex::new(VecDeque::new()),
            gate: Mutex::new(None),
            observer: OnceLock::new(),
            statuses: Mutex::new(Vec::new()),
        }
    }

    fn observe(&self, engine: &SyncEngine) {
        self.observer.set(engine.subscribe()).ok();
    }

    fn statuses(&self) -> Vec<SyncStatus> {
        self.statuses.lock().unwrap().clone()
    }

    fn respond(self, response: AdapterResult<Value>) -> Self {
        self.responses.lock().unwrap().push_back(response);
        self
    }

    fn gated(self, gate: Arc<Gate>) -> Self {
        *self.gate.lock().unwrap() = Some(gate);
        self
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn entity_ids(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.entity_id).collect()
    }

    async fn call(&self, method: &'static str, entity_id: &str, payload: &Value) -> AdapterResult<Value> {
        self.calls.lock().unwrap().push(Call {
            method,
            entity_id: entity_id.to_string(),
            payload: payload.clone(),
        });
        if let Some(observer) = self.observer.get() {
            let status = observer.borrow().sync_status;
            self.statuses.lock().unwrap().push(status);
        }

        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }

        let scripted = self.responses.lock().unwrap().pop_front();
        match scripted {
            Some(response) => response,
            None if method == "delete" => Ok(Value::Null),
            None => Ok(payload.clone()),
        }
    }
}

#[async_trait]
impl EntitySyncAdapter for ScriptedAdapter {
    fn entity_type(&self) -> &EntityType {
        &self.entity_type
    }

    async fn create(&self, entity_id: &str, payload: &Value) -> AdapterResult<Value> {
        self.call("create", entity_id, payload).await
    }

    async fn update(&self, entity_id: &str, payload: &Value) -> AdapterResult<Value> {
        self.call("update", entity_id, payload).await
    }

    async fn delete(&self, entity_id: &str, payload: &Value) -> AdapterResult<Value> {
        self.call("delete", entity_id, payload).await
    }
}

#[derive(Default)]
struct RecordingNotifier {
    conflicts: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
}

impl SyncNotifier for RecordingNotifier {
    fn conflict_detected(&self, _conflict: &Conflict) {
        self.conflicts.fetch_add(1, Ordering::SeqCst);
    }

    fn sync_completed(&self, _result: &SyncResult) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    fn sync_failed(&self, _error: &Error) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }
}

struct Harness {
    engine: SyncEngine,
    adapter: Arc<ScriptedAdapter>,
    state_store: MemoryStore,
    local: MemoryStore,
    notifier: Arc<RecordingNotifier>,
}

fn offline() -> SyncConfig {
    SyncConfig {
        sync_mode: SyncMode::Manual,
        start_online: false,
        ..SyncConfig::default()
    }
}

fn online() -> SyncConfig {
    SyncConfig {
        start_online: true,
        ..offline()
    }
}

async fn harness(adapter: ScriptedAdapter, config: SyncConfig) -> Harness {
    let adapter = Arc::new(adapter);
    let state_store = MemoryStore::new();
    let local = MemoryStore::new();
    let notifier = Arc::new(RecordingNotifier::default());

    let engine = SyncEngine::builder(Arc::new(state_store.clone()), Arc::new(local.clone()))
        .config(config)
        .adapter(adapter.clone())
        .unwrap()
        .notifier(notifier.clone())
        .open()
        .await
        .unwrap();

    Harness {
        engine,
        adapter,
        state_store,
        local,
        notifier,
    }
}

#[tokio::test]
async fn test_online_create_is_pushed_once() {
    let h = harness(ScriptedAdapter::new(), online()).await;

    let id = h
        .engine
        .enqueue(OperationKind::Create, task(), "task-1", json!({"title": "New Task"}))
        .await
        .unwrap();
    h.engine.wait_for_background().await;

    assert_eq!(
        h.adapter.calls(),
        vec![Call {
            method: "create",
            entity_id: "task-1".to_string(),
            payload: json!({"title": "New Task"}),
        }]
    );
    let state = h.engine.snapshot();
    assert_eq!(state.operations.get(id).unwrap().status, OperationStatus::Completed);
    assert_eq!(state.sync_status, SyncStatus::Success);
    assert_eq!(state.progress, 100);
    assert!(state.last_sync_at.is_some());
    assert_eq!(h.notifier.completed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_offline_enqueue_waits_for_reconnect() {
    let h = harness(ScriptedAdapter::new(), offline()).await;

    let id = h
        .engine
        .enqueue(OperationKind::Create, task(), "task-1", json!({"title": "New Task"}))
        .await
        .unwrap();
    h.engine.wait_for_background().await;

    assert!(h.adapter.calls().is_empty());
    assert_eq!(h.engine.snapshot().sync_status, SyncStatus::Idle);
    assert!(h.engine.start_sync().await.unwrap().is_none());
    assert!(h.adapter.calls().is_empty());

    h.engine.set_online_status(true);
    h.engine.wait_for_background().await;

    assert_eq!(h.adapter.entity_ids(), vec!["task-1"]);
    assert_eq!(
        h.engine.snapshot().operations.get(id).unwrap().status,
        OperationStatus::Completed
    );
}

#[tokio::test]
async fn test_drain_preserves_enqueue_order() {
    let h = harness(ScriptedAdapter::new(), offline()).await;

    let kinds = [
        OperationKind::Create,
        OperationKind::Update,
        OperationKind::Delete,
        OperationKind::Create,
        OperationKind::Update,
    ];
    for (n, kind) in kinds.into_iter().enumerate() {
        h.engine
            .enqueue(kind, task(), format!("task-{}", n + 1), json!({"n": n}))
            .await
            .unwrap();
    }

    h.engine.set_online_status(true);
    h.engine.wait_for_background().await;

    assert_eq!(
        h.adapter.entity_ids(),
        vec!["task-1", "task-2", "task-3", "task-4", "task-5"]
    );
    let methods: Vec<_> = h.adapter.calls().into_iter().map(|c| c.method).collect();
    assert_eq!(methods, vec!["create", "update", "delete", "create", "update"]);
    assert_eq!(h.engine.metrics().completed, 5);
}

#[tokio::test]
async fn test_rejected_update_records_conflict() {
    let adapter = ScriptedAdapter::new().respond(Err(AdapterError::conflict(json!({"title": "Remote"}))));
    let h = harness(adapter, offline()).await;

    let id = h
        .engine
        .enqueue(OperationKind::Update, task(), "task-1", json!({"title": "Local"}))
        .await
        .unwrap();
    h.engine.set_online_status(true);
    h.engine.wait_for_background().await;

    let conflicts = h.engine.unresolved_conflicts();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].local_payload, json!({"title": "Local"}));
    assert_eq!(conflicts[0].remote_payload, json!({"title": "Remote"}));
    assert_eq!(conflicts[0].operation_id, Some(id));
    assert_eq!(conflicts[0].kind, OperationKind::Update);

    let state = h.engine.snapshot();
    assert_eq!(state.sync_status, SyncStatus::Conflict);
    let op = state.operations.get(id).unwrap();
    assert_eq!(op.status, OperationStatus::Failed);
    assert_eq!(op.retry_count, 1);
    assert_eq!(h.notifier.conflicts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_remote_resolution_writes_local_store() {
    let h = harness(ScriptedAdapter::new(), offline()).await;

    let id = h
        .engine
        .record_conflict(
            OperationKind::Update,
            task(),
            "task-1",
            json!({"title": "Local"}),
            json!({"title": "Remote"}),
        )
        .await
        .unwrap();
    assert_eq!(h.engine.snapshot().sync_status, SyncStatus::Conflict);

    h.engine.resolve_conflict(id, Resolution::Remote, None).await.unwrap();

    assert_eq!(
        h.local.get(&task(), "task-1").await.unwrap(),
        Some(json!({"title": "Remote"}))
    );
    assert!(h.adapter.calls().is_empty());

    let state = h.engine.snapshot();
    let conflict = state.conflicts.get(id).unwrap();
    assert_eq!(conflict.resolution, Some(Resolution::Remote));
    assert!(conflict.resolved_at.is_some());
    assert_eq!(state.sync_status, SyncStatus::Idle);
}

#[tokio::test]
async fn test_second_resolution_has_no_side_effects() {
    let h = harness(ScriptedAdapter::new(), offline()).await;

    let id = h
        .engine
        .record_conflict(
            OperationKind::Update,
            task(),
            "task-1",
            json!({"title": "Local"}),
            json!({"title": "Remote"}),
        )
        .await
        .unwrap();

    h.engine.resolve_conflict(id, Resolution::Local, None).await.unwrap();
    let first = h.engine.snapshot().conflicts.get(id).unwrap().clone();

    let again = h.engine.resolve_conflict(id, Resolution::Remote, None).await;
    assert!(matches!(again, Err(Error::AlreadyResolved(_))));

    assert_eq!(h.adapter.calls().len(), 1);
    assert_eq!(h.local.get(&task(), "task-1").await.unwrap(), None);
    assert_eq!(h.engine.snapshot().conflicts.get(id).unwrap(), &first);
}

#[tokio::test]
async fn test_resolve_all_local_pushes_every_local_payload() {
    let h = harness(ScriptedAdapter::new(), offline()).await;

    for n in 1..=2 {
        h.engine
            .record_conflict(
                OperationKind::Update,
                task(),
                format!("task-{}", n),
                json!({"title": format!("Local {}", n)}),
                json!({"title": format!("Remote {}", n)}),
            )
            .await
            .unwrap();
    }

    let resolved = h.engine.resolve_all_conflicts(Resolution::Local).await.unwrap();
    assert_eq!(resolved, 2);

    let calls = h.adapter.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls.iter().all(|c| c.method == "update"));
    assert_eq!(calls[0].payload, json!({"title": "Local 1"}));
    assert_eq!(calls[1].payload, json!({"title": "Local 2"}));

    let state = h.engine.snapshot();
    assert!(state
        .conflicts
        .iter()
        .all(|c| c.resolution == Some(Resolution::Local)));
    assert_eq!(state.conflicts.unresolved_count(), 0);
}

#[tokio::test]
async fn test_resolve_all_rejects_manual() {
    let h = harness(ScriptedAdapter::new(), offline()).await;
    let result = h.engine.resolve_all_conflicts(Resolution::Manual).await;
    assert!(matches!(result, Err(Error::InvalidInput(_))));
}

#[tokio::test]
async fn test_manual_resolution_needs_payload() {
    let h = harness(ScriptedAdapter::new(), offline()).await;
    let id = h
        .engine
        .record_conflict(
            OperationKind::Update,
            task(),
            "task-1",
            json!({"title": "Local"}),
            json!({"title": "Remote"}),
        )
        .await
        .unwrap();

    let missing = h.engine.resolve_conflict(id, Resolution::Manual, None).await;
    assert!(matches!(missing, Err(Error::InvalidInput(_))));
    assert_eq!(h.engine.unresolved_conflicts().len(), 1);

    let chosen = json!({"title": "Chosen"});
    h.engine
        .resolve_conflict(id, Resolution::Manual, Some(chosen.clone()))
        .await
        .unwrap();

    assert_eq!(h.adapter.calls()[0].payload, chosen);
    assert_eq!(h.local.get(&task(), "task-1").await.unwrap(), Some(chosen.clone()));
    assert_eq!(
        h.engine.snapshot().conflicts.get(id).unwrap().resolved_payload,
        Some(chosen)
    );
}

#[tokio::test]
async fn test_merge_resolution_writes_both_sides() {
    let h = harness(ScriptedAdapter::new(), offline()).await;
    let id = h
        .engine
        .record_conflict(
            OperationKind::Update,
            task(),
            "task-1",
            json!({"title": "Local", "tags": ["a"]}),
            json!({"title": "Remote", "tags": ["b"], "done": true}),
        )
        .await
        .unwrap();

    h.engine.resolve_conflict(id, Resolution::Merge, None).await.unwrap();

    let merged = json!({"title": "Local", "tags": ["b", "a"], "done": true});
    assert_eq!(h.adapter.calls()[0].payload, merged);
    assert_eq!(h.local.get(&task(), "task-1").await.unwrap(), Some(merged));
}

#[tokio::test]
async fn test_delete_conflict_resolved_locally_pushes_delete() {
    let h = harness(ScriptedAdapter::new(), offline()).await;
    let id = h
        .engine
        .record_conflict(
            OperationKind::Delete,
            task(),
            "task-1",
            Value::Null,
            json!({"title": "Edited remotely"}),
        )
        .await
        .unwrap();

    h.engine.resolve_conflict(id, Resolution::Local, None).await.unwrap();

    assert_eq!(h.adapter.calls()[0].method, "delete");
}

#[tokio::test]
async fn test_resolve_unknown_conflict() {
    let h = harness(ScriptedAdapter::new(), offline()).await;
    let result = h
        .engine
        .resolve_conflict(tether_common::ConflictId::new(99), Resolution::Local, None)
        .await;
    assert!(matches!(result, Err(Error::NotFound(_))));
}

#[tokio::test]
async fn test_resolving_last_conflict_resumes_drain() {
    let adapter = ScriptedAdapter::new().respond(Err(AdapterError::conflict(json!({"title": "Remote"}))));
    let h = harness(adapter, offline()).await;

    let id = h
        .engine
        .enqueue(OperationKind::Update, task(), "task-1", json!({"title": "Local"}))
        .await
        .unwrap();
    h.engine.set_online_status(true);
    h.engine.wait_for_background().await;
    assert_eq!(h.engine.snapshot().sync_status, SyncStatus::Conflict);

    let conflict = h.engine.unresolved_conflicts()[0].id;
    h.engine.resolve_conflict(conflict, Resolution::Local, None).await.unwrap();
    h.engine.wait_for_background().await;

    let state = h.engine.snapshot();
    assert!(state.operations.get(id).is_none());
    assert_eq!(state.sync_status, SyncStatus::Success);
    assert_eq!(h.notifier.completed.load(Ordering::SeqCst), 2);

    let calls = h.adapter.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].method, "update");
    assert_eq!(calls[1].payload, json!({"title": "Local"}));
}

#[tokio::test]
async fn test_failed_attempts_are_counted() {
    let adapter = ScriptedAdapter::new()
        .respond(Err(AdapterError::Transient("timeout".into())))
        .respond(Err(AdapterError::Transient("timeout".into())));
    let config = SyncConfig {
        auto_retry_failed: false,
        ..offline()
    };
    let h = harness(adapter, config).await;

    let id = h
        .engine
        .enqueue(OperationKind::Update, task(), "task-1", json!({"title": "x"}))
        .await
        .unwrap();
    h.engine.set_online_status(true);
    h.engine.wait_for_background().await;

    let op = h.engine.snapshot().operations.get(id).unwrap().clone();
    assert_eq!(op.status, OperationStatus::Failed);
    assert_eq!(op.retry_count, 1);
    assert!(op.last_retry_at.is_some());
    assert!(op.last_error.unwrap().contains("timeout"));

    h.engine.set_online_status(false);
    h.engine.retry(id).await.unwrap();
    let op = h.engine.snapshot().operations.get(id).unwrap().clone();
    assert_eq!(op.status, OperationStatus::Pending);
    assert_eq!(op.retry_count, 1);

    h.engine.set_online_status(true);
    h.engine.wait_for_background().await;
    assert_eq!(h.engine.snapshot().operations.get(id).unwrap().retry_count, 2);

    h.engine.retry(id).await.unwrap();
    h.engine.wait_for_background().await;
    let op = h.engine.snapshot().operations.get(id).unwrap().clone();
    assert_eq!(op.status, OperationStatus::Completed);
    assert_eq!(op.retry_count, 2);
    assert_eq!(h.adapter.calls().len(), 3);
}

#[tokio::test]
async fn test_retry_rejects_non_failed_operations() {
    let h = harness(ScriptedAdapter::new(), offline()).await;
    let id = h
        .engine
        .enqueue(OperationKind::Create, task(), "task-1", json!({}))
        .await
        .unwrap();

    assert!(matches!(h.engine.retry(id).await, Err(Error::InvalidState(_))));
    assert!(matches!(
        h.engine.retry(tether_common::OperationId::new(42)).await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn test_max_attempts_abandons_operation() {
    let adapter = ScriptedAdapter::new()
        .respond(Err(AdapterError::Rejected("invalid".into())))
        .respond(Err(AdapterError::Rejected("invalid".into())));
    let config = SyncConfig {
        auto_retry_failed: false,
        max_attempts: Some(2),
        ..offline()
    };
    let h = harness(adapter, config).await;

    let id = h
        .engine
        .enqueue(OperationKind::Create, task(), "task-1", json!({}))
        .await
        .unwrap();
    h.engine.set_online_status(true);
    h.engine.wait_for_background().await;
    assert_eq!(
        h.engine.snapshot().operations.get(id).unwrap().status,
        OperationStatus::Failed
    );

    h.engine.retry(id).await.unwrap();
    h.engine.wait_for_background().await;

    let op = h.engine.snapshot().operations.get(id).unwrap().clone();
    assert_eq!(op.status, OperationStatus::Abandoned);
    assert_eq!(op.retry_count, 2);
    assert_eq!(h.engine.metrics().abandoned, 1);

    // manual retry still revives it
    h.engine.retry(id).await.unwrap();
    h.engine.wait_for_background().await;
    assert_eq!(
        h.engine.snapshot().operations.get(id).unwrap().status,
        OperationStatus::Completed
    );
}

#[tokio::test]
async fn test_transient_failure_is_retried_after_backoff() {
    let adapter = ScriptedAdapter::new().respond(Err(AdapterError::Transient("503".into())));
    let config = SyncConfig {
        retry: RetryConfig::new(0)
            .with_initial_delay(Duration::from_millis(10))
            .with_jitter(false),
        ..offline()
    };
    let h = harness(adapter, config).await;

    let id = h
        .engine
        .enqueue(OperationKind::Create, task(), "task-1", json!({}))
        .await
        .unwrap();

    let mut updates = h.engine.subscribe();
    h.engine.set_online_status(true);

    tokio::time::timeout(
        Duration::from_secs(5),
        updates.wait_for(|state| {
            state
                .operations
                .get(id)
                .is_some_and(|op| op.status == OperationStatus::Completed)
        }),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(h.adapter.calls().len(), 2);
    assert_eq!(h.engine.snapshot().operations.get(id).unwrap().retry_count, 1);
}

#[tokio::test]
async fn test_in_call_retries_absorb_transient_failures() {
    let adapter = ScriptedAdapter::new().respond(Err(AdapterError::Transient("reset".into())));
    let config = SyncConfig {
        call_retries: 1,
        retry: RetryConfig::new(0)
            .with_initial_delay(Duration::from_millis(1))
            .with_jitter(false),
        ..offline()
    };
    let h = harness(adapter, config).await;

    let id = h
        .engine
        .enqueue(OperationKind::Create, task(), "task-1", json!({}))
        .await
        .unwrap();
    h.engine.set_online_status(true);
    h.engine.wait_for_background().await;

    let op = h.engine.snapshot().operations.get(id).unwrap().clone();
    assert_eq!(op.status, OperationStatus::Completed);
    assert_eq!(op.retry_count, 0);
    assert_eq!(h.adapter.calls().len(), 2);
}

#[tokio::test]
async fn test_persistence_failure_ends_in_error() {
    let h = harness(ScriptedAdapter::new(), offline()).await;
    h.engine
        .enqueue(OperationKind::Create, task(), "task-1", json!({}))
        .await
        .unwrap();

    h.state_store.set_read_only(true);
    h.engine.set_online_status(true);
    h.engine.wait_for_background().await;

    let state = h.engine.snapshot();
    assert_eq!(state.sync_status, SyncStatus::Error);
    assert!(state.last_error.is_some());
    assert_eq!(h.notifier.failed.load(Ordering::SeqCst), 1);

    assert!(matches!(h.engine.start_sync().await, Err(Error::Storage(_))));
}

#[tokio::test]
async fn test_restart_restores_queue_and_resets_status() {
    let dir = tempfile::tempdir().unwrap();
    let open = |config: SyncConfig| {
        let store = Arc::new(FileStore::new(dir.path()).unwrap());
        SyncEngine::builder(store.clone(), store)
            .config(config)
            .adapter(Arc::new(ScriptedAdapter::new()))
            .unwrap()
            .open()
    };

    let engine = open(offline()).await.unwrap();
    let first = engine
        .enqueue(OperationKind::Create, task(), "task-1", json!({"title": "a"}))
        .await
        .unwrap();
    engine
        .record_conflict(
            OperationKind::Update,
            task(),
            "task-2",
            json!({"title": "b"}),
            json!({"title": "c"}),
        )
        .await
        .unwrap();
    assert_eq!(engine.snapshot().sync_status, SyncStatus::Conflict);
    drop(engine);

    let engine = open(offline()).await.unwrap();
    let state = engine.snapshot();
    assert_eq!(state.sync_status, SyncStatus::Idle);
    assert_eq!(state.progress, 0);
    assert!(!state.is_online);
    assert_eq!(state.operations.get(first).unwrap().status, OperationStatus::Pending);
    assert_eq!(state.conflicts.unresolved_count(), 1);

    let next = engine
        .enqueue(OperationKind::Create, task(), "task-3", json!({}))
        .await
        .unwrap();
    assert!(next.get() > first.get() + 1);
}

#[tokio::test]
async fn test_stop_sync_halts_between_operations() {
    let gate = Arc::new(Gate::default());
    let h = harness(ScriptedAdapter::new().gated(gate.clone()), offline()).await;

    for n in 1..=3 {
        h.engine
            .enqueue(OperationKind::Create, task(), format!("task-{}", n), json!({}))
            .await
            .unwrap();
    }

    h.engine.set_online_status(true);
    gate.entered.notified().await;
    assert_eq!(h.engine.snapshot().sync_status, SyncStatus::Syncing);

    h.engine.stop_sync();
    gate.release.notify_one();
    h.engine.wait_for_background().await;

    let state = h.engine.snapshot();
    assert_eq!(state.sync_status, SyncStatus::Idle);
    assert_eq!(state.progress, 0);
    assert_eq!(state.metrics().completed, 1);
    assert_eq!(state.metrics().pending, 2);
    assert_eq!(h.adapter.calls().len(), 1);

    h.engine.start_sync().await.unwrap().unwrap();
    assert_eq!(h.adapter.calls().len(), 3);
}

#[tokio::test]
async fn test_operation_removed_mid_pass_is_skipped() {
    let gate = Arc::new(Gate::default());
    let h = harness(ScriptedAdapter::new().gated(gate.clone()), offline()).await;

    let mut ids = Vec::new();
    for n in 1..=3 {
        ids.push(
            h.engine
                .enqueue(OperationKind::Create, task(), format!("task-{}", n), json!({}))
                .await
                .unwrap(),
        );
    }

    h.engine.set_online_status(true);
    gate.entered.notified().await;
    h.engine.remove(ids[1]).await.unwrap();
    gate.release.notify_one();
    h.engine.wait_for_background().await;

    assert_eq!(h.adapter.entity_ids(), vec!["task-1", "task-3"]);
    assert!(h.engine.snapshot().operations.get(ids[1]).is_none());
}

#[tokio::test]
async fn test_operation_enqueued_mid_pass_runs_next() {
    let gate = Arc::new(Gate::default());
    let h = harness(ScriptedAdapter::new().gated(gate.clone()), offline()).await;

    h.engine
        .enqueue(OperationKind::Create, task(), "task-1", json!({}))
        .await
        .unwrap();
    h.engine.set_online_status(true);
    gate.entered.notified().await;

    // a pass is running, so neither of these starts another one
    h.engine
        .enqueue(OperationKind::Create, task(), "task-2", json!({}))
        .await
        .unwrap();
    assert!(h.engine.start_sync().await.unwrap().is_none());

    gate.release.notify_one();
    h.engine.wait_for_background().await;

    assert_eq!(h.adapter.entity_ids(), vec!["task-1", "task-2"]);
    assert_eq!(h.engine.metrics().completed, 2);
    assert_eq!(h.notifier.completed.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_accepted_payload_is_reconciled_locally() {
    let accepted = json!({"title": "x", "serverId": "srv-1"});
    let adapter = ScriptedAdapter::new().respond(Ok(accepted.clone()));
    let h = harness(adapter, online()).await;

    h.engine
        .enqueue(OperationKind::Create, task(), "task-1", json!({"title": "x"}))
        .await
        .unwrap();
    h.engine.wait_for_background().await;

    assert_eq!(h.local.get(&task(), "task-1").await.unwrap(), Some(accepted));
}

#[tokio::test]
async fn test_reconcile_can_be_disabled() {
    let adapter = ScriptedAdapter::new().respond(Ok(json!({"title": "x", "serverId": "srv-1"})));
    let config = SyncConfig {
        reconcile_accepted: false,
        ..online()
    };
    let h = harness(adapter, config).await;

    h.engine
        .enqueue(OperationKind::Create, task(), "task-1", json!({"title": "x"}))
        .await
        .unwrap();
    h.engine.wait_for_background().await;

    assert_eq!(h.local.entity_count().unwrap(), 0);
}

#[tokio::test]
async fn test_auto_resolve_remote() {
    let adapter = ScriptedAdapter::new().respond(Err(AdapterError::conflict(json!({"title": "Remote"}))));
    let config = SyncConfig {
        auto_resolve: Some(Resolution::Remote),
        ..offline()
    };
    let h = harness(adapter, config).await;

    let id = h
        .engine
        .enqueue(OperationKind::Update, task(), "task-1", json!({"title": "Local"}))
        .await
        .unwrap();
    h.engine.set_online_status(true);
    h.engine.wait_for_background().await;

    let state = h.engine.snapshot();
    assert_eq!(state.conflicts.unresolved_count(), 0);
    assert!(state.operations.get(id).is_none());
    assert_eq!(state.metrics().completed, 0);
    assert_eq!(state.sync_status, SyncStatus::Success);
    assert_eq!(
        h.local.get(&task(), "task-1").await.unwrap(),
        Some(json!({"title": "Remote"}))
    );
}

#[tokio::test]
async fn test_unregistered_entity_type_fails_operation() {
    let h = harness(ScriptedAdapter::new(), offline()).await;
    let note = EntityType::new("note").unwrap();

    let id = h
        .engine
        .enqueue(OperationKind::Create, note, "note-1", json!({}))
        .await
        .unwrap();
    h.engine.set_online_status(true);
    h.engine.wait_for_background().await;

    let op = h.engine.snapshot().operations.get(id).unwrap().clone();
    assert_eq!(op.status, OperationStatus::Failed);
    assert!(op.last_error.unwrap().contains("No adapter"));
}

#[tokio::test]
async fn test_enqueue_rejects_blank_entity_id() {
    let h = harness(ScriptedAdapter::new(), offline()).await;
    let result = h.engine.enqueue(OperationKind::Create, task(), "  ", json!({})).await;
    assert!(matches!(result, Err(Error::InvalidInput(_))));
}

#[tokio::test]
async fn test_clear_completed_and_remove() {
    let h = harness(ScriptedAdapter::new(), online()).await;
    for n in 1..=2 {
        h.engine
            .enqueue(OperationKind::Create, task(), format!("task-{}", n), json!({}))
            .await
            .unwrap();
    }
    h.engine.wait_for_background().await;

    assert_eq!(h.engine.clear_completed().await.unwrap(), 2);
    assert!(h.engine.snapshot().operations.is_empty());
    assert!(matches!(
        h.engine.remove(tether_common::OperationId::new(1)).await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn test_concurrent_resolutions_apply_once() {
    let h = harness(ScriptedAdapter::new(), offline()).await;
    let id = h
        .engine
        .record_conflict(
            OperationKind::Update,
            task(),
            "task-1",
            json!({"title": "Local"}),
            json!({"title": "Remote"}),
        )
        .await
        .unwrap();

    let attempts = (0..4).map(|_| h.engine.resolve_conflict(id, Resolution::Local, None));
    let results = futures::future::join_all(attempts).await;

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(h.adapter.calls().len(), 1);
}

#[tokio::test]
async fn test_periodic_scheduler_drains_due_work() {
    let adapter = ScriptedAdapter::new().respond(Err(AdapterError::Transient("503".into())));
    let config = SyncConfig {
        sync_mode: SyncMode::Periodic {
            interval: Duration::from_millis(200),
        },
        retry: RetryConfig::new(0)
            .with_initial_delay(Duration::from_millis(50))
            .with_jitter(false),
        ..online()
    };
    let h = harness(adapter, config).await;

    let id = h
        .engine
        .enqueue(OperationKind::Create, task(), "task-1", json!({}))
        .await
        .unwrap();
    h.engine.wait_for_background().await;
    assert_eq!(
        h.engine.snapshot().operations.get(id).unwrap().status,
        OperationStatus::Failed
    );

    // push the armed retry far out so only the scheduler can pick the work up
    h.engine.schedule_next_sync(Duration::from_secs(3600));
    let mut updates = h.engine.subscribe();
    let _scheduler = h.engine.spawn_scheduler();

    tokio::time::timeout(
        Duration::from_secs(5),
        updates.wait_for(|state| {
            state
                .operations
                .get(id)
                .is_some_and(|op| op.status == OperationStatus::Completed)
        }),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(h.adapter.calls().len(), 2);
    h.engine.shutdown().await;
}

#[tokio::test]
async fn test_resolution_drops_linked_operation() {
    let adapter = ScriptedAdapter::new().respond(Err(AdapterError::conflict(json!({"title": "Remote"}))));
    let config = SyncConfig {
        retry: RetryConfig::new(0)
            .with_initial_delay(Duration::from_millis(1))
            .with_jitter(false),
        ..offline()
    };
    let h = harness(adapter, config).await;

    let id = h
        .engine
        .enqueue(OperationKind::Update, task(), "task-1", json!({"title": "Local"}))
        .await
        .unwrap();
    h.engine.set_online_status(true);
    h.engine.wait_for_background().await;
    assert_eq!(
        h.engine.snapshot().operations.get(id).unwrap().status,
        OperationStatus::Failed
    );

    let conflict = h.engine.unresolved_conflicts()[0].id;
    h.engine.resolve_conflict(conflict, Resolution::Remote, None).await.unwrap();
    h.engine.wait_for_background().await;

    let state = h.engine.snapshot();
    assert!(state.operations.get(id).is_none());
    assert_eq!(state.conflicts.get(conflict).unwrap().operation_id, Some(id));

    // nothing left to re-queue, so a later pass pushes nothing
    tokio::time::sleep(Duration::from_millis(20)).await;
    h.engine.start_sync().await.unwrap().unwrap();
    assert_eq!(h.adapter.calls().len(), 1);
}

#[tokio::test]
async fn test_failed_save_leaves_enqueue_unapplied() {
    let h = harness(ScriptedAdapter::new(), offline()).await;

    h.state_store.set_read_only(true);
    let result = h
        .engine
        .enqueue(OperationKind::Create, task(), "task-1", json!({"title": "a"}))
        .await;
    assert!(matches!(result, Err(Error::Storage(_))));
    assert!(h.engine.snapshot().operations.is_empty());

    h.state_store.set_read_only(false);
    h.engine.set_online_status(true);
    h.engine.wait_for_background().await;
    assert!(h.adapter.calls().is_empty());

    h.engine
        .enqueue(OperationKind::Create, task(), "task-1", json!({"title": "a"}))
        .await
        .unwrap();
    h.engine.wait_for_background().await;
    assert_eq!(h.adapter.entity_ids(), vec!["task-1"]);
}

#[tokio::test]
async fn test_failed_save_leaves_remove_and_retry_unapplied() {
    let adapter = ScriptedAdapter::new().respond(Err(AdapterError::Rejected("invalid".into())));
    let config = SyncConfig {
        auto_retry_failed: false,
        ..offline()
    };
    let h = harness(adapter, config).await;

    let id = h
        .engine
        .enqueue(OperationKind::Create, task(), "task-1", json!({}))
        .await
        .unwrap();
    h.engine.set_online_status(true);
    h.engine.wait_for_background().await;
    h.engine.set_online_status(false);

    h.state_store.set_read_only(true);
    assert!(h.engine.retry(id).await.is_err());
    assert_eq!(
        h.engine.snapshot().operations.get(id).unwrap().status,
        OperationStatus::Failed
    );
    assert!(h.engine.remove(id).await.is_err());
    assert!(h.engine.snapshot().operations.get(id).is_some());
}

#[tokio::test]
async fn test_failed_save_leaves_conflict_unresolved() {
    let h = harness(ScriptedAdapter::new(), offline()).await;
    let id = h
        .engine
        .record_conflict(
            OperationKind::Update,
            task(),
            "task-1",
            json!({"title": "Local"}),
            json!({"title": "Remote"}),
        )
        .await
        .unwrap();

    h.state_store.set_read_only(true);
    let result = h.engine.resolve_conflict(id, Resolution::Remote, None).await;
    assert!(matches!(result, Err(Error::Storage(_))));

    let state = h.engine.snapshot();
    assert!(!state.conflicts.get(id).unwrap().is_resolved());
    assert_eq!(state.sync_status, SyncStatus::Conflict);

    h.state_store.set_read_only(false);
    h.engine.resolve_conflict(id, Resolution::Remote, None).await.unwrap();
    assert!(h.engine.snapshot().conflicts.get(id).unwrap().is_resolved());
}

#[tokio::test]
async fn test_auto_resolve_mid_pass_keeps_pass_status() {
    let adapter = ScriptedAdapter::new().respond(Err(AdapterError::conflict(json!({"title": "Remote"}))));
    let config = SyncConfig {
        auto_resolve: Some(Resolution::Remote),
        ..offline()
    };
    let h = harness(adapter, config).await;
    h.adapter.observe(&h.engine);

    for n in 1..=2 {
        h.engine
            .enqueue(OperationKind::Update, task(), format!("task-{}", n), json!({"n": n}))
            .await
            .unwrap();
    }
    h.engine.set_online_status(true);
    h.engine.wait_for_background().await;

    let statuses = h.adapter.statuses();
    assert_eq!(statuses.len(), 2);
    assert!(statuses.iter().all(|s| *s != SyncStatus::Idle));
    assert_eq!(h.engine.snapshot().sync_status, SyncStatus::Success);
}

#[tokio::test]
async fn test_next_pass_replaces_previous_outcome() {
    let h = harness(ScriptedAdapter::new(), offline()).await;
    h.adapter.observe(&h.engine);
    h.engine
        .enqueue(OperationKind::Create, task(), "task-1", json!({}))
        .await
        .unwrap();

    h.state_store.set_read_only(true);
    h.engine.set_online_status(true);
    h.engine.wait_for_background().await;
    let state = h.engine.snapshot();
    assert_eq!(state.sync_status, SyncStatus::Error);
    assert!(state.last_error.is_some());

    h.state_store.set_read_only(false);
    h.engine
        .enqueue(OperationKind::Create, task(), "task-2", json!({}))
        .await
        .unwrap();
    h.engine.wait_for_background().await;

    let state = h.engine.snapshot();
    assert_eq!(state.sync_status, SyncStatus::Success);
    assert!(state.last_error.is_none());
    assert!(h.adapter.statuses().iter().all(|s| *s == SyncStatus::Syncing));
}
