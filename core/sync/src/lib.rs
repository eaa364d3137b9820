//! Tether sync engine
//!
//! Offline-first synchronization of local mutations against a remote API:
//! - Durable FIFO operation queue
//! - Conflict capture and resolution (local, remote, merge, manual)
//! - Drain orchestration with online/offline awareness
//! - Retry strategy with exponential backoff
//! - Manual and periodic scheduling

pub mod adapter;
pub mod conflict;
pub mod engine;
pub mod notify;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod state;
pub mod strategy;

// Re-export main types
pub use adapter::{AdapterError, AdapterRegistry, AdapterResult, EntitySyncAdapter};
pub use conflict::{Conflict, ConflictStore, Resolution};
pub use engine::{SyncConfig, SyncEngine, SyncEngineBuilder};
pub use notify::{SyncNotifier, TracingNotifier};
pub use queue::{Operation, OperationKind, OperationQueue, OperationStatus};
pub use retry::{RetryConfig, RetryExecutor};
pub use scheduler::{SyncMode, SyncRequest, SyncResult, SyncScheduler, SyncSchedulerHandle};
pub use state::{EngineState, PersistedState, SyncMetrics, SyncStatus};
pub use strategy::{suggest_merge, ResolutionPlan};
