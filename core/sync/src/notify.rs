//! Notification collaborator.

use tracing::{error, info, warn};

use tether_common::Error;

use crate::conflict::Conflict;
use crate::scheduler::SyncResult;

/// Fire-and-forget callbacks for user-facing notifications.
///
/// Implementations must not block; the engine ignores whatever they do.
pub trait SyncNotifier: Send + Sync {
    /// A push was rejected and a conflict recorded.
    fn conflict_detected(&self, _conflict: &Conflict) {}

    /// A sync pass finished.
    fn sync_completed(&self, _result: &SyncResult) {}

    /// A sync pass aborted on an engine-level failure.
    fn sync_failed(&self, _error: &Error) {}
}

/// Notifier that writes every event to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl SyncNotifier for TracingNotifier {
    fn conflict_detected(&self, conflict: &Conflict) {
        warn!(
            "Conflict {} on {} {}: resolution required",
            conflict.id, conflict.entity_type, conflict.entity_id
        );
    }

    fn sync_completed(&self, result: &SyncResult) {
        info!(
            "Sync completed in {:?}: {} synced, {} failed, {} conflicts",
            result.duration,
            result.operations_synced,
            result.operations_failed,
            result.conflicts_found
        );
    }

    fn sync_failed(&self, err: &Error) {
        error!("Sync failed: {}", err);
    }
}
