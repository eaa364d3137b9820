//! Sync scheduling - manual and periodic modes.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, info};

use tether_common::{Error, Result};

/// Sync mode configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMode {
    /// Sync only when triggered (enqueue, reconnect, resolution, explicit).
    Manual,
    /// Additionally attempt a drain at regular intervals.
    Periodic { interval: Duration },
}

impl Default for SyncMode {
    fn default() -> Self {
        SyncMode::Periodic {
            interval: Duration::from_secs(30),
        }
    }
}

impl SyncMode {
    fn interval(&self) -> Option<Duration> {
        match self {
            SyncMode::Periodic { interval } => Some(*interval),
            SyncMode::Manual => None,
        }
    }
}

/// Requests accepted by the scheduler loop.
#[derive(Debug)]
pub enum SyncRequest {
    /// Attempt a drain now.
    Now,
    /// Re-read the mode and rebuild the interval.
    Reconfigure,
    /// Stop the loop.
    Shutdown,
}

/// Summary of one sync pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncResult {
    pub operations_synced: usize,
    pub operations_failed: usize,
    pub conflicts_found: usize,
    pub duration: Duration,
}

/// Handle used to control a running scheduler loop.
#[derive(Clone)]
pub struct SyncScheduler {
    mode: Arc<RwLock<SyncMode>>,
    request_tx: mpsc::Sender<SyncRequest>,
}

impl SyncScheduler {
    /// Create a new scheduler with the given mode.
    pub fn new(mode: SyncMode) -> (Self, SyncSchedulerHandle) {
        let (request_tx, request_rx) = mpsc::channel(100);
        let mode = Arc::new(RwLock::new(mode));

        let scheduler = Self {
            mode: mode.clone(),
            request_tx,
        };
        let handle = SyncSchedulerHandle { mode, request_rx };

        (scheduler, handle)
    }

    /// Ask the loop to attempt a drain now.
    pub async fn request_sync(&self) -> Result<()> {
        self.send(SyncRequest::Now).await
    }

    /// Change the sync mode.
    pub async fn set_mode(&self, mode: SyncMode) -> Result<()> {
        *self.mode.write().await = mode;
        self.send(SyncRequest::Reconfigure).await
    }

    /// Get current sync mode.
    pub async fn get_mode(&self) -> SyncMode {
        self.mode.read().await.clone()
    }

    /// Stop the loop. Safe to call after the loop has already exited.
    pub async fn shutdown(&self) {
        let _ = self.request_tx.send(SyncRequest::Shutdown).await;
    }

    async fn send(&self, request: SyncRequest) -> Result<()> {
        self.request_tx
            .send(request)
            .await
            .map_err(|_| Error::InvalidState("Scheduler not running".to_string()))
    }
}

/// The scheduler loop itself, consumed by [`SyncSchedulerHandle::run`].
pub struct SyncSchedulerHandle {
    mode: Arc<RwLock<SyncMode>>,
    request_rx: mpsc::Receiver<SyncRequest>,
}

impl SyncSchedulerHandle {
    /// Run the scheduler loop.
    ///
    /// This should be spawned in a tokio task. `tick` is called for every
    /// periodic tick and every explicit request; it must not block, the
    /// engine's drain attempt spawns its own task.
    pub async fn run<F>(mut self, tick: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut periodic = self.create_periodic_interval().await;

        info!("Sync scheduler started");

        loop {
            tokio::select! {
                request = self.request_rx.recv() => {
                    match request {
                        Some(SyncRequest::Now) => {
                            debug!("Explicit sync request");
                            tick();
                        }
                        Some(SyncRequest::Reconfigure) => {
                            periodic = self.create_periodic_interval().await;
                            debug!("Scheduler reconfigured: {:?}", *self.mode.read().await);
                        }
                        Some(SyncRequest::Shutdown) | None => {
                            info!("Sync scheduler shutting down");
                            break;
                        }
                    }
                }

                _ = Self::wait_for_periodic(&mut periodic) => {
                    debug!("Periodic sync tick");
                    tick();
                }
            }
        }
    }

    async fn create_periodic_interval(&self) -> Option<Interval> {
        self.mode.read().await.interval().map(|duration| {
            let mut ticker = interval(duration);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        })
    }

    async fn wait_for_periodic(periodic: &mut Option<Interval>) {
        match periodic {
            Some(ticker) => {
                ticker.tick().await;
            }
            None => std::future::pending::<()>().await,
        }
    }
}
