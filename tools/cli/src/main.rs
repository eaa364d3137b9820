//! Tether CLI - inspect and drive the offline sync queue from a terminal.
//!
//! State lives in a directory (`--state-dir`): the persisted queue, the local
//! entity copies, and a loopback remote under `remote/` that stands in for a
//! server.

mod loopback;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use tether_common::{ConflictId, EntityType, OperationId};
use tether_storage::{FileStore, StateStore};
use tether_sync::{
    AdapterRegistry, OperationKind, OperationStatus, PersistedState, Resolution, SyncConfig,
    SyncEngine, SyncMode,
};

use crate::loopback::LoopbackAdapter;

#[derive(Parser)]
#[command(name = "tether")]
#[command(about = "Tether - Offline sync queue and conflict resolution")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Directory holding the queue, local entities and loopback remote.
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// JSON file with engine configuration.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Kind {
    Create,
    Update,
    Delete,
}

impl From<Kind> for OperationKind {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Create => OperationKind::Create,
            Kind::Update => OperationKind::Update,
            Kind::Delete => OperationKind::Delete,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum StatusFilter {
    Pending,
    Completed,
    Failed,
    Abandoned,
}

impl From<StatusFilter> for OperationStatus {
    fn from(status: StatusFilter) -> Self {
        match status {
            StatusFilter::Pending => OperationStatus::Pending,
            StatusFilter::Completed => OperationStatus::Completed,
            StatusFilter::Failed => OperationStatus::Failed,
            StatusFilter::Abandoned => OperationStatus::Abandoned,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Queue a local mutation.
    Enqueue {
        /// Mutation kind.
        #[arg(short, long, value_enum)]
        kind: Kind,

        /// Entity type, e.g. "task".
        #[arg(short = 't', long)]
        entity_type: EntityType,

        /// Entity id.
        #[arg(short, long)]
        id: String,

        /// JSON payload (default: null).
        #[arg(short, long)]
        payload: Option<String>,
    },

    /// List queued operations.
    List {
        /// Only show operations with this status.
        #[arg(short, long, value_enum)]
        status: Option<StatusFilter>,
    },

    /// Cancel a queued operation.
    Remove {
        /// Operation id, e.g. "op-3" or "3".
        id: OperationId,
    },

    /// Move a failed or abandoned operation back to pending.
    Retry {
        /// Operation id.
        id: OperationId,
    },

    /// Drop completed operations.
    ClearCompleted,

    /// List conflicts.
    Conflicts {
        /// Include resolved conflicts.
        #[arg(short, long)]
        all: bool,
    },

    /// Resolve one conflict.
    Resolve {
        /// Conflict id, e.g. "conflict-4" or "4".
        id: ConflictId,

        /// local, remote, merge or manual.
        #[arg(short, long)]
        strategy: Resolution,

        /// JSON payload for manual (or an explicit merge).
        #[arg(short, long)]
        payload: Option<String>,
    },

    /// Resolve every unresolved conflict with one strategy.
    ResolveAll {
        /// local, remote or merge.
        #[arg(short, long)]
        strategy: Resolution,
    },

    /// Drain the queue against the loopback remote.
    Sync,

    /// Show queue and conflict counts.
    Metrics {
        /// Print as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Run the background scheduler until Ctrl-C.
    Watch,
}

impl Commands {
    /// Commands that talk to the remote run online; everything else only
    /// touches the queue.
    fn is_online(&self) -> bool {
        matches!(self, Commands::Sync | Commands::Watch)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let state_dir = match cli.state_dir {
        Some(dir) => dir,
        None => dirs::data_dir()
            .context("No data directory on this platform, pass --state-dir")?
            .join("tether"),
    };

    let mut config = load_config(cli.config.as_deref())?;
    config.start_online = cli.command.is_online();

    let new_type = match &cli.command {
        Commands::Enqueue { entity_type, .. } => Some(entity_type.clone()),
        _ => None,
    };
    let engine = open_engine(&state_dir, config, new_type).await?;

    let outcome = match cli.command {
        Commands::Enqueue {
            kind,
            entity_type,
            id,
            payload,
        } => cmd_enqueue(&engine, kind.into(), entity_type, &id, payload.as_deref()).await,

        Commands::List { status } => cmd_list(&engine, status.map(Into::into)),

        Commands::Remove { id } => cmd_remove(&engine, id).await,

        Commands::Retry { id } => cmd_retry(&engine, id).await,

        Commands::ClearCompleted => cmd_clear_completed(&engine).await,

        Commands::Conflicts { all } => cmd_conflicts(&engine, all),

        Commands::Resolve {
            id,
            strategy,
            payload,
        } => cmd_resolve(&engine, id, strategy, payload.as_deref()).await,

        Commands::ResolveAll { strategy } => cmd_resolve_all(&engine, strategy).await,

        Commands::Sync => cmd_sync(&engine).await,

        Commands::Metrics { json } => cmd_metrics(&engine, json),

        Commands::Watch => cmd_watch(&engine).await,
    };

    engine.shutdown().await;
    outcome
}

/// Read the engine configuration, falling back to defaults.
fn load_config(path: Option<&Path>) -> Result<SyncConfig> {
    let Some(path) = path else {
        return Ok(SyncConfig::default());
    };

    let data = std::fs::read(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    let config: SyncConfig = serde_json::from_slice(&data).context("Invalid config file")?;
    config.validate().context("Invalid config file")?;
    Ok(config)
}

/// Open the engine with a loopback adapter for every known entity type.
async fn open_engine(
    state_dir: &Path,
    config: SyncConfig,
    extra_type: Option<EntityType>,
) -> Result<SyncEngine> {
    let store = Arc::new(FileStore::new(state_dir).context("Failed to open state directory")?);
    let remote = Arc::new(
        FileStore::new(state_dir.join("remote")).context("Failed to open loopback remote")?,
    );

    let mut types = known_entity_types(store.as_ref(), &config.namespace).await?;
    types.extend(extra_type);

    let mut adapters = AdapterRegistry::new();
    for entity_type in types {
        adapters.register(Arc::new(LoopbackAdapter::new(entity_type, remote.clone())))?;
    }

    SyncEngine::builder(store.clone(), store)
        .config(config)
        .adapters(adapters)
        .open()
        .await
        .context("Failed to open sync engine")
}

/// Entity types referenced by the persisted queue and conflicts.
async fn known_entity_types(store: &dyn StateStore, namespace: &str) -> Result<BTreeSet<EntityType>> {
    let Some(data) = store.load(namespace).await? else {
        return Ok(BTreeSet::new());
    };
    let persisted = PersistedState::from_json(&data).context("Corrupt sync state")?;

    Ok(persisted
        .operations
        .iter()
        .map(|op| op.entity_type.clone())
        .chain(persisted.conflicts.iter().map(|c| c.entity_type.clone()))
        .collect())
}

fn parse_payload(payload: Option<&str>) -> Result<Option<Value>> {
    payload
        .map(|raw| serde_json::from_str(raw).context("Payload is not valid JSON"))
        .transpose()
}

async fn cmd_enqueue(
    engine: &SyncEngine,
    kind: OperationKind,
    entity_type: EntityType,
    entity_id: &str,
    payload: Option<&str>,
) -> Result<()> {
    let payload = parse_payload(payload)?.unwrap_or(Value::Null);
    let id = engine
        .enqueue(kind, entity_type, entity_id, payload)
        .await
        .context("Failed to enqueue operation")?;

    println!("Queued {}", id);
    Ok(())
}

fn cmd_list(engine: &SyncEngine, status: Option<OperationStatus>) -> Result<()> {
    let state = engine.snapshot();
    let operations: Vec<_> = state
        .operations
        .iter()
        .filter(|op| status.is_none_or(|s| op.status == s))
        .collect();

    if operations.is_empty() {
        println!("Queue is empty.");
        return Ok(());
    }

    for op in operations {
        println!(
            "  {:<8} {:<7} {}/{}  {:?}  retries={}  queued {}",
            op.id.to_string(),
            format!("{:?}", op.kind).to_lowercase(),
            op.entity_type,
            op.entity_id,
            op.status,
            op.retry_count,
            op.enqueued_at.format("%Y-%m-%d %H:%M:%S")
        );
        if let Some(error) = &op.last_error {
            println!("           last error: {}", error);
        }
    }
    Ok(())
}

async fn cmd_remove(engine: &SyncEngine, id: OperationId) -> Result<()> {
    let removed = engine.remove(id).await.context("Failed to remove operation")?;
    println!("Removed {} ({:?})", removed.id, removed.status);
    Ok(())
}

async fn cmd_retry(engine: &SyncEngine, id: OperationId) -> Result<()> {
    engine.retry(id).await.context("Failed to retry operation")?;
    println!("{} is pending again", id);
    Ok(())
}

async fn cmd_clear_completed(engine: &SyncEngine) -> Result<()> {
    let removed = engine.clear_completed().await?;
    println!("Cleared {} completed operations", removed);
    Ok(())
}

fn cmd_conflicts(engine: &SyncEngine, all: bool) -> Result<()> {
    let state = engine.snapshot();
    let conflicts: Vec<_> = state
        .conflicts
        .iter()
        .filter(|c| all || !c.is_resolved())
        .collect();

    if conflicts.is_empty() {
        println!("No conflicts.");
        return Ok(());
    }

    for conflict in conflicts {
        let status = match conflict.resolution {
            Some(resolution) => format!("resolved {:?}", resolution),
            None => "unresolved".to_string(),
        };
        println!(
            "{}  {}/{}  {}  detected {}",
            conflict.id,
            conflict.entity_type,
            conflict.entity_id,
            status,
            conflict.detected_at.format("%Y-%m-%d %H:%M:%S")
        );
        println!("  local:  {}", conflict.local_payload);
        println!("  remote: {}", conflict.remote_payload);
    }
    Ok(())
}

async fn cmd_resolve(
    engine: &SyncEngine,
    id: ConflictId,
    strategy: Resolution,
    payload: Option<&str>,
) -> Result<()> {
    let payload = parse_payload(payload)?;
    engine
        .resolve_conflict(id, strategy, payload)
        .await
        .with_context(|| format!("Failed to resolve {}", id))?;

    println!("Resolved {} with {:?}", id, strategy);
    Ok(())
}

async fn cmd_resolve_all(engine: &SyncEngine, strategy: Resolution) -> Result<()> {
    let resolved = engine
        .resolve_all_conflicts(strategy)
        .await
        .context("Failed to resolve conflicts")?;
    println!("Resolved {} conflicts with {:?}", resolved, strategy);
    Ok(())
}

async fn cmd_sync(engine: &SyncEngine) -> Result<()> {
    let Some(result) = engine.start_sync().await.context("Sync failed")? else {
        println!("Sync skipped.");
        return Ok(());
    };
    engine.wait_for_background().await;

    println!(
        "Synced {} operations ({} failed, {} conflicts) in {:?}",
        result.operations_synced, result.operations_failed, result.conflicts_found, result.duration
    );
    Ok(())
}

fn cmd_metrics(engine: &SyncEngine, json: bool) -> Result<()> {
    let metrics = engine.metrics();
    if json {
        println!("{}", serde_json::to_string_pretty(&metrics)?);
        return Ok(());
    }

    println!("Pending:      {}", metrics.pending);
    println!("Failed:       {}", metrics.failed);
    println!("Abandoned:    {}", metrics.abandoned);
    println!("Completed:    {}", metrics.completed);
    println!("Conflicts:    {}", metrics.unresolved_conflicts);
    match metrics.last_sync_at {
        Some(at) => println!("Last sync:    {}", at.format("%Y-%m-%d %H:%M:%S")),
        None => println!("Last sync:    never"),
    }
    Ok(())
}

async fn cmd_watch(engine: &SyncEngine) -> Result<()> {
    if engine.config().sync_mode == SyncMode::Manual {
        anyhow::bail!("Sync mode is manual, set a periodic sync_mode to watch");
    }

    let _scheduler = engine.spawn_scheduler();
    let mut updates = engine.subscribe();
    let mut last_status = updates.borrow().sync_status;
    info!("Watching, press Ctrl-C to stop");

    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let status = updates.borrow_and_update().sync_status;
                if status != last_status {
                    println!("{:?}", status);
                    last_status = status;
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                break;
            }
        }
    }

    engine.stop_sync();
    Ok(())
}
