//! DocVault CLI - drive the offline queue and sync coordinator from a shell.
//!
//! The commands run against an in-memory store and a hand-driven
//! connectivity source, which makes them useful for exercising retry,
//! reconnect and conflict behaviour without a backend.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use docvault_common::{EntityId, Error};
use docvault_store::{EntityGroup, MemoryStore, RevisionRecord};
use docvault_sync::{
    ConflictStrategy, ManualConnectivity, NetworkReachabilityMonitor, OperationQueue, PathStatus,
    QueueEvent, QueuedOperation, SyncCoordinator, SyncScheduler, SyncSettings, SyncStatus,
    SETTINGS_FILENAME,
};

#[derive(Parser)]
#[command(name = "docvault")]
#[command(about = "DocVault - Offline queue and sync tooling")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Settings file (default: <config dir>/docvault/sync.json).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue operations while offline, then reconnect and drain them.
    Queue {
        /// Number of operations to enqueue.
        #[arg(short, long, default_value_t = 5)]
        operations: usize,

        /// Operation names that always fail (e.g. op-2).
        #[arg(short, long)]
        fail: Vec<String>,

        /// Retries allowed after the first failed attempt.
        #[arg(short = 'r', long)]
        max_retries: Option<u32>,

        /// How long to stay offline before reconnecting, in milliseconds.
        #[arg(long, default_value_t = 500)]
        offline_ms: u64,
    },

    /// Run a sync pass over a seeded in-memory store.
    Sync {
        /// Number of entities to seed.
        #[arg(short, long, default_value_t = 9)]
        entities: usize,

        /// How many of them diverge on both sides.
        #[arg(long, default_value_t = 0)]
        conflicts: usize,

        /// Resolve every conflict found with this strategy.
        #[arg(short, long, value_enum)]
        resolve: Option<StrategyArg>,

        /// Fail the sync pass in this entity group.
        #[arg(long, value_enum)]
        fail_group: Option<GroupArg>,

        /// Start disconnected.
        #[arg(long)]
        offline: bool,
    },

    /// Show or write sync settings.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective settings.
    Show,
    /// Write default settings to the settings file.
    Init {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum StrategyArg {
    ServerWins,
    ClientWins,
    Merge,
    Manual,
}

impl From<StrategyArg> for ConflictStrategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::ServerWins => ConflictStrategy::ServerWins,
            StrategyArg::ClientWins => ConflictStrategy::ClientWins,
            StrategyArg::Merge => ConflictStrategy::Merge,
            StrategyArg::Manual => ConflictStrategy::Manual,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum GroupArg {
    Vaults,
    Documents,
    ComplianceRecords,
}

impl From<GroupArg> for EntityGroup {
    fn from(arg: GroupArg) -> Self {
        match arg {
            GroupArg::Vaults => EntityGroup::Vaults,
            GroupArg::Documents => EntityGroup::Documents,
            GroupArg::ComplianceRecords => EntityGroup::ComplianceRecords,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    if std::env::var_os("RUST_LOG").is_some() {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(EnvFilter::from_default_env())
            .with_target(false)
            .compact()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
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
    }

    let settings_path = settings_path(cli.config);

    match cli.command {
        Commands::Queue {
            operations,
            fail,
            max_retries,
            offline_ms,
        } => {
            let settings = load_settings(settings_path.as_deref()).await?;
            cmd_queue(settings, operations, &fail, max_retries, offline_ms).await
        }

        Commands::Sync {
            entities,
            conflicts,
            resolve,
            fail_group,
            offline,
        } => {
            let settings = load_settings(settings_path.as_deref()).await?;
            cmd_sync(settings, entities, conflicts, resolve, fail_group, offline).await
        }

        Commands::Config { action } => match action {
            ConfigAction::Show => cmd_config_show(settings_path.as_deref()).await,
            ConfigAction::Init { force } => cmd_config_init(settings_path.as_deref(), force).await,
        },
    }
}

/// Resolve the settings file location.
fn settings_path(explicit: Option<PathBuf>) -> Option<PathBuf> {
    explicit.or_else(|| {
        dirs::config_dir().map(|dir| dir.join("docvault").join(SETTINGS_FILENAME))
    })
}

/// Load settings, falling back to defaults when no file exists.
async fn load_settings(path: Option<&Path>) -> Result<SyncSettings> {
    match path {
        Some(path) if path.exists() => SyncSettings::load(path)
            .await
            .with_context(|| format!("Failed to load settings from {}", path.display())),
        _ => Ok(SyncSettings::default()),
    }
}

/// Enqueue operations offline, reconnect, and report every outcome.
async fn cmd_queue(
    mut settings: SyncSettings,
    operations: usize,
    fail: &[String],
    max_retries: Option<u32>,
    offline_ms: u64,
) -> Result<()> {
    settings.queue.assume_online = false;
    settings.queue.auto_drain = true;

    let source = ManualConnectivity::new(PathStatus::Unsatisfied);
    let monitor = NetworkReachabilityMonitor::new(Arc::new(source.clone()));
    monitor
        .start(|online| info!("Reachability: {}", if online { "online" } else { "offline" }))
        .context("Failed to start reachability monitor")?;

    let queue = OperationQueue::new(settings.queue);
    let _forwarder = queue.follow(monitor.subscribe());
    let mut events = queue.subscribe();

    for i in 0..operations {
        let name = format!("op-{}", i);
        let failing = fail.contains(&name);
        let label = name.clone();
        let mut operation = QueuedOperation::new(name, move || {
            let label = label.clone();
            async move {
                if failing {
                    Err(Error::Transient(format!("{} rejected by remote", label)))
                } else {
                    Ok(())
                }
            }
        })
        .with_priority((i % 3) as i32);
        if let Some(max_retries) = max_retries {
            operation = operation.with_max_retries(max_retries);
        }
        queue.enqueue(operation).await;
    }

    let status = queue.status().await;
    println!("Queued {} operations while offline", status.total_operations);
    println!("  Drain order: {}", queue.pending_names().await.join(", "));

    tokio::time::sleep(Duration::from_millis(offline_ms)).await;
    println!("Reconnecting...");
    source.set_online(true);

    let (completed, exhausted) = collect_outcomes(&queue, &mut events, operations).await;

    println!();
    println!("Completed: {}", completed);
    println!("Exhausted: {}", exhausted);
    println!("Passes:    {}", queue.passes().await);

    monitor.stop();
    Ok(())
}

/// Print queue events until every one of `expected` operations has finished.
///
/// Returns `(completed, exhausted)`. Outcomes missed to lag are accounted
/// for once the queue reports itself empty.
async fn collect_outcomes(
    queue: &OperationQueue,
    events: &mut broadcast::Receiver<QueueEvent>,
    expected: usize,
) -> (usize, usize) {
    let mut completed = 0;
    let mut exhausted = 0;
    while completed + exhausted < expected {
        match events.recv().await {
            Ok(QueueEvent::OperationCompleted { name, .. }) => {
                completed += 1;
                println!("  ✓ {}", name);
            }
            Ok(QueueEvent::OperationDeferred {
                name,
                retry_count,
                error,
                ..
            }) => {
                println!("  … {} failed, retry {} scheduled: {}", name, retry_count, error);
            }
            Ok(QueueEvent::OperationExhausted { error, .. }) => {
                exhausted += 1;
                println!("  ✗ {}", error);
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!("Missed {} queue events", skipped);
                if queue.status().await.total_operations == 0 {
                    break;
                }
            }
            Err(RecvError::Closed) => break,
        }
    }
    (completed, exhausted)
}

/// Seed a store, run one pass through the scheduler, and resolve conflicts.
async fn cmd_sync(
    mut settings: SyncSettings,
    entities: usize,
    conflicts: usize,
    resolve: Option<StrategyArg>,
    fail_group: Option<GroupArg>,
    offline: bool,
) -> Result<()> {
    let store = seed_store(entities, conflicts).await?;
    if let Some(group) = fail_group {
        store.fail_group(group.into(), "remote rejected batch").await;
    }

    settings.coordinator.assume_online = !offline;
    let coordinator = Arc::new(SyncCoordinator::new(settings.coordinator));
    coordinator.configure(Arc::new(store.clone())).await;

    let (scheduler, handle) = SyncScheduler::new(settings.mode);
    let task = tokio::spawn(handle.run(coordinator.clone()));

    let outcome = scheduler.request_sync().await;
    match &outcome {
        Ok(report) => {
            println!("Sync finished: {}", report.status);
            println!("  Phases:      {}", report.phases_completed.len());
            println!("  Committed:   {}", report.entities_committed);
            println!("  Conflicts:   {}", report.conflicts_found);
            println!("  Duration:    {:?}", report.duration);
        }
        Err(e) => println!("Sync failed: {}", e),
    }

    if let Some(strategy) = resolve {
        let strategy = ConflictStrategy::from(strategy);
        for conflict in coordinator.conflicts().await {
            let result = coordinator
                .resolve_conflict(&conflict.entity_id, strategy)
                .await
                .with_context(|| format!("Failed to resolve {}", conflict.entity_id))?;
            println!("  {} ({}): {:?}", conflict.entity_id, conflict.group, result);
        }
    }

    let snapshot = coordinator.snapshot().await;
    println!();
    println!("Status:         {}", snapshot.status);
    println!("Open conflicts: {}", snapshot.conflict_count);
    match snapshot.last_sync_time {
        Some(time) => println!("Last sync:      {}", time.format("%Y-%m-%d %H:%M:%S UTC")),
        None => println!("Last sync:      never"),
    }
    println!("Needs sync:     {}", coordinator.needs_sync().await);

    scheduler.shutdown().await;
    task.await.context("Scheduler task failed")?;

    if snapshot.status == SyncStatus::Error {
        outcome.context("Sync pass failed")?;
    }
    Ok(())
}

/// Build a store with local edits and `conflicts` two-sided divergences.
async fn seed_store(entities: usize, conflicts: usize) -> Result<MemoryStore> {
    let store = MemoryStore::new();
    for i in 0..entities {
        let group = EntityGroup::ALL[i % EntityGroup::ALL.len()];
        let id = EntityId::new(format!("{}-{}", group, i))?;
        store
            .put_record(RevisionRecord::in_sync(id.clone(), group, "r1"))
            .await;

        if i < conflicts {
            store.modify_local(&id, group).await;
            store.modify_remote(&id, group).await;
        } else if i % 2 == 0 {
            store.modify_local(&id, group).await;
        } else {
            store.modify_remote(&id, group).await;
        }
    }
    Ok(store)
}

/// Print the effective settings as JSON.
async fn cmd_config_show(path: Option<&Path>) -> Result<()> {
    let settings = load_settings(path).await?;
    match path {
        Some(path) if path.exists() => println!("# {}", path.display()),
        _ => println!("# defaults"),
    }
    println!("{}", settings.to_json()?);
    Ok(())
}

/// Write default settings.
async fn cmd_config_init(path: Option<&Path>, force: bool) -> Result<()> {
    let path = path.context("No config directory available; pass --config")?;
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }

    SyncSettings::default()
        .save(path)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Wrote default settings to {}", path.display());
    Ok(())
}
