//! FieldSync CLI - Inspect and drive an offline mutation queue.
//!
//! This tool operates on the same on-disk queue an app would use, so it can
//! be used to enqueue test mutations, inspect failures and push pending work
//! to an API endpoint.

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use fieldsync_common::{Error, ItemId};
use fieldsync_storage::FileStore;
use fieldsync_sync::{
    ConflictPolicy, ConflictResolver, EnqueueOptions, HttpEntityClient, ItemStatus,
    ManualNetworkMonitor, Operation, Priority, RemoteEntity, RemoteEntityClient, SyncConfig,
    SyncEngine, SyncItem,
};

#[derive(Parser)]
#[command(name = "fieldsync")]
#[command(about = "FieldSync - Offline mutation queue management")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Directory holding the persisted queue.
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// JSON file with sync configuration overrides.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show queue counts and sync statistics.
    Status,

    /// List queued items.
    List {
        /// Only show items that exhausted their retries.
        #[arg(short, long)]
        failed: bool,
    },

    /// Queue a mutation without sending it.
    Enqueue {
        /// Operation: create, update or delete.
        #[arg(short, long)]
        operation: Operation,

        /// Entity type, e.g. "tasks".
        #[arg(short = 't', long)]
        entity_type: String,

        /// Target entity id (placeholder id for creates).
        #[arg(short, long)]
        entity_id: Option<String>,

        /// JSON payload.
        #[arg(short, long, default_value = "{}")]
        payload: String,

        /// Priority: low, medium or high.
        #[arg(long, default_value = "medium")]
        priority: Priority,

        /// Conflict policy override: client_wins, server_wins or merge.
        #[arg(long)]
        policy: Option<ConflictPolicy>,
    },

    /// Put a failed item back in line.
    Retry {
        /// Queue item id.
        id: String,
    },

    /// Put every failed item back in line.
    RetryAll,

    /// Remove completed items kept for auditing.
    ClearCompleted,

    /// Discard every queued item.
    Clear {
        /// Confirm discarding unsent mutations.
        #[arg(long)]
        yes: bool,
    },

    /// Deliver pending items to an API endpoint.
    Sync {
        /// Base URL of the entity API.
        #[arg(short, long)]
        endpoint: String,

        /// Bearer token sent with every request.
        #[arg(long)]
        token: Option<String>,
    },
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

    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => dirs::data_dir()
            .context("Could not determine a data directory, pass --data-dir")?
            .join("fieldsync"),
    };
    let config = load_config(cli.config.as_deref()).await?;

    match cli.command {
        Commands::Status => cmd_status(&data_dir, config).await,

        Commands::List { failed } => cmd_list(&data_dir, config, failed).await,

        Commands::Enqueue {
            operation,
            entity_type,
            entity_id,
            payload,
            priority,
            policy,
        } => {
            let options = EnqueueOptions {
                entity_id,
                priority,
                conflict_policy: policy,
            };
            cmd_enqueue(&data_dir, config, operation, &entity_type, &payload, options).await
        }

        Commands::Retry { id } => cmd_retry(&data_dir, config, &id).await,

        Commands::RetryAll => cmd_retry_all(&data_dir, config).await,

        Commands::ClearCompleted => cmd_clear_completed(&data_dir, config).await,

        Commands::Clear { yes } => cmd_clear(&data_dir, config, yes).await,

        Commands::Sync { endpoint, token } => {
            cmd_sync(&data_dir, config, &endpoint, token.as_deref()).await
        }
    }
}

/// Stand-in remote for commands that never dispatch.
struct OfflineClient;

#[async_trait]
impl RemoteEntityClient for OfflineClient {
    async fn create(
        &self,
        _entity_type: &str,
        _payload: &Value,
    ) -> fieldsync_common::Result<RemoteEntity> {
        Err(Error::Offline)
    }

    async fn read(&self, _entity_type: &str, _id: &str) -> fieldsync_common::Result<RemoteEntity> {
        Err(Error::Offline)
    }

    async fn update(
        &self,
        _entity_type: &str,
        _id: &str,
        _payload: &Value,
    ) -> fieldsync_common::Result<RemoteEntity> {
        Err(Error::Offline)
    }

    async fn delete(&self, _entity_type: &str, _id: &str) -> fieldsync_common::Result<()> {
        Err(Error::Offline)
    }
}

async fn load_config(path: Option<&Path>) -> Result<SyncConfig> {
    let Some(path) = path else {
        return Ok(SyncConfig::default());
    };
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Invalid config {}", path.display()))
}

/// Open the queue without network access.
async fn open_offline(data_dir: &Path, config: SyncConfig) -> Result<SyncEngine> {
    open_engine(
        data_dir,
        config,
        Arc::new(OfflineClient),
        Arc::new(ManualNetworkMonitor::new(false)),
    )
    .await
}

async fn open_engine(
    data_dir: &Path,
    config: SyncConfig,
    remote: Arc<dyn RemoteEntityClient>,
    network: Arc<ManualNetworkMonitor>,
) -> Result<SyncEngine> {
    let store = FileStore::new(data_dir)
        .with_context(|| format!("Failed to open data directory {}", data_dir.display()))?;

    SyncEngine::open(
        remote,
        Arc::new(store),
        network,
        ConflictResolver::standard(),
        config.with_sync_on_enqueue(false),
    )
    .await
    .context("Failed to load sync queue")
}

fn print_item(item: &SyncItem) {
    println!(
        "  {}  {:<9} {:<6} {}/{}  priority={:?} retries={}",
        item.id,
        format!("{:?}", item.status),
        item.operation,
        item.entity_type,
        item.entity_id
            .as_deref()
            .or(item.temp_id.as_deref())
            .unwrap_or("-"),
        item.priority,
        item.retry_count
    );
    if let Some(error) = &item.last_error {
        println!("      last error: {}", error);
    }
}

/// Show queue counts and statistics.
async fn cmd_status(data_dir: &Path, config: SyncConfig) -> Result<()> {
    let engine = open_offline(data_dir, config).await?;
    let counts = engine.status_counts().await;
    let stats = engine.statistics().await;

    let count = |status: ItemStatus| counts.get(&status).copied().unwrap_or(0);

    println!("Queue at {}", data_dir.display());
    println!("  Pending:   {}", count(ItemStatus::Pending));
    println!("  Failed:    {}", count(ItemStatus::Failed));
    println!("  Completed: {}", count(ItemStatus::Succeeded));
    println!();
    println!("Statistics:");
    println!("  Synced:              {}", stats.total_synced);
    println!("  Failed:              {}", stats.total_failed);
    println!("  Conflicts resolved:  {}", stats.conflicts_resolved);
    println!("  Passes:              {}", stats.pass_count);
    println!("  Average pass:        {:.1} ms", stats.average_duration_ms);
    match stats.last_sync_at {
        Some(at) => println!("  Last sync:           {}", at.to_rfc3339()),
        None => println!("  Last sync:           never"),
    }

    Ok(())
}

/// List queued items.
async fn cmd_list(data_dir: &Path, config: SyncConfig, failed: bool) -> Result<()> {
    let engine = open_offline(data_dir, config).await?;
    let items = if failed {
        engine.failed_items().await
    } else {
        engine.pending_items().await
    };

    if items.is_empty() {
        println!("No {} items.", if failed { "failed" } else { "pending" });
    } else {
        println!("{} {} items:", items.len(), if failed { "failed" } else { "pending" });
        for item in &items {
            print_item(item);
        }
    }

    Ok(())
}

/// Queue a mutation.
async fn cmd_enqueue(
    data_dir: &Path,
    config: SyncConfig,
    operation: Operation,
    entity_type: &str,
    payload: &str,
    options: EnqueueOptions,
) -> Result<()> {
    let payload: Value = serde_json::from_str(payload).context("Payload is not valid JSON")?;
    let engine = open_offline(data_dir, config).await?;

    let id = engine
        .enqueue(operation, entity_type, payload, options)
        .await
        .context("Failed to enqueue mutation")?;

    println!("Queued {} {} as {}", operation, entity_type, id);
    Ok(())
}

/// Reset one failed item.
async fn cmd_retry(data_dir: &Path, config: SyncConfig, id: &str) -> Result<()> {
    let id = ItemId::new(id).context("Invalid item id")?;
    let engine = open_offline(data_dir, config).await?;

    if engine.retry(&id).await {
        println!("Item {} will be retried on the next sync.", id);
    } else {
        anyhow::bail!("No failed item with id {}", id);
    }
    Ok(())
}

/// Reset every failed item.
async fn cmd_retry_all(data_dir: &Path, config: SyncConfig) -> Result<()> {
    let engine = open_offline(data_dir, config).await?;
    let count = engine.retry_all().await;
    println!("{} failed items will be retried on the next sync.", count);
    Ok(())
}

/// Remove completed items.
async fn cmd_clear_completed(data_dir: &Path, config: SyncConfig) -> Result<()> {
    let engine = open_offline(data_dir, config).await?;
    let removed = engine.clear_completed().await;
    println!("Removed {} completed items.", removed);
    Ok(())
}

/// Discard everything.
async fn cmd_clear(data_dir: &Path, config: SyncConfig, yes: bool) -> Result<()> {
    let engine = open_offline(data_dir, config).await?;
    let pending = engine.pending_count().await;

    if pending > 0 && !yes {
        anyhow::bail!(
            "{} unsent mutations would be lost, pass --yes to discard them",
            pending
        );
    }

    engine.clear().await;
    println!("Queue cleared.");
    Ok(())
}

/// Run a sync pass against `endpoint`.
async fn cmd_sync(
    data_dir: &Path,
    config: SyncConfig,
    endpoint: &str,
    token: Option<&str>,
) -> Result<()> {
    info!("Syncing with {}", endpoint);

    let mut client = HttpEntityClient::new(endpoint).context("Invalid endpoint")?;
    if let Some(token) = token {
        client = client.with_token(token);
    }

    let engine = open_engine(
        data_dir,
        config,
        Arc::new(client),
        Arc::new(ManualNetworkMonitor::new(true)),
    )
    .await?;

    let pending = engine.pending_count().await;
    if pending == 0 {
        println!("Nothing to sync.");
        return Ok(());
    }

    let mut synced = 0;
    let mut failed = 0;
    loop {
        let result = engine.force_sync().await;
        synced += result.synced;
        failed += result.failed;
        // Items still backing off wait for the next invocation
        if result.synced == 0 || engine.pending_count().await == 0 {
            break;
        }
    }

    println!("Sync finished: {} synced, {} failed attempts.", synced, failed);
    let remaining = engine.pending_count().await;
    if remaining > 0 {
        println!("  {} items still pending.", remaining);
    }
    let exhausted = engine.failed_items().await;
    if !exhausted.is_empty() {
        println!("  {} items failed permanently:", exhausted.len());
        for item in &exhausted {
            print_item(item);
        }
    }

    Ok(())
}
