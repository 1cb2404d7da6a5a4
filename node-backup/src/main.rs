//! Node Backup - Main entry point
//!
//! Runs one backup, restore or commit log restore in-process, or serves the
//! operations API for coordinated requests.

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::{Args as ClapArgs, Parser, Subcommand};
use node_backup::{
    api,
    daemon::ShutdownCoordinator,
    operations::Engine,
    request::{NodeEndpoint, TransferSettings},
    storage::StorageRegistry,
    utils, Config, DatabaseEntities, OperationRequest, OperationState, OperationsService,
    StorageLocation,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Back up this node, or the listed nodes with --global
    Backup(BackupArgs),

    /// Restore this node, or the listed nodes with --global, from a backup
    Restore(RestoreArgs),

    /// Restores archived commit logs to node
    CommitlogRestore(CommitlogRestoreArgs),

    /// Serve the operations API
    Serve {
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Print the effective configuration as TOML
    PrintConfig,
}

#[derive(ClapArgs, Debug)]
struct CommonArgs {
    /// Storage location, <provider>://<bucket>[/<prefix>]
    #[arg(long)]
    storage_location: StorageLocation,

    /// Entities to include: `ks1,ks2` or `ks1.t1,ks2.t2`
    #[arg(long, default_value = "")]
    entities: DatabaseEntities,

    /// Fan the request out to every --node
    #[arg(long)]
    global: bool,

    /// Member node as [<datacenter>:]<id>@http://host:port (repeatable)
    #[arg(long = "node")]
    nodes: Vec<NodeEndpoint>,

    /// With --global, only nodes of this datacenter receive the request
    #[arg(long, visible_alias = "dc")]
    datacenter: Option<String>,

    /// Wait for a held lock instead of failing
    #[arg(long)]
    wait_for_lock: bool,

    #[arg(long)]
    concurrency: Option<usize>,

    /// Aggregate bandwidth limit in bytes per second
    #[arg(long)]
    bandwidth: Option<u64>,

    #[arg(long)]
    retries: Option<u32>,

    #[arg(long)]
    timeout_secs: Option<u64>,
}

impl CommonArgs {
    fn transfer(&self, base: &TransferSettings) -> TransferSettings {
        TransferSettings {
            concurrency: self.concurrency.unwrap_or(base.concurrency),
            bandwidth: self.bandwidth.or(base.bandwidth),
            retries: self.retries.unwrap_or(base.retries),
        }
    }
}

#[derive(ClapArgs, Debug)]
struct BackupArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Snapshot tag (defaults to autosnap-<unix seconds>)
    #[arg(long)]
    snapshot_tag: Option<String>,

    /// Upload existing snapshot directories without contacting the node
    #[arg(long)]
    offline: bool,
}

#[derive(ClapArgs, Debug)]
struct RestoreArgs {
    #[command(flatten)]
    common: CommonArgs,

    #[arg(long)]
    snapshot_tag: String,

    /// Also restore the system keyspace
    #[arg(long)]
    restore_system_keyspace: bool,

    /// Rewrite initial_token in cassandra.yaml from the backup
    #[arg(long)]
    update_config: bool,
}

#[derive(ClapArgs, Debug)]
struct CommitlogRestoreArgs {
    /// Storage location, <provider>://<bucket>[/<prefix>]
    #[arg(long)]
    storage_location: StorageLocation,

    /// Directory the logs are downloaded to
    #[arg(long)]
    commit_log_restore_directory: Option<PathBuf>,

    /// Oldest archive time to restore (RFC 3339)
    #[arg(long)]
    timestamp_start: Option<DateTime<Utc>>,

    /// Newest archive time to restore, also the replay point in time (RFC 3339)
    #[arg(long)]
    timestamp_end: Option<DateTime<Utc>>,

    #[arg(long)]
    wait_for_lock: bool,

    #[arg(long)]
    concurrency: Option<usize>,

    #[arg(long)]
    bandwidth: Option<u64>,

    #[arg(long)]
    timeout_secs: Option<u64>,
}

fn build_backup(config: &Config, args: BackupArgs) -> OperationRequest {
    let mut request = config.backup_request(args.common.storage_location.clone());
    request.transfer = args.common.transfer(&config.transfer);
    request.entities = args.common.entities;
    request.global_request = args.common.global;
    request.nodes = args.common.nodes;
    request.datacenter = args.common.datacenter;
    request.wait_for_lock |= args.common.wait_for_lock;
    request.offline_backup = args.offline;
    if let Some(tag) = args.snapshot_tag {
        request.snapshot_tag = tag;
    }
    if let Some(timeout) = args.common.timeout_secs {
        request.timeout_secs = timeout;
    }
    OperationRequest::Backup(request)
}

fn build_restore(config: &Config, args: RestoreArgs) -> OperationRequest {
    let mut request =
        config.restore_request(args.common.storage_location.clone(), &args.snapshot_tag);
    request.transfer = args.common.transfer(&config.transfer);
    request.entities = args.common.entities;
    request.global_request = args.common.global;
    request.nodes = args.common.nodes;
    request.datacenter = args.common.datacenter;
    request.wait_for_lock |= args.common.wait_for_lock;
    request.restore_system_keyspace = args.restore_system_keyspace;
    request.update_config = args.update_config;
    if let Some(timeout) = args.common.timeout_secs {
        request.timeout_secs = timeout;
    }
    OperationRequest::Restore(request)
}

fn build_commitlog_restore(config: &Config, args: CommitlogRestoreArgs) -> OperationRequest {
    let mut request = config.commitlog_restore_request(args.storage_location);
    if args.commit_log_restore_directory.is_some() {
        request.commit_log_restore_directory = args.commit_log_restore_directory;
    }
    request.timestamp_start = args.timestamp_start;
    request.timestamp_end = args.timestamp_end;
    request.wait_for_lock |= args.wait_for_lock;
    if let Some(concurrency) = args.concurrency {
        request.transfer.concurrency = concurrency;
    }
    request.transfer.bandwidth = args.bandwidth.or(request.transfer.bandwidth);
    if let Some(timeout) = args.timeout_secs {
        request.timeout_secs = timeout;
    }
    OperationRequest::CommitlogRestore(request)
}

fn engine(config: &Config) -> Engine {
    Engine::new(
        Arc::new(config.cluster_control()),
        StorageRegistry::with_defaults(),
    )
}

/// Run one operation in-process and fail unless it completes.
async fn run_once(config: &Config, request: OperationRequest) -> Result<()> {
    let service = OperationsService::new(engine(config), node_backup::ws::WsState::new());

    let submitted = service.submit(request).await?;
    let operation = service
        .wait_for_terminal(submitted.id, WAIT_POLL_INTERVAL)
        .await?;

    println!("{}", serde_json::to_string_pretty(&operation)?);

    match operation.state {
        OperationState::Completed => Ok(()),
        _ => anyhow::bail!(
            "{} {} failed: {}",
            operation.kind,
            operation.id,
            operation.error.as_deref().unwrap_or("unknown error")
        ),
    }
}

async fn serve(config: &Config, port: Option<u16>) -> Result<()> {
    // Initialize start time for uptime tracking
    api::health::init_start_time();

    let port = port.unwrap_or(config.agent.port);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let app_state = api::create_app_state(config.agent.id.clone(), engine(config));
    let shutdown_coordinator = ShutdownCoordinator::new(app_state.operations.clone());
    let app = api::create_router(app_state);

    tracing::info!("Listening on http://{}", addr);
    tracing::info!("Operations endpoint: http://{}/operations", addr);
    tracing::info!("WebSocket endpoint: ws://{}/ws", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    let mut shutdown_rx = shutdown_coordinator.subscribe();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        shutdown_rx.recv().await.ok();
    });
    let server_handle = tokio::spawn(async move { server.await });

    shutdown_coordinator.wait_for_signal().await;
    shutdown_coordinator.shutdown(SHUTDOWN_GRACE).await;

    match tokio::time::timeout(Duration::from_secs(5), server_handle).await {
        Ok(Ok(Ok(()))) => tracing::info!("Server shutdown complete"),
        Ok(Ok(Err(e))) => tracing::error!("Server error during shutdown: {}", e),
        Ok(Err(e)) => tracing::error!("Server task panicked: {}", e),
        Err(_) => tracing::warn!("Server shutdown timeout, forcing exit"),
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load(args.config.as_deref())?;

    if let Command::PrintConfig = args.command {
        print!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::info!(
        "Starting node-backup v{} (agent_id: {})",
        env!("CARGO_PKG_VERSION"),
        config.agent.id
    );

    match args.command {
        Command::Backup(backup) => run_once(&config, build_backup(&config, backup)).await,
        Command::Restore(restore) => run_once(&config, build_restore(&config, restore)).await,
        Command::CommitlogRestore(restore) => {
            run_once(&config, build_commitlog_restore(&config, restore)).await
        }
        Command::Serve { port } => serve(&config, port).await,
        Command::PrintConfig => Ok(()),
    }
}
