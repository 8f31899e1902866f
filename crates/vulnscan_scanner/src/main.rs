//! VulnScan scanner node.
//!
//! Usage:
//!     vulnscan-node --database-url sqlite:vulnscan.db --concurrency 100

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use vulnscan_logging::{init_logging, LogConfig};
use vulnscan_protocol::Settings;
use vulnscan_scanner::executor::{CaseExecutor, ExecutorConfig, ScanTaskHandler};
use vulnscan_scanner::fingerprint::FingerprintEngine;
use vulnscan_scanner::node::{generate_node_id, NodeConfig, NodeManager};
use vulnscan_scanner::registry::{CaseRegistry, ToolRegistry};
use vulnscan_scanner::AuthManager;
use vulnscan_store::{open_store, WorkBroker};

#[derive(Parser, Debug)]
#[command(name = "vulnscan-node", about = "VulnScan scanner node")]
struct Args {
    /// Record store / broker URL (overrides DATABASE_URL)
    #[arg(long)]
    database_url: Option<String>,

    /// Node ID (auto-generated if not provided)
    #[arg(long)]
    node_id: Option<String>,

    /// Pool size (overrides SCANNER_MAX_CONCURRENCY)
    #[arg(long)]
    concurrency: Option<usize>,

    /// Plugin directory (overrides PLUGIN_DIR)
    #[arg(long)]
    plugin_dir: Option<PathBuf>,

    /// Node tags (repeatable)
    #[arg(long = "tag")]
    tags: Vec<String>,

    /// Directory for log files (stderr only if unset)
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Verbose console logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(LogConfig {
        app_name: "vulnscan-node",
        verbose: args.verbose,
        log_dir: args.log_dir.as_deref(),
    })?;

    let mut settings = Settings::from_env().context("invalid configuration")?;
    if let Some(database_url) = args.database_url {
        settings.database_url = database_url;
    }
    if let Some(concurrency) = args.concurrency {
        settings.scanner_max_concurrency = concurrency;
    }
    if let Some(plugin_dir) = args.plugin_dir {
        settings.plugin_dir = plugin_dir;
    }

    let node_id = args.node_id.unwrap_or_else(generate_node_id);
    info!("Starting VulnScan node {}", node_id);
    info!("  Store: {}", settings.database_url);
    info!("  Plugins: {}", settings.plugin_dir.display());

    let store = open_store(&settings.database_url, settings.database_max_connections())
        .await
        .context("failed to open record store")?;
    let broker = WorkBroker::new(store.pool().clone(), settings.rabbitmq_exchange.clone());

    // Composition root: engine, auth, tools, registry, executor.
    let engine = Arc::new(FingerprintEngine::new().context("failed to build HTTP client")?);
    let auth = Arc::new(AuthManager::new());

    let mut tools = ToolRegistry::new();
    tools.register("fingerprint_engine", engine.clone());
    tools.register("auth_manager", auth.clone());

    let mut registry = CaseRegistry::new(Arc::new(tools));
    registry.register_builtin();
    let loaded = registry.load_from_directory(&settings.plugin_dir)?;
    info!(
        "Loaded {} plugin cases ({} total)",
        loaded,
        registry.len()
    );

    // Mirror case metadata into the store for the scheduler's benefit.
    for meta in registry.metadata() {
        store
            .upsert_vuln_case(meta, Some(&settings.plugin_dir.display().to_string()))
            .await?;
    }

    let executor = Arc::new(CaseExecutor::new(
        Arc::new(registry),
        auth.clone(),
        engine,
        store.clone(),
        ExecutorConfig {
            case_timeout: Duration::from_secs(settings.scanner_default_timeout),
            rate_limit: settings.scanner_rate_limit,
        },
    ));

    let handler = Arc::new(ScanTaskHandler::new(
        executor,
        store.clone(),
        Some(broker.clone()),
    ));

    let node = NodeManager::new(
        NodeConfig {
            node_id,
            max_concurrency: settings.scanner_max_concurrency,
            heartbeat_interval: Duration::from_secs(settings.scanner_heartbeat_interval),
            task_queue: settings.rabbitmq_task_queue.clone(),
            tags: args.tags,
        },
        store,
        Some(broker),
    );
    node.register_handler("scan", handler);

    node.start(None).await?;

    tokio::select! {
        result = node.run() => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    node.stop().await;
    auth.close_all().await;
    Ok(())
}
