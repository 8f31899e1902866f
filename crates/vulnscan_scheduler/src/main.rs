//! VulnScan scheduler.
//!
//! Usage:
//!     vulnscan-scheduler run
//!     vulnscan-scheduler create --name nightly --target 192.168.1.0/24 --policy redline
//!     vulnscan-scheduler list --status running

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info};

use vulnscan_logging::{init_logging, LogConfig};
use tokio_util::sync::CancellationToken;
use vulnscan_protocol::{ScanPolicy, Settings, TaskStatus};
use vulnscan_scheduler::dispatcher::{Dispatcher, DispatcherConfig};
use vulnscan_scheduler::task_manager::{CreateTask, TaskManager};
use vulnscan_store::{open_store, VulnStore, WorkBroker};

#[derive(Parser, Debug)]
#[command(name = "vulnscan-scheduler", about = "VulnScan task scheduler")]
struct Args {
    /// Record store / broker URL (overrides DATABASE_URL)
    #[arg(long)]
    database_url: Option<String>,

    /// Directory for log files (stderr only if unset)
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Verbose console logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the scheduler loop: dispatch pending tasks and consume results.
    Run {
        /// Seconds between pending-task sweeps
        #[arg(long, default_value_t = 5)]
        schedule_interval: u64,
    },
    /// Create a scan task.
    Create {
        #[arg(long)]
        name: String,
        /// Target specifier (IP, hostname, or CIDR); repeatable
        #[arg(long = "target", required = true)]
        targets: Vec<String>,
        #[arg(long, default_value = "full")]
        policy: String,
        #[arg(long, default_value_t = 5)]
        priority: i64,
        /// Case id for the `specified` policy; repeatable
        #[arg(long = "vuln-id")]
        vuln_ids: Vec<String>,
        /// Auth mapping as JSON: {"admin": {"username": "...", "password": "..."}}
        #[arg(long)]
        auth: Option<String>,
    },
    /// List tasks.
    List {
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long, default_value_t = 20)]
        size: u32,
    },
    /// Pause a running task.
    Pause { task_id: String },
    /// Resume a paused task.
    Resume { task_id: String },
    /// Cancel a task.
    Cancel { task_id: String },
    /// List registered scanner nodes.
    Nodes,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(LogConfig {
        app_name: "vulnscan-scheduler",
        verbose: args.verbose,
        log_dir: args.log_dir.as_deref(),
    })?;

    let mut settings = Settings::from_env().context("invalid configuration")?;
    if let Some(database_url) = args.database_url {
        settings.database_url = database_url;
    }

    let store = open_store(&settings.database_url, settings.database_max_connections())
        .await
        .context("failed to open record store")?;
    let tasks = TaskManager::new(store.clone());

    match args.command {
        Command::Run { schedule_interval } => {
            run_scheduler(&settings, &store, tasks, schedule_interval).await
        }
        Command::Create {
            name,
            targets,
            policy,
            priority,
            vuln_ids,
            auth,
        } => {
            let policy: ScanPolicy = policy.parse().context("invalid policy")?;
            let auth = match auth {
                Some(raw) => serde_json::from_str(&raw).context("invalid auth JSON")?,
                None => Default::default(),
            };
            let task = tasks
                .create_task(CreateTask {
                    name,
                    targets,
                    auth,
                    policy,
                    vuln_ids: if vuln_ids.is_empty() {
                        None
                    } else {
                        Some(vuln_ids)
                    },
                    priority,
                    options: Default::default(),
                })
                .await?;
            println!("{}", task.id);
            Ok(())
        }
        Command::List { status, page, size } => {
            let status = match status {
                Some(raw) => Some(raw.parse::<TaskStatus>().context("invalid status")?),
                None => None,
            };
            let (rows, total) = tasks.list_tasks(status, page, size).await?;
            for task in &rows {
                let progress = task.progress();
                println!(
                    "{}  {:<9}  {:>4}/{:<4}  p{}  {}",
                    task.id,
                    task.status().as_str(),
                    progress.completed,
                    progress.total,
                    task.priority,
                    task.name
                );
            }
            println!("{} of {} task(s)", rows.len(), total);
            Ok(())
        }
        Command::Pause { task_id } => {
            report(tasks.pause_task(&task_id).await?, "paused", &task_id)
        }
        Command::Resume { task_id } => {
            report(tasks.resume_task(&task_id).await?, "resumed", &task_id)
        }
        Command::Cancel { task_id } => {
            report(tasks.cancel_task(&task_id).await?, "cancelled", &task_id)
        }
        Command::Nodes => {
            for node in store.list_nodes().await? {
                println!(
                    "{}  {:<7}  cpu={:.2} mem={:.2}  {}/{} tasks  seen {}",
                    node.id,
                    node.status,
                    node.cpu_load,
                    node.memory_load,
                    node.tasks_running,
                    node.max_tasks,
                    node.last_heartbeat
                );
            }
            Ok(())
        }
    }
}

fn report(changed: bool, verb: &str, task_id: &str) -> anyhow::Result<()> {
    if changed {
        println!("task {task_id} {verb}");
        Ok(())
    } else {
        anyhow::bail!("task {task_id} could not be {verb} (missing or illegal transition)")
    }
}

async fn run_scheduler(
    settings: &Settings,
    store: &VulnStore,
    tasks: TaskManager,
    schedule_interval: u64,
) -> anyhow::Result<()> {
    let broker = WorkBroker::new(store.pool().clone(), settings.rabbitmq_exchange.clone());
    let dispatcher = Arc::new(Dispatcher::new(
        broker,
        tasks,
        DispatcherConfig {
            chunk_size: vulnscan_protocol::defaults::DEFAULT_CHUNK_SIZE,
            task_queue: settings.rabbitmq_task_queue.clone(),
            result_queue: settings.rabbitmq_result_queue.clone(),
        },
    ));
    dispatcher.connect().await.context("broker declare failed")?;

    info!("Scheduler started (interval {}s)", schedule_interval);

    let cancel = CancellationToken::new();
    let consumer = {
        let dispatcher = dispatcher.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { dispatcher.run_result_consumer(cancel).await })
    };

    let mut ticker = tokio::time::interval(Duration::from_secs(schedule_interval.max(1)));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match dispatcher.schedule_pending_tasks().await {
                    Ok(0) => {}
                    Ok(n) => info!("Dispatched {} pending task(s)", n),
                    Err(err) => error!("Scheduling sweep failed: {}", err),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    cancel.cancel();
    let _ = consumer.await;
    Ok(())
}
