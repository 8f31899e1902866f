//! Dispatcher: chunk publication and result consumption.
//!
//! Owns the broker bindings (`task` -> task queue, `result` -> result queue).
//! The single result consumer serializes progress updates per task; progress
//! deltas fold into a clamped absolute value, so at-least-once redelivery can
//! only over-count up to the clamp.

use std::time::Duration;

use tracing::{debug, error, info, warn};

use tokio_util::sync::CancellationToken;

use vulnscan_protocol::defaults::{self, RESULT_ROUTING_KEY, TASK_ROUTING_KEY};
use vulnscan_protocol::{ChunkMessage, ResultKind, ResultMessage};
use vulnscan_store::WorkBroker;

use crate::error::Result;
use crate::targets;
use crate::task_manager::TaskManager;

/// How long one consumed result stays leased while being applied.
const RESULT_LEASE: Duration = Duration::from_secs(30);
/// Poll interval when the result queue is empty.
const POLL_INTERVAL: Duration = Duration::from_millis(200);
/// Initial backoff after a consume error; doubles up to the max.
const CONSUME_BACKOFF_BASE: Duration = Duration::from_secs(1);
const CONSUME_BACKOFF_MAX: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub chunk_size: usize,
    pub task_queue: String,
    pub result_queue: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            chunk_size: defaults::DEFAULT_CHUNK_SIZE,
            task_queue: defaults::DEFAULT_TASK_QUEUE.to_string(),
            result_queue: defaults::DEFAULT_RESULT_QUEUE.to_string(),
        }
    }
}

/// Publishes chunks and consumes results for the scheduler.
pub struct Dispatcher {
    broker: WorkBroker,
    tasks: TaskManager,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(broker: WorkBroker, tasks: TaskManager, config: DispatcherConfig) -> Self {
        Self {
            broker,
            tasks,
            config,
        }
    }

    pub fn task_manager(&self) -> &TaskManager {
        &self.tasks
    }

    /// Declare the exchange and both durable queue bindings.
    pub async fn connect(&self) -> Result<()> {
        self.broker.declare_exchange().await?;
        self.broker
            .bind_queue(TASK_ROUTING_KEY, &self.config.task_queue)
            .await?;
        self.broker
            .bind_queue(RESULT_ROUTING_KEY, &self.config.result_queue)
            .await?;
        Ok(())
    }

    /// Expand, chunk, and publish one persistent message per chunk in
    /// ascending chunk id, then mark the task running. A task that expands to
    /// nothing completes immediately.
    pub async fn dispatch_task(&self, task_id: &str, target_specs: &[String]) -> Result<()> {
        let chunks = targets::split_targets(target_specs, self.config.chunk_size);
        let total_chunks = chunks.len() as u32;

        for (index, chunk_targets) in chunks.into_iter().enumerate() {
            let message = ChunkMessage::new(task_id, index as u32, chunk_targets, total_chunks);
            self.broker
                .publish(
                    TASK_ROUTING_KEY,
                    &serde_json::to_vec(&message)?,
                    Some(task_id),
                )
                .await?;
        }

        self.tasks.mark_running(task_id).await?;
        if total_chunks == 0 {
            self.tasks.mark_completed(task_id).await?;
        }
        info!("Dispatched task {} with {} chunks", task_id, total_chunks);
        Ok(())
    }

    /// List pending tasks by (priority desc, created asc) and dispatch each.
    /// A task that fails to dispatch is marked failed; the loop continues.
    pub async fn schedule_pending_tasks(&self) -> Result<usize> {
        let pending = self.tasks.list_pending().await?;
        let mut dispatched = 0;

        for task in pending {
            match self.dispatch_task(&task.id, &task.targets()).await {
                Ok(()) => dispatched += 1,
                Err(err) => {
                    error!("Failed to dispatch task {}: {}", task.id, err);
                    if let Err(err) = self.tasks.mark_failed(&task.id, &err.to_string()).await {
                        error!("Failed to mark task {} failed: {}", task.id, err);
                    }
                }
            }
        }

        Ok(dispatched)
    }

    /// Consume and apply at most one result message. Returns false when the
    /// queue was empty. Undecodable messages and unknown kinds are acked
    /// (poison-pill protection); apply errors requeue the message.
    pub async fn consume_result_once(&self) -> Result<bool> {
        let Some(delivery) = self
            .broker
            .consume(&self.config.result_queue, RESULT_LEASE)
            .await?
        else {
            return Ok(false);
        };

        match serde_json::from_slice::<ResultMessage>(&delivery.body) {
            Err(err) => {
                warn!("Undecodable result message {}: {}", delivery.delivery_id, err);
                self.broker.ack(delivery.delivery_id).await?;
            }
            Ok(message) => match self.apply_result(&message).await {
                Ok(()) => {
                    self.broker.ack(delivery.delivery_id).await?;
                    debug!("Handled result for task {}: {:?}", message.task_id, message.status);
                }
                Err(err) => {
                    error!(
                        "Failed to apply result for task {}: {}",
                        message.task_id, err
                    );
                    self.broker.nack(delivery.delivery_id).await?;
                }
            },
        }

        Ok(true)
    }

    async fn apply_result(&self, message: &ResultMessage) -> Result<()> {
        match message.status {
            ResultKind::Progress => {
                let delta = message.completed.unwrap_or(0);
                let Some(task) = self.tasks.get_task(&message.task_id).await? else {
                    warn!("Progress for unknown task {}", message.task_id);
                    return Ok(());
                };
                let completed = task.progress().completed + delta;
                self.tasks
                    .update_progress(&message.task_id, completed, None)
                    .await?;

                if let Some(task) = self.tasks.get_task(&message.task_id).await? {
                    let progress = task.progress();
                    if progress.total > 0 && progress.completed >= progress.total {
                        self.tasks.mark_completed(&message.task_id).await?;
                    }
                }
            }
            ResultKind::Completed => {
                self.tasks.mark_completed(&message.task_id).await?;
            }
            ResultKind::Failed => {
                let error_message = message
                    .error
                    .clone()
                    .unwrap_or_else(|| "Unknown error".to_string());
                self.tasks
                    .mark_failed(&message.task_id, &error_message)
                    .await?;
            }
            ResultKind::Unknown => {
                warn!(
                    "Unknown result kind for task {}; dropping message",
                    message.task_id
                );
            }
        }
        Ok(())
    }

    /// Consume results until cancelled.
    pub async fn run_result_consumer(&self, cancel: CancellationToken) {
        info!("Result consumer started");
        let mut backoff = CONSUME_BACKOFF_BASE;
        while !cancel.is_cancelled() {
            match self.consume_result_once().await {
                Ok(true) => backoff = CONSUME_BACKOFF_BASE,
                Ok(false) => {
                    backoff = CONSUME_BACKOFF_BASE;
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                Err(err) => {
                    error!("Result consumer error: {}", err);
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(CONSUME_BACKOFF_MAX);
                }
            }
        }
        info!("Result consumer stopped");
    }
}
