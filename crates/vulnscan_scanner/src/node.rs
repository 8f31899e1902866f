//! Node manager: scanner-node lifecycle, heartbeat, and task consumption.
//!
//! Lifecycle: stopped -> starting -> running -> stopping -> stopped. Broker
//! connection is best-effort; without it the node runs isolated (heartbeats
//! only). Messages are acked after submission to the pool, which is the
//! deliberate at-least-once choice.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use sysinfo::System;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use tokio_util::sync::CancellationToken;
use vulnscan_protocol::defaults::{self, TASK_ROUTING_KEY};
use vulnscan_protocol::{ChunkMessage, NodeStatus};
use vulnscan_store::{Delivery, NodeReport, VulnStore, WorkBroker};

use crate::pool::{CoroutinePool, PoolError};

/// How long one consumed message stays leased while being submitted.
const CONSUME_LEASE: Duration = Duration::from_secs(60);
/// Poll interval when the task queue is empty.
const POLL_INTERVAL: Duration = Duration::from_millis(200);
/// Initial backoff after a broker error; doubles up to the max.
const BROKER_BACKOFF_BASE: Duration = Duration::from_secs(1);
const BROKER_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Handler for one kind of task message.
#[async_trait]
pub trait ChunkHandler: Send + Sync {
    async fn handle(&self, chunk: ChunkMessage) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Node configuration (plain data).
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: String,
    pub max_concurrency: usize,
    pub heartbeat_interval: Duration,
    pub task_queue: String,
    pub tags: Vec<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: generate_node_id(),
            max_concurrency: defaults::DEFAULT_MAX_CONCURRENCY,
            heartbeat_interval: Duration::from_secs(defaults::DEFAULT_HEARTBEAT_INTERVAL_SECS),
            task_queue: defaults::DEFAULT_TASK_QUEUE.to_string(),
            tags: Vec::new(),
        }
    }
}

pub fn generate_node_id() -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    format!("node-{}", &uuid[..8])
}

/// Manages one scanner node.
pub struct NodeManager {
    config: NodeConfig,
    store: VulnStore,
    broker: Option<WorkBroker>,
    connected: AtomicBool,
    pool: StdMutex<Option<Arc<CoroutinePool<()>>>>,
    handlers: StdRwLock<HashMap<String, Arc<dyn ChunkHandler>>>,
    state: StdMutex<NodeState>,
    heartbeat_cancel: StdMutex<Option<CancellationToken>>,
    heartbeat_handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl NodeManager {
    pub fn new(config: NodeConfig, store: VulnStore, broker: Option<WorkBroker>) -> Self {
        Self {
            config,
            store,
            broker,
            connected: AtomicBool::new(false),
            pool: StdMutex::new(None),
            handlers: StdRwLock::new(HashMap::new()),
            state: StdMutex::new(NodeState::Stopped),
            heartbeat_cancel: StdMutex::new(None),
            heartbeat_handle: tokio::sync::Mutex::new(None),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn state(&self) -> NodeState {
        *self.state.lock().expect("node state lock poisoned")
    }

    pub fn is_running(&self) -> bool {
        self.state() == NodeState::Running
    }

    /// Active tasks in the pool (0 before start).
    pub fn active_tasks(&self) -> usize {
        self.current_pool().map(|p| p.active_count()).unwrap_or(0)
    }

    fn current_pool(&self) -> Option<Arc<CoroutinePool<()>>> {
        self.pool.lock().expect("node pool lock poisoned").clone()
    }

    fn set_state(&self, state: NodeState) {
        *self.state.lock().expect("node state lock poisoned") = state;
    }

    /// Register a handler for a task message type (default type is `scan`).
    pub fn register_handler(&self, task_type: &str, handler: Arc<dyn ChunkHandler>) {
        self.handlers
            .write()
            .expect("node handlers lock poisoned")
            .insert(task_type.to_string(), handler);
        info!("Registered handler for task type: {}", task_type);
    }

    /// Start the node: build the pool, connect the broker (best-effort),
    /// register the node record, and launch the heartbeat.
    pub async fn start(&self, max_concurrency: Option<usize>) -> anyhow::Result<()> {
        {
            let mut state = self.state.lock().expect("node state lock poisoned");
            if *state != NodeState::Stopped {
                warn!("Node is already running");
                return Ok(());
            }
            *state = NodeState::Starting;
        }

        let concurrency = max_concurrency.unwrap_or(self.config.max_concurrency);
        let pool = Arc::new(CoroutinePool::new(concurrency));
        *self.pool.lock().expect("node pool lock poisoned") = Some(pool.clone());

        // Broker connection is best-effort; a node without one still
        // heartbeats and can be driven directly.
        if let Some(broker) = &self.broker {
            let connect = async {
                broker.declare_exchange().await?;
                broker
                    .bind_queue(TASK_ROUTING_KEY, &self.config.task_queue)
                    .await
            };
            match connect.await {
                Ok(()) => {
                    self.connected.store(true, Ordering::SeqCst);
                    info!("Connected to work broker");
                }
                Err(err) => {
                    warn!("Failed to connect to work broker: {}; running isolated", err);
                }
            }
        }

        self.store
            .upsert_node(
                &self.config.node_id,
                &self.report(NodeStatus::Online, &pool),
            )
            .await
            .context("failed to register scan node")?;
        info!("Node {} registered", self.config.node_id);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(heartbeat_loop(
            self.store.clone(),
            self.config.node_id.clone(),
            self.config.heartbeat_interval,
            cancel.clone(),
            pool,
            self.config.max_concurrency as i64,
            self.config.tags.clone(),
        ));
        *self
            .heartbeat_cancel
            .lock()
            .expect("heartbeat cancel lock poisoned") = Some(cancel);
        *self.heartbeat_handle.lock().await = Some(handle);

        self.set_state(NodeState::Running);
        info!(
            "Scanner node {} started with max_concurrency={}",
            self.config.node_id, concurrency
        );
        Ok(())
    }

    /// Consume task messages until stopped. Without a broker connection,
    /// blocks (sleeping) until stopped.
    pub async fn run(&self) -> anyhow::Result<()> {
        let Some(pool) = self.current_pool() else {
            anyhow::bail!("node not started");
        };

        let mut backoff = BROKER_BACKOFF_BASE;
        while self.is_running() {
            if !self.connected.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
            let Some(broker) = &self.broker else {
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            };

            match broker.consume(&self.config.task_queue, CONSUME_LEASE).await {
                Ok(Some(delivery)) => {
                    backoff = BROKER_BACKOFF_BASE;
                    self.dispatch_delivery(broker, &pool, delivery).await;
                }
                Ok(None) => {
                    backoff = BROKER_BACKOFF_BASE;
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                Err(err) => {
                    error!("Task queue consume failed: {}", err);
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(BROKER_BACKOFF_MAX);
                }
            }
        }
        Ok(())
    }

    /// Decode one delivery, submit it to the pool, and ack.
    ///
    /// Undecodable messages and unknown task types are logged and acked
    /// (poison-pill protection). The ack lands after submission: a crash
    /// between the two redelivers the chunk.
    async fn dispatch_delivery(
        &self,
        broker: &WorkBroker,
        pool: &Arc<CoroutinePool<()>>,
        delivery: Delivery,
    ) {
        let delivery_id = delivery.delivery_id;

        let value: serde_json::Value = match serde_json::from_slice(&delivery.body) {
            Ok(value) => value,
            Err(err) => {
                warn!("Undecodable task message {}: {}", delivery_id, err);
                self.ack(broker, delivery_id).await;
                return;
            }
        };
        let task_type = value
            .get("type")
            .and_then(|v| v.as_str())
            .unwrap_or("scan")
            .to_string();

        let handler = self
            .handlers
            .read()
            .expect("node handlers lock poisoned")
            .get(&task_type)
            .cloned();
        let Some(handler) = handler else {
            warn!("No handler for task type: {}", task_type);
            self.ack(broker, delivery_id).await;
            return;
        };

        let chunk: ChunkMessage = match serde_json::from_value(value) {
            Ok(chunk) => chunk,
            Err(err) => {
                warn!("Malformed chunk message {}: {}", delivery_id, err);
                self.ack(broker, delivery_id).await;
                return;
            }
        };

        let submitted = pool
            .submit(async move {
                if let Err(err) = handler.handle(chunk).await {
                    error!("Task handler failed: {:#}", err);
                }
            })
            .await;

        match submitted {
            Ok(_handle) => self.ack(broker, delivery_id).await,
            Err(PoolError::Stopped) => {
                // Shutting down: leave the message for another node.
                if let Err(err) = broker.nack(delivery_id).await {
                    warn!("Failed to requeue delivery {}: {}", delivery_id, err);
                }
            }
            Err(err) => {
                error!("Pool submission failed: {}", err);
                if let Err(err) = broker.nack(delivery_id).await {
                    warn!("Failed to requeue delivery {}: {}", delivery_id, err);
                }
            }
        }
    }

    async fn ack(&self, broker: &WorkBroker, delivery_id: i64) {
        if let Err(err) = broker.ack(delivery_id).await {
            warn!("Failed to ack delivery {}: {}", delivery_id, err);
        }
    }

    /// Stop the node: cancel the heartbeat, drain the pool with a grace
    /// period, and mark the node offline.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock().expect("node state lock poisoned");
            if matches!(*state, NodeState::Stopped | NodeState::Stopping) {
                return;
            }
            *state = NodeState::Stopping;
        }

        if let Some(cancel) = self
            .heartbeat_cancel
            .lock()
            .expect("heartbeat cancel lock poisoned")
            .take()
        {
            cancel.cancel();
        }
        if let Some(handle) = self.heartbeat_handle.lock().await.take() {
            handle.abort();
            // Swallow the cancellation outcome.
            let _ = handle.await;
        }

        let pool = self.pool.lock().expect("node pool lock poisoned").take();
        if let Some(pool) = pool {
            let outcomes = pool
                .stop(Duration::from_secs(defaults::POOL_STOP_GRACE_SECS))
                .await;
            let cancelled = outcomes.iter().filter(|o| o.is_err()).count();
            if cancelled > 0 {
                warn!("{} in-flight tasks cancelled during shutdown", cancelled);
            }
        }

        let offline = NodeReport {
            status: NodeStatus::Offline,
            cpu_load: 0.0,
            memory_load: 0.0,
            tasks_running: 0,
            max_tasks: self.config.max_concurrency as i64,
            tags: self.config.tags.clone(),
        };
        if let Err(err) = self.store.upsert_node(&self.config.node_id, &offline).await {
            error!("Failed to mark node offline: {}", err);
        }

        self.connected.store(false, Ordering::SeqCst);
        self.set_state(NodeState::Stopped);
        info!("Scanner node {} stopped", self.config.node_id);
    }

    fn report(&self, status: NodeStatus, pool: &Arc<CoroutinePool<()>>) -> NodeReport {
        NodeReport {
            status,
            cpu_load: 0.0,
            memory_load: 0.0,
            tasks_running: pool.active_count() as i64,
            max_tasks: self.config.max_concurrency as i64,
            tags: self.config.tags.clone(),
        }
    }
}

/// Periodic heartbeat: cpu/memory load, active task count, online status.
/// Failures are logged and ignored; they never tear the node down.
async fn heartbeat_loop(
    store: VulnStore,
    node_id: String,
    interval: Duration,
    cancel: CancellationToken,
    pool: Arc<CoroutinePool<()>>,
    max_tasks: i64,
    tags: Vec<String>,
) {
    let mut system = System::new();
    loop {
        if cancel.is_cancelled() {
            break;
        }

        system.refresh_cpu();
        system.refresh_memory();
        let cpu_load = (system.global_cpu_info().cpu_usage() as f64 / 100.0).clamp(0.0, 1.0);
        let memory_load = if system.total_memory() > 0 {
            system.used_memory() as f64 / system.total_memory() as f64
        } else {
            0.0
        };

        let report = NodeReport {
            status: NodeStatus::Online,
            cpu_load,
            memory_load,
            tasks_running: pool.active_count() as i64,
            max_tasks,
            tags: tags.clone(),
        };

        match store.upsert_node(&node_id, &report).await {
            Ok(()) => debug!("Heartbeat sent: cpu={:.2}, mem={:.2}", cpu_load, memory_load),
            Err(err) => error!("Heartbeat failed: {}", err),
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Notify;
    use vulnscan_store::open_store;

    struct RecordingHandler {
        seen: StdMutex<Vec<ChunkMessage>>,
        notify: Notify,
    }

    impl RecordingHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                seen: StdMutex::new(Vec::new()),
                notify: Notify::new(),
            })
        }
    }

    #[async_trait]
    impl ChunkHandler for RecordingHandler {
        async fn handle(&self, chunk: ChunkMessage) -> anyhow::Result<()> {
            self.seen.lock().unwrap().push(chunk);
            self.notify.notify_one();
            Ok(())
        }
    }

    async fn temp_setup() -> (tempfile::TempDir, VulnStore, WorkBroker) {
        let tmp = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}", tmp.path().join("node_test.db").display());
        let store = open_store(&url, 5).await.unwrap();
        let broker = WorkBroker::new(store.pool().clone(), "vulnscan");
        broker.declare_exchange().await.unwrap();
        broker.bind_queue("task", "scan.tasks").await.unwrap();
        (tmp, store, broker)
    }

    fn test_config(node_id: &str) -> NodeConfig {
        NodeConfig {
            node_id: node_id.to_string(),
            max_concurrency: 4,
            heartbeat_interval: Duration::from_millis(50),
            task_queue: "scan.tasks".to_string(),
            tags: vec!["test".to_string()],
        }
    }

    #[tokio::test]
    async fn lifecycle_registers_and_marks_offline() {
        let (_tmp, store, _broker) = temp_setup().await;
        let node = NodeManager::new(test_config("node-test-1"), store.clone(), None);

        assert_eq!(node.state(), NodeState::Stopped);
        node.start(None).await.unwrap();
        assert_eq!(node.state(), NodeState::Running);

        let row = store.get_node("node-test-1").await.unwrap().unwrap();
        assert_eq!(row.status(), NodeStatus::Online);
        assert_eq!(row.tag_list(), vec!["test".to_string()]);

        // Heartbeats keep flowing
        tokio::time::sleep(Duration::from_millis(120)).await;

        node.stop().await;
        assert_eq!(node.state(), NodeState::Stopped);
        let row = store.get_node("node-test-1").await.unwrap().unwrap();
        assert_eq!(row.status(), NodeStatus::Offline);
    }

    #[tokio::test]
    async fn consumes_chunk_and_acks_after_submission() {
        let (_tmp, store, broker) = temp_setup().await;
        let handler = RecordingHandler::new();

        let node = Arc::new(NodeManager::new(
            test_config("node-test-2"),
            store.clone(),
            Some(broker.clone()),
        ));
        node.register_handler("scan", handler.clone());
        node.start(None).await.unwrap();

        let chunk = ChunkMessage::new("task-1", 0, vec!["10.0.0.1".to_string()], 1);
        broker
            .publish("task", &serde_json::to_vec(&chunk).unwrap(), Some("task-1"))
            .await
            .unwrap();

        let runner = {
            let node = node.clone();
            tokio::spawn(async move { node.run().await })
        };

        tokio::time::timeout(Duration::from_secs(5), handler.notify.notified())
            .await
            .expect("handler was not invoked");

        // Give the ack a moment to land, then verify the queue drained.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(broker.queue_depth("scan.tasks").await.unwrap(), 0);
        assert_eq!(handler.seen.lock().unwrap().len(), 1);
        assert_eq!(handler.seen.lock().unwrap()[0].task_id, "task-1");

        node.stop().await;
        runner.abort();
        let _ = runner.await;
    }

    #[tokio::test]
    async fn unknown_task_type_is_dropped_with_ack() {
        let (_tmp, store, broker) = temp_setup().await;
        let node = Arc::new(NodeManager::new(
            test_config("node-test-3"),
            store.clone(),
            Some(broker.clone()),
        ));
        // No handler registered at all.
        node.start(None).await.unwrap();

        broker
            .publish(
                "task",
                br#"{"task_id":"t","chunk_id":0,"targets":[],"total_chunks":1,"type":"exotic"}"#,
                None,
            )
            .await
            .unwrap();

        let runner = {
            let node = node.clone();
            tokio::spawn(async move { node.run().await })
        };

        // Poll until the poison message is acked away.
        let mut drained = false;
        for _ in 0..50 {
            if broker.queue_depth("scan.tasks").await.unwrap() == 0 {
                drained = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(drained, "unknown-type message was not acked");

        node.stop().await;
        runner.abort();
        let _ = runner.await;
    }
}
