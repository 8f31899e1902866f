//! Case executor: per-target fingerprint, case selection, verification under
//! timeout, stat recording, and cleanup.
//!
//! Verify-level failures never escape this module; they become stat records.
//! A process-wide semaphore gates outbound verify attempts.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use vulnscan_protocol::defaults::{self, RESULT_ROUTING_KEY};
use vulnscan_protocol::{ChunkMessage, Fingerprint, ResultMessage, StatStatus, VulnResult};
use vulnscan_store::{NewStat, TaskRow, VulnStore, WorkBroker};

use crate::auth::{AuthError, AuthManager, Session};
use crate::fingerprint::{derive_base_url, FingerprintEngine};
use crate::node::ChunkHandler;
use crate::registry::CaseRegistry;

/// Tunables for the executor; defaults follow the process configuration.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub case_timeout: Duration,
    pub rate_limit: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            case_timeout: Duration::from_secs(defaults::DEFAULT_CASE_TIMEOUT_SECS),
            rate_limit: defaults::DEFAULT_RATE_LIMIT,
        }
    }
}

/// Runs vulnerability cases against targets.
pub struct CaseExecutor {
    registry: RwLock<Arc<CaseRegistry>>,
    auth: Arc<AuthManager>,
    engine: Arc<FingerprintEngine>,
    store: VulnStore,
    rate: Arc<Semaphore>,
    case_timeout: Duration,
}

impl CaseExecutor {
    pub fn new(
        registry: Arc<CaseRegistry>,
        auth: Arc<AuthManager>,
        engine: Arc<FingerprintEngine>,
        store: VulnStore,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            registry: RwLock::new(registry),
            auth,
            engine,
            store,
            rate: Arc::new(Semaphore::new(config.rate_limit)),
            case_timeout: config.case_timeout,
        }
    }

    /// Snapshot of the current registry.
    pub fn registry(&self) -> Arc<CaseRegistry> {
        self.registry
            .read()
            .expect("case registry lock poisoned")
            .clone()
    }

    /// Atomically swap in a freshly loaded registry (plugin reload).
    pub fn swap_registry(&self, registry: Arc<CaseRegistry>) {
        *self
            .registry
            .write()
            .expect("case registry lock poisoned") = registry;
        info!("Case registry reloaded");
    }

    /// Fingerprint one target, select cases per the task's policy, and run
    /// each under the per-case timeout. Returns the accumulated results;
    /// failures are recorded as stats and logged, never raised.
    pub async fn scan_target(&self, task: &TaskRow, target: &str) -> Vec<VulnResult> {
        let fingerprints = self.engine.identify(target, None).await;
        let registry = self.registry();
        let vuln_ids = task.vuln_ids();
        let case_ids = registry.matching(&fingerprints, task.policy(), vuln_ids.as_deref());

        if case_ids.is_empty() {
            debug!("No matching cases for {}", target);
            return Vec::new();
        }

        let session = match self.acquire_session(task, target).await {
            Ok(session) => session,
            Err(err) => {
                warn!("Could not build session for {}: {}", target, err);
                return Vec::new();
            }
        };

        self.record_target(target, &fingerprints, session.base_url())
            .await;

        let mut results = Vec::new();
        for case_id in &case_ids {
            let Some(case) = registry.get(case_id) else {
                continue;
            };

            let permit = self
                .rate
                .acquire()
                .await
                .expect("rate limit semaphore closed");
            let started = Utc::now();
            let outcome = tokio::time::timeout(
                self.case_timeout,
                case.verify(target, &session, &fingerprints),
            )
            .await;
            drop(permit);
            let finished = Utc::now();

            let (status, serialized) = match outcome {
                Ok(Ok(result)) => {
                    let serialized = serde_json::to_string(&result).ok();
                    results.push(result);
                    (StatStatus::Success, serialized)
                }
                Ok(Err(err)) => {
                    error!("Case {} failed on {}: {}", case_id, target, err);
                    (StatStatus::Fail, None)
                }
                Err(_) => {
                    debug!("Case {} timed out on {}", case_id, target);
                    results.push(VulnResult::new(case_id.clone(), target));
                    (StatStatus::Timeout, None)
                }
            };

            if let Err(err) = self
                .store
                .append_stat(NewStat {
                    vuln_id: case_id.clone(),
                    target_id: target.to_string(),
                    task_id: task.id.clone(),
                    start_time: started,
                    end_time: finished,
                    status,
                    result: serialized,
                })
                .await
            {
                error!("Failed to record stat for {}: {}", case_id, err);
            }

            if let Err(err) = case.cleanup(target, &session).await {
                debug!("Cleanup failed for {} on {}: {}", case_id, target, err);
            }
        }

        results
    }

    /// Install the task's credentials and open a session keyed by the first
    /// login point; anonymous when the task carries no auth.
    async fn acquire_session(
        &self,
        task: &TaskRow,
        target: &str,
    ) -> Result<Arc<Session>, AuthError> {
        let base_url = derive_base_url(target, None);
        let auth_map = task.auth();

        match auth_map.keys().next().cloned() {
            None => Ok(Arc::new(Session::anonymous(&base_url)?)),
            Some(first_login_point) => {
                for (login_point, credential) in &auth_map {
                    self.auth
                        .set_credentials(login_point, credential.clone())
                        .await;
                }
                self.auth
                    .get_session(&first_login_point, &base_url, false)
                    .await
            }
        }
    }

    /// Best-effort asset bookkeeping: target row, fingerprints, primary service.
    async fn record_target(&self, target: &str, fingerprints: &[Fingerprint], base_url: &str) {
        let target_id = match self.store.upsert_target(target).await {
            Ok(id) => id,
            Err(err) => {
                debug!("Failed to upsert target {}: {}", target, err);
                return;
            }
        };

        if let Err(err) = self.store.record_fingerprints(&target_id, fingerprints).await {
            debug!("Failed to record fingerprints for {}: {}", target, err);
        }

        if let Some(primary) = fingerprints.first() {
            if let Ok(parsed) = url::Url::parse(base_url) {
                if let Some(port) = parsed.port_or_known_default() {
                    let ssl = parsed.scheme() == "https";
                    if let Err(err) = self
                        .store
                        .record_service(&target_id, port, &primary.name, ssl)
                        .await
                    {
                        debug!("Failed to record service for {}: {}", target, err);
                    }
                }
            }
        }
    }
}

/// Chunk handler for `type: "scan"` messages: scans every target in the chunk
/// and emits one progress result per target.
pub struct ScanTaskHandler {
    executor: Arc<CaseExecutor>,
    store: VulnStore,
    broker: Option<WorkBroker>,
}

impl ScanTaskHandler {
    pub fn new(executor: Arc<CaseExecutor>, store: VulnStore, broker: Option<WorkBroker>) -> Self {
        Self {
            executor,
            store,
            broker,
        }
    }

    async fn process(&self, chunk: &ChunkMessage) -> anyhow::Result<()> {
        let task = self
            .store
            .get_task(&chunk.task_id)
            .await
            .context("failed to load task for chunk")?
            .ok_or_else(|| anyhow!("unknown task {}", chunk.task_id))?;

        info!(
            "Scanning chunk {}/{} of task {} ({} targets)",
            chunk.chunk_id + 1,
            chunk.total_chunks,
            chunk.task_id,
            chunk.targets.len()
        );

        for target in &chunk.targets {
            let results = self.executor.scan_target(&task, target).await;
            let findings = results.iter().filter(|r| r.vulnerable).count();
            if findings > 0 {
                info!("{}: {} finding(s)", target, findings);
            }
            self.emit(ResultMessage::progress(&chunk.task_id, 1)).await;
        }

        Ok(())
    }

    async fn emit(&self, message: ResultMessage) {
        let Some(broker) = &self.broker else {
            return;
        };
        match serde_json::to_vec(&message) {
            Ok(body) => {
                if let Err(err) = broker
                    .publish(RESULT_ROUTING_KEY, &body, Some(&message.task_id))
                    .await
                {
                    warn!("Failed to publish result for {}: {}", message.task_id, err);
                }
            }
            Err(err) => warn!("Failed to encode result message: {}", err),
        }
    }
}

#[async_trait]
impl ChunkHandler for ScanTaskHandler {
    async fn handle(&self, chunk: ChunkMessage) -> anyhow::Result<()> {
        match self.process(&chunk).await {
            Ok(()) => Ok(()),
            Err(err) => {
                // Catastrophic chunk failure: tell the scheduler.
                self.emit(ResultMessage::failed(&chunk.task_id, err.to_string()))
                    .await;
                Err(err)
            }
        }
    }
}
