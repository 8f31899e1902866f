//! Task manager: lifecycle state machine and progress aggregation.
//!
//! State machine:
//! pending -> running -> {paused <-> running, completed, failed}; cancel is
//! valid from any non-terminal state and lands in failed. Completed and
//! failed are terminal; re-entering pending is forbidden. Illegal transitions
//! return false without mutating the task.

use tracing::{error, info};

use vulnscan_protocol::defaults::{
    CANCELLED_BY_USER_MESSAGE, DEFAULT_PRIORITY, MAX_PRIORITY, MIN_PRIORITY,
};
use vulnscan_protocol::types::AuthMap;
use vulnscan_protocol::{ProtocolError, ScanPolicy, TaskStatus};
use vulnscan_store::{NewTask, TaskRow, VulnStore};

use crate::error::{Result, SchedulerError};
use crate::targets;

/// Everything a caller supplies to create a scan task.
#[derive(Debug, Clone)]
pub struct CreateTask {
    pub name: String,
    pub targets: Vec<String>,
    pub auth: AuthMap,
    pub policy: ScanPolicy,
    pub vuln_ids: Option<Vec<String>>,
    pub priority: i64,
    pub options: serde_json::Map<String, serde_json::Value>,
}

impl CreateTask {
    pub fn new(name: impl Into<String>, targets: Vec<String>) -> Self {
        Self {
            name: name.into(),
            targets,
            auth: AuthMap::new(),
            policy: ScanPolicy::Full,
            vuln_ids: None,
            priority: DEFAULT_PRIORITY,
            options: serde_json::Map::new(),
        }
    }
}

/// Owns task records and enforces their state machine.
#[derive(Clone)]
pub struct TaskManager {
    store: VulnStore,
}

impl TaskManager {
    pub fn new(store: VulnStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &VulnStore {
        &self.store
    }

    /// Validate and persist a new task. `progress_total` comes from target
    /// expansion cardinality and never decreases afterwards.
    pub async fn create_task(&self, spec: CreateTask) -> Result<TaskRow> {
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&spec.priority) {
            return Err(ProtocolError::InvalidPriority(spec.priority).into());
        }
        if spec.policy == ScanPolicy::Specified
            && spec.vuln_ids.as_ref().map_or(true, |ids| ids.is_empty())
        {
            return Err(SchedulerError::invalid_task(
                "policy 'specified' requires a non-empty vuln_ids list",
            ));
        }

        let progress_total = targets::count(&spec.targets);
        let task = self
            .store
            .insert_task(NewTask {
                name: spec.name,
                targets: spec.targets,
                auth: spec.auth,
                policy: spec.policy,
                vuln_ids: spec.vuln_ids,
                priority: spec.priority,
                options: spec.options,
                progress_total,
            })
            .await?;

        info!("Created task {}: {}", task.id, task.name);
        Ok(task)
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Option<TaskRow>> {
        Ok(self.store.get_task(task_id).await?)
    }

    pub async fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        page: u32,
        size: u32,
    ) -> Result<(Vec<TaskRow>, i64)> {
        Ok(self.store.list_tasks(status, page, size).await?)
    }

    /// Pending tasks in dispatch order (priority desc, oldest first).
    pub async fn list_pending(&self) -> Result<Vec<TaskRow>> {
        Ok(self.store.list_pending_tasks().await?)
    }

    /// Pause a running task. False when the task is missing or not running.
    pub async fn pause_task(&self, task_id: &str) -> Result<bool> {
        let paused = self
            .store
            .transition_task(task_id, &[TaskStatus::Running], TaskStatus::Paused, None)
            .await?;
        if paused {
            info!("Paused task {}", task_id);
        }
        Ok(paused)
    }

    /// Resume a paused task. False when the task is missing or not paused.
    pub async fn resume_task(&self, task_id: &str) -> Result<bool> {
        let resumed = self
            .store
            .transition_task(task_id, &[TaskStatus::Paused], TaskStatus::Running, None)
            .await?;
        if resumed {
            info!("Resumed task {}", task_id);
        }
        Ok(resumed)
    }

    /// Cancel a task from any non-terminal state.
    pub async fn cancel_task(&self, task_id: &str) -> Result<bool> {
        let cancelled = self
            .store
            .transition_task(
                task_id,
                &[TaskStatus::Pending, TaskStatus::Running, TaskStatus::Paused],
                TaskStatus::Failed,
                Some(CANCELLED_BY_USER_MESSAGE),
            )
            .await?;
        if cancelled {
            info!("Cancelled task {}", task_id);
        }
        Ok(cancelled)
    }

    /// Set absolute progress, clamped into `[current, progress_total]`.
    pub async fn update_progress(
        &self,
        task_id: &str,
        completed: u64,
        total: Option<u64>,
    ) -> Result<()> {
        Ok(self
            .store
            .update_task_progress(task_id, completed, total)
            .await?)
    }

    /// Dispatch edge: pending -> running.
    pub async fn mark_running(&self, task_id: &str) -> Result<bool> {
        Ok(self
            .store
            .transition_task(task_id, &[TaskStatus::Pending], TaskStatus::Running, None)
            .await?)
    }

    /// All-completed edge: running -> completed (fills progress).
    pub async fn mark_completed(&self, task_id: &str) -> Result<bool> {
        let completed = self
            .store
            .transition_task(task_id, &[TaskStatus::Running], TaskStatus::Completed, None)
            .await?;
        if completed {
            info!("Task {} completed", task_id);
        }
        Ok(completed)
    }

    /// Error edge: any non-terminal state -> failed.
    pub async fn mark_failed(&self, task_id: &str, error_message: &str) -> Result<bool> {
        let failed = self
            .store
            .transition_task(
                task_id,
                &[TaskStatus::Pending, TaskStatus::Running, TaskStatus::Paused],
                TaskStatus::Failed,
                Some(error_message),
            )
            .await?;
        if failed {
            error!("Task {} failed: {}", task_id, error_message);
        }
        Ok(failed)
    }
}
