//! Row types for the record store collections.
//!
//! JSON-valued columns are stored as TEXT; the typed accessors below decode
//! them leniently (a corrupt column reads as empty rather than poisoning the
//! whole row).

use sqlx::FromRow;

use vulnscan_protocol::types::AuthMap;
use vulnscan_protocol::{NodeStatus, ScanPolicy, TaskProgress, TaskStatus};

/// Scan task record.
#[derive(Debug, Clone, FromRow)]
pub struct TaskRow {
    pub id: String,
    pub name: String,
    pub targets: String,
    pub auth: Option<String>,
    pub policy: String,
    pub vuln_ids: Option<String>,
    pub priority: i64,
    pub options: Option<String>,
    pub status: String,
    pub progress_total: i64,
    pub progress_completed: i64,
    pub error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl TaskRow {
    pub fn status(&self) -> TaskStatus {
        self.status.parse().unwrap_or_default()
    }

    pub fn policy(&self) -> ScanPolicy {
        self.policy.parse().unwrap_or_default()
    }

    pub fn targets(&self) -> Vec<String> {
        serde_json::from_str(&self.targets).unwrap_or_default()
    }

    pub fn auth(&self) -> AuthMap {
        self.auth
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default()
    }

    pub fn vuln_ids(&self) -> Option<Vec<String>> {
        self.vuln_ids
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
    }

    pub fn options(&self) -> serde_json::Map<String, serde_json::Value> {
        self.options
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default()
    }

    pub fn progress(&self) -> TaskProgress {
        TaskProgress {
            total: self.progress_total.max(0) as u64,
            completed: self.progress_completed.max(0) as u64,
        }
    }
}

/// Scanner node record, refreshed by heartbeats.
#[derive(Debug, Clone, FromRow)]
pub struct NodeRow {
    pub id: String,
    pub status: String,
    pub cpu_load: f64,
    pub memory_load: f64,
    pub tasks_running: i64,
    pub max_tasks: i64,
    pub last_heartbeat: String,
    pub tags: Option<String>,
}

impl NodeRow {
    pub fn status(&self) -> NodeStatus {
        self.status.parse().unwrap_or_default()
    }

    pub fn tag_list(&self) -> Vec<String> {
        self.tags
            .as_deref()
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Append-only measurement of one (case, target, task) execution.
#[derive(Debug, Clone, FromRow)]
pub struct StatRow {
    pub id: String,
    pub vuln_id: String,
    pub target_id: String,
    pub task_id: String,
    pub start_time: String,
    pub end_time: String,
    pub duration_ms: i64,
    pub status: String,
    pub result: Option<String>,
}

/// Loaded vulnerability-case metadata mirrored into the store.
#[derive(Debug, Clone, FromRow)]
pub struct VulnCaseRow {
    pub id: String,
    pub name: String,
    pub severity: String,
    pub tags: Option<String>,
    pub fingerprint: Option<String>,
    pub file_path: Option<String>,
    pub enabled: i64,
}

/// Known scan target.
#[derive(Debug, Clone, FromRow)]
pub struct TargetRow {
    pub id: String,
    pub address: String,
    pub last_scan: Option<String>,
}

/// Fingerprint recorded against a target.
#[derive(Debug, Clone, FromRow)]
pub struct TargetFingerprintRow {
    pub id: String,
    pub target_id: String,
    pub category: String,
    pub name: String,
    pub version: Option<String>,
    pub tags: Option<String>,
}

/// Service observed on a target.
#[derive(Debug, Clone, FromRow)]
pub struct ServiceRow {
    pub id: String,
    pub target_id: String,
    pub port: i64,
    pub name: String,
    pub ssl: i64,
}
