//! Record store over SQLite.
//!
//! Five logical collections: `tasks`, `scan_nodes`, `stat_records`,
//! `vuln_cases`, `targets` (with child `services` and `fingerprints`).
//! Status transitions re-read the row inside the transaction that writes the
//! new status, so concurrent transitions on one task serialize through the
//! database.

use std::str::FromStr;

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use tracing::{debug, info};
use uuid::Uuid;

use vulnscan_protocol::types::AuthMap;
use vulnscan_protocol::{CaseMetadata, Fingerprint, NodeStatus, ScanPolicy, StatStatus, TaskStatus};

use crate::error::{Result, StoreError};
use crate::models::{
    NodeRow, ServiceRow, StatRow, TargetFingerprintRow, TargetRow, TaskRow, VulnCaseRow,
};

/// Fields needed to create a task record.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub name: String,
    pub targets: Vec<String>,
    pub auth: AuthMap,
    pub policy: ScanPolicy,
    pub vuln_ids: Option<Vec<String>>,
    pub priority: i64,
    pub options: serde_json::Map<String, serde_json::Value>,
    pub progress_total: u64,
}

/// Fields needed to append a stat record.
#[derive(Debug, Clone)]
pub struct NewStat {
    pub vuln_id: String,
    pub target_id: String,
    pub task_id: String,
    pub start_time: chrono::DateTime<Utc>,
    pub end_time: chrono::DateTime<Utc>,
    pub status: StatStatus,
    pub result: Option<String>,
}

/// Fields reported with every node heartbeat.
#[derive(Debug, Clone)]
pub struct NodeReport {
    pub status: NodeStatus,
    pub cpu_load: f64,
    pub memory_load: f64,
    pub tasks_running: i64,
    pub max_tasks: i64,
    pub tags: Vec<String>,
}

/// Shared handle to the record store.
#[derive(Clone)]
pub struct VulnStore {
    pool: Pool<Sqlite>,
}

impl VulnStore {
    /// Open (creating the file if missing) and return an uninitialized store.
    pub async fn open(database_url: &str, max_connections: u32) -> Result<Self> {
        if !database_url.starts_with("sqlite:") {
            return Err(StoreError::UnsupportedUrl(database_url.to_string()));
        }
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(StoreError::Sqlx)?
            .create_if_missing(true);

        // A :memory: database exists per-connection; keep a single connection
        // so every caller sees the same data.
        let max_connections = if database_url.contains(":memory:") {
            1
        } else {
            max_connections.max(1)
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// Create all collections if they do not exist yet.
    pub async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                targets TEXT NOT NULL,
                auth TEXT,
                policy TEXT NOT NULL DEFAULT 'full',
                vuln_ids TEXT,
                priority INTEGER NOT NULL DEFAULT 5,
                options TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                progress_total INTEGER NOT NULL DEFAULT 0,
                progress_completed INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks (status, priority DESC, created_at ASC)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS scan_nodes (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL DEFAULT 'offline',
                cpu_load REAL NOT NULL DEFAULT 0,
                memory_load REAL NOT NULL DEFAULT 0,
                tasks_running INTEGER NOT NULL DEFAULT 0,
                max_tasks INTEGER NOT NULL DEFAULT 100,
                last_heartbeat TEXT NOT NULL,
                tags TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS stat_records (
                id TEXT PRIMARY KEY,
                vuln_id TEXT NOT NULL,
                target_id TEXT NOT NULL,
                task_id TEXT NOT NULL,
                start_time TEXT NOT NULL,
                end_time TEXT NOT NULL,
                duration_ms INTEGER NOT NULL,
                status TEXT NOT NULL,
                result TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS vuln_cases (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                severity TEXT NOT NULL DEFAULT 'medium',
                tags TEXT,
                fingerprint TEXT,
                file_path TEXT,
                enabled INTEGER NOT NULL DEFAULT 1
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS targets (
                id TEXT PRIMARY KEY,
                address TEXT NOT NULL UNIQUE,
                last_scan TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS fingerprints (
                id TEXT PRIMARY KEY,
                target_id TEXT NOT NULL,
                category TEXT NOT NULL,
                name TEXT NOT NULL,
                version TEXT,
                tags TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS services (
                id TEXT PRIMARY KEY,
                target_id TEXT NOT NULL,
                port INTEGER NOT NULL,
                name TEXT NOT NULL,
                ssl INTEGER NOT NULL DEFAULT 0,
                UNIQUE (target_id, port)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        debug!("Record store initialized");
        Ok(())
    }

    /// Raw pool handle, shared with the work broker.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    // ------------------------------------------------------------------
    // Tasks
    // ------------------------------------------------------------------

    pub async fn insert_task(&self, new: NewTask) -> Result<TaskRow> {
        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();
        let auth = if new.auth.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&new.auth)?)
        };
        let vuln_ids = match &new.vuln_ids {
            Some(ids) => Some(serde_json::to_string(ids)?),
            None => None,
        };
        let options = if new.options.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&new.options)?)
        };

        sqlx::query(
            r#"
            INSERT INTO tasks
                (id, name, targets, auth, policy, vuln_ids, priority, options,
                 status, progress_total, progress_completed, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?, 0, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&new.name)
        .bind(serde_json::to_string(&new.targets)?)
        .bind(&auth)
        .bind(new.policy.as_str())
        .bind(&vuln_ids)
        .bind(new.priority)
        .bind(&options)
        .bind(new.progress_total as i64)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        self.get_task(&id)
            .await?
            .ok_or_else(|| StoreError::not_found(format!("task {id} vanished after insert")))
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Option<TaskRow>> {
        let row = sqlx::query_as::<_, TaskRow>("SELECT * FROM tasks WHERE id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// Filtered page of tasks, newest first, plus the filtered total count.
    pub async fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        page: u32,
        size: u32,
    ) -> Result<(Vec<TaskRow>, i64)> {
        let page = page.max(1);
        let size = size.max(1);
        let offset = ((page - 1) * size) as i64;

        let (rows, total) = match status {
            Some(status) => {
                let rows = sqlx::query_as::<_, TaskRow>(
                    "SELECT * FROM tasks WHERE status = ? ORDER BY created_at DESC LIMIT ? OFFSET ?",
                )
                .bind(status.as_str())
                .bind(size as i64)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?;
                let total: i64 =
                    sqlx::query_scalar("SELECT COUNT(*) FROM tasks WHERE status = ?")
                        .bind(status.as_str())
                        .fetch_one(&self.pool)
                        .await?;
                (rows, total)
            }
            None => {
                let rows = sqlx::query_as::<_, TaskRow>(
                    "SELECT * FROM tasks ORDER BY created_at DESC LIMIT ? OFFSET ?",
                )
                .bind(size as i64)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?;
                let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tasks")
                    .fetch_one(&self.pool)
                    .await?;
                (rows, total)
            }
        };

        Ok((rows, total))
    }

    /// Pending tasks in dispatch order: priority descending, oldest first.
    pub async fn list_pending_tasks(&self) -> Result<Vec<TaskRow>> {
        let rows = sqlx::query_as::<_, TaskRow>(
            "SELECT * FROM tasks WHERE status = 'pending' ORDER BY priority DESC, created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Atomically move a task from one of `allowed_from` to `to`.
    ///
    /// Returns false (without mutating) when the task is missing or its
    /// current status is not in `allowed_from`.
    pub async fn transition_task(
        &self,
        task_id: &str,
        allowed_from: &[TaskStatus],
        to: TaskStatus,
        error_message: Option<&str>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let current: Option<String> = sqlx::query_scalar("SELECT status FROM tasks WHERE id = ?")
            .bind(task_id)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(current) = current else {
            tx.commit().await?;
            return Ok(false);
        };
        let current: TaskStatus = current.parse().unwrap_or_default();
        if !allowed_from.contains(&current) {
            tx.commit().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE tasks
            SET status = ?,
                error_message = COALESCE(?, error_message),
                progress_completed = CASE WHEN ? THEN progress_total ELSE progress_completed END,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(to.as_str())
        .bind(error_message)
        .bind(to == TaskStatus::Completed)
        .bind(now_rfc3339())
        .bind(task_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Clamped, monotonic progress update.
    ///
    /// `completed` is an absolute value; the stored counter never moves
    /// backwards and never exceeds `progress_total`, so redelivered progress
    /// messages are harmless.
    pub async fn update_task_progress(
        &self,
        task_id: &str,
        completed: u64,
        total: Option<u64>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        if let Some(total) = total {
            // progress_total never decreases
            sqlx::query(
                "UPDATE tasks SET progress_total = MAX(progress_total, ?), updated_at = ? WHERE id = ?",
            )
            .bind(total as i64)
            .bind(now_rfc3339())
            .bind(task_id)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            UPDATE tasks
            SET progress_completed = MAX(progress_completed, MIN(?, progress_total)),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(completed as i64)
        .bind(now_rfc3339())
        .bind(task_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Scan nodes
    // ------------------------------------------------------------------

    pub async fn upsert_node(&self, node_id: &str, report: &NodeReport) -> Result<()> {
        let tags = if report.tags.is_empty() {
            None
        } else {
            Some(report.tags.join(","))
        };
        sqlx::query(
            r#"
            INSERT INTO scan_nodes
                (id, status, cpu_load, memory_load, tasks_running, max_tasks, last_heartbeat, tags)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                status = excluded.status,
                cpu_load = excluded.cpu_load,
                memory_load = excluded.memory_load,
                tasks_running = excluded.tasks_running,
                max_tasks = excluded.max_tasks,
                last_heartbeat = excluded.last_heartbeat,
                tags = excluded.tags
            "#,
        )
        .bind(node_id)
        .bind(report.status.as_str())
        .bind(report.cpu_load)
        .bind(report.memory_load)
        .bind(report.tasks_running)
        .bind(report.max_tasks)
        .bind(now_rfc3339())
        .bind(tags)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_node(&self, node_id: &str) -> Result<Option<NodeRow>> {
        let row = sqlx::query_as::<_, NodeRow>("SELECT * FROM scan_nodes WHERE id = ?")
            .bind(node_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn list_nodes(&self) -> Result<Vec<NodeRow>> {
        let rows = sqlx::query_as::<_, NodeRow>("SELECT * FROM scan_nodes ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    // ------------------------------------------------------------------
    // Stat records
    // ------------------------------------------------------------------

    pub async fn append_stat(&self, stat: NewStat) -> Result<()> {
        let duration_ms = (stat.end_time - stat.start_time).num_milliseconds().max(0);
        sqlx::query(
            r#"
            INSERT INTO stat_records
                (id, vuln_id, target_id, task_id, start_time, end_time, duration_ms, status, result)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&stat.vuln_id)
        .bind(&stat.target_id)
        .bind(&stat.task_id)
        .bind(stat.start_time.to_rfc3339())
        .bind(stat.end_time.to_rfc3339())
        .bind(duration_ms)
        .bind(stat.status.as_str())
        .bind(&stat.result)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_stats_for_task(&self, task_id: &str) -> Result<Vec<StatRow>> {
        let rows = sqlx::query_as::<_, StatRow>(
            "SELECT * FROM stat_records WHERE task_id = ? ORDER BY start_time ASC",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // ------------------------------------------------------------------
    // Vuln cases
    // ------------------------------------------------------------------

    /// Mirror loaded case metadata into the store (last write wins).
    pub async fn upsert_vuln_case(&self, meta: &CaseMetadata, file_path: Option<&str>) -> Result<()> {
        let tags = if meta.tags.is_empty() {
            None
        } else {
            Some(meta.tags.join(","))
        };
        let fingerprint = match &meta.fingerprint {
            Some(predicate) => Some(serde_json::to_string(predicate)?),
            None => None,
        };
        sqlx::query(
            r#"
            INSERT INTO vuln_cases (id, name, severity, tags, fingerprint, file_path, enabled)
            VALUES (?, ?, ?, ?, ?, ?, 1)
            ON CONFLICT (id) DO UPDATE SET
                name = excluded.name,
                severity = excluded.severity,
                tags = excluded.tags,
                fingerprint = excluded.fingerprint,
                file_path = excluded.file_path,
                enabled = excluded.enabled
            "#,
        )
        .bind(&meta.id)
        .bind(&meta.name)
        .bind(meta.severity.as_str())
        .bind(tags)
        .bind(fingerprint)
        .bind(file_path)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_vuln_cases(&self) -> Result<Vec<VulnCaseRow>> {
        let rows = sqlx::query_as::<_, VulnCaseRow>("SELECT * FROM vuln_cases ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    // ------------------------------------------------------------------
    // Targets and child collections
    // ------------------------------------------------------------------

    /// Get-or-create the target row for an address, returning its id.
    pub async fn upsert_target(&self, address: &str) -> Result<String> {
        let mut tx = self.pool.begin().await?;

        let existing: Option<String> = sqlx::query_scalar("SELECT id FROM targets WHERE address = ?")
            .bind(address)
            .fetch_optional(&mut *tx)
            .await?;

        let id = match existing {
            Some(id) => id,
            None => {
                let id = Uuid::new_v4().to_string();
                sqlx::query("INSERT INTO targets (id, address) VALUES (?, ?)")
                    .bind(&id)
                    .bind(address)
                    .execute(&mut *tx)
                    .await?;
                id
            }
        };

        tx.commit().await?;
        Ok(id)
    }

    /// Replace the fingerprints recorded for a target and stamp its last scan.
    pub async fn record_fingerprints(
        &self,
        target_id: &str,
        fingerprints: &[Fingerprint],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM fingerprints WHERE target_id = ?")
            .bind(target_id)
            .execute(&mut *tx)
            .await?;

        for fp in fingerprints {
            let tags = if fp.tags.is_empty() {
                None
            } else {
                Some(fp.tags.join(","))
            };
            sqlx::query(
                "INSERT INTO fingerprints (id, target_id, category, name, version, tags) VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(target_id)
            .bind(fp.category.as_str())
            .bind(&fp.name)
            .bind(&fp.version)
            .bind(tags)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("UPDATE targets SET last_scan = ? WHERE id = ?")
            .bind(now_rfc3339())
            .bind(target_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn record_service(
        &self,
        target_id: &str,
        port: u16,
        name: &str,
        ssl: bool,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO services (id, target_id, port, name, ssl)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (target_id, port) DO UPDATE SET
                name = excluded.name,
                ssl = excluded.ssl
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(target_id)
        .bind(port as i64)
        .bind(name)
        .bind(ssl as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_services(&self, target_id: &str) -> Result<Vec<ServiceRow>> {
        let rows = sqlx::query_as::<_, ServiceRow>(
            "SELECT * FROM services WHERE target_id = ? ORDER BY port",
        )
        .bind(target_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn get_target(&self, address: &str) -> Result<Option<TargetRow>> {
        let row = sqlx::query_as::<_, TargetRow>("SELECT * FROM targets WHERE address = ?")
            .bind(address)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn list_target_fingerprints(
        &self,
        target_id: &str,
    ) -> Result<Vec<TargetFingerprintRow>> {
        let rows = sqlx::query_as::<_, TargetFingerprintRow>(
            "SELECT * FROM fingerprints WHERE target_id = ? ORDER BY name",
        )
        .bind(target_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

/// Convenience constructor used by both binaries.
pub async fn open_store(database_url: &str, max_connections: u32) -> Result<VulnStore> {
    let store = VulnStore::open(database_url, max_connections).await?;
    store.init().await?;
    info!("Record store ready at {}", database_url);
    Ok(store)
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}
