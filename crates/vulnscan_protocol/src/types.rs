//! Canonical enums and message payload types.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

// ============================================================================
// Canonical enums (use these everywhere)
// ============================================================================

/// Scan task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    /// Completed and failed tasks never change status again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "paused" => Ok(TaskStatus::Paused),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(ProtocolError::InvalidStatus(other.to_string())),
        }
    }
}

/// Case selection strategy over the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ScanPolicy {
    #[default]
    Full,
    Redline,
    /// Reserved; behaves like `Full` until heuristic pruning lands.
    Smart,
    Specified,
}

impl ScanPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanPolicy::Full => "full",
            ScanPolicy::Redline => "redline",
            ScanPolicy::Smart => "smart",
            ScanPolicy::Specified => "specified",
        }
    }
}

impl fmt::Display for ScanPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScanPolicy {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(ScanPolicy::Full),
            "redline" => Ok(ScanPolicy::Redline),
            "smart" => Ok(ScanPolicy::Smart),
            "specified" => Ok(ScanPolicy::Specified),
            other => Err(ProtocolError::InvalidPolicy(other.to_string())),
        }
    }
}

/// Vulnerability severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    #[default]
    Medium,
    Low,
    Info,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
            Severity::Info => "info",
        }
    }

    /// Whether this severity passes the `redline` policy filter.
    pub fn is_redline(&self) -> bool {
        matches!(self, Severity::Critical | Severity::High)
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "critical" => Ok(Severity::Critical),
            "high" => Ok(Severity::High),
            "medium" => Ok(Severity::Medium),
            "low" => Ok(Severity::Low),
            "info" => Ok(Severity::Info),
            other => Err(ProtocolError::InvalidSeverity(other.to_string())),
        }
    }
}

/// Scanner node availability status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Online,
    #[default]
    Offline,
    Busy,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Online => "online",
            NodeStatus::Offline => "offline",
            NodeStatus::Busy => "busy",
        }
    }
}

impl FromStr for NodeStatus {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(NodeStatus::Online),
            "offline" => Ok(NodeStatus::Offline),
            "busy" => Ok(NodeStatus::Busy),
            other => Err(ProtocolError::InvalidStatus(other.to_string())),
        }
    }
}

/// Outcome bucket of a single case execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatStatus {
    Success,
    Fail,
    Timeout,
}

impl StatStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatStatus::Success => "success",
            StatStatus::Fail => "fail",
            StatStatus::Timeout => "timeout",
        }
    }
}

impl FromStr for StatStatus {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(StatStatus::Success),
            "fail" => Ok(StatStatus::Fail),
            "timeout" => Ok(StatStatus::Timeout),
            other => Err(ProtocolError::InvalidStatus(other.to_string())),
        }
    }
}

/// Technology classification of a fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FingerprintCategory {
    Webserver,
    Framework,
    Cms,
    Server,
    Database,
    Ci,
    Vcs,
    Application,
    Os,
    Service,
}

impl FingerprintCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FingerprintCategory::Webserver => "webserver",
            FingerprintCategory::Framework => "framework",
            FingerprintCategory::Cms => "cms",
            FingerprintCategory::Server => "server",
            FingerprintCategory::Database => "database",
            FingerprintCategory::Ci => "ci",
            FingerprintCategory::Vcs => "vcs",
            FingerprintCategory::Application => "application",
            FingerprintCategory::Os => "os",
            FingerprintCategory::Service => "service",
        }
    }
}

// ============================================================================
// Broker wire messages
// ============================================================================

fn default_message_type() -> String {
    "scan".to_string()
}

/// One unit of dispatched work: a sub-list of expanded targets bound to a task.
///
/// Delivery is at-least-once; the same chunk may arrive twice after a
/// consumer crash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMessage {
    pub task_id: String,
    pub chunk_id: u32,
    pub targets: Vec<String>,
    pub total_chunks: u32,
    #[serde(rename = "type", default = "default_message_type")]
    pub message_type: String,
}

impl ChunkMessage {
    pub fn new(task_id: impl Into<String>, chunk_id: u32, targets: Vec<String>, total_chunks: u32) -> Self {
        Self {
            task_id: task_id.into(),
            chunk_id,
            targets,
            total_chunks,
            message_type: default_message_type(),
        }
    }
}

/// Kind discriminator of a result message. Unknown kinds deserialize to
/// `Unknown` so the consumer can log-and-ack poison messages instead of
/// redelivering them forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultKind {
    Progress,
    Completed,
    Failed,
    #[serde(other)]
    Unknown,
}

/// Result message flowing from scanner nodes back to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultMessage {
    pub task_id: String,
    pub status: ResultKind,
    /// Per-target progress delta; only set for `Progress`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResultMessage {
    pub fn progress(task_id: impl Into<String>, completed_delta: u64) -> Self {
        Self {
            task_id: task_id.into(),
            status: ResultKind::Progress,
            completed: Some(completed_delta),
            error: None,
        }
    }

    pub fn completed(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: ResultKind::Completed,
            completed: None,
            error: None,
        }
    }

    pub fn failed(task_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: ResultKind::Failed,
            completed: None,
            error: Some(error.into()),
        }
    }
}

// ============================================================================
// Domain values
// ============================================================================

/// Task progress counters. `completed <= total` always holds after clamping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TaskProgress {
    pub total: u64,
    pub completed: u64,
}

impl TaskProgress {
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.completed as f64 / self.total as f64) * 100.0
    }
}

/// A detected technology on a target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub category: FingerprintCategory,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "Fingerprint::default_confidence")]
    pub confidence: f32,
}

impl Fingerprint {
    fn default_confidence() -> f32 {
        1.0
    }

    pub fn new(category: FingerprintCategory, name: impl Into<String>) -> Self {
        Self {
            category,
            name: name.into(),
            version: None,
            tags: Vec::new(),
            confidence: 1.0,
        }
    }

    pub fn with_version(mut self, version: Option<String>) -> Self {
        self.version = version;
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }
}

/// Fingerprint-match predicate declared by a case.
///
/// `tags` matches if at least one declared tag is present in the union of the
/// input fingerprint tags; `service` matches case-insensitively against
/// fingerprint names. A predicate declaring neither matches universally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FingerprintPredicate {
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
}

impl FingerprintPredicate {
    pub fn matches(&self, fingerprints: &[Fingerprint]) -> bool {
        if !self.tags.is_empty() {
            let present = fingerprints
                .iter()
                .flat_map(|fp| fp.tags.iter())
                .any(|tag| self.tags.iter().any(|want| want == tag));
            if !present {
                return false;
            }
        }

        if let Some(service) = self.service.as_deref() {
            if !service.is_empty() {
                let want = service.to_ascii_lowercase();
                let found = fingerprints
                    .iter()
                    .any(|fp| fp.name.to_ascii_lowercase() == want);
                if !found {
                    return false;
                }
            }
        }

        true
    }
}

/// Metadata declared by a vulnerability-case plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseMetadata {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<FingerprintPredicate>,
}

impl CaseMetadata {
    /// Pure: depends only on this metadata and the inputs.
    pub fn matches(&self, fingerprints: &[Fingerprint], policy: ScanPolicy) -> bool {
        if policy == ScanPolicy::Redline && !self.severity.is_redline() {
            return false;
        }
        match &self.fingerprint {
            Some(predicate) => predicate.matches(fingerprints),
            None => true,
        }
    }
}

/// Verdict of a single case verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VulnResult {
    pub vuln_id: String,
    pub target: String,
    pub vulnerable: bool,
    pub severity: Severity,
    #[serde(default)]
    pub details: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proof: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl VulnResult {
    pub fn new(vuln_id: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            vuln_id: vuln_id.into(),
            target: target.into(),
            vulnerable: false,
            severity: Severity::Medium,
            details: serde_json::Map::new(),
            proof: None,
            timestamp: Utc::now(),
        }
    }

    pub fn vulnerable(mut self, severity: Severity, proof: impl Into<String>) -> Self {
        self.vulnerable = true;
        self.severity = severity;
        self.proof = Some(proof.into());
        self
    }
}

/// Credential bundle for one login point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub username: String,
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Task auth mapping: login-point name -> credential bundle. Ordered so "the
/// first login point" is deterministic.
pub type AuthMap = BTreeMap<String, Credential>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_message_wire_shape() {
        let chunk = ChunkMessage::new("t-1", 0, vec!["10.0.0.1".into()], 3);
        let json = serde_json::to_value(&chunk).unwrap();
        assert_eq!(json["task_id"], "t-1");
        assert_eq!(json["chunk_id"], 0);
        assert_eq!(json["total_chunks"], 3);
        assert_eq!(json["type"], "scan");

        // `type` defaults to "scan" when absent
        let parsed: ChunkMessage = serde_json::from_str(
            r#"{"task_id":"t-1","chunk_id":1,"targets":["a.com"],"total_chunks":2}"#,
        )
        .unwrap();
        assert_eq!(parsed.message_type, "scan");
    }

    #[test]
    fn result_message_kinds() {
        let msg = ResultMessage::progress("t-1", 1);
        let json = serde_json::to_string(&msg).unwrap();
        let back: ResultMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.status, ResultKind::Progress);
        assert_eq!(back.completed, Some(1));

        let failed = ResultMessage::failed("t-1", "boom");
        assert_eq!(failed.error.as_deref(), Some("boom"));

        // Unknown kinds do not fail deserialization
        let poison: ResultMessage =
            serde_json::from_str(r#"{"task_id":"t-1","status":"resurrected"}"#).unwrap();
        assert_eq!(poison.status, ResultKind::Unknown);
    }

    #[test]
    fn status_round_trips() {
        for s in ["pending", "running", "paused", "completed", "failed"] {
            assert_eq!(s.parse::<TaskStatus>().unwrap().as_str(), s);
        }
        assert!("zombie".parse::<TaskStatus>().is_err());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(!TaskStatus::Paused.is_terminal());
    }

    #[test]
    fn redline_severities() {
        assert!(Severity::Critical.is_redline());
        assert!(Severity::High.is_redline());
        assert!(!Severity::Medium.is_redline());
        assert!(!Severity::Info.is_redline());
    }

    #[test]
    fn predicate_tag_and_service_matching() {
        let fps = vec![
            Fingerprint::new(FingerprintCategory::Server, "Tomcat")
                .with_tags(vec!["manager".into()]),
            Fingerprint::new(FingerprintCategory::Webserver, "nginx"),
        ];

        let by_tag = FingerprintPredicate {
            tags: vec!["manager".into()],
            service: None,
        };
        assert!(by_tag.matches(&fps));

        let by_service = FingerprintPredicate {
            tags: vec![],
            service: Some("tomcat".into()),
        };
        assert!(by_service.matches(&fps));

        let miss = FingerprintPredicate {
            tags: vec!["wordpress".into()],
            service: None,
        };
        assert!(!miss.matches(&fps));

        // no predicate fields -> universal match
        assert!(FingerprintPredicate::default().matches(&[]));
    }

    #[test]
    fn metadata_policy_filter() {
        let meta = CaseMetadata {
            id: "CVE-2024-0001".into(),
            name: "test".into(),
            severity: Severity::Low,
            tags: vec![],
            fingerprint: None,
        };
        assert!(meta.matches(&[], ScanPolicy::Full));
        assert!(meta.matches(&[], ScanPolicy::Smart));
        assert!(!meta.matches(&[], ScanPolicy::Redline));
    }

    #[test]
    fn progress_percent() {
        let progress = TaskProgress {
            total: 200,
            completed: 50,
        };
        assert_eq!(progress.percent(), 25.0);
        assert_eq!(TaskProgress::default().percent(), 0.0);
    }
}
