//! Wire and domain types shared between the scheduler and scanner nodes.
//!
//! The broker carries two JSON message shapes on a durable direct exchange:
//!
//! - routing key `task` -> queue `scan.tasks`:
//!   `{"task_id": str, "chunk_id": int, "targets": [str], "total_chunks": int, "type": "scan"}`
//! - routing key `result` -> queue `scan.results`:
//!   `{"task_id": str, "status": "progress"|"completed"|"failed", "completed": int?, "error": str?}`
//!
//! Both queues are at-least-once; consumers must be idempotent.

pub mod config;
pub mod defaults;
pub mod error;
pub mod types;

pub use config::Settings;
pub use error::ProtocolError;
pub use types::{
    CaseMetadata, ChunkMessage, Credential, Fingerprint, FingerprintCategory,
    FingerprintPredicate, NodeStatus, ResultKind, ResultMessage, ScanPolicy, Severity, StatStatus,
    TaskProgress, TaskStatus, VulnResult,
};
