//! Record store and durable work broker for the VulnScan engine.
//!
//! The record store exposes the five collections of the persistence
//! interface (tasks, scan_nodes, stat_records, vuln_cases, targets with
//! child services/fingerprints). The work broker layers durable queues with
//! lease-based at-least-once delivery over the same database, so a single
//! `DATABASE_URL` is the only piece of shared infrastructure a deployment
//! needs.

pub mod broker;
pub mod error;
pub mod models;
pub mod store;

pub use broker::{Delivery, WorkBroker};
pub use error::{Result, StoreError};
pub use models::{NodeRow, StatRow, TargetRow, TaskRow, VulnCaseRow};
pub use store::{open_store, NewStat, NewTask, NodeReport, VulnStore};
