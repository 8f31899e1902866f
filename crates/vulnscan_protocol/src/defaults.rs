//! Canonical default values shared across scheduler and scanner nodes.

pub const DEFAULT_SERVER_HOST: &str = "0.0.0.0";
pub const DEFAULT_SERVER_PORT: u16 = 8000;

pub const DEFAULT_DATABASE_URL: &str = "sqlite:vulnscan.db";
pub const DEFAULT_DATABASE_POOL_SIZE: u32 = 10;
pub const DEFAULT_DATABASE_MAX_OVERFLOW: u32 = 20;

pub const DEFAULT_REDIS_POOL_SIZE: u32 = 10;

pub const DEFAULT_EXCHANGE: &str = "vulnscan";
pub const DEFAULT_TASK_QUEUE: &str = "scan.tasks";
pub const DEFAULT_RESULT_QUEUE: &str = "scan.results";
pub const TASK_ROUTING_KEY: &str = "task";
pub const RESULT_ROUTING_KEY: &str = "result";

pub const DEFAULT_CHUNK_SIZE: usize = 256;
pub const DEFAULT_MAX_CONCURRENCY: usize = 100;
pub const DEFAULT_CASE_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_RATE_LIMIT: usize = 100;
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 10;

pub const DEFAULT_PRIORITY: i64 = 5;
pub const MIN_PRIORITY: i64 = 1;
pub const MAX_PRIORITY: i64 = 10;

pub const DEFAULT_PLUGIN_DIR: &str = "plugins/vulns";

pub const FINGERPRINT_TIMEOUT_SECS: u64 = 10;
pub const POOL_STOP_GRACE_SECS: u64 = 30;

pub const CANCELLED_BY_USER_MESSAGE: &str = "Task cancelled by user";
