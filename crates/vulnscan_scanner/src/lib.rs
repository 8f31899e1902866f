//! Scanner-node core: bounded concurrency pool, fingerprint engine,
//! authenticated-session manager, vulnerability-case registry/executor, and
//! the node manager tying them together.

pub mod auth;
pub mod executor;
pub mod fingerprint;
pub mod node;
pub mod pool;
pub mod registry;

pub use auth::{AuthError, AuthManager, Session};
pub use executor::{CaseExecutor, ExecutorConfig, ScanTaskHandler};
pub use fingerprint::{derive_base_url, FingerprintDef, FingerprintEngine, PatternRule};
pub use node::{ChunkHandler, NodeConfig, NodeManager, NodeState};
pub use pool::{CoroutinePool, PoolError, TaskHandle};
pub use registry::{CaseError, CaseRegistry, ProbeCase, ProbeCaseDef, ToolRegistry, VulnCase};
