//! End-to-end scanner-core tests: fingerprint -> case selection -> verify ->
//! stats, and chunk handling with progress emission.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use httpmock::prelude::*;

use vulnscan_protocol::types::AuthMap;
use vulnscan_protocol::{
    CaseMetadata, ChunkMessage, Credential, Fingerprint, ResultKind, ResultMessage, ScanPolicy,
    Severity, VulnResult,
};
use vulnscan_scanner::auth::AuthManager;
use vulnscan_scanner::executor::{CaseExecutor, ExecutorConfig, ScanTaskHandler};
use vulnscan_scanner::fingerprint::FingerprintEngine;
use vulnscan_scanner::node::ChunkHandler;
use vulnscan_scanner::registry::{CaseError, CaseRegistry, ToolRegistry, VulnCase};
use vulnscan_scanner::Session;
use vulnscan_store::{open_store, NewTask, TaskRow, VulnStore, WorkBroker};

async fn temp_store() -> (tempfile::TempDir, VulnStore) {
    let tmp = tempfile::tempdir().unwrap();
    let url = format!("sqlite:{}", tmp.path().join("scan_flow.db").display());
    let store = open_store(&url, 5).await.unwrap();
    (tmp, store)
}

async fn make_task(
    store: &VulnStore,
    target: &str,
    policy: ScanPolicy,
    vuln_ids: Option<Vec<String>>,
    auth: AuthMap,
) -> TaskRow {
    store
        .insert_task(NewTask {
            name: "scan".to_string(),
            targets: vec![target.to_string()],
            auth,
            policy,
            vuln_ids,
            priority: 5,
            options: Default::default(),
            progress_total: 1,
        })
        .await
        .unwrap()
}

fn make_executor(store: &VulnStore, registry: CaseRegistry, timeout: Duration) -> Arc<CaseExecutor> {
    Arc::new(CaseExecutor::new(
        Arc::new(registry),
        Arc::new(AuthManager::new()),
        Arc::new(FingerprintEngine::new().unwrap()),
        store.clone(),
        ExecutorConfig {
            case_timeout: timeout,
            rate_limit: 10,
        },
    ))
}

fn builtin_registry() -> CaseRegistry {
    let mut registry = CaseRegistry::new(Arc::new(ToolRegistry::new()));
    registry.register_builtin();
    registry
}

/// Mock target serving an nginx banner and a readable git config.
async fn vulnerable_server() -> MockServer {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/");
            then.status(200)
                .header("Server", "nginx/1.18.0")
                .body("<html>welcome</html>");
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/.git/config");
            then.status(200).body("[core]\n\trepositoryformatversion = 0\n");
        })
        .await;
    server
}

fn server_target(server: &MockServer) -> String {
    format!("{}:{}", server.host(), server.port())
}

#[tokio::test]
async fn full_policy_scan_finds_exposures_and_records_stats() {
    let server = vulnerable_server().await;
    let (_tmp, store) = temp_store().await;
    let target = server_target(&server);

    let task = make_task(&store, &target, ScanPolicy::Full, None, AuthMap::new()).await;
    let executor = make_executor(&store, builtin_registry(), Duration::from_secs(5));

    let results = executor.scan_target(&task, &target).await;

    let git = results
        .iter()
        .find(|r| r.vuln_id == "VULN-GIT-CONFIG")
        .unwrap();
    assert!(git.vulnerable);
    assert_eq!(git.severity, Severity::High);
    assert!(git.proof.is_some());

    // nginx/1.18.0 leaks a version
    let version = results
        .iter()
        .find(|r| r.vuln_id == "VULN-VERSION-DISCLOSURE")
        .unwrap();
    assert!(version.vulnerable);

    // .env probe ran and came back clean
    let env = results.iter().find(|r| r.vuln_id == "VULN-ENV-FILE").unwrap();
    assert!(!env.vulnerable);

    // One stat per executed case, all success, non-negative durations.
    let stats = store.list_stats_for_task(&task.id).await.unwrap();
    assert_eq!(stats.len(), 3);
    assert!(stats.iter().all(|s| s.status == "success"));
    assert!(stats.iter().all(|s| s.duration_ms >= 0));

    // Target bookkeeping: fingerprints and the primary service recorded
    // against the target row.
    let target_row = store.get_target(&target).await.unwrap().unwrap();
    let fps = store
        .list_target_fingerprints(&target_row.id)
        .await
        .unwrap();
    assert!(fps.iter().any(|fp| fp.name == "nginx"));
    let services = store.list_services(&target_row.id).await.unwrap();
    assert_eq!(services.len(), 1);
    assert_eq!(services[0].name, "nginx");
}

#[tokio::test]
async fn redline_policy_skips_low_severity_cases() {
    let server = vulnerable_server().await;
    let (_tmp, store) = temp_store().await;
    let target = server_target(&server);

    let task = make_task(&store, &target, ScanPolicy::Redline, None, AuthMap::new()).await;
    let executor = make_executor(&store, builtin_registry(), Duration::from_secs(5));

    let results = executor.scan_target(&task, &target).await;

    // Info-severity version disclosure is filtered out under redline.
    assert!(results
        .iter()
        .all(|r| r.vuln_id != "VULN-VERSION-DISCLOSURE"));
    assert!(results.iter().any(|r| r.vuln_id == "VULN-GIT-CONFIG"));
}

#[tokio::test]
async fn specified_policy_runs_only_listed_cases() {
    let server = vulnerable_server().await;
    let (_tmp, store) = temp_store().await;
    let target = server_target(&server);

    let task = make_task(
        &store,
        &target,
        ScanPolicy::Specified,
        Some(vec!["VULN-ENV-FILE".to_string(), "NOT-LOADED".to_string()]),
        AuthMap::new(),
    )
    .await;
    let executor = make_executor(&store, builtin_registry(), Duration::from_secs(5));

    let results = executor.scan_target(&task, &target).await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].vuln_id, "VULN-ENV-FILE");

    let stats = store.list_stats_for_task(&task.id).await.unwrap();
    assert_eq!(stats.len(), 1);
}

struct SlowCase {
    meta: CaseMetadata,
}

impl SlowCase {
    fn new() -> Self {
        Self {
            meta: CaseMetadata {
                id: "SLOW-0001".to_string(),
                name: "never finishes".to_string(),
                severity: Severity::Medium,
                tags: vec![],
                fingerprint: None,
            },
        }
    }
}

#[async_trait]
impl VulnCase for SlowCase {
    fn metadata(&self) -> &CaseMetadata {
        &self.meta
    }

    async fn verify(
        &self,
        target: &str,
        _session: &Session,
        _fingerprints: &[Fingerprint],
    ) -> Result<VulnResult, CaseError> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(VulnResult::new(&self.meta.id, target))
    }
}

#[tokio::test]
async fn per_case_timeout_is_recorded() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/");
            then.status(200).body("ok");
        })
        .await;
    let (_tmp, store) = temp_store().await;
    let target = server_target(&server);

    let mut registry = CaseRegistry::new(Arc::new(ToolRegistry::new()));
    registry.register(Arc::new(SlowCase::new()));

    let task = make_task(&store, &target, ScanPolicy::Full, None, AuthMap::new()).await;
    let executor = make_executor(&store, registry, Duration::from_millis(100));

    let results = executor.scan_target(&task, &target).await;
    // Timed-out cases yield a default not-vulnerable result.
    assert_eq!(results.len(), 1);
    assert!(!results[0].vulnerable);

    let stats = store.list_stats_for_task(&task.id).await.unwrap();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].status, "timeout");
}

#[tokio::test]
async fn task_auth_authenticates_against_first_login_point() {
    let server = MockServer::start_async().await;
    let login = server
        .mock_async(|when, then| {
            when.method(POST).path("/login");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(serde_json::json!({"token": "scan-token"}));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/");
            then.status(200).body("ok");
        })
        .await;
    let env = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/.env")
                .header("authorization", "Bearer scan-token");
            then.status(200).body("SECRET_KEY=abc\n");
        })
        .await;

    let (_tmp, store) = temp_store().await;
    let target = server_target(&server);

    let mut auth = AuthMap::new();
    auth.insert(
        "admin".to_string(),
        Credential {
            username: "admin".to_string(),
            password: "hunter2".to_string(),
            login_url: None,
            method: None,
            extra: Default::default(),
        },
    );

    let task = make_task(
        &store,
        &target,
        ScanPolicy::Specified,
        Some(vec!["VULN-ENV-FILE".to_string()]),
        auth,
    )
    .await;
    let executor = make_executor(&store, builtin_registry(), Duration::from_secs(5));

    let results = executor.scan_target(&task, &target).await;

    login.assert_async().await;
    env.assert_async().await;
    assert_eq!(results.len(), 1);
    assert!(results[0].vulnerable);
}

#[tokio::test]
async fn chunk_handler_emits_one_progress_delta_per_target() {
    let server = vulnerable_server().await;
    let (_tmp, store) = temp_store().await;
    let target = server_target(&server);

    let broker = WorkBroker::new(store.pool().clone(), "vulnscan");
    broker.declare_exchange().await.unwrap();
    broker.bind_queue("result", "scan.results").await.unwrap();

    let task = make_task(&store, &target, ScanPolicy::Full, None, AuthMap::new()).await;
    let executor = make_executor(&store, builtin_registry(), Duration::from_secs(5));
    let handler = ScanTaskHandler::new(executor, store.clone(), Some(broker.clone()));

    let chunk = ChunkMessage::new(&task.id, 0, vec![target.clone(), target.clone()], 1);
    handler.handle(chunk).await.unwrap();

    let mut deltas = 0u64;
    while let Some(delivery) = broker
        .consume("scan.results", Duration::from_secs(30))
        .await
        .unwrap()
    {
        let message: ResultMessage = serde_json::from_slice(&delivery.body).unwrap();
        assert_eq!(message.status, ResultKind::Progress);
        assert_eq!(message.task_id, task.id);
        deltas += message.completed.unwrap_or(0);
        broker.ack(delivery.delivery_id).await.unwrap();
    }
    assert_eq!(deltas, 2);
}

#[tokio::test]
async fn unknown_task_in_chunk_reports_failure() {
    let (_tmp, store) = temp_store().await;
    let broker = WorkBroker::new(store.pool().clone(), "vulnscan");
    broker.declare_exchange().await.unwrap();
    broker.bind_queue("result", "scan.results").await.unwrap();

    let executor = make_executor(&store, builtin_registry(), Duration::from_secs(5));
    let handler = ScanTaskHandler::new(executor, store.clone(), Some(broker.clone()));

    let chunk = ChunkMessage::new("ghost-task", 0, vec!["10.0.0.1".to_string()], 1);
    assert!(handler.handle(chunk).await.is_err());

    let delivery = broker
        .consume("scan.results", Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    let message: ResultMessage = serde_json::from_slice(&delivery.body).unwrap();
    assert_eq!(message.status, ResultKind::Failed);
    assert_eq!(message.task_id, "ghost-task");
    assert!(message.error.is_some());
}
