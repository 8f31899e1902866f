//! Case registry: plugin loading, metadata, and policy/fingerprint selection.
//!
//! Cases come from two places: compiled-in implementations of [`VulnCase`],
//! and declarative JSON probe definitions loaded from the plugin directory.
//! The registry is immutable once loading finishes; reloading builds a fresh
//! registry and the executor swaps the reference atomically.

use std::any::Any;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use regex::RegexBuilder;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use vulnscan_protocol::{CaseMetadata, Fingerprint, ScanPolicy, Severity, VulnResult};

use crate::auth::{AuthError, Session};

#[derive(Debug, Error)]
pub enum CaseError {
    #[error("session error: {0}")]
    Session(#[from] AuthError),

    #[error("invalid case definition in {path}: {message}")]
    InvalidDefinition { path: String, message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("verification failed: {0}")]
    Failed(String),
}

/// The plugin capability set: metadata, verify, cleanup.
#[async_trait]
pub trait VulnCase: Send + Sync {
    fn metadata(&self) -> &CaseMetadata;

    /// Check whether the target is vulnerable. Runs under the executor's
    /// per-case timeout.
    async fn verify(
        &self,
        target: &str,
        session: &Session,
        fingerprints: &[Fingerprint],
    ) -> Result<VulnResult, CaseError>;

    /// Best-effort cleanup after verify; failures are logged and ignored.
    async fn cleanup(&self, _target: &str, _session: &Session) -> Result<(), CaseError> {
        Ok(())
    }
}

/// Shared tools exposed to cases and plugins (HTTP engines, helpers).
/// Composition roots populate it; cases look tools up by name and type.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: Send + Sync + 'static>(&mut self, name: &str, tool: Arc<T>) {
        self.tools.insert(name.to_string(), tool);
    }

    pub fn get<T: Send + Sync + 'static>(&self, name: &str) -> Option<Arc<T>> {
        self.tools
            .get(name)
            .and_then(|tool| tool.clone().downcast::<T>().ok())
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }
}

// ============================================================================
// Declarative probe cases (runtime-loaded plugin format)
// ============================================================================

fn default_match_status() -> Vec<u16> {
    vec![200]
}

/// HTTP probe described by a plugin file.
#[derive(Debug, Clone, Deserialize)]
pub struct ProbeSpec {
    pub path: String,
    #[serde(default = "default_match_status")]
    pub match_status: Vec<u16>,
    #[serde(default)]
    pub body_regex: Option<String>,
    /// Proof text reported when the probe hits.
    #[serde(default)]
    pub evidence: Option<String>,
    /// Optional path fetched during cleanup (e.g. a logout endpoint).
    #[serde(default)]
    pub cleanup_path: Option<String>,
}

/// On-disk shape of a declarative plugin file.
#[derive(Debug, Clone, Deserialize)]
pub struct ProbeCaseDef {
    #[serde(flatten)]
    pub meta: CaseMetadata,
    pub probe: ProbeSpec,
}

/// Generic HTTP probe case interpreting a [`ProbeCaseDef`].
pub struct ProbeCase {
    meta: CaseMetadata,
    probe: ProbeSpec,
    body_regex: Option<regex::Regex>,
}

impl ProbeCase {
    pub fn from_def(def: ProbeCaseDef, source: &str) -> Result<Self, CaseError> {
        let body_regex = match &def.probe.body_regex {
            Some(pattern) => Some(
                RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|err| CaseError::InvalidDefinition {
                        path: source.to_string(),
                        message: err.to_string(),
                    })?,
            ),
            None => None,
        };
        Ok(Self {
            meta: def.meta,
            probe: def.probe,
            body_regex,
        })
    }
}

#[async_trait]
impl VulnCase for ProbeCase {
    fn metadata(&self) -> &CaseMetadata {
        &self.meta
    }

    async fn verify(
        &self,
        target: &str,
        session: &Session,
        _fingerprints: &[Fingerprint],
    ) -> Result<VulnResult, CaseError> {
        let response = session.get(&self.probe.path).await?;
        let status = response.status().as_u16();

        let mut result = VulnResult::new(&self.meta.id, target);
        if self.probe.match_status.contains(&status) {
            let body_hit = match &self.body_regex {
                Some(re) => {
                    let body = response.text().await.unwrap_or_default();
                    re.is_match(&body)
                }
                None => true,
            };
            if body_hit {
                let proof = self
                    .probe
                    .evidence
                    .clone()
                    .unwrap_or_else(|| format!("{} returned HTTP {}", self.probe.path, status));
                result = result.vulnerable(self.meta.severity, proof);
            }
        }
        Ok(result)
    }

    async fn cleanup(&self, _target: &str, session: &Session) -> Result<(), CaseError> {
        if let Some(path) = &self.probe.cleanup_path {
            session.get(path).await?;
        }
        Ok(())
    }
}

// ============================================================================
// Compiled-in cases
// ============================================================================

/// Reports version strings leaked through fingerprintable surfaces.
pub struct VersionDisclosureCase {
    meta: CaseMetadata,
}

impl VersionDisclosureCase {
    pub fn new() -> Self {
        Self {
            meta: CaseMetadata {
                id: "VULN-VERSION-DISCLOSURE".to_string(),
                name: "Product version disclosure".to_string(),
                severity: Severity::Info,
                tags: vec!["disclosure".to_string()],
                fingerprint: None,
            },
        }
    }
}

impl Default for VersionDisclosureCase {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VulnCase for VersionDisclosureCase {
    fn metadata(&self) -> &CaseMetadata {
        &self.meta
    }

    async fn verify(
        &self,
        target: &str,
        _session: &Session,
        fingerprints: &[Fingerprint],
    ) -> Result<VulnResult, CaseError> {
        let leaked: Vec<String> = fingerprints
            .iter()
            .filter_map(|fp| {
                fp.version
                    .as_ref()
                    .map(|version| format!("{} {}", fp.name, version))
            })
            .collect();

        let mut result = VulnResult::new(&self.meta.id, target);
        if !leaked.is_empty() {
            result = result.vulnerable(
                Severity::Info,
                format!("versions disclosed: {}", leaked.join(", ")),
            );
        }
        Ok(result)
    }
}

fn builtin_probe(
    id: &str,
    name: &str,
    severity: Severity,
    fingerprint: Option<vulnscan_protocol::FingerprintPredicate>,
    probe: ProbeSpec,
) -> Arc<dyn VulnCase> {
    // Compiled-in definitions have vetted regexes; from_def cannot fail here.
    let case = ProbeCase::from_def(
        ProbeCaseDef {
            meta: CaseMetadata {
                id: id.to_string(),
                name: name.to_string(),
                severity,
                tags: Vec::new(),
                fingerprint,
            },
            probe,
        },
        "<builtin>",
    )
    .expect("builtin probe definition is valid");
    Arc::new(case)
}

/// The compiled-in case set.
pub fn builtin_cases() -> Vec<Arc<dyn VulnCase>> {
    vec![
        Arc::new(VersionDisclosureCase::new()),
        builtin_probe(
            "VULN-GIT-CONFIG",
            "Exposed git repository configuration",
            Severity::High,
            None,
            ProbeSpec {
                path: "/.git/config".to_string(),
                match_status: vec![200],
                body_regex: Some(r"\[core\]".to_string()),
                evidence: Some("/.git/config is readable".to_string()),
                cleanup_path: None,
            },
        ),
        builtin_probe(
            "VULN-ENV-FILE",
            "Exposed dotenv file",
            Severity::High,
            None,
            ProbeSpec {
                path: "/.env".to_string(),
                match_status: vec![200],
                body_regex: Some(r"(?m)^[A-Z][A-Z0-9_]*=".to_string()),
                evidence: Some("/.env is readable".to_string()),
                cleanup_path: None,
            },
        ),
        builtin_probe(
            "VULN-TOMCAT-MANAGER",
            "Tomcat manager reachable without authentication",
            Severity::Medium,
            Some(vulnscan_protocol::FingerprintPredicate {
                tags: vec!["manager".to_string()],
                service: None,
            }),
            ProbeSpec {
                path: "/manager/html".to_string(),
                match_status: vec![200],
                body_regex: None,
                evidence: Some("/manager/html served without credentials".to_string()),
                cleanup_path: None,
            },
        ),
    ]
}

// ============================================================================
// Registry
// ============================================================================

/// Immutable-after-load case registry.
pub struct CaseRegistry {
    cases: HashMap<String, Arc<dyn VulnCase>>,
    tools: Arc<ToolRegistry>,
}

impl CaseRegistry {
    pub fn new(tools: Arc<ToolRegistry>) -> Self {
        Self {
            cases: HashMap::new(),
            tools,
        }
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    /// Register a case. Duplicate ids: last registered wins, with a warning.
    pub fn register(&mut self, case: Arc<dyn VulnCase>) {
        let id = case.metadata().id.clone();
        if self.cases.insert(id.clone(), case).is_some() {
            warn!("Duplicate case id {}; last loaded wins", id);
        } else {
            debug!("Registered case {}", id);
        }
    }

    /// Register every compiled-in case.
    pub fn register_builtin(&mut self) {
        for case in builtin_cases() {
            self.register(case);
        }
    }

    /// Load declarative plugin files from a directory tree.
    ///
    /// Files whose names start with `_` are skipped; a malformed file is
    /// logged and skipped without aborting the load. Returns the number of
    /// cases loaded.
    pub fn load_from_directory(&mut self, path: &Path) -> Result<usize, CaseError> {
        if !path.exists() {
            warn!("Plugin directory not found: {}", path.display());
            return Ok(0);
        }

        let mut loaded = 0;
        for entry in walkdir::WalkDir::new(path)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
        {
            let file_path = entry.path();
            let file_name = entry.file_name().to_string_lossy();
            if file_name.starts_with('_') {
                continue;
            }
            if file_path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }

            match load_probe_case(file_path) {
                Ok(case) => {
                    self.register(Arc::new(case));
                    loaded += 1;
                }
                Err(err) => {
                    warn!("Failed to load plugin {}: {}", file_path.display(), err);
                }
            }
        }

        debug!("Loaded {} vulnerability plugins from {}", loaded, path.display());
        Ok(loaded)
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn VulnCase>> {
        self.cases.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.cases.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    pub fn metadata(&self) -> Vec<&CaseMetadata> {
        self.cases.values().map(|case| case.metadata()).collect()
    }

    /// Case ids to run for a fingerprint set under a policy.
    ///
    /// Pure with respect to the loaded metadata: the answer depends only on
    /// the inputs and each case's metadata.
    pub fn matching(
        &self,
        fingerprints: &[Fingerprint],
        policy: ScanPolicy,
        specified_ids: Option<&[String]>,
    ) -> Vec<String> {
        if policy == ScanPolicy::Specified {
            return specified_ids
                .unwrap_or(&[])
                .iter()
                .filter(|id| self.cases.contains_key(id.as_str()))
                .cloned()
                .collect();
        }

        let mut matching: Vec<String> = self
            .cases
            .values()
            .filter(|case| case.metadata().matches(fingerprints, policy))
            .map(|case| case.metadata().id.clone())
            .collect();
        matching.sort();
        matching
    }
}

fn load_probe_case(path: &Path) -> Result<ProbeCase, CaseError> {
    let raw = std::fs::read_to_string(path)?;
    let def: ProbeCaseDef =
        serde_json::from_str(&raw).map_err(|err| CaseError::InvalidDefinition {
            path: path.display().to_string(),
            message: err.to_string(),
        })?;
    ProbeCase::from_def(def, &path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vulnscan_protocol::FingerprintCategory;

    fn registry_with_builtin() -> CaseRegistry {
        let mut registry = CaseRegistry::new(Arc::new(ToolRegistry::new()));
        registry.register_builtin();
        registry
    }

    fn meta_only_case(id: &str, severity: Severity) -> Arc<dyn VulnCase> {
        builtin_probe(
            id,
            id,
            severity,
            None,
            ProbeSpec {
                path: "/".to_string(),
                match_status: vec![200],
                body_regex: None,
                evidence: None,
                cleanup_path: None,
            },
        )
    }

    #[test]
    fn redline_keeps_only_critical_and_high() {
        let mut registry = CaseRegistry::new(Arc::new(ToolRegistry::new()));
        registry.register(meta_only_case("c1", Severity::Critical));
        registry.register(meta_only_case("h1", Severity::High));
        registry.register(meta_only_case("m1", Severity::Medium));
        registry.register(meta_only_case("l1", Severity::Low));

        let ids = registry.matching(&[], ScanPolicy::Redline, None);
        assert_eq!(ids, vec!["c1".to_string(), "h1".to_string()]);

        let all = registry.matching(&[], ScanPolicy::Full, None);
        assert_eq!(all.len(), 4);
        // smart behaves like full
        assert_eq!(registry.matching(&[], ScanPolicy::Smart, None), all);
    }

    #[test]
    fn specified_policy_intersects_registry() {
        let mut registry = CaseRegistry::new(Arc::new(ToolRegistry::new()));
        registry.register(meta_only_case("a", Severity::Medium));
        registry.register(meta_only_case("b", Severity::Medium));

        let wanted = vec!["b".to_string(), "ghost".to_string()];
        let ids = registry.matching(&[], ScanPolicy::Specified, Some(&wanted));
        assert_eq!(ids, vec!["b".to_string()]);

        // specified with no ids selects nothing
        assert!(registry
            .matching(&[], ScanPolicy::Specified, None)
            .is_empty());
    }

    #[test]
    fn fingerprint_predicate_gates_selection() {
        let registry = registry_with_builtin();

        // Without the manager tag the Tomcat case stays out.
        let ids = registry.matching(&[], ScanPolicy::Full, None);
        assert!(!ids.contains(&"VULN-TOMCAT-MANAGER".to_string()));
        assert!(ids.contains(&"VULN-GIT-CONFIG".to_string()));

        let tomcat = Fingerprint::new(FingerprintCategory::Server, "Tomcat")
            .with_tags(vec!["manager".to_string()]);
        let ids = registry.matching(std::slice::from_ref(&tomcat), ScanPolicy::Full, None);
        assert!(ids.contains(&"VULN-TOMCAT-MANAGER".to_string()));
    }

    #[test]
    fn duplicate_ids_last_loaded_wins() {
        let mut registry = CaseRegistry::new(Arc::new(ToolRegistry::new()));
        registry.register(meta_only_case("dup", Severity::Low));
        registry.register(meta_only_case("dup", Severity::Critical));
        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.get("dup").unwrap().metadata().severity,
            Severity::Critical
        );
    }

    #[test]
    fn loads_declarative_plugins_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("heartbleed-ish.json"),
            r#"{
                "id": "CVE-2024-9999",
                "name": "Example probe",
                "severity": "critical",
                "fingerprint": {"service": "nginx"},
                "probe": {"path": "/status", "match_status": [200], "body_regex": "build"}
            }"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("_disabled.json"), "{not json").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignore me").unwrap();
        std::fs::write(dir.path().join("broken.json"), "{definitely not json").unwrap();

        let mut registry = CaseRegistry::new(Arc::new(ToolRegistry::new()));
        let loaded = registry.load_from_directory(dir.path()).unwrap();
        assert_eq!(loaded, 1);
        assert!(registry.contains("CVE-2024-9999"));

        let meta = registry.get("CVE-2024-9999").unwrap();
        assert_eq!(meta.metadata().severity, Severity::Critical);

        // missing directory is not an error
        let mut registry = CaseRegistry::new(Arc::new(ToolRegistry::new()));
        assert_eq!(
            registry
                .load_from_directory(Path::new("/nonexistent/plugins"))
                .unwrap(),
            0
        );
    }

    #[test]
    fn tool_registry_downcasts_by_type() {
        let mut tools = ToolRegistry::new();
        tools.register("greeting", Arc::new("hello".to_string()));
        assert_eq!(
            tools.get::<String>("greeting").as_deref(),
            Some(&"hello".to_string())
        );
        assert!(tools.get::<u64>("greeting").is_none());
        assert!(tools.get::<String>("missing").is_none());
    }
}
