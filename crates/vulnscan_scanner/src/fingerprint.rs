//! Fingerprint engine: pattern-driven web/service identification.
//!
//! Fetches the target's base URL once and evaluates every known definition
//! against the response. Patterns within a definition are OR-ed: the first
//! satisfied pattern matches the definition. Results are cached per base URL
//! until `clear_cache`. Fetch failures produce an empty result set, never an
//! error.

use std::collections::HashMap;
use std::sync::{Mutex as StdMutex, RwLock};
use std::time::Duration;

use regex::RegexBuilder;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use vulnscan_protocol::defaults::FINGERPRINT_TIMEOUT_SECS;
use vulnscan_protocol::{Fingerprint, FingerprintCategory};

#[derive(Debug, Error)]
pub enum FingerprintError {
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Expected status set for a path probe: a single status or a list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StatusSpec {
    One(u16),
    Many(Vec<u16>),
}

impl StatusSpec {
    fn contains(&self, status: u16) -> bool {
        match self {
            StatusSpec::One(expected) => *expected == status,
            StatusSpec::Many(expected) => expected.contains(&status),
        }
    }
}

impl Default for StatusSpec {
    fn default() -> Self {
        StatusSpec::One(200)
    }
}

fn default_header_regex() -> String {
    ".*".to_string()
}

/// One match rule inside a fingerprint definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PatternRule {
    /// Regex over a named response header, case-insensitive. A capturing
    /// group becomes the version.
    Header {
        header: String,
        #[serde(default = "default_header_regex")]
        regex: String,
    },
    /// Secondary GET of `base + path`; matches when the status is expected.
    Path {
        path: String,
        #[serde(default)]
        status: StatusSpec,
    },
    /// Regex over the response body, case-insensitive.
    Body { body: String },
    /// Regex over the semicolon-joined `name=value` response cookies.
    Cookie { cookie: String },
}

/// A fingerprint definition: built-in or plugin-registered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FingerprintDef {
    pub name: String,
    #[serde(rename = "type")]
    pub category: FingerprintCategory,
    pub patterns: Vec<PatternRule>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Derive the base URL for a target: https on 443, http otherwise, default
/// ports omitted.
pub fn derive_base_url(target: &str, port: Option<u16>) -> String {
    let scheme = if port == Some(443) { "https" } else { "http" };
    match port {
        Some(p) if p != 80 && p != 443 => format!("{scheme}://{target}:{p}"),
        _ => format!("{scheme}://{target}"),
    }
}

struct Evidence {
    headers: HeaderMap,
    cookie_str: String,
    body: String,
}

/// Engine for fingerprint identification. Safe for concurrent use.
pub struct FingerprintEngine {
    client: reqwest::Client,
    definitions: RwLock<Vec<FingerprintDef>>,
    cache: StdMutex<HashMap<String, Vec<Fingerprint>>>,
}

impl FingerprintEngine {
    pub fn new() -> Result<Self, FingerprintError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(FINGERPRINT_TIMEOUT_SECS))
            .danger_accept_invalid_certs(true)
            .redirect(reqwest::redirect::Policy::limited(10))
            .cookie_store(true)
            .build()?;

        Ok(Self {
            client,
            definitions: RwLock::new(builtin_definitions()),
            cache: StdMutex::new(HashMap::new()),
        })
    }

    /// Register one plugin-supplied definition.
    pub fn add_definition(&self, def: FingerprintDef) {
        self.definitions
            .write()
            .expect("fingerprint definitions lock poisoned")
            .push(def);
    }

    /// Register several plugin-supplied definitions.
    pub fn load_definitions(&self, defs: Vec<FingerprintDef>) {
        self.definitions
            .write()
            .expect("fingerprint definitions lock poisoned")
            .extend(defs);
    }

    pub fn definition_count(&self) -> usize {
        self.definitions
            .read()
            .expect("fingerprint definitions lock poisoned")
            .len()
    }

    /// Identify fingerprints for a target, consulting the per-URL cache.
    pub async fn identify(&self, target: &str, port: Option<u16>) -> Vec<Fingerprint> {
        let url = derive_base_url(target, port);

        if let Some(cached) = self.cached(&url) {
            return cached;
        }

        let fingerprints = self.identify_url(&url).await;

        self.cache
            .lock()
            .expect("fingerprint cache lock poisoned")
            .insert(url, fingerprints.clone());
        fingerprints
    }

    /// Cached result for a base URL, if any.
    pub fn cached(&self, base_url: &str) -> Option<Vec<Fingerprint>> {
        self.cache
            .lock()
            .expect("fingerprint cache lock poisoned")
            .get(base_url)
            .cloned()
    }

    pub fn clear_cache(&self) {
        self.cache
            .lock()
            .expect("fingerprint cache lock poisoned")
            .clear();
    }

    async fn identify_url(&self, base_url: &str) -> Vec<Fingerprint> {
        let response = match self.client.get(base_url).send().await {
            Ok(response) => response,
            Err(err) => {
                debug!("Fingerprint fetch failed for {}: {}", base_url, err);
                return Vec::new();
            }
        };

        let headers = response.headers().clone();
        let cookie_str = response
            .cookies()
            .map(|c| format!("{}={}", c.name(), c.value()))
            .collect::<Vec<_>>()
            .join("; ");
        let body = response.text().await.unwrap_or_default();

        let evidence = Evidence {
            headers,
            cookie_str,
            body,
        };

        let defs: Vec<FingerprintDef> = self
            .definitions
            .read()
            .expect("fingerprint definitions lock poisoned")
            .clone();

        let mut fingerprints = Vec::new();
        for def in &defs {
            if let Some(version) = self.match_definition(def, &evidence, base_url).await {
                fingerprints.push(
                    Fingerprint::new(def.category, def.name.clone())
                        .with_version(version)
                        .with_tags(def.tags.clone()),
                );
            }
        }
        fingerprints
    }

    /// First satisfied pattern wins. `Some(version)` on match.
    async fn match_definition(
        &self,
        def: &FingerprintDef,
        evidence: &Evidence,
        base_url: &str,
    ) -> Option<Option<String>> {
        for pattern in &def.patterns {
            match pattern {
                PatternRule::Header { header, regex } => {
                    let value = evidence
                        .headers
                        .get_all(header.as_str())
                        .iter()
                        .filter_map(|v| v.to_str().ok())
                        .collect::<Vec<_>>()
                        .join("; ");
                    if let Some(re) = compile(regex) {
                        if let Some(captures) = re.captures(&value) {
                            let version = captures
                                .get(1)
                                .map(|m| m.as_str().to_string())
                                .filter(|v| !v.is_empty());
                            return Some(version);
                        }
                    }
                }
                PatternRule::Body { body } => {
                    if let Some(re) = compile(body) {
                        if re.is_match(&evidence.body) {
                            return Some(None);
                        }
                    }
                }
                PatternRule::Cookie { cookie } => {
                    if let Some(re) = compile(cookie) {
                        if re.is_match(&evidence.cookie_str) {
                            return Some(None);
                        }
                    }
                }
                PatternRule::Path { path, status } => {
                    let url = format!("{base_url}{path}");
                    match self.client.get(&url).send().await {
                        Ok(response) if status.contains(response.status().as_u16()) => {
                            return Some(None);
                        }
                        Ok(_) => {}
                        Err(err) => {
                            debug!("Path probe failed for {}: {}", url, err);
                        }
                    }
                }
            }
        }
        None
    }
}

fn compile(pattern: &str) -> Option<regex::Regex> {
    match RegexBuilder::new(pattern).case_insensitive(true).build() {
        Ok(re) => Some(re),
        Err(err) => {
            debug!("Invalid fingerprint regex '{}': {}", pattern, err);
            None
        }
    }
}

/// Built-in fingerprint catalog.
pub fn builtin_definitions() -> Vec<FingerprintDef> {
    use FingerprintCategory as Cat;

    let header = |header: &str, regex: &str| PatternRule::Header {
        header: header.to_string(),
        regex: regex.to_string(),
    };
    let body = |regex: &str| PatternRule::Body {
        body: regex.to_string(),
    };
    let cookie = |regex: &str| PatternRule::Cookie {
        cookie: regex.to_string(),
    };
    let path = |path: &str, status: StatusSpec| PatternRule::Path {
        path: path.to_string(),
        status,
    };
    let def = |name: &str, category: Cat, patterns: Vec<PatternRule>| FingerprintDef {
        name: name.to_string(),
        category,
        patterns,
        tags: Vec::new(),
    };

    vec![
        // Web servers
        def("nginx", Cat::Webserver, vec![header("Server", r"nginx[/\s]*([\d.]+)?")]),
        def("Apache", Cat::Webserver, vec![header("Server", r"Apache[/\s]*([\d.]+)?")]),
        def("IIS", Cat::Webserver, vec![header("Server", r"Microsoft-IIS[/\s]*([\d.]+)?")]),
        // Frameworks
        def(
            "Django",
            Cat::Framework,
            vec![header("Set-Cookie", r"csrftoken"), body(r"csrfmiddlewaretoken")],
        ),
        def("Flask", Cat::Framework, vec![cookie(r"session=.*\.")]),
        def("Spring", Cat::Framework, vec![header("Set-Cookie", r"JSESSIONID")]),
        // Applications
        def(
            "WordPress",
            Cat::Cms,
            vec![
                body(r"wp-content"),
                body(r"WordPress"),
                path("/wp-login.php", StatusSpec::One(200)),
            ],
        ),
        FingerprintDef {
            name: "Tomcat".to_string(),
            category: Cat::Server,
            patterns: vec![
                body(r"Apache Tomcat"),
                path("/manager/html", StatusSpec::Many(vec![200, 401])),
            ],
            tags: vec!["manager".to_string()],
        },
        def(
            "phpMyAdmin",
            Cat::Database,
            vec![body(r"phpMyAdmin"), path("/phpmyadmin/", StatusSpec::One(200))],
        ),
        def("Jenkins", Cat::Ci, vec![header("X-Jenkins", r"([\d.]+)")]),
        def("GitLab", Cat::Vcs, vec![body(r"GitLab")]),
    ]
}
