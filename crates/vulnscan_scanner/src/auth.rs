//! Auth manager: credential store and authenticated-session cache.
//!
//! Sessions are cached by `(login_point, base_url)` and reused until
//! invalidation or shutdown. Authentication failures degrade to an anonymous
//! session rather than erroring, so a bad credential never blocks a scan.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use vulnscan_protocol::types::Credential;

const SESSION_TIMEOUT_SECS: u64 = 30;
const DEFAULT_LOGIN_PATH: &str = "/login";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Live HTTP client state for one target: cookie jar, default headers, and an
/// optional bearer token.
pub struct Session {
    base_url: String,
    client: reqwest::Client,
    token: Option<String>,
}

impl Session {
    /// Session with no credentials attached.
    pub fn anonymous(base_url: &str) -> Result<Self, AuthError> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: build_client()?,
            token: None,
        })
    }

    fn authenticated(base_url: &str, client: reqwest::Client, token: Option<String>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            token,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.token.is_some()
    }

    fn url_for(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn apply_token(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Send a GET relative to the session's base URL.
    pub async fn get(&self, path: &str) -> Result<reqwest::Response, AuthError> {
        let request = self.apply_token(self.client.get(self.url_for(path)));
        Ok(request.send().await?)
    }

    /// Send a POST with a JSON body relative to the session's base URL.
    pub async fn post_json(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, AuthError> {
        let request = self.apply_token(self.client.post(self.url_for(path)).json(body));
        Ok(request.send().await?)
    }
}

fn build_client() -> Result<reqwest::Client, AuthError> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(SESSION_TIMEOUT_SECS))
        .danger_accept_invalid_certs(true)
        .cookie_store(true)
        .build()?)
}

#[derive(Default)]
struct AuthState {
    credentials: HashMap<String, Credential>,
    sessions: HashMap<(String, String), Arc<Session>>,
}

/// Owner of credentials and cached sessions. One mutex serializes cache
/// mutations, so two concurrent `get_session` calls with the same key get the
/// same session.
#[derive(Default)]
pub struct AuthManager {
    state: Mutex<AuthState>,
}

impl AuthManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a credential bundle for a login point.
    pub async fn set_credentials(&self, login_point: &str, credential: Credential) {
        let mut state = self.state.lock().await;
        state
            .credentials
            .insert(login_point.to_string(), credential);
        debug!("Credentials set for login point: {}", login_point);
    }

    /// Get or create a session for `(login_point, base_url)`.
    ///
    /// With credentials present, authenticates against the login URL; on any
    /// non-200 status or transport error the session falls back to anonymous.
    pub async fn get_session(
        &self,
        login_point: &str,
        base_url: &str,
        force_new: bool,
    ) -> Result<Arc<Session>, AuthError> {
        let mut state = self.state.lock().await;
        let cache_key = (login_point.to_string(), base_url.to_string());

        if !force_new {
            if let Some(session) = state.sessions.get(&cache_key) {
                return Ok(session.clone());
            }
        }

        let session = match state.credentials.get(login_point).cloned() {
            Some(credential) => Arc::new(authenticate(base_url, &credential).await?),
            None => Arc::new(Session::anonymous(base_url)?),
        };

        state.sessions.insert(cache_key, session.clone());
        Ok(session)
    }

    /// Evict the cached session for `(login_point, base_url)`.
    pub async fn invalidate_session(&self, login_point: &str, base_url: &str) {
        let mut state = self.state.lock().await;
        let cache_key = (login_point.to_string(), base_url.to_string());
        if state.sessions.remove(&cache_key).is_some() {
            debug!("Session invalidated for {}:{}", login_point, base_url);
        }
    }

    /// Drop every cached session.
    pub async fn close_all(&self) {
        let mut state = self.state.lock().await;
        let count = state.sessions.len();
        state.sessions.clear();
        debug!("Closed {} sessions", count);
    }

    pub async fn session_count(&self) -> usize {
        self.state.lock().await.sessions.len()
    }
}

/// Authenticate against `base_url + login_url` and build a session from the
/// response cookies and token. Failures degrade to anonymous.
async fn authenticate(base_url: &str, credential: &Credential) -> Result<Session, AuthError> {
    let client = build_client()?;
    let login_path = credential.login_url.as_deref().unwrap_or(DEFAULT_LOGIN_PATH);
    let url = format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        login_path.trim_start_matches('/')
    );
    let method = credential.method.as_deref().unwrap_or("POST");

    let request = if method.eq_ignore_ascii_case("GET") {
        client.get(&url).query(&[
            ("username", credential.username.as_str()),
            ("password", credential.password.as_str()),
        ])
    } else {
        client.post(&url).json(&serde_json::json!({
            "username": credential.username,
            "password": credential.password,
        }))
    };

    match request.send().await {
        Ok(response) if response.status() == StatusCode::OK => {
            // Cookies from the login response already live in the client's jar.
            let token = response
                .json::<serde_json::Value>()
                .await
                .ok()
                .and_then(|data| {
                    data.get("token")
                        .or_else(|| data.get("access_token"))
                        .and_then(|v| v.as_str())
                        .map(str::to_string)
                });
            info!("Authenticated successfully to {}", base_url);
            Ok(Session::authenticated(base_url, client, token))
        }
        Ok(response) => {
            warn!(
                "Authentication to {} failed with status {}",
                base_url,
                response.status()
            );
            Session::anonymous(base_url)
        }
        Err(err) => {
            warn!("Authentication error for {}: {}", base_url, err);
            Session::anonymous(base_url)
        }
    }
}
