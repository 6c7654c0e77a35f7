//! OAuth 2.1 + PKCE + dynamic client registration coordinator (§4.F),
//! including the loopback callback HTTP server shared with the
//! inter-process coordination protocol in [`crate::coordinate`].

use crate::discovery::DiscoveryClient;
use crate::model::{ClientInfo, ServerMetadata, Tokens};
use crate::store::RemoteConfigStore;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use axum::Router;
use base64::Engine;
use mcp_remote_core::{CancellationToken, Error, Result};
use mcp_remote_net::http::{HttpClient, HttpClientConfig};
use parking_lot::Mutex as SyncMutex;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;

const PKCE_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-._~";

pub fn generate_pkce_verifier() -> String {
    let mut bytes = [0u8; 64];
    rand::rng().fill_bytes(&mut bytes);
    bytes
        .iter()
        .map(|b| PKCE_CHARS[(*b as usize) % PKCE_CHARS.len()] as char)
        .collect()
}

pub fn pkce_challenge(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest)
}

/// Launches the user's default browser. Implementations MUST reject any
/// non-http(s) URL before invoking it; the coordinator always also logs the
/// URL so manual authorization stays possible when this fails.
pub trait BrowserOpener: Send + Sync {
    fn open(&self, url: &str) -> Result<()>;
}

pub struct SystemBrowserOpener;

impl BrowserOpener for SystemBrowserOpener {
    fn open(&self, url: &str) -> Result<()> {
        let parsed = url::Url::parse(url).map_err(|e| Error::Config(e.to_string()))?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(Error::Config("refusing to open a non-http(s) URL".into()));
        }
        let status = open_command(url).status()?;
        if status.success() {
            Ok(())
        } else {
            Err(Error::Config(format!("browser opener exited with {status}")))
        }
    }
}

#[cfg(target_os = "macos")]
fn open_command(url: &str) -> std::process::Command {
    let mut cmd = std::process::Command::new("open");
    cmd.arg(url);
    cmd
}

#[cfg(target_os = "linux")]
fn open_command(url: &str) -> std::process::Command {
    let mut cmd = std::process::Command::new("xdg-open");
    cmd.arg(url);
    cmd
}

#[cfg(target_os = "windows")]
fn open_command(url: &str) -> std::process::Command {
    let mut cmd = std::process::Command::new("cmd");
    cmd.args(["/C", "start", "", url]);
    cmd
}

#[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
fn open_command(_url: &str) -> std::process::Command {
    std::process::Command::new("true")
}

struct CallbackShared {
    pending: SyncMutex<Option<mpsc::UnboundedSender<String>>>,
    completed: AtomicBool,
    notify: Notify,
}

/// The loopback HTTP server exposing `GET /callback` and
/// `GET /wait-for-auth`. Bound once per owned authorization attempt; probes
/// `[base_port, base_port+99]` for the first free port.
pub struct CallbackServer {
    port: u16,
    shared: Arc<CallbackShared>,
    shutdown: Option<oneshot::Sender<()>>,
    _task: JoinHandle<()>,
}

impl CallbackServer {
    pub async fn bind(base_port: u16) -> Result<Self> {
        for candidate in base_port..=base_port.saturating_add(99) {
            let Ok(listener) = TcpListener::bind(("127.0.0.1", candidate)).await else {
                continue;
            };
            let shared = Arc::new(CallbackShared {
                pending: SyncMutex::new(None),
                completed: AtomicBool::new(false),
                notify: Notify::new(),
            });
            let app = router(shared.clone());
            let (shutdown_tx, shutdown_rx) = oneshot::channel();
            let task = tokio::spawn(async move {
                let _ = axum::serve(listener, app)
                    .with_graceful_shutdown(async {
                        let _ = shutdown_rx.await;
                    })
                    .await;
            });
            return Ok(Self {
                port: candidate,
                shared,
                shutdown: Some(shutdown_tx),
                _task: task,
            });
        }
        Err(Error::Config(format!(
            "no bindable loopback port found in [{base_port}, {})",
            base_port as u32 + 100
        )))
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Arms the server for one authorization attempt and returns the
    /// channel the `/callback` handler will deliver the code on.
    pub fn begin_attempt(&self) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.shared.pending.lock() = Some(tx);
        self.shared.completed.store(false, Ordering::SeqCst);
        rx
    }

    /// Waits for `/callback` to deliver a code, bounded by `timeout` and by
    /// `cancel`.
    pub async fn wait_for_code(
        &self,
        mut rx: mpsc::UnboundedReceiver<String>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<String> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::Cancelled),
            code = rx.recv() => code.ok_or(Error::AuthTimeout),
            () = tokio::time::sleep(timeout) => Err(Error::AuthTimeout),
        }
    }

    /// Marks the attempt complete so in-process `/wait-for-auth` calls
    /// resolve to 200 and any long-pollers are woken.
    pub fn mark_completed(&self) {
        self.shared.completed.store(true, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
    }
}

impl Drop for CallbackServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

#[derive(Deserialize)]
struct CallbackQuery {
    code: Option<String>,
}

async fn callback_handler(
    State(shared): State<Arc<CallbackShared>>,
    Query(q): Query<CallbackQuery>,
) -> impl IntoResponse {
    let Some(code) = q.code else {
        return (StatusCode::BAD_REQUEST, "missing code").into_response();
    };
    let sender = shared.pending.lock().take();
    match sender {
        Some(tx) => {
            let _ = tx.send(code);
            (
                StatusCode::OK,
                Html("<html><body>Authorization complete. You may close this tab.</body></html>"),
            )
                .into_response()
        }
        None => (StatusCode::BAD_REQUEST, "no authorization flow in progress").into_response(),
    }
}

#[derive(Deserialize)]
struct WaitQuery {
    poll: Option<String>,
}

async fn wait_for_auth_handler(
    State(shared): State<Arc<CallbackShared>>,
    Query(q): Query<WaitQuery>,
) -> StatusCode {
    if shared.completed.load(Ordering::SeqCst) {
        return StatusCode::OK;
    }
    if q.poll.as_deref() == Some("false") {
        return StatusCode::ACCEPTED;
    }
    let notified = shared.notify.notified();
    tokio::select! {
        () = notified => {}
        () = tokio::time::sleep(Duration::from_secs(30)) => {}
    }
    if shared.completed.load(Ordering::SeqCst) {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    }
}

fn router(shared: Arc<CallbackShared>) -> Router {
    Router::new()
        .route("/callback", get(callback_handler))
        .route("/wait-for-auth", get(wait_for_auth_handler))
        .with_state(shared)
}

#[derive(Serialize)]
struct RegistrationRequest {
    client_name: String,
    redirect_uris: Vec<String>,
    token_endpoint_auth_method: String,
    grant_types: Vec<String>,
    response_types: Vec<String>,
    scope: String,
}

#[derive(Deserialize)]
struct RegistrationResponse {
    client_id: String,
    #[serde(default)]
    client_secret: Option<String>,
    #[serde(default)]
    client_id_issued_at: Option<u64>,
    #[serde(default)]
    client_secret_expires_at: Option<u64>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    token_type: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    scope: Option<String>,
}

impl TokenResponse {
    fn into_tokens(self, now_unix_secs: u64) -> Tokens {
        // The source computes expires_in as token.Expiry - now, which can be
        // negative under a refresh race; clamp to zero before persisting.
        let expires_in = self.expires_in.map(|v| v.max(0) as u64);
        Tokens {
            access_token: SecretString::new(self.access_token),
            token_type: self.token_type,
            refresh_token: self.refresh_token.map(SecretString::new),
            expires_in,
            expires_at: expires_in.map(|e| now_unix_secs + e),
            scope: self.scope,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OAuthCoordinatorConfig {
    pub client_name: String,
    pub callback_port_base: u16,
}

impl Default for OAuthCoordinatorConfig {
    fn default() -> Self {
        Self {
            client_name: "MCP CLI Client".to_string(),
            callback_port_base: 3334,
        }
    }
}

pub struct OAuthCoordinator {
    http: HttpClient,
    discovery: DiscoveryClient,
    config: OAuthCoordinatorConfig,
    browser_opener: Arc<dyn BrowserOpener>,
    serialize: tokio::sync::Mutex<()>,
}

impl OAuthCoordinator {
    pub fn new(config: OAuthCoordinatorConfig, browser_opener: Arc<dyn BrowserOpener>) -> Result<Self> {
        Ok(Self {
            http: HttpClient::new(HttpClientConfig::default())
                .map_err(|e| Error::Config(e.to_string()))?,
            discovery: DiscoveryClient::new()?,
            config,
            browser_opener,
            serialize: tokio::sync::Mutex::new(()),
        })
    }

    pub fn config(&self) -> &OAuthCoordinatorConfig {
        &self.config
    }

    pub fn http(&self) -> &HttpClient {
        &self.http
    }

    pub fn discovery(&self) -> &DiscoveryClient {
        &self.discovery
    }

    /// The master operation used by the proxy. Returns unexpired tokens
    /// from disk, refreshes, or runs the full interactive flow in turn.
    pub async fn ensure_authorized(&self, remote_url: &str, cancel: &CancellationToken) -> Result<Tokens> {
        let _guard = self.serialize.lock().await;
        let store = RemoteConfigStore::new(remote_url);

        if let Some(tokens) = store.load_tokens().await? {
            if !tokens.is_expired(now_unix()) {
                return Ok(tokens);
            }
            if let Some(refresh_token) = tokens.refresh_token.clone() {
                if let Some(metadata) = store.load_server_metadata().await? {
                    match self
                        .refresh(&store, &metadata, refresh_token.expose_secret(), cancel)
                        .await
                    {
                        Ok(refreshed) => return Ok(refreshed),
                        Err(e) => {
                            tracing::warn!(error = %e, "refresh_token grant failed, falling back to full authorization");
                        }
                    }
                }
            }
        }

        let discovered = self.discovery.discover(remote_url, cancel).await?;
        if discovered.is_fallback() {
            tracing::debug!("discovery fell back to synthesized endpoints, not caching server_metadata.json");
        } else if let Err(e) = store.save_server_metadata(&discovered.metadata).await {
            tracing::warn!(error = %e, "failed to cache server_metadata.json");
        }
        let metadata = discovered.metadata;

        let coordination = crate::coordinate::AuthCoordination::new(
            store.clone(),
            self.http.clone(),
            self.config.callback_port_base,
        );

        match coordination.begin(cancel).await? {
            crate::coordinate::Outcome::Follower(follower) => follower.wait_for_tokens(cancel).await,
            crate::coordinate::Outcome::Owner(owner) => {
                self.run_owner_flow(&store, &metadata, owner, cancel).await
            }
        }
    }

    async fn run_owner_flow(
        &self,
        store: &RemoteConfigStore,
        metadata: &ServerMetadata,
        owner: crate::coordinate::Owner,
        cancel: &CancellationToken,
    ) -> Result<Tokens> {
        let client_info = match store.load_client_info().await? {
            Some(info) => info,
            None => self.register_client(store, metadata, owner.port(), cancel).await?,
        };

        let verifier = generate_pkce_verifier();
        let challenge = pkce_challenge(&verifier);
        store.save_code_verifier(&verifier).await?;

        let state = uuid::Uuid::new_v4().to_string();
        let redirect_uri = format!("http://localhost:{}/callback", owner.port());
        let auth_url = build_authorization_url(metadata, &client_info, &redirect_uri, &challenge, &state)?;

        tracing::info!(url = %auth_url, "open this URL in a browser to authorize");
        if let Err(e) = self.browser_opener.open(&auth_url) {
            tracing::warn!(error = %e, "could not launch a browser automatically");
        }

        let rx = owner.begin_attempt();
        let code = owner.wait_for_code(rx, Duration::from_secs(300), cancel).await?;

        let tokens = self
            .exchange_code(store, metadata, &client_info, &code, &verifier, &redirect_uri, cancel)
            .await?;

        owner.mark_completed();
        store.delete_code_verifier().await;
        Ok(tokens)
    }

    async fn register_client(
        &self,
        store: &RemoteConfigStore,
        metadata: &ServerMetadata,
        port: u16,
        cancel: &CancellationToken,
    ) -> Result<ClientInfo> {
        let Some(endpoint) = metadata.registration_endpoint.clone() else {
            return Err(Error::RegistrationUnsupported);
        };
        let redirect_uri = format!("http://localhost:{port}/callback");
        let request = RegistrationRequest {
            client_name: self.config.client_name.clone(),
            redirect_uris: vec![redirect_uri.clone()],
            token_endpoint_auth_method: "none".to_string(),
            grant_types: vec!["authorization_code".to_string(), "refresh_token".to_string()],
            response_types: vec!["code".to_string()],
            scope: "mcp offline_access".to_string(),
        };
        let resp = self
            .http
            .post_json(&endpoint, &request, &HashMap::new(), cancel)
            .await
            .map_err(|e| Error::Config(e.to_string()))?;
        if !resp.is_success() {
            return Err(Error::Http {
                status: resp.status,
                body: resp.text(),
            });
        }
        let registered: RegistrationResponse = resp.json().map_err(|e| Error::OAuthParse(e.to_string()))?;
        let info = ClientInfo {
            client_id: registered.client_id,
            client_secret: registered.client_secret.map(SecretString::new),
            client_id_issued_at: registered.client_id_issued_at,
            client_secret_expires_at: registered.client_secret_expires_at,
            redirect_uris: vec![redirect_uri],
            token_endpoint_auth_method: "none".to_string(),
        };
        store.save_client_info(&info).await?;
        Ok(info)
    }

    async fn exchange_code(
        &self,
        store: &RemoteConfigStore,
        metadata: &ServerMetadata,
        client: &ClientInfo,
        code: &str,
        verifier: &str,
        redirect_uri: &str,
        cancel: &CancellationToken,
    ) -> Result<Tokens> {
        let mut form = HashMap::new();
        form.insert("grant_type", "authorization_code");
        form.insert("code", code);
        form.insert("redirect_uri", redirect_uri);
        form.insert("client_id", client.client_id.as_str());
        form.insert("code_verifier", verifier);

        let resp = self
            .http
            .post_form(&metadata.token_endpoint, &form, &HashMap::new(), cancel)
            .await
            .map_err(|e| Error::Config(e.to_string()))?;
        if !resp.is_success() {
            return Err(Error::Http {
                status: resp.status,
                body: resp.text(),
            });
        }
        let token_resp: TokenResponse = resp.json().map_err(|e| Error::OAuthParse(e.to_string()))?;
        let tokens = token_resp.into_tokens(now_unix());
        store.save_tokens(&tokens).await?;
        Ok(tokens)
    }

    async fn refresh(
        &self,
        store: &RemoteConfigStore,
        metadata: &ServerMetadata,
        refresh_token: &str,
        cancel: &CancellationToken,
    ) -> Result<Tokens> {
        let mut form = HashMap::new();
        form.insert("grant_type", "refresh_token");
        form.insert("refresh_token", refresh_token);

        let resp = self
            .http
            .post_form(&metadata.token_endpoint, &form, &HashMap::new(), cancel)
            .await
            .map_err(|e| Error::Config(e.to_string()))?;
        if !resp.is_success() {
            return Err(Error::Http {
                status: resp.status,
                body: resp.text(),
            });
        }
        let token_resp: TokenResponse = resp.json().map_err(|e| Error::OAuthParse(e.to_string()))?;
        let mut tokens = token_resp.into_tokens(now_unix());
        if tokens.refresh_token.is_none() {
            tokens.refresh_token = Some(SecretString::new(refresh_token.to_string()));
        }
        store.save_tokens(&tokens).await?;
        Ok(tokens)
    }

    /// Forces the next `ensure_authorized` call to obtain a new access
    /// token. If a refresh token is on hand this only marks the cached
    /// tokens expired, so `ensure_authorized` silently refreshes instead of
    /// falling all the way back to an interactive re-authorization; only a
    /// remote with no refresh token loses its cached tokens outright. Used
    /// by the proxy's single-retry 401 handling.
    pub async fn discard_tokens(&self, remote_url: &str) {
        let store = RemoteConfigStore::new(remote_url);
        if let Ok(Some(mut tokens)) = store.load_tokens().await {
            if tokens.refresh_token.is_some() {
                tokens.expires_at = Some(0);
                if store.save_tokens(&tokens).await.is_ok() {
                    return;
                }
            }
        }
        store.delete_tokens().await;
    }
}

fn build_authorization_url(
    metadata: &ServerMetadata,
    client: &ClientInfo,
    redirect_uri: &str,
    challenge: &str,
    state: &str,
) -> Result<String> {
    let mut url = url::Url::parse(&metadata.authorization_endpoint).map_err(|e| Error::Config(e.to_string()))?;
    url.query_pairs_mut()
        .append_pair("response_type", "code")
        .append_pair("client_id", &client.client_id)
        .append_pair("redirect_uri", redirect_uri)
        .append_pair("scope", "mcp offline_access")
        .append_pair("code_challenge", challenge)
        .append_pair("code_challenge_method", "S256")
        .append_pair("state", state);
    Ok(url.to_string())
}

fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
