//! Bidirectional pump and process lifecycle (§4.L), grounded on
//! `turbomcp-proxy::proxy::service`'s ownership of a frontend/backend pair
//! plus a shared cancellation token, narrowed from the teacher's N:M
//! tool-routing proxy down to the 1:1 stdio-to-remote pump this bridge
//! needs.

use mcp_remote_auth::{OAuthCoordinator, OAuthCoordinatorConfig, SystemBrowserOpener, Tokens};
use mcp_remote_core::{CancellationToken, Error, Result};
use mcp_remote_stdio::StdioFramer;
use mcp_remote_transport::{negotiate, CommittedTransport, TransportConfig, TransportMode};
use parking_lot::Mutex;
use secrecy::ExposeSecret;
use std::collections::HashMap;
use std::sync::Arc;

const CLIENT_NAME_SUFFIX: &str = " (via mcp-remote-go)";

pub struct ProxyConfig {
    pub remote_url: String,
    pub transport_mode: TransportMode,
    pub headers: HashMap<String, String>,
    pub callback_port_base: u16,
}

/// Owns the stdio framer and the committed transport for the lifetime of
/// one bridged session.
pub struct Proxy {
    remote_url: String,
    oauth: Arc<OAuthCoordinator>,
    tokens: Arc<Mutex<Option<Tokens>>>,
    transport: CommittedTransport,
    framer: StdioFramer,
}

impl Proxy {
    /// Runs `EnsureAuthorized`, negotiates a transport, and returns a
    /// `Proxy` ready to pump records. Opens no stdio beyond what
    /// `StdioFramer::new` binds.
    pub async fn connect(config: ProxyConfig, cancel: &CancellationToken) -> Result<Self> {
        let oauth = Arc::new(OAuthCoordinator::new(
            OAuthCoordinatorConfig {
                client_name: "mcp-remote-rs".to_string(),
                callback_port_base: config.callback_port_base,
            },
            Arc::new(SystemBrowserOpener),
        )?);

        let initial = oauth.ensure_authorized(&config.remote_url, cancel).await?;
        let tokens = Arc::new(Mutex::new(Some(initial)));

        let transport_config = TransportConfig {
            remote_url: config.remote_url.clone(),
            headers: config.headers,
            token_provider: token_provider(tokens.clone()),
        };
        let transport = negotiate(config.transport_mode, transport_config, cancel).await?;
        transport.connect_notifications(cancel.clone());

        Ok(Self {
            remote_url: config.remote_url,
            oauth,
            tokens,
            transport,
            framer: StdioFramer::new(),
        })
    }

    /// Pumps records until stdin closes, a fatal transport error occurs, or
    /// `cancel` fires. Returns `Ok(())` for every shutdown that isn't a
    /// fatal error, matching the proxy's "exit 0 on normal shutdown,
    /// non-zero if initiated by a fatal error" contract (the exit code
    /// itself is chosen by the caller in `main`).
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        let (outbound_tx, mut outbound_rx) = tokio::sync::mpsc::unbounded_channel::<serde_json::Value>();
        self.transport.set_on_message(Arc::new(move |value| {
            let _ = outbound_tx.send(value);
        }));
        self.transport.set_on_error(Arc::new(|e| {
            tracing::error!(error = %e, "transport reported an asynchronous error");
        }));

        let mut writer = self.framer.writer;
        let writer_cancel = cancel.clone();
        let writer_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = writer_cancel.cancelled() => break,
                    received = outbound_rx.recv() => {
                        match received {
                            Some(value) => {
                                if let Err(e) = writer.write_record(&value).await {
                                    tracing::error!(error = %e, "failed writing a record to stdout, shutting down");
                                    writer_cancel.cancel();
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
        });

        let result = self.read_loop(&cancel).await;

        cancel.cancel();
        self.transport.close().await;
        let _ = writer_task.await;

        result
    }

    async fn read_loop(&mut self, cancel: &CancellationToken) -> Result<()> {
        loop {
            let record = tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(()),
                record = self.framer.reader.next_record() => record?,
            };
            let Some(mut record) = record else {
                tracing::debug!("stdin closed, shutting down");
                return Ok(());
            };
            stamp_client_name(&mut record);
            self.send_with_reauth(&record, cancel).await?;
        }
    }

    /// Sends one record; on a 401 from the remote, discards cached tokens,
    /// re-runs `EnsureAuthorized`, and retries this exact record exactly
    /// once. Any other send failure is logged and the record dropped,
    /// unless it's a fatal transport error, which ends the session.
    async fn send_with_reauth(&self, record: &serde_json::Value, cancel: &CancellationToken) -> Result<()> {
        match self.transport.send(record, cancel).await {
            Ok(()) => Ok(()),
            Err(Error::Http { status: 401, .. }) => {
                tracing::info!("got 401 from remote, discarding tokens and re-authorizing");
                self.oauth.discard_tokens(&self.remote_url).await;
                let refreshed = self.oauth.ensure_authorized(&self.remote_url, cancel).await?;
                *self.tokens.lock() = Some(refreshed);
                match self.transport.send(record, cancel).await {
                    Ok(()) => Ok(()),
                    Err(e @ Error::Http { status: 401, .. }) => {
                        tracing::error!(error = %e, "second consecutive 401 after reauth, surfacing as fatal");
                        Err(e)
                    }
                    Err(e) if e.is_fatal_transport() => Err(e),
                    Err(e) => {
                        tracing::error!(error = %e, "retry after reauth failed, dropping record");
                        Ok(())
                    }
                }
            }
            Err(e) if e.is_fatal_transport() => Err(e),
            Err(e) => {
                tracing::error!(error = %e, "send failed, dropping record");
                Ok(())
            }
        }
    }
}

fn token_provider(tokens: Arc<Mutex<Option<Tokens>>>) -> mcp_remote_transport::TokenProvider {
    Arc::new(move || {
        tokens
            .lock()
            .as_ref()
            .map(|t| t.access_token.expose_secret().to_string())
    })
}

/// `initialize` records get their `clientInfo.name` suffixed so the remote
/// can tell bridged sessions apart from direct MCP clients; every other
/// record passes through untouched.
fn stamp_client_name(record: &mut serde_json::Value) {
    let is_initialize = record.get("method").and_then(|m| m.as_str()) == Some("initialize");
    if !is_initialize {
        return;
    }
    if let Some(name) = record
        .pointer_mut("/params/clientInfo/name")
        .and_then(|v| v.as_str().map(str::to_string))
    {
        if let Some(slot) = record.pointer_mut("/params/clientInfo/name") {
            *slot = serde_json::Value::String(format!("{name}{CLIENT_NAME_SUFFIX}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcp_remote_auth::{BrowserOpener, RemoteConfigStore, ServerMetadata};
    use mcp_remote_transport::StreamableHttpTransport;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct NeverOpened;

    impl BrowserOpener for NeverOpened {
        fn open(&self, _url: &str) -> Result<()> {
            panic!("discovery/registration is pre-seeded; this flow must not need a fresh authorization");
        }
    }

    fn now_unix() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    /// A remote that keeps returning 401 even after reauth must surface a
    /// fatal error instead of having the second 401 silently dropped.
    #[tokio::test]
    async fn second_consecutive_401_after_reauth_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("MCP_REMOTE_CONFIG_DIR", dir.path());

        let server = MockServer::start().await;
        let remote_url = format!("{}/mcp", server.uri());

        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "T2",
                "refresh_token": "R1",
                "expires_in": 3600,
                "token_type": "Bearer",
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let store = RemoteConfigStore::new(&remote_url);
        store
            .save_server_metadata(&ServerMetadata {
                issuer: server.uri(),
                authorization_endpoint: format!("{}/auth", server.uri()),
                token_endpoint: format!("{}/token", server.uri()),
                registration_endpoint: Some(format!("{}/register", server.uri())),
                jwks_uri: None,
                scopes_supported: vec![],
                response_types_supported: vec![],
                grant_types_supported: vec![],
            })
            .await
            .unwrap();
        store
            .save_tokens(&Tokens {
                access_token: secrecy::SecretString::new("T1".to_string()),
                token_type: "Bearer".to_string(),
                refresh_token: Some(secrecy::SecretString::new("R1".to_string())),
                expires_in: Some(3600),
                expires_at: Some(now_unix() + 3600),
                scope: None,
            })
            .await
            .unwrap();

        let oauth = Arc::new(
            OAuthCoordinator::new(
                OAuthCoordinatorConfig {
                    client_name: "mcp-remote-rs-test".to_string(),
                    callback_port_base: 19980,
                },
                Arc::new(NeverOpened),
            )
            .unwrap(),
        );

        let transport = StreamableHttpTransport::new(mcp_remote_transport::TransportConfig {
            remote_url: remote_url.clone(),
            headers: HashMap::new(),
            token_provider: Arc::new(|| None),
        })
        .unwrap();

        let proxy = Proxy {
            remote_url: remote_url.clone(),
            oauth,
            tokens: Arc::new(Mutex::new(None)),
            transport: mcp_remote_transport::CommittedTransport::Streamable(transport),
            framer: StdioFramer::new(),
        };

        let cancel = CancellationToken::new();
        let message = serde_json::json!({"jsonrpc":"2.0","id":1,"method":"tools/call"});
        let err = proxy.send_with_reauth(&message, &cancel).await.unwrap_err();
        assert!(
            matches!(err, Error::Http { status: 401, .. }),
            "expected the second 401 to surface as a fatal error, got {err:?}"
        );
    }

    #[test]
    fn stamps_client_info_name_on_initialize() {
        let mut record = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "initialize",
            "params": { "clientInfo": { "name": "my-client" } }
        });
        stamp_client_name(&mut record);
        assert_eq!(
            record["params"]["clientInfo"]["name"],
            "my-client (via mcp-remote-go)"
        );
    }

    #[test]
    fn leaves_non_initialize_records_untouched() {
        let mut record = serde_json::json!({"jsonrpc": "2.0", "method": "tools/call"});
        let before = record.clone();
        stamp_client_name(&mut record);
        assert_eq!(record, before);
    }

    #[test]
    fn leaves_initialize_without_client_info_untouched() {
        let mut record = serde_json::json!({"jsonrpc": "2.0", "method": "initialize", "params": {}});
        let before = record.clone();
        stamp_client_name(&mut record);
        assert_eq!(record, before);
    }
}
