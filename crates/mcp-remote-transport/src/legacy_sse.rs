//! Legacy SSE transport, MCP 2024-11-05 (§4.I): a long-lived GET event
//! stream that announces a separate POST command endpoint via an `endpoint`
//! event, grounded on the same SSE-loop machinery as the Streamable HTTP
//! transport but restructured around that two-endpoint split.

use crate::{ErrorHandler, MessageHandler, TransportConfig};
use futures::StreamExt;
use mcp_remote_core::{CancellationToken, Error, Result};
use mcp_remote_net::sse::SseReader;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::io::StreamReader;
use url::Url;

/// MCP 2024-11-05 wire transport. `command_endpoint` starts empty and is
/// filled in once the `endpoint` event arrives on the SSE stream; `send`
/// fails with `NotConnected` until then.
#[derive(Clone)]
pub struct LegacySseTransport {
    config: TransportConfig,
    client: reqwest::Client,
    command_endpoint: Arc<Mutex<Option<String>>>,
    endpoint_received: Arc<tokio::sync::Notify>,
    on_message: Arc<Mutex<Option<MessageHandler>>>,
    on_error: Arc<Mutex<Option<ErrorHandler>>>,
    stream_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl LegacySseTransport {
    pub fn new(config: TransportConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;
        Ok(Self {
            config,
            client,
            command_endpoint: Arc::new(Mutex::new(None)),
            endpoint_received: Arc::new(tokio::sync::Notify::new()),
            on_message: Arc::new(Mutex::new(None)),
            on_error: Arc::new(Mutex::new(None)),
            stream_task: Arc::new(Mutex::new(None)),
        })
    }

    pub fn set_on_message(&self, handler: MessageHandler) {
        *self.on_message.lock() = Some(handler);
    }

    pub fn set_on_error(&self, handler: ErrorHandler) {
        *self.on_error.lock() = Some(handler);
    }

    /// Legacy SSE carries no session concept.
    pub fn session_id(&self) -> Option<String> {
        None
    }

    fn headers(&self, accept: &str) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            reqwest::header::ACCEPT,
            HeaderValue::from_str(accept).map_err(|e| Error::Config(e.to_string()))?,
        );
        if let Some(token) = (self.config.token_provider)() {
            if let Ok(v) = HeaderValue::from_str(&format!("Bearer {token}")) {
                headers.insert(reqwest::header::AUTHORIZATION, v);
            }
        }
        for (k, v) in &self.config.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(k.as_bytes()),
                HeaderValue::from_str(v),
            ) {
                headers.insert(name, value);
            }
        }
        Ok(headers)
    }

    /// Opens the long-lived `GET` event stream. Returns once the stream is
    /// established and the reader is running in the background; callers
    /// that need the `endpoint` event to have arrived should await
    /// `wait_for_endpoint`.
    pub async fn connect(&self, cancel: CancellationToken) -> Result<()> {
        let mut headers = self.headers("text/event-stream")?;
        headers.insert(
            reqwest::header::CACHE_CONTROL,
            HeaderValue::from_static("no-cache"),
        );

        let response = self
            .client
            .get(&self.config.remote_url)
            .headers(headers)
            .send()
            .await
            .map_err(|e| Error::Config(e.to_string()))?;

        let status = response.status();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if !status.is_success() || !content_type.contains("text/event-stream") {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Http {
                status: status.as_u16(),
                body,
            });
        }

        let base = Url::parse(&self.config.remote_url).map_err(|e| Error::Config(e.to_string()))?;
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let stream = response
                .bytes_stream()
                .map(|r| r.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)));
            let body_reader = StreamReader::new(stream);
            let mut reader = SseReader::new(body_reader, cancel.clone());
            while let Some(event) = reader.next_event().await {
                this.handle_event(&base, event);
            }
        });
        *self.stream_task.lock() = Some(handle);
        Ok(())
    }

    fn handle_event(&self, base: &Url, event: mcp_remote_net::sse::SseEvent) {
        match event.event.as_deref() {
            Some("endpoint") => {
                match resolve_endpoint(base, &event.data) {
                    Ok(resolved) => {
                        *self.command_endpoint.lock() = Some(resolved);
                        self.endpoint_received.notify_waiters();
                    }
                    Err(e) => {
                        if let Some(handler) = self.on_error.lock().as_ref() {
                            handler(e);
                        }
                    }
                }
            }
            Some("message") | None => match serde_json::from_str::<serde_json::Value>(&event.data) {
                Ok(value) => {
                    if let Some(handler) = self.on_message.lock().as_ref() {
                        handler(value);
                    }
                }
                Err(e) => tracing::warn!(error = %e, "dropping unparseable legacy SSE message"),
            },
            Some(other) => tracing::debug!(event = other, "ignoring unrecognized SSE event type"),
        }
    }

    /// Waits until the `endpoint` event has been received, or returns
    /// immediately if it already has.
    pub async fn wait_for_endpoint(&self) {
        if self.command_endpoint.lock().is_some() {
            return;
        }
        self.endpoint_received.notified().await;
    }

    pub async fn send(&self, message: &serde_json::Value, cancel: &CancellationToken) -> Result<()> {
        let Some(endpoint) = self.command_endpoint.lock().clone() else {
            return Err(Error::NotConnected);
        };
        let mut headers = self.headers("application/json")?;
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );

        let send = self.client.post(&endpoint).headers(headers).json(message).send();
        let response = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Error::Cancelled),
            r = send => r.map_err(|e| Error::Config(e.to_string()))?,
        };

        let status = response.status();
        if status == reqwest::StatusCode::OK || status == reqwest::StatusCode::ACCEPTED {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(Error::Http {
                status: status.as_u16(),
                body,
            })
        }
    }

    pub async fn close(&self) {
        if let Some(handle) = self.stream_task.lock().take() {
            handle.abort();
        }
    }
}

/// Resolves the `endpoint` event's `data` against the SSE stream's own URL:
/// absolute URIs pass through, root-relative paths resolve against
/// scheme+host, anything else resolves as a relative reference.
fn resolve_endpoint(base: &Url, data: &str) -> Result<String> {
    let trimmed = data.trim();
    if let Ok(absolute) = Url::parse(trimmed) {
        return Ok(absolute.to_string());
    }
    base.join(trimmed)
        .map(|u| u.to_string())
        .map_err(|e| Error::Config(format!("invalid endpoint event data {trimmed:?}: {e}")))
}
