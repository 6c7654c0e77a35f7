//! Streamable HTTP transport, MCP 2025-11-25 (§4.H). A single endpoint
//! carries both request/response traffic (POST) and an optional
//! server-initiated notification stream (GET), grounded on
//! `turbomcp-http::transport::StreamableHttpClientTransport`'s
//! session-id-under-mutex pattern and 202/200-json/200-sse branching.

use crate::{ErrorHandler, MessageHandler, TransportConfig};
use futures::StreamExt;
use mcp_remote_core::{CancellationToken, Error, Result};
use mcp_remote_net::sse::SseReader;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::io::StreamReader;

const PROTOCOL_VERSION: &str = "2025-11-25";
const RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// MCP 2025-11-25 wire transport. Every operation on this type is cheap to
/// clone and share: session id and notification-stream state live behind an
/// `Arc`, matching the teacher's `Arc<RwLock<..>>` field style but using
/// `parking_lot` for the short, never-held-across-await session id lock.
#[derive(Clone)]
pub struct StreamableHttpTransport {
    config: TransportConfig,
    client: reqwest::Client,
    session_id: Arc<Mutex<Option<String>>>,
    last_event_id: Arc<Mutex<Option<String>>>,
    notifications_available: Arc<AtomicBool>,
    on_message: Arc<Mutex<Option<MessageHandler>>>,
    on_error: Arc<Mutex<Option<ErrorHandler>>>,
    notify_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl StreamableHttpTransport {
    pub fn new(config: TransportConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;
        Ok(Self {
            config,
            client,
            session_id: Arc::new(Mutex::new(None)),
            last_event_id: Arc::new(Mutex::new(None)),
            notifications_available: Arc::new(AtomicBool::new(true)),
            on_message: Arc::new(Mutex::new(None)),
            on_error: Arc::new(Mutex::new(None)),
            notify_task: Arc::new(Mutex::new(None)),
        })
    }

    pub fn set_on_message(&self, handler: MessageHandler) {
        *self.on_message.lock() = Some(handler);
    }

    pub fn set_on_error(&self, handler: ErrorHandler) {
        *self.on_error.lock() = Some(handler);
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id.lock().clone()
    }

    fn dispatch(&self, value: serde_json::Value) {
        if let Some(handler) = self.on_message.lock().as_ref() {
            handler(value);
        }
    }

    fn build_headers(&self, accept: &str) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            reqwest::header::ACCEPT,
            HeaderValue::from_str(accept).map_err(|e| Error::Config(e.to_string()))?,
        );
        headers.insert(
            "Mcp-Protocol-Version",
            HeaderValue::from_static(PROTOCOL_VERSION),
        );
        if let Some(sid) = self.session_id.lock().clone() {
            if let Ok(v) = HeaderValue::from_str(&sid) {
                headers.insert("Mcp-Session-Id", v);
            }
        }
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

    /// Sends one JSON-RPC record. `202` means the response will arrive later
    /// via the notification stream; `200 application/json` dispatches
    /// synchronously; `200 text/event-stream` reads the body as an SSE
    /// stream and dispatches each event.
    pub async fn send(&self, message: &serde_json::Value, cancel: &CancellationToken) -> Result<()> {
        let mut headers = self.build_headers("application/json, text/event-stream")?;
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );

        let send = self
            .client
            .post(&self.config.remote_url)
            .headers(headers)
            .json(message)
            .send();

        let response = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Error::Cancelled),
            r = send => r.map_err(|e| Error::Config(e.to_string()))?,
        };

        let status = response.status();
        if let Some(sid) = response
            .headers()
            .get("Mcp-Session-Id")
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.lock() = Some(sid.to_string());
        }

        if status == reqwest::StatusCode::ACCEPTED {
            return Ok(());
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Http {
                status: status.as_u16(),
                body,
            });
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.contains("application/json") {
            let value: serde_json::Value = response.json().await.map_err(|e| Error::Config(e.to_string()))?;
            self.dispatch(value);
        } else if content_type.contains("text/event-stream") {
            let stream = response
                .bytes_stream()
                .map(|r| r.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)));
            let body_reader = StreamReader::new(stream);
            let mut reader = SseReader::new(body_reader, cancel.clone());
            while let Some(event) = reader.next_event().await {
                if let Some(id) = event.id {
                    *self.last_event_id.lock() = Some(id);
                }
                match serde_json::from_str::<serde_json::Value>(&event.data) {
                    Ok(value) => self.dispatch(value),
                    Err(e) => tracing::warn!(error = %e, "dropping unparseable streamable-http event"),
                }
            }
        }
        // Any other 2xx content type is accepted silently.
        Ok(())
    }

    /// Optionally opens the server-initiated notification stream. Spawns a
    /// background reconnect loop; on `405` the stream is marked permanently
    /// unavailable and the loop exits without retrying.
    pub fn connect(&self, cancel: CancellationToken) {
        if self.notify_task.lock().is_some() {
            return;
        }
        let this = self.clone();
        let handle = tokio::spawn(async move {
            this.notification_loop(cancel).await;
        });
        *self.notify_task.lock() = Some(handle);
    }

    async fn notification_loop(&self, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() || !self.notifications_available.load(Ordering::SeqCst) {
                return;
            }

            let headers = match self.build_headers("text/event-stream") {
                Ok(h) => h,
                Err(e) => {
                    self.emit_error(e);
                    return;
                }
            };
            let mut headers = headers;
            if let Some(id) = self.last_event_id.lock().clone() {
                if let Ok(v) = HeaderValue::from_str(&id) {
                    headers.insert("Last-Event-ID", v);
                }
            }

            let request = self.client.get(&self.config.remote_url).headers(headers).send();
            let response = tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                r = request => r,
            };

            match response {
                Ok(resp) if resp.status() == reqwest::StatusCode::METHOD_NOT_ALLOWED => {
                    self.notifications_available.store(false, Ordering::SeqCst);
                    return;
                }
                Ok(resp) if resp.status().is_success() => {
                    let stream = resp
                        .bytes_stream()
                        .map(|r| r.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)));
                    let body_reader = StreamReader::new(stream);
                    let mut reader = SseReader::new(body_reader, cancel.clone());
                    while let Some(event) = reader.next_event().await {
                        if let Some(id) = event.id {
                            *self.last_event_id.lock() = Some(id);
                        }
                        match serde_json::from_str::<serde_json::Value>(&event.data) {
                            Ok(value) => self.dispatch(value),
                            Err(e) => tracing::warn!(error = %e, "dropping unparseable notification event"),
                        }
                    }
                }
                Ok(resp) => {
                    tracing::warn!(status = %resp.status(), "notification stream connect failed");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "notification stream transport error");
                }
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(RECONNECT_DELAY) => {}
            }
        }
    }

    fn emit_error(&self, err: Error) {
        if let Some(handler) = self.on_error.lock().as_ref() {
            handler(err);
        }
    }

    /// Cancels the notification stream and, if a session was established,
    /// best-effort terminates it server-side with `DELETE`.
    pub async fn close(&self) {
        if let Some(handle) = self.notify_task.lock().take() {
            handle.abort();
        }
        let Some(sid) = self.session_id.lock().clone() else {
            return;
        };
        let mut headers = HeaderMap::new();
        if let Ok(v) = HeaderValue::from_str(&sid) {
            headers.insert("Mcp-Session-Id", v);
        }
        if let Err(e) = self
            .client
            .delete(&self.config.remote_url)
            .headers(headers)
            .send()
            .await
        {
            tracing::warn!(error = %e, "failed to terminate streamable-http session on close");
        }
    }
}
