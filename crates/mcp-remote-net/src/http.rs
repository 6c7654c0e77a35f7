//! Thin HTTP client wrapper: per-call timeout, fixed-delay retry on
//! transport errors and 5xx only, JSON/form encoding helpers, and a response
//! wrapper that buffers its body once so callers can inspect it more than
//! once.

use mcp_remote_core::CancellationToken;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HttpClientError {
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("operation cancelled")]
    Cancelled,
    #[error("non-2xx response: {status} {body}")]
    Status { status: u16, body: String },
    #[error("invalid json body: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub retries: u32,
    pub retry_delay: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            retries: 3,
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// A response whose body has been read into memory exactly once, so callers
/// may call both `json()` and `text()` without re-reading the wire.
pub struct HttpResponse {
    pub status: u16,
    pub headers: reqwest::header::HeaderMap,
    body: bytes::Bytes,
}

impl HttpResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, HttpClientError> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
    }
}

#[derive(Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    config: HttpClientConfig,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> Result<Self, HttpClientError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client, config })
    }

    pub fn raw(&self) -> &reqwest::Client {
        &self.client
    }

    /// GET, retrying on transport errors and 5xx responses only.
    pub async fn get(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse, HttpClientError> {
        self.execute_with_retry(cancel, || {
            let mut req = self.client.get(url);
            for (k, v) in headers {
                req = req.header(k, v);
            }
            req
        })
        .await
    }

    /// POST a JSON body, setting `Content-Type: application/json` when the
    /// caller hasn't already supplied one.
    pub async fn post_json<T: Serialize>(
        &self,
        url: &str,
        body: &T,
        headers: &HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse, HttpClientError> {
        let has_content_type = headers.keys().any(|k| k.eq_ignore_ascii_case("content-type"));
        self.execute_with_retry(cancel, || {
            let mut req = self.client.post(url).json(body);
            for (k, v) in headers {
                req = req.header(k, v);
            }
            if !has_content_type {
                req = req.header(reqwest::header::CONTENT_TYPE, "application/json");
            }
            req
        })
        .await
    }

    /// POST a form-encoded body, setting
    /// `Content-Type: application/x-www-form-urlencoded`.
    pub async fn post_form(
        &self,
        url: &str,
        form: &HashMap<&str, &str>,
        headers: &HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse, HttpClientError> {
        self.execute_with_retry(cancel, || {
            let mut req = self.client.post(url).form(form);
            for (k, v) in headers {
                req = req.header(k, v);
            }
            req
        })
        .await
    }

    async fn execute_with_retry<F>(
        &self,
        cancel: &CancellationToken,
        build: F,
    ) -> Result<HttpResponse, HttpClientError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let send = build().send();
            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(HttpClientError::Cancelled),
                r = send => r,
            };

            match result {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let headers = resp.headers().clone();
                    let body = match resp.bytes().await {
                        Ok(b) => b,
                        Err(e) => {
                            if attempt > self.config.retries {
                                return Err(e.into());
                            }
                            self.wait_for_retry(cancel).await?;
                            continue;
                        }
                    };
                    if (500..600).contains(&status) && attempt <= self.config.retries {
                        tracing::warn!(status, attempt, "retrying after 5xx response");
                        self.wait_for_retry(cancel).await?;
                        continue;
                    }
                    return Ok(HttpResponse {
                        status,
                        headers,
                        body,
                    });
                }
                Err(e) => {
                    if attempt > self.config.retries {
                        return Err(e.into());
                    }
                    tracing::warn!(error = %e, attempt, "retrying after transport error");
                    self.wait_for_retry(cancel).await?;
                }
            }
        }
    }

    async fn wait_for_retry(&self, cancel: &CancellationToken) -> Result<(), HttpClientError> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(HttpClientError::Cancelled),
            () = tokio::time::sleep(self.config.retry_delay) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn get_retries_on_5xx_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let client = HttpClient::new(HttpClientConfig {
            retry_delay: Duration::from_millis(1),
            ..Default::default()
        })
        .unwrap();
        let resp = client
            .get(
                &format!("{}/flaky", server.uri()),
                &HashMap::new(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.text(), "ok");
    }

    #[tokio::test]
    async fn does_not_retry_on_4xx() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/nope"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let client = HttpClient::new(HttpClientConfig::default()).unwrap();
        let resp = client
            .get(
                &format!("{}/nope", server.uri()),
                &HashMap::new(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status, 404);
    }

    #[tokio::test]
    async fn response_body_can_be_read_twice() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/json"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{\"a\":1}"))
            .mount(&server)
            .await;

        let client = HttpClient::new(HttpClientConfig::default()).unwrap();
        let resp = client
            .get(
                &format!("{}/json", server.uri()),
                &HashMap::new(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(resp.text(), "{\"a\":1}");
        let value: serde_json::Value = resp.json().unwrap();
        assert_eq!(value["a"], 1);
    }
}
