//! Four-strategy authorization-server metadata discovery (§4.E), tried in
//! order and cancellation-aware between strategies.

use crate::model::ServerMetadata;
use mcp_remote_core::{CancellationToken, Error, Result};
use mcp_remote_net::http::{HttpClient, HttpClientConfig};
use serde::Deserialize;
use std::collections::HashMap;
use url::Url;

#[derive(Debug, Deserialize)]
struct Rfc8414Document {
    issuer: String,
    authorization_endpoint: String,
    token_endpoint: String,
    #[serde(default)]
    registration_endpoint: Option<String>,
    #[serde(default)]
    jwks_uri: Option<String>,
    #[serde(default)]
    scopes_supported: Vec<String>,
    #[serde(default)]
    response_types_supported: Vec<String>,
    #[serde(default)]
    grant_types_supported: Vec<String>,
}

impl From<Rfc8414Document> for ServerMetadata {
    fn from(d: Rfc8414Document) -> Self {
        ServerMetadata {
            issuer: d.issuer,
            authorization_endpoint: d.authorization_endpoint,
            token_endpoint: d.token_endpoint,
            registration_endpoint: d.registration_endpoint,
            jwks_uri: d.jwks_uri,
            scopes_supported: d.scopes_supported,
            response_types_supported: d.response_types_supported,
            grant_types_supported: d.grant_types_supported,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ProtectedResourceMetadata {
    #[serde(default)]
    #[allow(dead_code)]
    resource: Option<String>,
    #[serde(default)]
    authorization_servers: Vec<String>,
    #[serde(default)]
    #[allow(dead_code)]
    scopes_supported: Vec<String>,
}

/// Which of the four discovery strategies (§4.E) produced a `ServerMetadata`.
/// Only strategies 1–3 are results from the authorization server itself;
/// `Fallback` is synthesized locally and callers that cache discovery
/// results to `server_metadata.json` must skip it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryStrategy {
    ProtectedResource,
    Rfc8414,
    Oidc,
    Fallback,
}

/// A discovered `ServerMetadata` tagged with the strategy that produced it.
#[derive(Debug, Clone)]
pub struct DiscoveryOutcome {
    pub metadata: ServerMetadata,
    pub strategy: DiscoveryStrategy,
}

impl DiscoveryOutcome {
    pub fn is_fallback(&self) -> bool {
        matches!(self.strategy, DiscoveryStrategy::Fallback)
    }
}

pub struct DiscoveryClient {
    http: HttpClient,
}

impl DiscoveryClient {
    pub fn new() -> Result<Self> {
        Ok(Self {
            http: HttpClient::new(HttpClientConfig::default())
                .map_err(|e| Error::Config(e.to_string()))?,
        })
    }

    /// Runs the four strategies in order, stopping at the first success.
    /// Returns a `Cancelled` error immediately if `cancel` fires between
    /// strategies.
    pub async fn discover(&self, remote_url: &str, cancel: &CancellationToken) -> Result<DiscoveryOutcome> {
        let url = Url::parse(remote_url).map_err(|e| Error::Config(e.to_string()))?;
        let origin = origin_of(&url)?;

        let mut last_err: Option<Error> = None;

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        match self.protected_resource(&origin, cancel).await {
            Ok(metadata) => {
                return Ok(DiscoveryOutcome {
                    metadata,
                    strategy: DiscoveryStrategy::ProtectedResource,
                })
            }
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => last_err = Some(e),
        }

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        match self.rfc8414(&origin, cancel).await {
            Ok(metadata) => {
                return Ok(DiscoveryOutcome {
                    metadata,
                    strategy: DiscoveryStrategy::Rfc8414,
                })
            }
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => last_err = Some(e),
        }

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        match self.oidc(&origin, cancel).await {
            Ok(metadata) => {
                return Ok(DiscoveryOutcome {
                    metadata,
                    strategy: DiscoveryStrategy::Oidc,
                })
            }
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => last_err = Some(e),
        }

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        match fallback(&origin) {
            Ok(metadata) => Ok(DiscoveryOutcome {
                metadata,
                strategy: DiscoveryStrategy::Fallback,
            }),
            Err(e) => Err(Error::discovery(last_err.unwrap_or(e))),
        }
    }

    async fn protected_resource(&self, origin: &str, cancel: &CancellationToken) -> Result<ServerMetadata> {
        let url = format!("{origin}/.well-known/oauth-protected-resource");
        let resp = self
            .http
            .get(&url, &HashMap::new(), cancel)
            .await
            .map_err(|e| Error::Config(e.to_string()))?;
        if !resp.is_success() {
            return Err(Error::Http {
                status: resp.status,
                body: resp.text(),
            });
        }
        let prm: ProtectedResourceMetadata =
            resp.json().map_err(|e| Error::OAuthParse(e.to_string()))?;

        let mut last_err: Option<Error> = None;
        for authorization_server in &prm.authorization_servers {
            let as_origin = origin_of(
                &Url::parse(authorization_server).map_err(|e| Error::Config(e.to_string()))?,
            )?;
            match self.rfc8414(&as_origin, cancel).await {
                Ok(metadata) => return Ok(metadata),
                Err(e) => last_err = Some(e),
            }
            match self.oidc(&as_origin, cancel).await {
                Ok(metadata) => return Ok(metadata),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or(Error::Config("no authorization_servers listed".into())))
    }

    async fn rfc8414(&self, origin: &str, cancel: &CancellationToken) -> Result<ServerMetadata> {
        let url = format!("{origin}/.well-known/oauth-authorization-server");
        self.fetch_document(&url, cancel).await
    }

    async fn oidc(&self, origin: &str, cancel: &CancellationToken) -> Result<ServerMetadata> {
        let url = format!("{origin}/.well-known/openid-configuration");
        self.fetch_document(&url, cancel).await
    }

    async fn fetch_document(&self, url: &str, cancel: &CancellationToken) -> Result<ServerMetadata> {
        let resp = self
            .http
            .get(url, &HashMap::new(), cancel)
            .await
            .map_err(|e| Error::Config(e.to_string()))?;
        if !resp.is_success() {
            return Err(Error::Http {
                status: resp.status,
                body: resp.text(),
            });
        }
        let doc: Rfc8414Document = resp.json().map_err(|e| Error::OAuthParse(e.to_string()))?;
        Ok(doc.into())
    }
}

fn origin_of(url: &Url) -> Result<String> {
    let scheme = url.scheme();
    let host = url.host_str().ok_or_else(|| Error::Config("remote URL has no host".into()))?;
    match url.port() {
        Some(port) => Ok(format!("{scheme}://{host}:{port}")),
        None => Ok(format!("{scheme}://{host}")),
    }
}

fn fallback(origin: &str) -> Result<ServerMetadata> {
    if origin.is_empty() {
        return Err(Error::Config("cannot synthesize fallback metadata without scheme+host".into()));
    }
    Ok(ServerMetadata {
        issuer: origin.to_string(),
        authorization_endpoint: format!("{origin}/oauth/authorize"),
        token_endpoint: format!("{origin}/oauth/token"),
        registration_endpoint: Some(format!("{origin}/oauth/register")),
        jwks_uri: None,
        scopes_supported: vec!["mcp".into(), "offline_access".into()],
        response_types_supported: vec!["code".into()],
        grant_types_supported: vec!["authorization_code".into(), "refresh_token".into()],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn rfc8414_success_short_circuits_remaining_strategies() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/oauth-protected-resource"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/.well-known/oauth-authorization-server"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "issuer": server.uri(),
                "authorization_endpoint": format!("{}/auth", server.uri()),
                "token_endpoint": format!("{}/token", server.uri()),
                "registration_endpoint": format!("{}/register", server.uri()),
            })))
            .mount(&server)
            .await;

        let client = DiscoveryClient::new().unwrap();
        let outcome = client
            .discover(&server.uri(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.strategy, DiscoveryStrategy::Rfc8414);
        assert_eq!(outcome.metadata.token_endpoint, format!("{}/token", server.uri()));
        assert!(!outcome.is_fallback());
    }

    #[tokio::test]
    async fn all_wellknown_404_synthesizes_fallback() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = DiscoveryClient::new().unwrap();
        let outcome = client
            .discover(&server.uri(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.is_fallback());
        assert_eq!(outcome.strategy, DiscoveryStrategy::Fallback);
        assert_eq!(
            outcome.metadata.authorization_endpoint,
            format!("{}/oauth/authorize", server.uri())
        );
        assert_eq!(
            outcome.metadata.grant_types_supported,
            vec!["authorization_code", "refresh_token"]
        );
    }

    #[tokio::test]
    async fn cancellation_between_strategies_short_circuits() {
        let server = MockServer::start().await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let client = DiscoveryClient::new().unwrap();
        let result = client.discover(&server.uri(), &cancel).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
