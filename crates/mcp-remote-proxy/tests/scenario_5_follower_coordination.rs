//! End-to-end scenario 5: a second instance started while an owner already
//! holds a valid lock becomes a follower — it never opens a browser, polls
//! the owner's `/wait-for-auth` until the owner completes, then reads
//! tokens from the shared config directory (spec §8, scenario 5).

mod support;

use mcp_remote_auth::{BrowserOpener, OAuthCoordinator, OAuthCoordinatorConfig, RemoteConfigStore};
use mcp_remote_core::{CancellationToken, Result};
use secrecy::ExposeSecret;
use std::sync::Arc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct ScriptedBrowserOpener {
    code: String,
}

impl BrowserOpener for ScriptedBrowserOpener {
    fn open(&self, url: &str) -> Result<()> {
        let parsed = url::Url::parse(url).expect("authorization URL must be well formed");
        let redirect_uri = parsed
            .query_pairs()
            .find(|(k, _)| k == "redirect_uri")
            .expect("authorization URL must carry redirect_uri")
            .1
            .to_string();
        let callback_url = format!("{redirect_uri}?code={}", self.code);
        tokio::spawn(async move {
            // Give the follower a chance to observe at least one 202 before
            // the owner completes, matching the spec's "202 twice, then 200"
            // shape as closely as a two-task test can.
            tokio::time::sleep(std::time::Duration::from_millis(150)).await;
            let _ = reqwest::Client::new().get(&callback_url).send().await;
        });
        Ok(())
    }
}

struct NeverOpened;

impl BrowserOpener for NeverOpened {
    fn open(&self, _url: &str) -> Result<()> {
        panic!("a follower must never open a browser");
    }
}

#[tokio::test]
async fn follower_waits_for_the_owner_and_never_opens_a_browser() {
    support::init_config_dir();
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
    Mock::given(method("POST"))
        .and(path("/register"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "client_id": "C1",
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "T1",
            "refresh_token": "R1",
            "expires_in": 3600,
            "token_type": "Bearer",
        })))
        .mount(&server)
        .await;

    let remote_url = format!("{}/mcp", server.uri());

    let owner = OAuthCoordinator::new(
        OAuthCoordinatorConfig {
            client_name: "mcp-remote-rs-owner".to_string(),
            callback_port_base: 19680,
        },
        Arc::new(ScriptedBrowserOpener { code: "AC1".to_string() }),
    )
    .unwrap();

    let owner_remote = remote_url.clone();
    let owner_task = tokio::spawn(async move {
        owner
            .ensure_authorized(&owner_remote, &CancellationToken::new())
            .await
            .unwrap()
    });

    // Let the owner bind its callback server and write lock.json before the
    // follower starts probing it.
    tokio::time::sleep(std::time::Duration::from_millis(80)).await;

    let follower = OAuthCoordinator::new(
        OAuthCoordinatorConfig {
            client_name: "mcp-remote-rs-follower".to_string(),
            callback_port_base: 19780,
        },
        Arc::new(NeverOpened),
    )
    .unwrap();
    let follower_tokens = follower
        .ensure_authorized(&remote_url, &CancellationToken::new())
        .await
        .unwrap();

    let owner_tokens = owner_task.await.unwrap();
    assert_eq!(follower_tokens, owner_tokens);
    assert_eq!(follower_tokens.access_token.expose_secret(), "T1");

    let store = RemoteConfigStore::new(&remote_url);
    assert!(
        store.load_lock_info().await.unwrap().is_none(),
        "owner must remove lock.json once its flow completes"
    );
}
