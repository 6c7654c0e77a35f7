//! Inter-process authorization coordination (§4.G): the lockfile protocol
//! that lets at most one live instance per remote run the interactive
//! authorization flow while siblings wait and then read tokens from disk.

use crate::model::{LockInfo, Tokens};
use crate::oauth::CallbackServer;
use crate::store::RemoteConfigStore;
use mcp_remote_core::{CancellationToken, Error, Result};
use mcp_remote_net::http::HttpClient;
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const LOCK_VALIDITY: Duration = Duration::from_secs(30 * 60);
const LIVENESS_PROBE_TIMEOUT: Duration = Duration::from_secs(1);
const FOLLOWER_RETRY_DELAY: Duration = Duration::from_secs(1);
const SETTLE_DELAY: Duration = Duration::from_secs(1);

pub struct AuthCoordination {
    store: RemoteConfigStore,
    http: HttpClient,
    base_port: u16,
}

/// The bound callback server plus the lockfile bookkeeping that makes this
/// process the owner of the current authorization attempt.
pub struct Owner {
    server: CallbackServer,
    store: RemoteConfigStore,
}

impl Owner {
    pub fn port(&self) -> u16 {
        self.server.port()
    }

    pub fn begin_attempt(&self) -> tokio::sync::mpsc::UnboundedReceiver<String> {
        self.server.begin_attempt()
    }

    pub async fn wait_for_code(
        &self,
        rx: tokio::sync::mpsc::UnboundedReceiver<String>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<String> {
        self.server.wait_for_code(rx, timeout, cancel).await
    }

    pub fn mark_completed(&self) {
        self.server.mark_completed();
    }
}

impl Drop for Owner {
    fn drop(&mut self) {
        // Best-effort: a synchronous remove is acceptable at shutdown since
        // tokio::fs equivalents aren't available outside an async context.
        let path = self.store.dir().join("lock.json");
        let _ = std::fs::remove_file(path);
    }
}

/// A process that observed a valid peer lock. It only ever long-polls the
/// owner and reads tokens back from disk; it never binds a callback server
/// and never receives or exchanges an authorization code.
pub struct Follower {
    store: RemoteConfigStore,
    http: HttpClient,
    lock: LockInfo,
}

impl Follower {
    /// Repeatedly long-polls the owner's `/wait-for-auth` until it reports
    /// completion, then reloads tokens from disk.
    pub async fn wait_for_tokens(&self, cancel: &CancellationToken) -> Result<Tokens> {
        let url = format!("http://127.0.0.1:{}/wait-for-auth", self.lock.port);
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let resp = self
                .http
                .get(&url, &HashMap::new(), cancel)
                .await
                .map_err(|e| Error::Config(e.to_string()))?;
            match resp.status {
                200 => break,
                202 => {
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => return Err(Error::Cancelled),
                        () = tokio::time::sleep(FOLLOWER_RETRY_DELAY) => {}
                    }
                }
                other => {
                    return Err(Error::Http {
                        status: other,
                        body: resp.text(),
                    })
                }
            }
        }

        tokio::time::sleep(SETTLE_DELAY).await;
        self.store
            .load_tokens()
            .await?
            .ok_or_else(|| Error::OAuthParse("owner reported completion but wrote no tokens.json".into()))
    }

    /// A follower never receives a redirect code itself — only the owner's
    /// callback server does. Invoking this is always a bug in the caller.
    pub async fn wait_for_code(&self) -> Result<String> {
        Err(Error::UnexpectedFollowerCall)
    }
}

pub enum Outcome {
    /// A valid peer owner holds the lock; this process must wait on it.
    Follower(Follower),
    /// No valid peer owner exists; this process bound the callback server
    /// and must run the rest of the interactive flow.
    Owner(Owner),
}

impl AuthCoordination {
    pub fn new(store: RemoteConfigStore, http: HttpClient, base_port: u16) -> Self {
        Self {
            store,
            http,
            base_port,
        }
    }

    pub async fn begin(&self, cancel: &CancellationToken) -> Result<Outcome> {
        if let Some(lock) = self.store.load_lock_info().await? {
            if self.lock_is_valid(&lock, cancel).await {
                return Ok(Outcome::Follower(Follower {
                    store: self.store.clone(),
                    http: self.http.clone(),
                    lock,
                }));
            }
            tracing::debug!(pid = lock.pid, port = lock.port, "discarding stale lock.json");
            self.store.delete_lock_info().await;
        }

        let server = CallbackServer::bind(self.base_port).await?;
        let info = LockInfo {
            pid: std::process::id(),
            port: server.port(),
            timestamp_ms: now_ms(),
        };
        self.store.save_lock_info(&info).await?;

        Ok(Outcome::Owner(Owner {
            server,
            store: self.store.clone(),
        }))
    }

    async fn lock_is_valid(&self, lock: &LockInfo, cancel: &CancellationToken) -> bool {
        if now_ms().saturating_sub(lock.timestamp_ms) > LOCK_VALIDITY.as_millis() as u64 {
            return false;
        }
        if !pid_is_live(lock.pid) {
            return false;
        }
        let url = format!("http://127.0.0.1:{}/wait-for-auth?poll=false", lock.port);
        match tokio::time::timeout(
            LIVENESS_PROBE_TIMEOUT,
            self.http.get(&url, &HashMap::new(), cancel),
        )
        .await
        {
            Ok(Ok(resp)) => resp.status == 200 || resp.status == 202,
            _ => false,
        }
    }
}

#[cfg(unix)]
fn pid_is_live(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(not(unix))]
fn pid_is_live(_pid: u32) -> bool {
    // No reliable liveness check on this platform: treat the lock as
    // invalid so this process becomes the owner rather than stalling
    // forever behind an unverifiable peer.
    false
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Tokens;

    #[tokio::test]
    async fn owner_path_binds_a_server_and_writes_lock_json() {
        let dir = tempfile::tempdir().unwrap();
        let store = RemoteConfigStore::with_root(dir.path().to_path_buf(), "https://example.com/mcp");
        let http = HttpClient::new(Default::default()).unwrap();
        let coordination = AuthCoordination::new(store.clone(), http, 19080);

        let outcome = coordination.begin(&CancellationToken::new()).await.unwrap();
        let owner = match outcome {
            Outcome::Owner(o) => o,
            Outcome::Follower(_) => panic!("expected Owner outcome on an empty config dir"),
        };
        let lock = store.load_lock_info().await.unwrap().unwrap();
        assert_eq!(lock.port, owner.port());
        drop(owner);
        // Owner's Drop removes lock.json on shutdown.
        assert!(store.load_lock_info().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_lock_past_validity_window_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let store = RemoteConfigStore::with_root(dir.path().to_path_buf(), "https://example.com/mcp");
        store
            .save_lock_info(&LockInfo {
                pid: std::process::id(),
                port: 1,
                timestamp_ms: 0,
            })
            .await
            .unwrap();
        let http = HttpClient::new(Default::default()).unwrap();
        let coordination = AuthCoordination::new(store.clone(), http, 19180);
        let outcome = coordination.begin(&CancellationToken::new()).await.unwrap();
        assert!(matches!(outcome, Outcome::Owner(_)));
    }

    #[tokio::test]
    async fn follower_reads_tokens_once_owner_completes() {
        let dir = tempfile::tempdir().unwrap();
        let owner_store = RemoteConfigStore::with_root(dir.path().to_path_buf(), "https://example.com/mcp");
        let http = HttpClient::new(Default::default()).unwrap();
        let owner_coord = AuthCoordination::new(owner_store.clone(), http.clone(), 19280);
        let owner = match owner_coord.begin(&CancellationToken::new()).await.unwrap() {
            Outcome::Owner(o) => o,
            _ => panic!("expected owner"),
        };

        let tokens = Tokens {
            access_token: secrecy::SecretString::new("T1".to_string()),
            token_type: "Bearer".into(),
            refresh_token: None,
            expires_in: Some(3600),
            expires_at: Some(now_ms() / 1000 + 3600),
            scope: None,
        };
        owner_store.save_tokens(&tokens).await.unwrap();
        owner.mark_completed();

        let follower_store = RemoteConfigStore::with_root(dir.path().to_path_buf(), "https://example.com/mcp");
        let follower_coord = AuthCoordination::new(follower_store, http, 19280);
        let follower = match follower_coord.begin(&CancellationToken::new()).await.unwrap() {
            Outcome::Follower(f) => f,
            Outcome::Owner(_) => panic!("expected Follower outcome while the owner's lock is valid"),
        };
        let got = follower.wait_for_tokens(&CancellationToken::new()).await.unwrap();
        assert_eq!(got, tokens);
    }

    #[tokio::test]
    async fn follower_wait_for_code_is_rejected_as_a_bug() {
        let dir = tempfile::tempdir().unwrap();
        let owner_store = RemoteConfigStore::with_root(dir.path().to_path_buf(), "https://example.com/mcp");
        let http = HttpClient::new(Default::default()).unwrap();
        let owner_coord = AuthCoordination::new(owner_store.clone(), http.clone(), 19380);
        let owner = match owner_coord.begin(&CancellationToken::new()).await.unwrap() {
            Outcome::Owner(o) => o,
            Outcome::Follower(_) => panic!("expected owner on an empty config dir"),
        };

        let follower_store = RemoteConfigStore::with_root(dir.path().to_path_buf(), "https://example.com/mcp");
        let follower_coord = AuthCoordination::new(follower_store, http, 19380);
        let follower = match follower_coord.begin(&CancellationToken::new()).await.unwrap() {
            Outcome::Follower(f) => f,
            Outcome::Owner(_) => panic!("expected Follower outcome while the owner's lock is valid"),
        };

        let err = follower.wait_for_code().await.unwrap_err();
        assert!(matches!(err, Error::UnexpectedFollowerCall));

        drop(owner);
    }
}
