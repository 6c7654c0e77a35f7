//! Per-remote config directory layout (§3) and lock-protected read/write of
//! `tokens.json`, `client_info.json`, `server_metadata.json`,
//! `code_verifier.txt`, and `lock.json`.

use crate::lock;
use crate::model::{ClientInfo, LockInfo, ServerMetadata, Tokens};
use mcp_remote_core::{Error, RemoteId, Result};
use serde::{Serialize, de::DeserializeOwned};
use std::path::{Path, PathBuf};
use std::time::Duration;

const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Resolves `$MCP_REMOTE_CONFIG_DIR`, falling back to `<home>/.mcp-auth`,
/// falling back further to the current directory if `HOME` is undetermined.
/// Resolved once per process the first time it's needed, matching the
/// single process-wide cache the design notes call for.
pub fn config_root() -> PathBuf {
    static ROOT: std::sync::OnceLock<PathBuf> = std::sync::OnceLock::new();
    ROOT.get_or_init(|| {
        if let Ok(dir) = std::env::var("MCP_REMOTE_CONFIG_DIR") {
            return PathBuf::from(dir);
        }
        match std::env::var("HOME") {
            Ok(home) if !home.is_empty() => PathBuf::from(home).join(".mcp-auth"),
            _ => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    })
    .clone()
}

#[derive(Debug, Clone)]
pub struct RemoteConfigStore {
    dir: PathBuf,
}

impl RemoteConfigStore {
    pub fn new(remote_url: &str) -> Self {
        Self::with_root(config_root(), remote_url)
    }

    pub fn with_root(root: PathBuf, remote_url: &str) -> Self {
        let id = RemoteId::new(remote_url);
        Self {
            dir: root.join(id.as_str()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn ensure_dir(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        set_dir_mode(&self.dir)?;
        Ok(())
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    async fn read_json<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        let path = self.path(name);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_json<T: Serialize + Sync>(&self, name: &str, value: &T) -> Result<()> {
        self.ensure_dir().await?;
        let path = self.path(name);
        let payload = serde_json::to_vec_pretty(value)?;
        let write_path = path.clone();
        lock::with_lock(&path, LOCK_TIMEOUT, move || async move {
            let tmp = write_path.with_extension("tmp");
            tokio::fs::write(&tmp, &payload).await?;
            set_file_mode(&tmp)?;
            tokio::fs::rename(&tmp, &write_path).await?;
            Ok(())
        })
        .await
    }

    pub async fn load_server_metadata(&self) -> Result<Option<ServerMetadata>> {
        self.read_json("server_metadata.json").await
    }

    pub async fn save_server_metadata(&self, metadata: &ServerMetadata) -> Result<()> {
        self.write_json("server_metadata.json", metadata).await
    }

    pub async fn load_client_info(&self) -> Result<Option<ClientInfo>> {
        self.read_json("client_info.json").await
    }

    pub async fn save_client_info(&self, info: &ClientInfo) -> Result<()> {
        self.write_json("client_info.json", info).await
    }

    pub async fn load_tokens(&self) -> Result<Option<Tokens>> {
        self.read_json("tokens.json").await
    }

    pub async fn save_tokens(&self, tokens: &Tokens) -> Result<()> {
        self.write_json("tokens.json", tokens).await
    }

    /// Discards cached tokens so the next `ensure_authorized` call runs a
    /// full authorization instead of trusting a token a 401 just rejected.
    pub async fn delete_tokens(&self) {
        if let Err(e) = tokio::fs::remove_file(self.path("tokens.json")).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(error = %e, "failed to delete tokens.json");
            }
        }
    }

    pub async fn save_code_verifier(&self, verifier: &str) -> Result<()> {
        self.ensure_dir().await?;
        let path = self.path("code_verifier.txt");
        tokio::fs::write(&path, verifier.as_bytes()).await?;
        set_file_mode(&path)?;
        Ok(())
    }

    pub async fn load_code_verifier(&self) -> Result<Option<String>> {
        match tokio::fs::read_to_string(self.path("code_verifier.txt")).await {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Best-effort cleanup; implementations MUST tolerate this never having
    /// run, so failures here are logged, not propagated.
    pub async fn delete_code_verifier(&self) {
        if let Err(e) = tokio::fs::remove_file(self.path("code_verifier.txt")).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(error = %e, "failed to delete code_verifier.txt");
            }
        }
    }

    pub async fn load_lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_json("lock.json").await
    }

    pub async fn save_lock_info(&self, info: &LockInfo) -> Result<()> {
        self.write_json("lock.json", info).await
    }

    pub async fn delete_lock_info(&self) {
        if let Err(e) = tokio::fs::remove_file(self.path("lock.json")).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(error = %e, "failed to delete lock.json");
            }
        }
    }
}

#[cfg(unix)]
fn set_file_mode(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(Error::from)
}

#[cfg(unix)]
fn set_dir_mode(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
        .map_err(Error::from)
}

#[cfg(not(unix))]
fn set_file_mode(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(not(unix))]
fn set_dir_mode(_path: &Path) -> Result<()> {
    Ok(())
}
