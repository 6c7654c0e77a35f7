//! Advisory cross-process file lock (§4.C). Acquisition uses create-exclusive
//! semantics on `path + ".lock"` with a 10ms backoff; a caller-chosen timeout
//! bounds the wait.

use mcp_remote_core::{Error, Result};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::fs::OpenOptions;

const BACKOFF: Duration = Duration::from_millis(10);

struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to remove lock file");
            }
        }
    }
}

/// Runs `fn` while holding an exclusive advisory lock on `path.lock`.
/// Returns `LockTimeout` if the lock cannot be acquired within `timeout`.
/// Not re-entrant: calling this again for the same path from the same
/// process while a guard is still held will itself time out.
pub async fn with_lock<T, Fut, F>(path: &Path, timeout: Duration, f: F) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let lock_path = lock_file_path(path);
    let deadline = Instant::now() + timeout;

    loop {
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
            .await
        {
            Ok(_) => break,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if Instant::now() >= deadline {
                    return Err(Error::LockTimeout {
                        path: lock_path.display().to_string(),
                        timeout_ms: timeout.as_millis() as u64,
                    });
                }
                tokio::time::sleep(BACKOFF).await;
            }
            Err(e) => return Err(e.into()),
        }
    }

    let guard = LockGuard {
        path: lock_path.clone(),
    };
    let result = f().await;
    drop(guard);
    result
}

fn lock_file_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".lock");
    PathBuf::from(os)
}
