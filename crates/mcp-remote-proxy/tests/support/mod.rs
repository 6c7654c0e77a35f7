//! Shared scaffolding for the end-to-end scenario tests (spec §8).
//!
//! `mcp_remote_auth::store::config_root` caches its resolved directory in a
//! process-wide `OnceLock`, matching the single global cache spec §9 calls
//! for. Each scenario test binary is its own process, so pinning
//! `MCP_REMOTE_CONFIG_DIR` to a fresh temporary directory before the first
//! store access isolates that binary's on-disk state without fighting the
//! cache.

use std::sync::Once;

static INIT: Once = Once::new();

pub fn init_config_dir() {
    INIT.call_once(|| {
        let dir = tempfile::tempdir().expect("create a temp config dir");
        std::env::set_var("MCP_REMOTE_CONFIG_DIR", dir.path());
        // Intentionally leaked: the directory must outlive every test in
        // this binary, which ends at process exit anyway.
        std::mem::forget(dir);
    });
}
