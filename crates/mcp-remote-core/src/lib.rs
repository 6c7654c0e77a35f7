//! Shared types used by every `mcp-remote-rs` crate: the remote identity
//! hash, the central error enum, and the cancellation token alias.

pub mod error;
pub mod remote_id;

pub use error::{Error, Result};
pub use remote_id::RemoteId;

/// Cancellation token threaded through discovery, OAuth, transports, and the
/// proxy pump. A single token is created in the binary's `main` and cloned
/// into every long-running task.
pub type CancellationToken = tokio_util::sync::CancellationToken;
