//! MCP wire transports (§4.H, §4.I) and the negotiator that picks between
//! them (§4.J). Both transports are variant-agnostic from the proxy's point
//! of view: they expose the same small capability set (connect, send,
//! message/error callbacks, close, session id) described in spec §9 as
//! "runtime polymorphism replacing interfaces", implemented here as a closed
//! two-variant enum rather than a trait object since there are exactly two
//! wire transports in scope.

pub mod legacy_sse;
pub mod negotiate;
pub mod streamable;

pub use legacy_sse::LegacySseTransport;
pub use negotiate::{CommittedTransport, TransportMode, negotiate};
pub use streamable::StreamableHttpTransport;

use std::collections::HashMap;
use std::sync::Arc;

/// Supplies the current bearer token, if any, for every outbound request.
/// A closure rather than a direct reference to the OAuth coordinator so the
/// transport cannot call back into it (spec §9's "no cyclic ownership").
pub type TokenProvider = Arc<dyn Fn() -> Option<String> + Send + Sync>;

/// Invoked once per inbound JSON-RPC message the transport dispatches,
/// whether it arrived as an immediate response or a server-initiated
/// notification.
pub type MessageHandler = Arc<dyn Fn(serde_json::Value) + Send + Sync>;

/// Invoked for transport-level failures that don't abort the calling
/// `send`/`connect` future directly (e.g. a background reconnect giving up).
pub type ErrorHandler = Arc<dyn Fn(mcp_remote_core::Error) + Send + Sync>;

/// Construction parameters shared by both transports.
#[derive(Clone)]
pub struct TransportConfig {
    pub remote_url: String,
    pub headers: HashMap<String, String>,
    pub token_provider: TokenProvider,
}
