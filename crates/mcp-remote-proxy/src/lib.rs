//! CLI parsing and the bidirectional stdio-to-remote pump for
//! `mcp-remote-rs`.

pub mod cli;
pub mod pump;

pub use cli::Cli;
pub use pump::{Proxy, ProxyConfig};
