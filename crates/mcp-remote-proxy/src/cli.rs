//! Command-line surface (§6), a concrete `clap` derive struct filling in
//! the distilled spec's "external collaborator, minimal contract", modeled
//! on `turbomcp-proxy::cli::args`'s `Args`/`ValueEnum` derive style.

use clap::{Parser, ValueEnum};
use mcp_remote_core::{Error, Result};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TransportArg {
    Auto,
    #[value(name = "streamable-http")]
    StreamableHttp,
    Sse,
}

impl From<TransportArg> for mcp_remote_transport::TransportMode {
    fn from(value: TransportArg) -> Self {
        match value {
            TransportArg::Auto => mcp_remote_transport::TransportMode::Auto,
            TransportArg::StreamableHttp => mcp_remote_transport::TransportMode::StreamableHttp,
            TransportArg::Sse => mcp_remote_transport::TransportMode::Sse,
        }
    }
}

/// A local-to-remote bridge for the Model Context Protocol: relays
/// newline-delimited JSON-RPC on stdio to a remote MCP server reachable
/// over HTTPS, handling OAuth 2.1 + PKCE authorization on the caller's
/// behalf.
#[derive(Debug, Parser)]
#[command(name = "mcp-remote-rs", version)]
pub struct Cli {
    /// URL of the remote MCP server.
    pub remote_url: String,

    /// Loopback port the OAuth callback server probes from.
    #[arg(long, default_value_t = 3334)]
    pub port: u16,

    /// Allow a remote URL with a plain `http` scheme (only ever safe for a
    /// localhost host; enforced at startup, not here).
    #[arg(long, default_value_t = false)]
    pub allow_http: bool,

    /// Wire transport to negotiate.
    #[arg(long, value_enum, default_value_t = TransportArg::Auto)]
    pub transport: TransportArg,

    /// Extra header to merge into every outbound request, `Name: Value`.
    /// Repeatable.
    #[arg(long = "header", value_name = "NAME: VALUE")]
    pub headers: Vec<String>,

    /// Increase log verbosity (repeatable). Overridden by `RUST_LOG` when set.
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    /// Parses `--header "Name:Value"`/`"Name: Value"` entries, trimming
    /// whitespace around the first colon. An entry with no colon is a
    /// `ConfigError`, per the Open Question resolution favoring strict
    /// input validation over a silent drop.
    pub fn parsed_headers(&self) -> Result<HashMap<String, String>> {
        let mut map = HashMap::new();
        for raw in &self.headers {
            let Some((name, value)) = raw.split_once(':') else {
                return Err(Error::Config(format!(
                    "invalid --header {raw:?}: expected \"Name: Value\""
                )));
            };
            let name = name.trim();
            let value = value.trim();
            if name.is_empty() {
                return Err(Error::Config(format!("invalid --header {raw:?}: empty header name")));
            }
            map.insert(name.to_string(), value.to_string());
        }
        Ok(map)
    }

    /// Enforces `allow-http`: the remote URL scheme must be `https`, or
    /// `http` only when the host is a localhost-class host and
    /// `allow_http` was explicitly set.
    pub fn validate_remote_url(&self) -> Result<url::Url> {
        let url = url::Url::parse(&self.remote_url)
            .map_err(|e| Error::Config(format!("invalid remote URL {:?}: {e}", self.remote_url)))?;
        match url.scheme() {
            "https" => Ok(url),
            "http" => {
                let is_localhost = matches!(url.host_str(), Some("localhost" | "127.0.0.1" | "::1"));
                if self.allow_http || is_localhost {
                    Ok(url)
                } else {
                    Err(Error::Config(
                        "remote URL scheme must be https unless --allow-http is set or the host is localhost".to_string(),
                    ))
                }
            }
            other => Err(Error::Config(format!("unsupported remote URL scheme {other:?}"))),
        }
    }

    pub fn log_filter(&self) -> String {
        match self.verbose {
            0 => "info".to_string(),
            1 => "debug".to_string(),
            _ => "trace".to_string(),
        }
    }
}
