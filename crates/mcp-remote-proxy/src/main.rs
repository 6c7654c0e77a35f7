//! Entry point: parses argv, initializes logging to stderr, and runs the
//! pump until shutdown.

use clap::Parser;
use mcp_remote_core::CancellationToken;
use mcp_remote_proxy::{Cli, Proxy, ProxyConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_filter()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let exit_code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!(error = %e, "mcp-remote-rs exiting with a fatal error");
            1
        }
    };
    std::process::exit(exit_code);
}

async fn run(cli: Cli) -> mcp_remote_core::Result<()> {
    let remote_url = cli.validate_remote_url()?;
    let headers = cli.parsed_headers()?;

    let cancel = CancellationToken::new();
    install_signal_handlers(cancel.clone());

    let config = ProxyConfig {
        remote_url: remote_url.to_string(),
        transport_mode: cli.transport.into(),
        headers,
        callback_port_base: cli.port,
    };

    let proxy = Proxy::connect(config, &cancel).await?;
    proxy.run(cancel).await
}

/// SIGINT and (on unix) SIGTERM both cancel the shared token, which unwinds
/// the pump's read loop and triggers the shutdown sequence in
/// `Proxy::run`.
fn install_signal_handlers(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut terminate = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to install SIGTERM handler");
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                    }
                    cancel.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        cancel.cancel();
    });
}
