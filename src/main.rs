//! muxrpc: a multiplexing RPC endpoint
//!
//! Serves the built-in `ping` and `echo` methods over:
//! - TCP, one session per connection
//! - stdin/stdout, a single session (`--stdio`)
//!
//! Configuration via CLI arguments or TOML file.

use std::sync::Arc;

use muxrpc::config::Config;
use muxrpc::protocols;
use muxrpc::server::{serve_stdio, Server};
use muxrpc::HandlerMux;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging; stdout may carry the protocol
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let mut mux = HandlerMux::new();
    protocols::register_builtin(&mut mux);

    info!(
        listen = %config.listen,
        stdio = config.stdio,
        max_connections = config.max_connections,
        max_body_size = config.max_body_size,
        methods = mux.len(),
        "Starting muxrpc"
    );

    if config.stdio {
        serve_stdio(Arc::new(mux), CancellationToken::new(), config.max_body_size).await?;
        return Ok(());
    }

    let server = Server::new(config, mux);
    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted");
            shutdown.cancel();
        }
    });

    server.run().await
}
