//! http-mirror: an HTTP/1.x request-echo server
//!
//! Answers every request with a canonical JSON description of exactly what
//! arrived on the wire, so an external harness can check that a request
//! survived proxies, load balancers, and header rewriting unchanged.
//!
//! Features:
//! - From-scratch HTTP/1.x framing over raw TCP
//! - Keep-alive with pipelined requests
//! - Chunked and Content-Length body decoding
//! - Configuration via CLI arguments or TOML file

mod config;
mod envelope;
mod http;
mod server;

use config::Config;
use server::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        max_connections = config.max_connections,
        read_timeout = config.read_timeout,
        max_head_size = config.max_head_size,
        max_body_size = config.max_body_size,
        "Starting http-mirror server"
    );

    Server::new(config).run().await?;
    Ok(())
}
