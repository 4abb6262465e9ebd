//! oneshot-httpd: a reactor-plus-thread-pool network server
//!
//! A single event loop thread multiplexes non-blocking sockets over epoll
//! and hands ready connections to a fixed worker pool. Connection sockets
//! are armed one-shot so at most one worker touches a connection at a time.
//!
//! Protocols:
//! - HTTP/1.1 static files (GET/POST, keep-alive, mmap'd bodies)
//! - Length-prefixed echo
//! - Line-based ping
//!
//! Features:
//! - Per-socket level- or edge-triggered readiness
//! - Idle connection eviction via a timer heap
//! - Connection limit with an immediate "Server busy!" rejection
//! - Configuration via CLI arguments or TOML file

mod config;
mod error;
mod protocols;
mod runtime;

use config::Config;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
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
        listen_trigger = ?config.listen_trigger,
        conn_trigger = ?config.conn_trigger,
        oneshot = config.oneshot,
        timeout_ms = config.timeout_ms,
        workers = config.workers,
        max_connections = config.max_connections,
        protocol = ?config.protocol,
        "Starting oneshot-httpd"
    );

    runtime::run(config)?;
    Ok(())
}
