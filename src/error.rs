//! Startup error types.
//!
//! Per-connection failures never surface here: they are plain `io::Error`
//! values that end in closing that one connection.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {source}", path.display())]
    FileRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config file '{}': {source}", path.display())]
    TomlParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid listen address '{addr}': {source}")]
    InvalidListen {
        addr: String,
        #[source]
        source: std::net::AddrParseError,
    },
}

/// Errors that abort server startup or stop the event loop.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("failed to set up reactor: {0}")]
    Reactor(#[source] io::Error),
    #[error("failed to start thread pool: {0}")]
    ThreadPool(#[source] io::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}
