//! Reactor-plus-pool runtime.
//!
//! One event loop thread owns the epoll instance, the connection table and
//! the idle timer heap. Socket I/O and request processing run on a fixed
//! worker pool, one connection per task, with the descriptor disarmed
//! (one-shot) until the task hands the connection back.
//!
//! - `Buffer`: growable byte buffer with cursor semantics
//! - `TimerHeap`: keyed min-heap of deadlines
//! - `ThreadPool`: FIFO task queue drained by named workers
//! - `Connection`: per-socket read/process/write state machine
//! - `Reactor`: thin epoll wrapper (Linux only)

mod buffer;
mod connection;
pub mod protocol;
mod thread_pool;
mod timer;

#[cfg(target_os = "linux")]
mod event_loop;
#[cfg(target_os = "linux")]
mod reactor;

pub use buffer::Buffer;

use crate::config::{Config, ProtocolType};
use crate::error::ServerError;
use protocol::Protocol;
use std::sync::Arc;

/// Build the configured protocol and run the event loop until it stops.
pub fn run(config: Config) -> Result<(), ServerError> {
    let protocol = match config.protocol {
        ProtocolType::Http => Protocol::Http {
            docroot: Arc::new(config.docroot.clone()),
        },
        ProtocolType::Echo => Protocol::Echo,
        ProtocolType::Ping => Protocol::Ping,
    };

    #[cfg(target_os = "linux")]
    {
        event_loop::Server::new(&config, protocol)?.run()
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = protocol;
        Err(ServerError::Io(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "Unsupported platform: the epoll reactor requires Linux",
        )))
    }
}
