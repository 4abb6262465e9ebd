//! Ping protocol: line-based health check.
//!
//! ```text
//! Request:  PING\r\n             Response: PONG\r\n
//! Request:  PING hello\r\n       Response: PONG hello\r\n
//! Request:  QUIT\r\n             Response: OK\r\n (then close)
//! ```
//!
//! Anything else gets `ERROR unknown command` and the connection closes.

mod handler;
pub mod parser;

pub use handler::PingHandler;
