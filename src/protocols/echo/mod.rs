//! Echo protocol: length-prefixed frames echoed back verbatim.
//!
//! Useful for throughput testing and for exercising large responses and
//! partial writes without touching the filesystem.
//!
//! ```text
//! Request:  <length>\r\n<data of exactly length bytes>
//! Response: <length>\r\n<data of exactly length bytes>
//!
//! Example:
//! Request:  5\r\nhello
//! Response: 5\r\nhello
//! ```
//!
//! `QUIT\r\n` replies `OK\r\n` and closes. A malformed or oversized length
//! replies `ERROR <reason>\r\n` and closes.

mod handler;
pub mod parser;

pub use handler::EchoHandler;
