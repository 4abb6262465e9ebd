//! Application protocol handlers.
//!
//! Each protocol implements `runtime::protocol::Handler`.
//!
//! ## Production Protocols
//! - `http`: static file server over HTTP/1.1
//!
//! ## Test Protocols
//! - `ping`: minimal ping/pong
//! - `echo`: length-prefixed echo, exercises large responses

pub mod echo;
pub mod http;
pub mod ping;
