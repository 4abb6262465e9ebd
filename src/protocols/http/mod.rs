//! HTTP/1.1 static file server.
//!
//! Serves files below a document root. Response bodies are memory-mapped and
//! sent as the second segment of a vectored write, so large files never pass
//! through the outbound buffer. Keep-alive is honoured for HTTP/1.1 requests
//! that ask for it.

mod handler;
pub mod request;
pub mod response;

pub use handler::HttpHandler;
