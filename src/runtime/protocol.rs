//! Interface between the connection state machine and application protocols.
//!
//! A `Handler` sees the inbound buffer, decides whether a full request is
//! present, and writes the response head into the outbound buffer. Large
//! bodies can be attached as a separate `Payload`, which the connection sends
//! as the second segment of a vectored write.

use crate::protocols::echo::EchoHandler;
use crate::protocols::http::HttpHandler;
use crate::protocols::ping::PingHandler;
use crate::runtime::Buffer;
use bytes::Bytes;
use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::ptr::{self, NonNull};
use std::sync::Arc;

/// Outcome of `Handler::parse`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    /// Need more bytes. Nothing was consumed.
    Incomplete,
    /// A well-formed request was consumed.
    Complete,
    /// Malformed input. The handler still produces an error response, after
    /// which the connection closes.
    Invalid,
}

/// What `Handler::build_response` produced besides the bytes it appended.
#[derive(Debug, Default)]
pub struct Response {
    /// Length of the response body, whether inline or in `payload`.
    pub body_len: usize,
    /// Body bytes sent after the outbound buffer.
    pub payload: Option<Payload>,
}

/// Application protocol driven by a `Connection`.
pub trait Handler: Send {
    fn parse(&mut self, input: &mut Buffer) -> ParseStatus;

    /// Append the response for the last parsed request to `output`.
    fn build_response(&mut self, output: &mut Buffer) -> Response;

    /// Whether the connection should stay open after the current response.
    fn is_keep_alive(&self) -> bool;
}

/// Zero-copy response body.
#[derive(Debug)]
pub enum Payload {
    Mapped(MappedFile),
    Shared(Bytes),
}

impl Payload {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Mapped(map) => map.as_slice(),
            Payload::Shared(bytes) => bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Read-only private mapping of a whole file. Unmapped on drop.
#[derive(Debug)]
pub struct MappedFile {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the mapping is read-only and owned exclusively by this value.
unsafe impl Send for MappedFile {}
unsafe impl Sync for MappedFile {}

impl MappedFile {
    /// Map `file` in full. Empty files cannot be mapped.
    pub fn map(file: &File) -> io::Result<Self> {
        let len = usize::try_from(file.metadata()?.len())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot map an empty file",
            ));
        }

        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                file.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let ptr = NonNull::new(addr.cast::<u8>())
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned null"))?;
        Ok(Self { ptr, len })
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: `ptr` covers `len` readable bytes until `drop`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.len
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast(), self.len);
        }
    }
}

/// Protocol served on every connection of a server.
#[derive(Debug, Clone)]
pub enum Protocol {
    Http { docroot: Arc<PathBuf> },
    Echo,
    Ping,
}

impl Protocol {
    /// Fresh handler for a newly accepted connection.
    pub fn handler(&self) -> Box<dyn Handler> {
        match self {
            Protocol::Http { docroot } => Box::new(HttpHandler::new(Arc::clone(docroot))),
            Protocol::Echo => Box::new(EchoHandler::new()),
            Protocol::Ping => Box::new(PingHandler::new()),
        }
    }
}
