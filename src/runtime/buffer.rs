//! Growable per-connection byte buffer.
//!
//! Layout of the backing storage:
//!
//! ```text
//! +-------------------+------------------+------------------+
//! | prependable bytes |  readable bytes  |  writable bytes  |
//! +-------------------+------------------+------------------+
//! 0            read_pos          write_pos          capacity
//! ```
//!
//! Appends go to the writable tail. When the tail is too small the buffer
//! first tries to reclaim the prependable slack by sliding the readable
//! region to offset 0, and only reallocates when that is not enough. The
//! buffer never shrinks.
//!
//! ## Socket I/O
//!
//! `read_from` issues a single vectored read into the writable tail plus a
//! 64 KiB stack scratch region, so an idle connection does not need a large
//! buffer but a burst can still be taken in one syscall. `write_to` issues a
//! single write of the readable region and leaves partial-write retries to
//! the caller.

#![allow(dead_code)] // Protocols use a subset of the cursor API

use std::io::{self, IoSliceMut, Read, Write};

/// Initial capacity for a connection buffer.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Size of the on-stack overflow region used by `read_from`.
const SCRATCH_SIZE: usize = 64 * 1024;

/// Byte buffer with independent read and write cursors.
#[derive(Debug, Clone)]
pub struct Buffer {
    buf: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl Buffer {
    /// Create a buffer with `DEFAULT_CAPACITY` bytes of storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a buffer with `capacity` bytes of storage.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity],
            read_pos: 0,
            write_pos: 0,
        }
    }

    /// Bytes available to read.
    pub fn readable_bytes(&self) -> usize {
        self.write_pos - self.read_pos
    }

    /// Bytes available at the tail without moving data.
    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.write_pos
    }

    /// Bytes already consumed in front of the readable region.
    pub fn prependable_bytes(&self) -> usize {
        self.read_pos
    }

    /// Size of the backing storage.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// The readable region.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.read_pos..self.write_pos]
    }

    /// The writable tail, to be filled before calling `has_written`.
    pub fn begin_write(&mut self) -> &mut [u8] {
        &mut self.buf[self.write_pos..]
    }

    /// Commit `len` bytes written directly into `begin_write`.
    pub fn has_written(&mut self, len: usize) {
        debug_assert!(len <= self.writable_bytes());
        self.write_pos += len;
    }

    /// Consume `len` readable bytes.
    pub fn retrieve(&mut self, len: usize) {
        debug_assert!(len <= self.readable_bytes());
        if len >= self.readable_bytes() {
            // Fully drained: rewind both cursors instead of leaving slack.
            self.read_pos = 0;
            self.write_pos = 0;
        } else {
            self.read_pos += len;
        }
    }

    /// Consume the readable bytes before offset `end` (relative to `peek`).
    pub fn retrieve_until(&mut self, end: usize) {
        self.retrieve(end.min(self.readable_bytes()));
    }

    /// Consume everything and clear the contents.
    pub fn retrieve_all(&mut self) {
        self.buf.fill(0);
        self.read_pos = 0;
        self.write_pos = 0;
    }

    /// Consume everything, returning it as a (lossy) UTF-8 string.
    pub fn retrieve_all_to_string(&mut self) -> String {
        let s = String::from_utf8_lossy(self.peek()).into_owned();
        self.retrieve_all();
        s
    }

    /// Position of the first `\r\n` within the readable region.
    pub fn find_crlf(&self) -> Option<usize> {
        self.peek().windows(2).position(|w| w == b"\r\n")
    }

    /// Make sure at least `len` bytes can be appended.
    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
        debug_assert!(self.writable_bytes() >= len);
    }

    /// Append `data` to the writable tail, growing if needed.
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.buf[self.write_pos..self.write_pos + data.len()].copy_from_slice(data);
        self.write_pos += data.len();
    }

    /// Append the readable region of another buffer.
    pub fn append_buffer(&mut self, other: &Buffer) {
        self.append(other.peek());
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len {
            self.buf.resize(self.write_pos + len + 1, 0);
        } else {
            let readable = self.readable_bytes();
            self.buf.copy_within(self.read_pos..self.write_pos, 0);
            self.read_pos = 0;
            self.write_pos = readable;
        }
    }

    /// Fill the buffer from `reader` with one vectored read.
    ///
    /// Returns the number of bytes read; `Ok(0)` means end of stream.
    /// `WouldBlock` is returned unchanged for the caller to interpret.
    pub fn read_from<R: Read + ?Sized>(&mut self, reader: &mut R) -> io::Result<usize> {
        let mut scratch = [0u8; SCRATCH_SIZE];
        let writable = self.writable_bytes();

        let n = {
            let tail = &mut self.buf[self.write_pos..];
            let mut iov = [IoSliceMut::new(tail), IoSliceMut::new(&mut scratch)];
            reader.read_vectored(&mut iov)?
        };

        if n <= writable {
            self.write_pos += n;
        } else {
            self.write_pos = self.buf.len();
            self.append(&scratch[..n - writable]);
        }
        Ok(n)
    }

    /// Write the readable region to `writer` with a single call.
    ///
    /// Advances the read cursor by the number of bytes accepted.
    pub fn write_to<W: Write + ?Sized>(&mut self, writer: &mut W) -> io::Result<usize> {
        let n = writer.write(self.peek())?;
        self.retrieve(n);
        Ok(n)
    }
}
