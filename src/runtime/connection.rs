//! Connection state machine and the table of live connections.
//!
//! A connection is owned by exactly one party at a time. While armed in the
//! reactor it is parked in the `ConnectionTable`; when an event fires the
//! event loop takes it out and moves it into a worker task, which hands it
//! back together with the `Next` step once the I/O is done.

use crate::runtime::protocol::{Handler, ParseStatus, Payload};
use crate::runtime::Buffer;
use std::collections::HashMap;
use std::io::{self, IoSlice, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::RawFd;
use tracing::trace;

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Accepted, nothing read yet.
    Idle,
    Reading,
    Processing,
    /// Response queued in the outbound buffer and payload.
    Writing,
    /// Response fully sent, waiting for the next request.
    KeepAliveIdle,
    Closed,
}

/// What the event loop should do with a connection handed back by a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    /// Re-arm for readable.
    Read,
    /// Re-arm for writable.
    Write,
    Close,
}

/// A single client connection.
pub struct Connection<S = TcpStream> {
    stream: S,
    fd: RawFd,
    peer: SocketAddr,
    state: ConnState,
    edge_triggered: bool,
    inbound: Buffer,
    outbound: Buffer,
    /// Second write segment, sent after `outbound`.
    payload: Option<Payload>,
    payload_sent: usize,
    handler: Box<dyn Handler>,
    keep_alive: bool,
    /// Peer shut down its write half after sending data still being served.
    peer_closed: bool,
}

impl<S: Read + Write> Connection<S> {
    pub fn new(
        stream: S,
        fd: RawFd,
        peer: SocketAddr,
        handler: Box<dyn Handler>,
        edge_triggered: bool,
        buffer_size: usize,
    ) -> Self {
        Self {
            stream,
            fd,
            peer,
            state: ConnState::Idle,
            edge_triggered,
            inbound: Buffer::with_capacity(buffer_size),
            outbound: Buffer::with_capacity(buffer_size),
            payload: None,
            payload_sent: 0,
            handler,
            keep_alive: false,
            peer_closed: false,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Bytes of the current response not yet sent.
    pub fn to_write_bytes(&self) -> usize {
        let payload_left = self
            .payload
            .as_ref()
            .map_or(0, |p| p.len() - self.payload_sent);
        self.outbound.readable_bytes() + payload_left
    }

    /// Drain the socket into the inbound buffer.
    ///
    /// Level-triggered connections read once; edge-triggered ones read until
    /// the socket would block. `Ok(0)` means the peer closed with nothing
    /// new to read. EOF after some bytes returns those bytes and marks the
    /// peer closed, so the buffered requests are still answered. `WouldBlock`
    /// is returned only if nothing at all was read.
    pub fn read(&mut self) -> io::Result<usize> {
        self.state = ConnState::Reading;
        let mut total = 0;
        loop {
            match self.inbound.read_from(&mut self.stream) {
                Ok(0) if total > 0 => {
                    self.peer_closed = true;
                    return Ok(total);
                }
                Ok(0) => return Ok(0),
                Ok(n) => {
                    total += n;
                    if !self.edge_triggered {
                        return Ok(total);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock && total > 0 => {
                    return Ok(total);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Run the handler over the inbound buffer.
    ///
    /// Returns true when a response was produced, which happens for both
    /// complete and malformed requests. A malformed request disables
    /// keep-alive so the connection closes after the error response.
    pub fn process(&mut self) -> bool {
        if self.inbound.readable_bytes() == 0 {
            return false;
        }
        self.state = ConnState::Processing;

        let status = self.handler.parse(&mut self.inbound);
        self.keep_alive = match status {
            ParseStatus::Incomplete => return false,
            ParseStatus::Complete => self.handler.is_keep_alive(),
            ParseStatus::Invalid => false,
        };

        let response = self.handler.build_response(&mut self.outbound);
        self.payload = response.payload.filter(|p| !p.is_empty());
        self.payload_sent = 0;
        self.state = ConnState::Writing;

        trace!(
            fd = self.fd,
            status = ?status,
            body_len = response.body_len,
            to_write = self.to_write_bytes(),
            "Response ready"
        );
        true
    }

    /// Send as much of the pending response as the socket accepts.
    ///
    /// Loops until everything is sent or the socket would block, in either
    /// trigger mode. Returns the number of bytes written.
    pub fn write(&mut self) -> io::Result<usize> {
        let mut total = 0;
        while self.to_write_bytes() > 0 {
            let head = self.outbound.readable_bytes();
            let result = {
                let tail = match &self.payload {
                    Some(p) => &p.as_bytes()[self.payload_sent..],
                    None => &[][..],
                };
                let iov = [IoSlice::new(self.outbound.peek()), IoSlice::new(tail)];
                let iov = if head == 0 { &iov[1..] } else { &iov[..] };
                self.stream.write_vectored(iov)
            };

            let n = match result {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            };

            if n >= head {
                self.outbound.retrieve(head);
                self.payload_sent += n - head;
            } else {
                self.outbound.retrieve(n);
            }
            total += n;
        }

        if self.to_write_bytes() == 0 {
            // Unmaps a file-backed body as soon as it is sent.
            self.payload = None;
            self.payload_sent = 0;
        }
        Ok(total)
    }

    /// Task body for a readable event.
    pub fn on_readable(&mut self) -> Next {
        match self.read() {
            Ok(0) => {
                trace!(fd = self.fd, "Peer closed");
                Next::Close
            }
            Ok(_) => self.after_read(),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Next::Read,
            Err(e) => {
                trace!(fd = self.fd, error = %e, "Read failed");
                Next::Close
            }
        }
    }

    /// Task body for a writable event.
    pub fn on_writable(&mut self) -> Next {
        if let Err(e) = self.write() {
            trace!(fd = self.fd, error = %e, "Write failed");
            return Next::Close;
        }
        if self.to_write_bytes() > 0 {
            return Next::Write;
        }
        if !self.keep_alive {
            return Next::Close;
        }
        self.state = ConnState::KeepAliveIdle;
        // Pipelined requests may already be buffered.
        self.after_read()
    }

    fn after_read(&mut self) -> Next {
        if self.process() {
            Next::Write
        } else if self.peer_closed {
            Next::Close
        } else {
            Next::Read
        }
    }

    /// Mark closed. The descriptor is released when the connection drops.
    pub fn close(&mut self) {
        self.state = ConnState::Closed;
        self.payload = None;
    }
}

/// Where a connection currently lives.
pub enum Slot<S = TcpStream> {
    /// Armed in the reactor, owned by the table.
    Parked(Box<Connection<S>>),
    /// Owned by a worker task.
    Dispatched,
    /// Evicted while dispatched. Closed when the task hands it back.
    Closing,
}

/// Live connections keyed by descriptor. Touched only by the event loop.
pub struct ConnectionTable<S = TcpStream> {
    slots: HashMap<RawFd, Slot<S>>,
    max_connections: usize,
}

impl<S> ConnectionTable<S> {
    pub fn new(max_connections: usize) -> Self {
        Self {
            slots: HashMap::with_capacity(max_connections.min(4096)),
            max_connections,
        }
    }

    /// Insert a new parked connection.
    ///
    /// Hands the connection back if the table is at capacity or `fd` is
    /// already present.
    pub fn insert(&mut self, fd: RawFd, conn: Box<Connection<S>>) -> Result<(), Box<Connection<S>>> {
        if self.is_full() || self.slots.contains_key(&fd) {
            return Err(conn);
        }
        self.slots.insert(fd, Slot::Parked(conn));
        Ok(())
    }

    /// Move a parked connection out to a task, leaving `Dispatched` behind.
    pub fn take(&mut self, fd: RawFd) -> Option<Box<Connection<S>>> {
        let slot = self.slots.get_mut(&fd)?;
        match std::mem::replace(slot, Slot::Dispatched) {
            Slot::Parked(conn) => Some(conn),
            other => {
                *slot = other;
                None
            }
        }
    }

    /// Return a dispatched connection to the table.
    ///
    /// Hands the connection back if the slot is not `Dispatched`, for
    /// example because it was marked `Closing` meanwhile.
    pub fn park(&mut self, fd: RawFd, conn: Box<Connection<S>>) -> Result<(), Box<Connection<S>>> {
        match self.slots.get_mut(&fd) {
            Some(slot) if matches!(slot, Slot::Dispatched) => {
                *slot = Slot::Parked(conn);
                Ok(())
            }
            _ => Err(conn),
        }
    }

    /// Flag a dispatched connection for deferred close.
    pub fn mark_closing(&mut self, fd: RawFd) -> bool {
        match self.slots.get_mut(&fd) {
            Some(slot) if matches!(slot, Slot::Dispatched) => {
                *slot = Slot::Closing;
                true
            }
            _ => false,
        }
    }

    pub fn remove(&mut self, fd: RawFd) -> Option<Slot<S>> {
        self.slots.remove(&fd)
    }

    pub fn get(&self, fd: RawFd) -> Option<&Slot<S>> {
        self.slots.get(&fd)
    }

    #[cfg(test)]
    pub fn contains(&self, fd: RawFd) -> bool {
        self.slots.contains_key(&fd)
    }

    #[cfg(test)]
    pub fn is_dispatched(&self, fd: RawFd) -> bool {
        matches!(self.slots.get(&fd), Some(Slot::Dispatched))
    }

    pub fn is_closing(&self, fd: RawFd) -> bool {
        matches!(self.slots.get(&fd), Some(Slot::Closing))
    }

    pub fn is_full(&self) -> bool {
        self.slots.len() >= self.max_connections
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_connections
    }

    /// Remove every entry, returning the descriptors that were present.
    pub fn drain(&mut self) -> Vec<(RawFd, Slot<S>)> {
        self.slots.drain().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::protocol::Protocol;
    use std::collections::VecDeque;

    /// In-memory socket: reads come from queued chunks, writes are capped per
    /// call and per round to force partial sends.
    struct MockStream {
        input: VecDeque<Vec<u8>>,
        eof: bool,
        output: Vec<u8>,
        per_call: usize,
        budget: usize,
    }

    impl MockStream {
        fn new() -> Self {
            Self {
                input: VecDeque::new(),
                eof: false,
                output: Vec::new(),
                per_call: usize::MAX,
                budget: usize::MAX,
            }
        }
    }

    impl Read for MockStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.input.pop_front() {
                Some(mut chunk) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    if n < chunk.len() {
                        self.input.push_front(chunk.split_off(n));
                    }
                    Ok(n)
                }
                None if self.eof => Ok(0),
                None => Err(io::ErrorKind::WouldBlock.into()),
            }
        }
    }

    impl Write for MockStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            self.budget -= 1;
            let n = buf.len().min(self.per_call);
            self.output.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn conn(protocol: Protocol, edge: bool) -> Connection<MockStream> {
        Connection::new(
            MockStream::new(),
            7,
            "127.0.0.1:4000".parse().unwrap(),
            protocol.handler(),
            edge,
            64,
        )
    }

    #[test]
    fn test_split_request_waits_for_second_fragment() {
        let mut c = conn(Protocol::Ping, true);
        assert_eq!(c.state(), ConnState::Idle);

        c.stream.input.push_back(b"PI".to_vec());
        assert_eq!(c.on_readable(), Next::Read);
        assert_eq!(c.inbound.peek(), b"PI");
        assert_eq!(c.to_write_bytes(), 0);

        c.stream.input.push_back(b"NG\r\n".to_vec());
        assert_eq!(c.on_readable(), Next::Write);
        assert_eq!(c.state(), ConnState::Writing);

        assert_eq!(c.on_writable(), Next::Read);
        assert_eq!(c.stream.output, b"PONG\r\n");
        assert_eq!(c.state(), ConnState::KeepAliveIdle);
    }

    #[test]
    fn test_spurious_wakeup_rearms_read() {
        let mut c = conn(Protocol::Ping, true);
        assert_eq!(c.on_readable(), Next::Read);
    }

    #[test]
    fn test_level_triggered_reads_once() {
        let mut c = conn(Protocol::Ping, false);
        c.stream.input.push_back(b"PING\r\n".to_vec());
        c.stream.input.push_back(b"PING\r\n".to_vec());

        assert_eq!(c.on_readable(), Next::Write);
        assert_eq!(c.stream.input.len(), 1);
        assert_eq!(c.on_writable(), Next::Read);

        assert_eq!(c.on_readable(), Next::Write);
        assert_eq!(c.on_writable(), Next::Read);
        assert_eq!(c.stream.output, b"PONG\r\nPONG\r\n");
    }

    #[test]
    fn test_edge_triggered_drains_socket() {
        let mut c = conn(Protocol::Ping, true);
        c.stream.input.push_back(b"PING\r\n".to_vec());
        c.stream.input.push_back(b"PING\r\n".to_vec());

        assert_eq!(c.on_readable(), Next::Write);
        assert!(c.stream.input.is_empty());

        // Second request is already buffered, so the write re-enters process.
        assert_eq!(c.on_writable(), Next::Write);
        assert_eq!(c.on_writable(), Next::Read);
        assert_eq!(c.stream.output, b"PONG\r\nPONG\r\n");
    }

    #[test]
    fn test_large_response_partial_writes() {
        let mut c = conn(Protocol::Echo, true);
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let mut request = b"100000\r\n".to_vec();
        request.extend_from_slice(&data);
        c.stream.input.push_back(request);

        assert_eq!(c.on_readable(), Next::Write);
        let total = c.to_write_bytes();
        assert_eq!(total, 8 + 100_000);

        c.stream.per_call = 4096;
        let mut rounds = 0;
        loop {
            c.stream.budget = 5;
            let before = c.stream.output.len();
            let next = c.on_writable();
            let sent = c.stream.output.len() - before;
            assert_eq!(c.to_write_bytes(), total - c.stream.output.len());
            rounds += 1;
            if next != Next::Write {
                assert_eq!(next, Next::Read);
                break;
            }
            assert!(sent > 0);
        }

        assert!(rounds > 1);
        assert_eq!(c.to_write_bytes(), 0);
        assert_eq!(&c.stream.output[..8], b"100000\r\n");
        assert_eq!(&c.stream.output[8..], &data[..]);
        assert!(c.payload.is_none());
    }

    #[test]
    fn test_write_split_inside_head() {
        let mut c = conn(Protocol::Echo, true);
        c.stream.input.push_back(b"5\r\nhello".to_vec());
        assert_eq!(c.on_readable(), Next::Write);

        // Two bytes per call: the first send stops inside the "5\r\n" head.
        c.stream.per_call = 2;
        c.stream.budget = 1;
        assert_eq!(c.on_writable(), Next::Write);
        assert_eq!(c.outbound.peek(), b"\n");
        assert_eq!(c.to_write_bytes(), 6);

        c.stream.budget = usize::MAX;
        assert_eq!(c.on_writable(), Next::Read);
        assert_eq!(c.stream.output, b"5\r\nhello");
        assert_eq!(c.outbound.readable_bytes(), 0);
        assert_eq!(c.outbound.prependable_bytes(), 0);
    }

    #[test]
    fn test_non_keep_alive_closes_after_write() {
        let mut c = conn(Protocol::Ping, true);
        c.stream.input.push_back(b"QUIT\r\n".to_vec());

        assert_eq!(c.on_readable(), Next::Write);
        assert!(!c.is_keep_alive());
        assert_eq!(c.on_writable(), Next::Close);
        assert_eq!(c.stream.output, b"OK\r\n");
    }

    #[test]
    fn test_invalid_request_gets_error_then_close() {
        let mut c = conn(Protocol::Ping, true);
        c.stream.input.push_back(b"BOGUS\r\n".to_vec());

        assert_eq!(c.on_readable(), Next::Write);
        assert_eq!(c.on_writable(), Next::Close);
        assert_eq!(c.stream.output, b"ERROR unknown command\r\n");
    }

    #[test]
    fn test_request_before_eof_is_answered() {
        let mut c = conn(Protocol::Ping, true);
        c.stream.input.push_back(b"PING\r\n".to_vec());
        c.stream.eof = true;

        assert_eq!(c.on_readable(), Next::Write);
        assert!(c.is_keep_alive());
        assert_eq!(c.on_writable(), Next::Close);
        assert_eq!(c.stream.output, b"PONG\r\n");
    }

    #[test]
    fn test_pipelined_requests_before_eof_are_all_answered() {
        let mut c = conn(Protocol::Ping, true);
        c.stream.input.push_back(b"PING\r\nPING b\r\nPI".to_vec());
        c.stream.eof = true;

        assert_eq!(c.on_readable(), Next::Write);
        assert_eq!(c.on_writable(), Next::Write);
        // Trailing partial request can never complete.
        assert_eq!(c.on_writable(), Next::Close);
        assert_eq!(c.stream.output, b"PONG\r\nPONG b\r\n");
    }

    #[test]
    fn test_eof_closes() {
        let mut c = conn(Protocol::Ping, true);
        c.stream.eof = true;
        assert_eq!(c.on_readable(), Next::Close);
    }

    #[test]
    fn test_write_zero_is_an_error() {
        let mut c = conn(Protocol::Ping, true);
        c.stream.input.push_back(b"PING\r\n".to_vec());
        assert_eq!(c.on_readable(), Next::Write);

        c.stream.per_call = 0;
        assert_eq!(c.on_writable(), Next::Close);
    }

    fn boxed(fd: RawFd) -> Box<Connection<MockStream>> {
        let mut c = conn(Protocol::Ping, true);
        c.fd = fd;
        Box::new(c)
    }

    #[test]
    fn test_connection_table_capacity() {
        let mut table = ConnectionTable::new(2);

        assert!(table.insert(10, boxed(10)).is_ok());
        assert!(table.insert(11, boxed(11)).is_ok());

        // At capacity
        assert!(table.is_full());
        assert!(table.insert(12, boxed(12)).is_err());

        assert_eq!(table.len(), 2);
        assert!(matches!(table.get(10), Some(Slot::Parked(c)) if c.fd() == 10));

        table.remove(10);
        assert!(!table.contains(10));
        assert_eq!(table.len(), 1);
        assert!(table.insert(12, boxed(12)).is_ok());
    }

    #[test]
    fn test_connection_table_rejects_duplicate_fd() {
        let mut table = ConnectionTable::new(4);
        assert!(table.insert(10, boxed(10)).is_ok());
        assert!(table.insert(10, boxed(10)).is_err());
    }

    #[test]
    fn test_take_and_park() {
        let mut table = ConnectionTable::new(4);
        table.insert(10, boxed(10)).ok().unwrap();

        let c = table.take(10).unwrap();
        assert!(table.is_dispatched(10));
        assert!(table.take(10).is_none());
        assert_eq!(table.len(), 1);

        assert!(table.park(10, c).is_ok());
        assert!(matches!(table.get(10), Some(Slot::Parked(_))));
        assert!(table.park(11, boxed(11)).is_err());
    }

    #[test]
    fn test_closing_slot_refuses_park() {
        let mut table = ConnectionTable::new(4);
        table.insert(10, boxed(10)).ok().unwrap();

        // Only dispatched slots can be flagged.
        assert!(!table.mark_closing(10));

        let c = table.take(10).unwrap();
        assert!(table.mark_closing(10));
        assert!(table.is_closing(10));
        assert!(table.take(10).is_none());

        let c = table.park(10, c).unwrap_err();
        assert_eq!(c.fd(), 10);
        assert!(matches!(table.remove(10), Some(Slot::Closing)));
        assert!(table.is_empty());
    }
}
