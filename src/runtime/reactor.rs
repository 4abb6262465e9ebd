//! Thin wrapper over Linux epoll.
//!
//! Readiness-based model: `wait` tells us which descriptors are ready and
//! the caller performs the non-blocking syscalls itself. Unlike mio, the
//! interest set exposes per-descriptor trigger mode and `EPOLLONESHOT`, which
//! the dispatch model relies on: a one-shot descriptor reports at most one
//! event until it is explicitly re-armed with `modify`.

use std::io;
use std::ops::BitOr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

/// Set of readiness conditions and delivery flags for a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest(u32);

impl Interest {
    /// No readiness conditions. A descriptor modified to this stays
    /// registered but is never reported (hangup and error aside).
    pub const NONE: Interest = Interest(0);
    pub const READABLE: Interest = Interest(libc::EPOLLIN as u32);
    pub const WRITABLE: Interest = Interest(libc::EPOLLOUT as u32);
    /// Peer closed its write half.
    pub const RDHUP: Interest = Interest(libc::EPOLLRDHUP as u32);
    /// Edge-triggered delivery.
    pub const EDGE: Interest = Interest(libc::EPOLLET as u32);
    /// Disarm after the first reported event.
    pub const ONESHOT: Interest = Interest(libc::EPOLLONESHOT as u32);

    pub const fn bits(self) -> u32 {
        self.0
    }

    #[cfg(test)]
    pub const fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

/// One readiness notification.
#[derive(Debug, Clone, Copy)]
pub struct Event {
    fd: RawFd,
    flags: u32,
}

impl Event {
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn is_readable(&self) -> bool {
        self.flags & libc::EPOLLIN as u32 != 0
    }

    pub fn is_writable(&self) -> bool {
        self.flags & libc::EPOLLOUT as u32 != 0
    }

    /// Peer hung up, fully or half.
    pub fn is_hangup(&self) -> bool {
        self.flags & (libc::EPOLLHUP | libc::EPOLLRDHUP) as u32 != 0
    }

    pub fn is_error(&self) -> bool {
        self.flags & libc::EPOLLERR as u32 != 0
    }
}

/// Reusable event buffer filled by `Reactor::wait`.
pub struct Events {
    raw: Vec<libc::epoll_event>,
    len: usize,
}

impl Events {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            raw: vec![libc::epoll_event { events: 0, u64: 0 }; capacity.max(1)],
            len: 0,
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Event> + '_ {
        self.raw[..self.len].iter().map(|raw| {
            // `epoll_event` is packed on x86_64; read fields by value.
            let flags = raw.events;
            let data = raw.u64;
            Event {
                fd: data as RawFd,
                flags,
            }
        })
    }
}

/// Owned epoll instance.
pub struct Reactor {
    epoll: OwnedFd,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `fd` is a freshly created descriptor we exclusively own.
        let epoll = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self { epoll })
    }

    pub fn register(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, interest)
    }

    /// Replace the interest set of a registered descriptor. For one-shot
    /// descriptors this is also what re-arms them.
    pub fn modify(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, interest)
    }

    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, Interest::NONE)
    }

    /// Block until at least one event is ready or `timeout` elapses.
    ///
    /// `None` waits indefinitely. An interrupted wait reports zero events.
    pub fn wait(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<usize> {
        let timeout_ms = match timeout {
            None => -1,
            // Round up so a sub-millisecond delay does not spin.
            Some(d) => d
                .as_nanos()
                .div_ceil(1_000_000)
                .min(libc::c_int::MAX as u128) as libc::c_int,
        };

        let n = unsafe {
            libc::epoll_wait(
                self.epoll.as_raw_fd(),
                events.raw.as_mut_ptr(),
                events.raw.len() as libc::c_int,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            events.len = 0;
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }
        events.len = n as usize;
        Ok(events.len)
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, interest: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interest.bits(),
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epoll.as_raw_fd(), op, fd, &mut event) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl AsRawFd for Reactor {
    fn as_raw_fd(&self) -> RawFd {
        self.epoll.as_raw_fd()
    }
}

/// eventfd used to interrupt `Reactor::wait` from other threads.
pub struct Waker {
    fd: OwnedFd,
}

impl Waker {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `fd` is a freshly created descriptor we exclusively own.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self { fd })
    }

    /// Make the eventfd readable. Wakes coalesce until `drain`.
    pub fn wake(&self) -> io::Result<()> {
        let val: u64 = 1;
        let rc = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            // Counter saturated: already readable.
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }

    /// Reset the counter so the descriptor stops reporting readable.
    pub fn drain(&self) {
        let mut val: u64 = 0;
        unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                &mut val as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            );
        }
    }
}

impl AsRawFd for Waker {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};

    const SHORT: Option<Duration> = Some(Duration::from_millis(50));
    const LONG: Option<Duration> = Some(Duration::from_secs(5));

    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (client, server)
    }

    #[test]
    fn test_interest_bits() {
        let interest = Interest::READABLE | Interest::RDHUP | Interest::ONESHOT;
        assert!(interest.contains(Interest::READABLE));
        assert!(interest.contains(Interest::ONESHOT));
        assert!(!interest.contains(Interest::EDGE));
        assert!(!interest.contains(Interest::WRITABLE));
        assert_eq!(Interest::NONE.bits(), 0);
    }

    #[test]
    fn test_level_triggered_redelivers() {
        let reactor = Reactor::new().unwrap();
        let mut events = Events::with_capacity(8);
        let (mut client, server) = socket_pair();
        reactor
            .register(server.as_raw_fd(), Interest::READABLE)
            .unwrap();

        client.write_all(b"ping").unwrap();
        assert_eq!(reactor.wait(&mut events, LONG).unwrap(), 1);
        let event = events.iter().next().unwrap();
        assert_eq!(event.fd(), server.as_raw_fd());
        assert!(event.is_readable());

        // Data still unread, so level-triggered reports it again.
        assert_eq!(reactor.wait(&mut events, SHORT).unwrap(), 1);
    }

    #[test]
    fn test_oneshot_waits_for_rearm() {
        let reactor = Reactor::new().unwrap();
        let mut events = Events::with_capacity(8);
        let (mut client, mut server) = socket_pair();
        let fd = server.as_raw_fd();
        let interest = Interest::READABLE | Interest::RDHUP | Interest::ONESHOT;
        reactor.register(fd, interest).unwrap();

        client.write_all(b"first").unwrap();
        assert_eq!(reactor.wait(&mut events, LONG).unwrap(), 1);

        // Disarmed: no redelivery, even with unread data and more arriving.
        client.write_all(b"second").unwrap();
        assert_eq!(reactor.wait(&mut events, SHORT).unwrap(), 0);

        reactor.modify(fd, interest).unwrap();
        assert_eq!(reactor.wait(&mut events, LONG).unwrap(), 1);
        assert!(events.iter().all(|e| e.fd() == fd && e.is_readable()));

        let mut buf = [0u8; 64];
        let n = server.read(&mut buf).unwrap();
        assert!(n > 0);
    }

    #[test]
    fn test_edge_triggered_reports_transitions() {
        let reactor = Reactor::new().unwrap();
        let mut events = Events::with_capacity(8);
        let (mut client, server) = socket_pair();
        reactor
            .register(server.as_raw_fd(), Interest::READABLE | Interest::EDGE)
            .unwrap();

        client.write_all(b"a").unwrap();
        assert_eq!(reactor.wait(&mut events, LONG).unwrap(), 1);
        assert_eq!(reactor.wait(&mut events, SHORT).unwrap(), 0);

        client.write_all(b"b").unwrap();
        assert_eq!(reactor.wait(&mut events, LONG).unwrap(), 1);
    }

    #[test]
    fn test_peer_close_reports_hangup() {
        let reactor = Reactor::new().unwrap();
        let mut events = Events::with_capacity(8);
        let (client, server) = socket_pair();
        reactor
            .register(server.as_raw_fd(), Interest::READABLE | Interest::RDHUP)
            .unwrap();

        drop(client);
        assert_eq!(reactor.wait(&mut events, LONG).unwrap(), 1);
        let event = events.iter().next().unwrap();
        assert!(event.is_hangup());
        assert!(!event.is_error());
    }

    #[test]
    fn test_deregistered_fd_is_silent() {
        let reactor = Reactor::new().unwrap();
        let mut events = Events::with_capacity(8);
        let (mut client, server) = socket_pair();
        reactor
            .register(server.as_raw_fd(), Interest::READABLE)
            .unwrap();
        reactor.deregister(server.as_raw_fd()).unwrap();

        client.write_all(b"ignored").unwrap();
        assert_eq!(reactor.wait(&mut events, SHORT).unwrap(), 0);
        assert!(events.is_empty());
    }

    #[test]
    fn test_modify_unregistered_fails() {
        let reactor = Reactor::new().unwrap();
        let (_client, server) = socket_pair();
        assert!(reactor
            .modify(server.as_raw_fd(), Interest::READABLE)
            .is_err());
    }

    #[test]
    fn test_waker_interrupts_wait() {
        let reactor = Reactor::new().unwrap();
        let mut events = Events::with_capacity(8);
        let waker = std::sync::Arc::new(Waker::new().unwrap());
        reactor
            .register(waker.as_raw_fd(), Interest::READABLE)
            .unwrap();

        let remote = std::sync::Arc::clone(&waker);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            remote.wake().unwrap();
            remote.wake().unwrap();
        });

        assert_eq!(reactor.wait(&mut events, LONG).unwrap(), 1);
        assert_eq!(events.iter().next().unwrap().fd(), waker.as_raw_fd());
        handle.join().unwrap();

        waker.drain();
        assert_eq!(reactor.wait(&mut events, SHORT).unwrap(), 0);
    }
}
