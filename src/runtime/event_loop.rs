//! Reactor thread: accept, dispatch, re-arm, evict.
//!
//! Readiness-based model: the reactor reports which sockets are ready and
//! the connection is handed, by value, to a worker task that performs the
//! non-blocking syscalls and runs the protocol handler. Connection sockets
//! are registered one-shot, so a descriptor reports nothing further until the
//! task hands the connection back through the mailbox and the loop re-arms
//! it. Only this thread touches the reactor, the connection table and the
//! timer heap.

use crate::config::Config;
use crate::error::ServerError;
use crate::runtime::connection::{Connection, ConnectionTable, Next, Slot};
use crate::runtime::protocol::Protocol;
use crate::runtime::reactor::{Events, Interest, Reactor, Waker};
use crate::runtime::thread_pool::ThreadPool;
use crate::runtime::timer::TimerHeap;
use parking_lot::Mutex;
use socket2::{Domain, Socket, Type};
use std::io::{self, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

const BUSY_REPLY: &[u8] = b"Server busy!";

/// A connection handed back by a worker task.
struct Completion {
    conn: Box<Connection>,
    next: Next,
}

/// Channel from workers back to the reactor thread.
struct Mailbox {
    completions: Mutex<Vec<Completion>>,
    waker: Waker,
    shutdown: AtomicBool,
}

impl Mailbox {
    fn post(&self, completion: Completion) {
        self.completions.lock().push(completion);
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "Failed to wake event loop");
        }
    }

    fn take_all(&self) -> Vec<Completion> {
        std::mem::take(&mut *self.completions.lock())
    }
}

/// Control handle usable from any thread.
#[allow(dead_code)] // The binary runs until killed; embedders and tests stop it
#[derive(Clone)]
pub struct ServerHandle {
    mailbox: Arc<Mailbox>,
    live: Arc<AtomicUsize>,
    local_addr: SocketAddr,
}

#[allow(dead_code)] // See `ServerHandle`
impl ServerHandle {
    /// Ask the event loop to stop. Returns immediately.
    pub fn shutdown(&self) {
        self.mailbox.shutdown.store(true, Ordering::Release);
        if let Err(e) = self.mailbox.waker.wake() {
            warn!(error = %e, "Failed to wake event loop");
        }
    }

    /// Snapshot of the connection table size, published by the event loop.
    pub fn live_connections(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// State reachable from timer callbacks.
pub struct LoopState {
    reactor: Reactor,
    connections: ConnectionTable,
    live: Arc<AtomicUsize>,
    conn_edge: bool,
    oneshot: bool,
}

impl LoopState {
    fn new(reactor: Reactor, max_connections: usize, conn_edge: bool, oneshot: bool) -> Self {
        Self {
            reactor,
            connections: ConnectionTable::new(max_connections),
            live: Arc::new(AtomicUsize::new(0)),
            conn_edge,
            oneshot,
        }
    }

    /// Interest set for a connection waiting on `next`.
    fn interest(&self, next: Next) -> Interest {
        let mut interest = match next {
            Next::Write => Interest::WRITABLE,
            _ => Interest::READABLE,
        } | Interest::RDHUP;
        if self.conn_edge {
            interest = interest | Interest::EDGE;
        }
        if self.oneshot {
            interest = interest | Interest::ONESHOT;
        }
        interest
    }

    fn publish_live(&self) {
        self.live.store(self.connections.len(), Ordering::Release);
    }

    /// Remove `fd` from the table and the reactor. Dropping the returned
    /// slot releases the descriptor.
    fn unlink(&mut self, fd: RawFd) -> Option<Slot> {
        let slot = self.connections.remove(fd)?;
        if let Err(e) = self.reactor.deregister(fd) {
            // Already deregistered when the slot was marked closing.
            trace!(fd, error = %e, "Deregister failed");
        }
        self.publish_live();
        Some(slot)
    }

    /// Idle timeout expiry.
    fn evict(&mut self, fd: RawFd) {
        match self.connections.get(fd) {
            Some(Slot::Parked(_)) => {
                if let Some(Slot::Parked(conn)) = self.unlink(fd) {
                    debug!(fd, peer = %conn.peer(), live = self.connections.len(), "Idle timeout, closed connection");
                }
            }
            Some(Slot::Dispatched) => {
                // A task owns it: stop further events now, close on hand-back.
                if let Err(e) = self.reactor.deregister(fd) {
                    trace!(fd, error = %e, "Deregister failed");
                }
                self.connections.mark_closing(fd);
                debug!(fd, "Idle timeout while dispatched, closing on completion");
            }
            Some(Slot::Closing) | None => {}
        }
    }
}

/// The event loop and everything it owns.
pub struct Server {
    listener: TcpListener,
    listen_edge: bool,
    protocol: Protocol,
    buffer_size: usize,
    max_events: usize,
    timeout: Option<Duration>,
    state: LoopState,
    timer: TimerHeap<RawFd, LoopState>,
    pool: ThreadPool,
    mailbox: Arc<Mailbox>,
}

impl Server {
    /// Bind the listening socket and set up the reactor and worker pool.
    pub fn new(config: &Config, protocol: Protocol) -> Result<Self, ServerError> {
        let listener = create_listener(config).map_err(|source| ServerError::Bind {
            addr: config.listen,
            source,
        })?;

        let reactor = Reactor::new().map_err(ServerError::Reactor)?;
        let waker = Waker::new().map_err(ServerError::Reactor)?;

        let mut listen_interest = Interest::READABLE;
        if config.listen_trigger.is_edge() {
            listen_interest = listen_interest | Interest::EDGE;
        }
        reactor
            .register(listener.as_raw_fd(), listen_interest)
            .map_err(ServerError::Reactor)?;
        reactor
            .register(waker.as_raw_fd(), Interest::READABLE)
            .map_err(ServerError::Reactor)?;

        let pool = ThreadPool::new(config.workers).map_err(ServerError::ThreadPool)?;

        let timeout = (config.timeout_ms > 0).then(|| Duration::from_millis(config.timeout_ms as u64));

        Ok(Self {
            listener,
            listen_edge: config.listen_trigger.is_edge(),
            protocol,
            buffer_size: config.buffer_size,
            max_events: config.max_events,
            timeout,
            state: LoopState::new(
                reactor,
                config.max_connections,
                config.conn_trigger.is_edge(),
                config.oneshot,
            ),
            timer: TimerHeap::new(),
            pool,
            mailbox: Arc::new(Mailbox {
                completions: Mutex::new(Vec::new()),
                waker,
                shutdown: AtomicBool::new(false),
            }),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    #[allow(dead_code)] // See `ServerHandle`
    pub fn handle(&self) -> io::Result<ServerHandle> {
        Ok(ServerHandle {
            mailbox: Arc::clone(&self.mailbox),
            live: Arc::clone(&self.state.live),
            local_addr: self.local_addr()?,
        })
    }

    /// Run until `ServerHandle::shutdown` is called or the reactor fails.
    pub fn run(mut self) -> Result<(), ServerError> {
        info!(
            addr = %self.local_addr()?,
            workers = self.pool.size(),
            listen_edge = self.listen_edge,
            conn_edge = self.state.conn_edge,
            oneshot = self.state.oneshot,
            timeout_ms = self.timeout.map_or(0, |t| t.as_millis() as u64),
            protocol = ?self.protocol,
            "Event loop started"
        );

        let listener_fd = self.listener.as_raw_fd();
        let waker_fd = self.mailbox.waker.as_raw_fd();
        let mut events = Events::with_capacity(self.max_events);

        let result = loop {
            if self.mailbox.shutdown.load(Ordering::Acquire) {
                break Ok(());
            }

            let wait = match self.timeout {
                Some(_) => self.timer.next_delay(&mut self.state),
                None => None,
            };
            if let Err(e) = self.state.reactor.wait(&mut events, wait) {
                error!(error = %e, "Reactor wait failed");
                break Err(ServerError::Reactor(e));
            }

            for event in events.iter() {
                let fd = event.fd();
                if fd == listener_fd {
                    self.accept_connections();
                } else if fd == waker_fd {
                    self.mailbox.waker.drain();
                } else if event.is_error() {
                    self.on_hangup(fd);
                } else if event.is_readable() {
                    // Also taken on a half-close, so data sent before the
                    // FIN is still read and answered.
                    self.dispatch(fd, Next::Read);
                } else if event.is_writable() {
                    self.dispatch(fd, Next::Write);
                } else if event.is_hangup() {
                    self.on_hangup(fd);
                }
            }

            self.apply_completions();
        };

        self.stop();
        result
    }

    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.admit(stream, peer),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    break;
                }
            }
            if !self.listen_edge {
                break;
            }
        }
    }

    fn admit(&mut self, mut stream: TcpStream, peer: SocketAddr) {
        if self.state.connections.is_full() {
            warn!(
                peer = %peer,
                max_connections = self.state.connections.capacity(),
                "Connection limit reached, rejecting"
            );
            // Best effort: the socket is still blocking and the reply is tiny.
            let _ = stream.write_all(BUSY_REPLY);
            return;
        }
        if let Err(e) = stream.set_nonblocking(true) {
            warn!(peer = %peer, error = %e, "Failed to set non-blocking");
            return;
        }

        let fd = stream.as_raw_fd();
        let conn = Box::new(Connection::new(
            stream,
            fd,
            peer,
            self.protocol.handler(),
            self.state.conn_edge,
            self.buffer_size,
        ));
        if self.state.connections.insert(fd, conn).is_err() {
            warn!(fd, peer = %peer, "Descriptor already in connection table");
            return;
        }
        let interest = self.state.interest(Next::Read);
        if let Err(e) = self.state.reactor.register(fd, interest) {
            warn!(fd, peer = %peer, error = %e, "Failed to register connection");
            self.state.connections.remove(fd);
            return;
        }
        if let Some(timeout) = self.timeout {
            self.timer.add_or_update(
                fd,
                timeout,
                Box::new(move |state: &mut LoopState| state.evict(fd)),
            );
        }
        self.state.publish_live();

        debug!(fd, peer = %peer, live = self.state.connections.len(), "Accepted connection");
    }

    /// Hand a parked connection to the pool for one read or write step.
    fn dispatch(&mut self, fd: RawFd, kind: Next) {
        let Some(mut conn) = self.state.connections.take(fd) else {
            // Closing, or already closed earlier in this batch.
            return;
        };

        if !self.state.oneshot {
            // Emulated one-shot: silence the descriptor until hand-back.
            if let Err(e) = self.state.reactor.modify(fd, Interest::NONE) {
                warn!(fd, error = %e, "Failed to disarm connection");
            }
        }
        if let Some(timeout) = self.timeout {
            self.timer.adjust(fd, timeout);
        }

        let mailbox = Arc::clone(&self.mailbox);
        let submitted = self.pool.submit(move || {
            let next = match kind {
                Next::Read => conn.on_readable(),
                Next::Write => conn.on_writable(),
                Next::Close => Next::Close,
            };
            mailbox.post(Completion { conn, next });
        });
        trace!(fd, queued = self.pool.queued(), "Dispatched connection");
        if let Err(e) = submitted {
            // The task, and the connection with it, was dropped by submit.
            warn!(fd, error = %e, "Failed to dispatch connection");
            self.close_connection(fd);
        }
    }

    fn on_hangup(&mut self, fd: RawFd) {
        match self.state.connections.get(fd) {
            Some(Slot::Parked(_)) => {
                trace!(fd, "Peer hung up");
                self.close_connection(fd);
            }
            Some(Slot::Dispatched) => {
                // Only reachable with emulated one-shot.
                if let Err(e) = self.state.reactor.deregister(fd) {
                    trace!(fd, error = %e, "Deregister failed");
                }
                self.state.connections.mark_closing(fd);
                self.timer.cancel(fd);
            }
            Some(Slot::Closing) | None => {}
        }
    }

    /// Re-arm, park or close every connection handed back since last time.
    fn apply_completions(&mut self) {
        for Completion { conn, next } in self.mailbox.take_all() {
            let fd = conn.fd();
            if self.state.connections.is_closing(fd) {
                self.close_connection(fd);
                drop(conn);
                continue;
            }

            if next == Next::Close {
                debug!(fd, peer = %conn.peer(), state = ?conn.state(), "Closing connection");
                self.close_connection(fd);
                drop(conn);
                continue;
            }

            if let Err(conn) = self.state.connections.park(fd, conn) {
                warn!(fd, "Completion for unknown connection");
                drop(conn);
                continue;
            }
            let interest = self.state.interest(next);
            if let Err(e) = self.state.reactor.modify(fd, interest) {
                warn!(fd, error = %e, "Failed to re-arm connection");
                self.close_connection(fd);
            }
        }
    }

    /// Single close transition: table, reactor, timer, then the descriptor.
    fn close_connection(&mut self, fd: RawFd) {
        let slot = self.state.unlink(fd);
        self.timer.cancel(fd);
        if let Some(Slot::Parked(mut conn)) = slot {
            conn.close();
        }
        trace!(fd, live = self.state.connections.len(), "Connection closed");
    }

    fn stop(self) {
        let Server {
            pool,
            mut state,
            mut timer,
            mailbox,
            ..
        } = self;

        // Joining the workers lets every in-flight task hand back its
        // connection before the table is torn down.
        drop(pool);
        let in_flight = mailbox.take_all().len();
        timer.clear();
        let parked = state.connections.drain().len();
        state.publish_live();

        info!(parked, in_flight, "Event loop stopped");
    }
}

fn create_listener(config: &Config) -> io::Result<TcpListener> {
    let addr = config.listen;
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;

    socket.set_reuse_address(true)?;
    if config.linger {
        // Inherited by accepted sockets.
        socket.set_linger(Some(Duration::from_secs(1)))?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(config.backlog)?;

    Ok(socket.into())
}
