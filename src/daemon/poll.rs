use std::net::TcpStream;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, trace};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;

use crate::connection::Connection;
use crate::error::Termination;
use crate::transport::Transport;

use super::{Core, PARKED_RETRY, WAIT_CAP};

const LISTENER: Token = Token(usize::MAX - 1);
const WAKER: Token = Token(usize::MAX);

struct Entry {
    conn: Connection,
    fd: RawFd,
    registered: Option<Interest>,
}

/// Builds the transport for a freshly accepted socket and wraps it in
/// a connection. Shared by every execution mode.
pub(crate) fn accept_one(core: &Core, nonblocking: bool) -> Option<Connection> {
    loop {
        match core.listener.accept() {
            Ok((socket, peer)) => {
                if let Err(e) = prepare_socket(&socket, nonblocking) {
                    debug!("{}: socket setup failed: {}", peer, e);
                    return None;
                }
                let transport = match make_transport(core, socket) {
                    Ok(t) => t,
                    Err(e) => {
                        core.callbacks
                            .log(format_args!("{}: tls session setup failed: {}", peer, e));
                        return None;
                    }
                };
                trace!("accepted connection from {}", peer);
                core.active.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                return Some(Connection::new(
                    peer,
                    transport,
                    core.pool_size,
                    core.timeout,
                    Arc::clone(&core.callbacks),
                ));
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => return None,
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                core.callbacks.log(format_args!("accept failed: {}", e));
                return None;
            }
        }
    }
}

fn prepare_socket(socket: &TcpStream, nonblocking: bool) -> std::io::Result<()> {
    socket.set_nodelay(true)?;
    socket.set_nonblocking(nonblocking)?;
    Ok(())
}

#[cfg(feature = "tls")]
fn make_transport(core: &Core, socket: TcpStream) -> std::io::Result<Transport> {
    match core.tls {
        Some(ref config) => Transport::tls(socket, Arc::clone(config)),
        None => Ok(Transport::plain(socket)),
    }
}

#[cfg(not(feature = "tls"))]
fn make_transport(_core: &Core, socket: TcpStream) -> std::io::Result<Transport> {
    Ok(Transport::plain(socket))
}

fn desired_interest(conn: &Connection) -> Option<Interest> {
    match conn.interest() {
        (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}

fn update_registration(poll: &Poll, key: usize, entry: &mut Entry) {
    let want = if entry.conn.is_closed() {
        None
    } else {
        desired_interest(&entry.conn)
    };
    if want == entry.registered {
        return;
    }
    let result = match (entry.registered, want) {
        (None, Some(interest)) => {
            poll.registry()
                .register(&mut SourceFd(&entry.fd), Token(key), interest)
        }
        (Some(_), Some(interest)) => {
            poll.registry()
                .reregister(&mut SourceFd(&entry.fd), Token(key), interest)
        }
        (Some(_), None) => poll.registry().deregister(&mut SourceFd(&entry.fd)),
        (None, None) => Ok(()),
    };
    if let Err(e) = result {
        debug!("{}: poll registration failed: {}", entry.conn.peer(), e);
        entry.conn.force_close(Termination::WithError);
    } else {
        entry.registered = want;
    }
}

fn reap(core: &Core, poll: &Poll, conns: &mut Slab<Entry>) {
    let closed: Vec<usize> = conns
        .iter()
        .filter(|(_, e)| e.conn.is_closed())
        .map(|(key, _)| key)
        .collect();
    for key in closed {
        let entry = conns.remove(key);
        if entry.registered.is_some() {
            let _ = poll.registry().deregister(&mut SourceFd(&entry.fd));
        }
        core.finish_connection(entry.conn.peer(), entry.conn.termination());
    }
}

fn poll_timeout(core: &Core, conns: &Slab<Entry>) -> Duration {
    let mut timeout = WAIT_CAP;
    let now = Instant::now();
    for (_, entry) in conns.iter() {
        if entry.conn.is_parked() {
            timeout = timeout.min(PARKED_RETRY);
        }
        if let Some(deadline) = entry.conn.deadline() {
            timeout = timeout.min(deadline.saturating_duration_since(now));
        }
    }
    if core.shutting_down() {
        timeout = timeout.min(PARKED_RETRY);
    }
    timeout.max(Duration::from_millis(1))
}

/// The internal select thread: one readiness poll over the listen
/// socket, every live connection, and the wakeup handle.
pub(crate) fn run_poll_loop(core: Arc<Core>) {
    let mut poll = match Poll::new() {
        Ok(poll) => poll,
        Err(e) => {
            error!("cannot create poller: {}", e);
            return;
        }
    };
    match Waker::new(poll.registry(), WAKER) {
        Ok(waker) => *core.waker.lock().unwrap() = Some(Arc::new(waker)),
        Err(e) => {
            error!("cannot create poll waker: {}", e);
            return;
        }
    }
    let listener_fd = core.listener.as_raw_fd();
    let mut listener_registered = false;
    let mut conns: Slab<Entry> = Slab::new();
    let mut events = Events::with_capacity(256);

    loop {
        if core.shutting_down() {
            for (_, entry) in conns.iter_mut() {
                entry.conn.shutdown_mark();
                if entry.conn.at_request_boundary() || core.drain_expired() {
                    entry.conn.force_close(Termination::DaemonShutdown);
                }
            }
        }
        reap(&core, &poll, &mut conns);
        if core.shutting_down() && conns.is_empty() {
            break;
        }

        let want_listener = !core.shutting_down() && !core.at_capacity();
        if want_listener != listener_registered {
            let result = if want_listener {
                poll.registry()
                    .register(&mut SourceFd(&listener_fd), LISTENER, Interest::READABLE)
            } else {
                poll.registry().deregister(&mut SourceFd(&listener_fd))
            };
            match result {
                Ok(()) => listener_registered = want_listener,
                Err(e) => error!("listener poll registration failed: {}", e),
            }
        }

        let timeout = poll_timeout(&core, &conns);
        match poll.poll(&mut events, Some(timeout)) {
            Ok(()) => {}
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!("poll failed: {}", e);
                break;
            }
        }

        let mut accept_ready = false;
        let mut ready: Vec<(usize, bool, bool)> = Vec::new();
        for event in events.iter() {
            match event.token() {
                WAKER => {}
                LISTENER => accept_ready = true,
                Token(key) => {
                    if conns.contains(key) {
                        ready.push((key, event.is_readable(), event.is_writable()));
                    }
                }
            }
        }

        if accept_ready {
            while !core.at_capacity() && !core.shutting_down() {
                match accept_one(&core, true) {
                    Some(conn) => {
                        let fd = conn.transport().socket().as_raw_fd();
                        let key = conns.insert(Entry { conn, fd, registered: None });
                        update_registration(&poll, key, &mut conns[key]);
                    }
                    None => break,
                }
            }
        }

        for (key, readable, writable) in ready {
            conns[key].conn.tick(readable, writable);
        }
        // idle maintenance for everyone else: timeouts, parked retries
        for (_, entry) in conns.iter_mut() {
            entry.conn.tick_idle();
        }
        for (key, entry) in conns.iter_mut() {
            update_registration(&poll, key, entry);
        }
    }

    if listener_registered {
        let _ = poll.registry().deregister(&mut SourceFd(&listener_fd));
    }
    *core.waker.lock().unwrap() = None;
}

/// Readiness sets for external-poll hosts.
#[derive(Debug, Default)]
pub struct FdSets {
    pub read: Vec<RawFd>,
    pub write: Vec<RawFd>,
}

/// Connection set for the external-poll mode; the host thread drives
/// it through [`crate::Daemon::run`].
pub(crate) struct ExternalCore {
    conns: Slab<Connection>,
}

impl ExternalCore {
    pub fn new() -> ExternalCore {
        ExternalCore { conns: Slab::new() }
    }

    pub fn fill_fd_sets(&self, core: &Core, sets: &mut FdSets) {
        sets.read.clear();
        sets.write.clear();
        if !core.at_capacity() && !core.shutting_down() {
            sets.read.push(core.listener.as_raw_fd());
        }
        for (_, conn) in self.conns.iter() {
            let (readable, writable) = conn.interest();
            let fd = conn.transport().socket().as_raw_fd();
            if readable {
                sets.read.push(fd);
            }
            if writable {
                sets.write.push(fd);
            }
        }
    }

    pub fn poll_timeout(&self) -> Option<Duration> {
        let now = Instant::now();
        let mut timeout: Option<Duration> = None;
        for (_, conn) in self.conns.iter() {
            let mut candidate: Option<Duration> = None;
            if conn.is_parked() {
                candidate = Some(PARKED_RETRY);
            }
            if let Some(deadline) = conn.deadline() {
                let left = deadline.saturating_duration_since(now);
                candidate = Some(candidate.map_or(left, |c| c.min(left)));
            }
            if let Some(c) = candidate {
                timeout = Some(timeout.map_or(c, |t| t.min(c)));
            }
        }
        timeout
    }

    /// One scheduler pass: accept what is pending, advance every
    /// connection, reap the closed ones.
    pub fn run(&mut self, core: &Core) {
        while !core.at_capacity() && !core.shutting_down() {
            match accept_one(core, true) {
                Some(conn) => {
                    self.conns.insert(conn);
                }
                None => break,
            }
        }
        for (_, conn) in self.conns.iter_mut() {
            if core.shutting_down() {
                conn.shutdown_mark();
                if conn.at_request_boundary() {
                    conn.force_close(Termination::DaemonShutdown);
                }
            }
            conn.tick(true, true);
        }
        let closed: Vec<usize> = self
            .conns
            .iter()
            .filter(|(_, c)| c.is_closed())
            .map(|(key, _)| key)
            .collect();
        for key in closed {
            let conn = self.conns.remove(key);
            core.finish_connection(conn.peer(), conn.termination());
        }
    }

    pub fn close_all(&mut self, core: &Core) {
        for (_, conn) in self.conns.iter_mut() {
            conn.force_close(Termination::DaemonShutdown);
        }
        let keys: Vec<usize> = self.conns.iter().map(|(key, _)| key).collect();
        for key in keys {
            let conn = self.conns.remove(key);
            core.finish_connection(conn.peer(), conn.termination());
        }
    }
}
