use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{error, trace};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};

use crate::connection::Connection;
use crate::error::Termination;

use super::poll::accept_one;
use super::{Core, PARKED_RETRY, WAIT_CAP};

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);

/// Accept loop of the thread-per-connection mode: waits on the listen
/// socket alone and hands every accepted connection to a fresh worker.
pub(crate) fn run_accept_loop(core: Arc<Core>) {
    let mut poll = match Poll::new() {
        Ok(poll) => poll,
        Err(e) => {
            error!("cannot create accept poller: {}", e);
            return;
        }
    };
    match Waker::new(poll.registry(), WAKER) {
        Ok(waker) => *core.waker.lock().unwrap() = Some(Arc::new(waker)),
        Err(e) => {
            error!("cannot create accept waker: {}", e);
            return;
        }
    }
    let listener_fd = core.listener.as_raw_fd();
    let mut listener_registered = false;
    let mut events = Events::with_capacity(8);

    while !core.shutting_down() {
        // while at the connection cap the listener leaves the
        // readiness set; worker completions wake us to re-add it
        let want_listener = !core.at_capacity();
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
        match poll.poll(&mut events, Some(WAIT_CAP)) {
            Ok(()) => {}
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!("accept poll failed: {}", e);
                break;
            }
        }
        while !core.at_capacity() && !core.shutting_down() {
            // workers get blocking sockets; readiness waiting happens
            // on the socket itself via I/O timeouts
            match accept_one(&core, false) {
                Some(conn) => spawn_worker(&core, conn),
                None => break,
            }
        }
    }

    if listener_registered {
        let _ = poll.registry().deregister(&mut SourceFd(&listener_fd));
    }
    *core.waker.lock().unwrap() = None;
}

fn spawn_worker(core: &Arc<Core>, conn: Connection) {
    let mut workers = core.workers.lock().unwrap();
    workers.retain(|handle| !handle.is_finished());
    let core = Arc::clone(core);
    workers.push(std::thread::spawn(move || run_worker(core, conn)));
}

/// Drives one connection with blocking reads and writes until it
/// reaches the closed state.
fn run_worker(core: Arc<Core>, mut conn: Connection) {
    trace!("{}: worker started", conn.peer());
    loop {
        if core.shutting_down() {
            conn.shutdown_mark();
            if conn.at_request_boundary() || core.drain_expired() {
                conn.force_close(Termination::DaemonShutdown);
            }
        }
        if conn.is_closed() {
            break;
        }
        if conn.is_parked() {
            std::thread::sleep(PARKED_RETRY);
            conn.tick_idle();
            continue;
        }
        let io_timeout = io_timeout(&conn);
        {
            let socket = conn.transport().socket();
            let _ = socket.set_read_timeout(Some(io_timeout));
            let _ = socket.set_write_timeout(Some(io_timeout));
        }
        let (readable, writable) = conn.interest();
        conn.tick(readable, writable);
    }
    let peer = conn.peer();
    let termination = conn.termination();
    trace!("{}: worker finished: {:?}", peer, termination);
    drop(conn);
    core.finish_connection(peer, termination);
}

/// Blocking I/O bound: the remaining idle budget, capped so shutdown
/// and timeouts are checked regularly.
fn io_timeout(conn: &Connection) -> Duration {
    let mut timeout = WAIT_CAP;
    if let Some(deadline) = conn.deadline() {
        timeout = timeout.min(deadline.saturating_duration_since(Instant::now()));
    }
    timeout.max(Duration::from_millis(1))
}
