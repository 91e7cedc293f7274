mod poll;
mod threaded;

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::connection::Request;
use crate::error::{Error, Termination};

pub use poll::FdSets;

/// Default per-connection memory pool size.
pub const DEFAULT_POOL_SIZE: usize = 32 * 1024;
/// Default cap on decoded form uploads.
pub const DEFAULT_POST_LIMIT: usize = 64 * 1024;
/// How long `stop()` lets in-flight exchanges finish before forcibly
/// closing their sockets.
pub(crate) const STOP_DRAIN: Duration = Duration::from_secs(2);
/// Retry interval for connections parked on an unready body producer.
pub(crate) const PARKED_RETRY: Duration = Duration::from_millis(20);
/// Upper bound on any blocking wait, so shutdown is always noticed.
pub(crate) const WAIT_CAP: Duration = Duration::from_millis(500);

/// How accepted connections are driven through the state machine.
/// Fixed for the lifetime of a daemon.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExecutionMode {
    /// The accept loop runs in an internal thread and every accepted
    /// connection gets a dedicated worker thread driving blocking I/O
    /// until the connection closes.
    ThreadPerConnection,
    /// One internal thread multiplexes the listener and every live
    /// connection over a single readiness poll.
    InternalPoll,
    /// The host performs the polling and calls [`Daemon::run`];
    /// [`Daemon::fill_fd_sets`] and [`Daemon::poll_timeout`] describe
    /// what to wait for.
    ExternalPoll,
}

/// Returned by the request handler to report failure; the connection
/// answers 500 and stays usable.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HandlerError;

/// Verdict of the accept-policy callback.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Policy {
    Accept,
    Reject,
}

pub type Handler = dyn Fn(&mut Request) -> Result<(), HandlerError> + Send + Sync;
pub type AcceptPolicy = dyn Fn(&SocketAddr) -> Policy + Send + Sync;
pub type NotifyCompleted = dyn Fn(SocketAddr, Termination) + Send + Sync;
pub type Logger = dyn Fn(fmt::Arguments) + Send + Sync;
pub type PanicHandler = dyn Fn(&str) + Send + Sync;

/// Caller-registered callbacks plus the limits the connection layer
/// consults while parsing.
pub(crate) struct Callbacks {
    pub handler: Box<Handler>,
    pub accept_policy: Option<Box<AcceptPolicy>>,
    pub notify_completed: Option<Box<NotifyCompleted>>,
    pub logger: Option<Box<Logger>>,
    pub panic_handler: Option<Box<PanicHandler>>,
    pub post_limit: usize,
}

impl Callbacks {
    /// Error reporting: the external logger when one is registered,
    /// the `log` facade otherwise.
    pub fn log(&self, args: fmt::Arguments) {
        match self.logger {
            Some(ref logger) => logger(args),
            None => log::error!("{}", args),
        }
    }
}

#[cfg(feature = "tls")]
struct TlsOptions {
    cert_pem: Vec<u8>,
    key_pem: Vec<u8>,
    cipher_priority: Option<Vec<String>>,
}

/// Configures and starts a [`Daemon`].
///
/// ```no_run
/// use std::sync::Arc;
/// use minihttpd::{DaemonBuilder, Response};
///
/// let daemon = DaemonBuilder::new()
///     .port(8080)
///     .handler(|req| {
///         let body = Arc::new(Response::from_static(b"hello, world\n"));
///         req.queue(200, body);
///         Ok(())
///     })
///     .start()
///     .unwrap();
/// # daemon.stop();
/// ```
pub struct DaemonBuilder {
    mode: ExecutionMode,
    bind_addr: IpAddr,
    port: u16,
    timeout: Option<Duration>,
    max_connections: usize,
    pool_size: usize,
    post_limit: usize,
    handler: Option<Box<Handler>>,
    accept_policy: Option<Box<AcceptPolicy>>,
    notify_completed: Option<Box<NotifyCompleted>>,
    logger: Option<Box<Logger>>,
    panic_handler: Option<Box<PanicHandler>>,
    #[cfg(feature = "tls")]
    tls: Option<TlsOptions>,
}

impl Default for DaemonBuilder {
    fn default() -> DaemonBuilder {
        DaemonBuilder::new()
    }
}

impl DaemonBuilder {
    pub fn new() -> DaemonBuilder {
        DaemonBuilder {
            mode: ExecutionMode::InternalPoll,
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            timeout: None,
            max_connections: 0,
            pool_size: DEFAULT_POOL_SIZE,
            post_limit: DEFAULT_POST_LIMIT,
            handler: None,
            accept_policy: None,
            notify_completed: None,
            logger: None,
            panic_handler: None,
            #[cfg(feature = "tls")]
            tls: None,
        }
    }

    pub fn mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Listen port; 0 picks an ephemeral port, see
    /// [`Daemon::local_addr`].
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Bind address; selects IPv4 or IPv6 listening.
    pub fn bind_addr(mut self, addr: IpAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Per-connection inactivity timeout; zero means none.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = if timeout.is_zero() { None } else { Some(timeout) };
        self
    }

    /// Cap on simultaneous connections; zero means unbounded. While at
    /// the cap the listener is taken out of the readiness set.
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Size of the per-connection memory pool.
    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    /// Cap on decoded form (urlencoded/multipart) upload size.
    pub fn post_limit(mut self, limit: usize) -> Self {
        self.post_limit = limit;
        self
    }

    /// The request handler. Required.
    pub fn handler<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut Request) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.handler = Some(Box::new(f));
        self
    }

    /// Called once per request before it is admitted; a `Reject`
    /// answers 403 and closes.
    pub fn accept_policy<F>(mut self, f: F) -> Self
    where
        F: Fn(&SocketAddr) -> Policy + Send + Sync + 'static,
    {
        self.accept_policy = Some(Box::new(f));
        self
    }

    /// Called exactly once per connection with its termination code.
    pub fn notify_completed<F>(mut self, f: F) -> Self
    where
        F: Fn(SocketAddr, Termination) + Send + Sync + 'static,
    {
        self.notify_completed = Some(Box::new(f));
        self
    }

    /// Receives internal error reports instead of the `log` facade.
    pub fn logger<F>(mut self, f: F) -> Self
    where
        F: Fn(fmt::Arguments) + Send + Sync + 'static,
    {
        self.logger = Some(Box::new(f));
        self
    }

    /// Called with the panic message when a request handler panics.
    /// The panic is contained: the offending request is answered with
    /// a 500 and the connection carries on.
    pub fn panic_handler<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.panic_handler = Some(Box::new(f));
        self
    }

    /// Serve HTTPS with this PEM certificate chain and private key.
    #[cfg(feature = "tls")]
    pub fn tls(mut self, cert_pem: &[u8], key_pem: &[u8]) -> Self {
        self.tls = Some(TlsOptions {
            cert_pem: cert_pem.to_vec(),
            key_pem: key_pem.to_vec(),
            cipher_priority: None,
        });
        self
    }

    /// Restrict and order the TLS cipher suites by name.
    #[cfg(feature = "tls")]
    pub fn tls_cipher_priority<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Some(ref mut tls) = self.tls {
            tls.cipher_priority = Some(names.into_iter().map(Into::into).collect());
        }
        self
    }

    /// Binds the listen socket and brings up the scheduler for the
    /// chosen execution mode.
    pub fn start(self) -> Result<Daemon, Error> {
        let handler = self.handler.ok_or(Error::BadOptions("no request handler set"))?;
        if self.pool_size < 1024 {
            return Err(Error::BadOptions("pool size below 1 KiB"));
        }
        #[cfg(feature = "tls")]
        let tls_config = match self.tls {
            Some(ref tls) => Some(crate::transport::make_server_config(
                &tls.cert_pem,
                &tls.key_pem,
                tls.cipher_priority.as_deref(),
            )?),
            None => None,
        };

        let listener = TcpListener::bind(SocketAddr::new(self.bind_addr, self.port))?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        info!("daemon listening on {} ({:?})", local_addr, self.mode);

        let core = Arc::new(Core {
            listener,
            local_addr,
            mode: self.mode,
            callbacks: Arc::new(Callbacks {
                handler,
                accept_policy: self.accept_policy,
                notify_completed: self.notify_completed,
                logger: self.logger,
                panic_handler: self.panic_handler,
                post_limit: self.post_limit,
            }),
            timeout: self.timeout,
            pool_size: self.pool_size,
            max_connections: self.max_connections,
            shutdown: AtomicBool::new(false),
            shutdown_deadline: Mutex::new(None),
            active: AtomicUsize::new(0),
            waker: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
            external: Mutex::new(None),
            #[cfg(feature = "tls")]
            tls: tls_config,
        });

        let thread = match self.mode {
            ExecutionMode::InternalPoll => {
                let core = Arc::clone(&core);
                Some(std::thread::spawn(move || poll::run_poll_loop(core)))
            }
            ExecutionMode::ThreadPerConnection => {
                let core = Arc::clone(&core);
                Some(std::thread::spawn(move || threaded::run_accept_loop(core)))
            }
            ExecutionMode::ExternalPoll => {
                *core.external.lock().unwrap() = Some(poll::ExternalCore::new());
                None
            }
        };

        Ok(Daemon { core, thread })
    }
}

pub(crate) struct Core {
    pub listener: TcpListener,
    pub local_addr: SocketAddr,
    pub mode: ExecutionMode,
    pub callbacks: Arc<Callbacks>,
    pub timeout: Option<Duration>,
    pub pool_size: usize,
    pub max_connections: usize,
    pub shutdown: AtomicBool,
    pub shutdown_deadline: Mutex<Option<Instant>>,
    pub active: AtomicUsize,
    pub waker: Mutex<Option<Arc<mio::Waker>>>,
    pub workers: Mutex<Vec<JoinHandle<()>>>,
    pub external: Mutex<Option<poll::ExternalCore>>,
    #[cfg(feature = "tls")]
    pub tls: Option<Arc<rustls::ServerConfig>>,
}

impl Core {
    pub fn at_capacity(&self) -> bool {
        self.max_connections != 0 && self.active.load(Ordering::SeqCst) >= self.max_connections
    }

    pub fn shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn drain_expired(&self) -> bool {
        self.shutdown_deadline
            .lock()
            .unwrap()
            .map_or(false, |d| Instant::now() >= d)
    }

    /// Breaks the scheduler out of its poll. Called by any thread that
    /// changed the connection set or queued work for it.
    pub fn wake(&self) {
        if let Some(ref waker) = *self.waker.lock().unwrap() {
            let _ = waker.wake();
        }
    }

    /// Termination bookkeeping shared by every mode: fires
    /// notify-completed exactly once and releases the connection slot.
    pub fn finish_connection(&self, peer: SocketAddr, termination: Termination) {
        debug!("{}: terminated: {:?}", peer, termination);
        if let Some(ref notify) = self.callbacks.notify_completed {
            notify(peer, termination);
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.wake();
    }
}

/// A running HTTP daemon.
///
/// Dropping the daemon stops it; prefer calling [`Daemon::stop`] to
/// observe the drain explicitly.
pub struct Daemon {
    core: Arc<Core>,
    thread: Option<JoinHandle<()>>,
}

impl Daemon {
    /// Address the listen socket is bound to. With port 0 this is the
    /// ephemeral port the kernel picked.
    pub fn local_addr(&self) -> SocketAddr {
        self.core.local_addr
    }

    pub fn mode(&self) -> ExecutionMode {
        self.core.mode
    }

    /// Number of currently live connections.
    pub fn num_connections(&self) -> usize {
        self.core.active.load(Ordering::SeqCst)
    }

    /// External-poll mode: fds to wait on. The listener appears in the
    /// read set unless the connection cap is reached.
    pub fn fill_fd_sets(&self, sets: &mut FdSets) -> Result<(), Error> {
        self.with_external(|core, ext| Ok(ext.fill_fd_sets(core, sets)))
    }

    /// External-poll mode: how long the host may sleep before calling
    /// [`Daemon::run`] again.
    pub fn poll_timeout(&self) -> Option<Duration> {
        self.with_external(|_, ext| Ok(ext.poll_timeout()))
            .unwrap_or(None)
    }

    /// External-poll mode: accepts pending sockets and advances every
    /// connection one step. Sockets are non-blocking, so calling this
    /// for connections that are not actually ready is harmless.
    pub fn run(&self) -> Result<(), Error> {
        self.with_external(|core, ext| {
            ext.run(core);
            Ok(())
        })
    }

    fn with_external<T>(
        &self,
        f: impl FnOnce(&Core, &mut poll::ExternalCore) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let mut guard = self.core.external.lock().unwrap();
        match *guard {
            Some(ref mut ext) => f(&self.core, ext),
            None => Err(Error::BadOptions("daemon is not in external-poll mode")),
        }
    }

    /// Stops the daemon: marks every connection must-close, drains
    /// in-flight exchanges up to a deadline, forcibly closes the rest,
    /// closes the listen socket and joins all threads.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.core.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.core.shutdown_deadline.lock().unwrap() = Some(Instant::now() + STOP_DRAIN);
        self.core.wake();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        let workers = std::mem::take(&mut *self.core.workers.lock().unwrap());
        for worker in workers {
            let _ = worker.join();
        }
        if self.core.mode == ExecutionMode::ExternalPoll {
            let deadline = Instant::now() + STOP_DRAIN;
            loop {
                let _ = self.run();
                if self.num_connections() == 0 {
                    break;
                }
                if Instant::now() >= deadline {
                    if let Ok(()) = self.with_external(|core, ext| {
                        ext.close_all(core);
                        Ok(())
                    }) {}
                    break;
                }
                std::thread::sleep(Duration::from_millis(10));
            }
        }
        info!("daemon on {} stopped", self.core.local_addr);
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.shutdown();
    }
}
