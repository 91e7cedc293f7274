//! Embeddable HTTP/1.1 server library, with optional TLS.
//!
//! minihttpd links an HTTP endpoint into a host process without
//! depending on an external web server. The crate is built around
//! three pieces: a per-connection state machine that parses requests
//! incrementally and serializes responses without blocking, a
//! scheduler offering three interchangeable execution models, and a
//! per-connection bump-allocator pool that owns all request-scoped
//! memory and is reclaimed wholesale between keep-alive requests.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use minihttpd::{DaemonBuilder, Response};
//!
//! let daemon = DaemonBuilder::new()
//!     .port(8080)
//!     .handler(|req| {
//!         let body = format!("you asked for {}\n", req.url());
//!         req.queue(200, Arc::new(Response::from_vec(body.into_bytes())));
//!         Ok(())
//!     })
//!     .start()
//!     .unwrap();
//! // ... the daemon serves in the background ...
//! daemon.stop();
//! ```
//!
//! # Execution modes
//!
//! [`ExecutionMode::ThreadPerConnection`] spawns a worker per accepted
//! socket and drives it with blocking I/O. [`ExecutionMode::InternalPoll`]
//! multiplexes every connection on one internal thread. With
//! [`ExecutionMode::ExternalPoll`] the host owns the poll loop and calls
//! [`Daemon::fill_fd_sets`], [`Daemon::poll_timeout`] and
//! [`Daemon::run`] itself.
//!
//! # Responses
//!
//! A [`Response`] is frozen once queued and may back any number of
//! simultaneous connections; share it as `Arc<Response>` and queue it
//! with a status code per request. Bodies come from memory
//! ([`Response::from_static`], [`Response::from_vec`],
//! [`Response::from_copy`]) or from a producer callback
//! ([`Response::from_reader`]) that can report "try again later" for
//! backpressure.

mod connection;
mod daemon;
mod error;
mod headers;
mod pool;
mod response;
mod transport;
mod version;

pub use connection::Request;
pub use daemon::{
    AcceptPolicy, Daemon, DaemonBuilder, ExecutionMode, FdSets, Handler, HandlerError, Logger,
    NotifyCompleted, PanicHandler, Policy, DEFAULT_POOL_SIZE, DEFAULT_POST_LIMIT,
};
pub use error::{reason_phrase, ConnectionError, Error, Termination};
pub use headers::HeaderKind;
pub use response::{InvalidHeader, ReaderResult, Response};
pub use version::Version;

#[cfg(feature = "tls")]
pub use transport::TlsInfo;
