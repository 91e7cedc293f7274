mod parser;
mod post;
mod writer;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::trace;

use crate::daemon::{Callbacks, HandlerError};
use crate::error::{ConnectionError, Termination};
use crate::headers::{HeaderKind, HeaderStore};
use crate::pool::{Pool, Span};
use crate::response::Response;
use crate::transport::Transport;
use crate::version::Version;

/// Hard cap on the request header section, independent of pool size.
pub const MAX_HEADERS_SIZE: usize = 16384;
/// Maximum length of a chunk size line. 12 bytes would do, but in theory
/// there might be extensions which we skip over.
pub const MAX_CHUNK_HEAD: usize = 128;
/// Upper bound for the body producer scratch buffer.
const WRITE_SCRATCH: usize = 8192;
/// Room kept out of the upload buffer so the response head can still be
/// serialized from the same pool.
const WRITE_RESERVE: usize = 2048;

static CONTINUE_RESPONSE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// Per-connection automaton state. `Closed` is terminal.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum State {
    /// TLS pre-state: run the handshake, then fall into `Init`.
    #[cfg(feature = "tls")]
    TlsHandshake,
    /// Freshly accepted or reset for keep-alive; no bytes of the
    /// current request seen yet.
    Init,
    /// Request line parsed; reading header lines.
    UrlReceived,
    /// Partial header line buffered; awaiting more bytes.
    HeaderPartReceived,
    /// Header section complete; pre-application decisions pending.
    HeadersReceived,
    /// Accept policy passed; reading the upload body (if any).
    HeadersProcessed,
    /// Writing the `100 Continue` interim response.
    ContinueSending,
    /// Interim response flushed; reading the upload body.
    ContinueSent,
    /// Upload body fully buffered.
    BodyReceived,
    /// Trailers of a chunked upload parsed.
    FootersReceived,
    /// Serialized status line and headers being flushed.
    HeadersSending,
    HeadersSent,
    NormalBodyReady,
    NormalBodyUnready,
    ChunkedBodyReady,
    ChunkedBodyUnready,
    BodySent,
    FootersSent,
    Closed,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum BodyKind {
    Fixed(u64),
    Chunked,
}

/// Progress of the upload body parser.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum BodyProgress {
    /// Fixed-size body, bytes left.
    Fixed(u64),
    /// Expecting the next chunk size line.
    ChunkHead,
    /// Inside a chunk, bytes left for it.
    ChunkData(u64),
    /// Expecting the CRLF after a chunk's data.
    ChunkPad,
    /// Reading trailer lines.
    Footers,
}

#[derive(Debug, Default)]
pub(crate) struct WriteState {
    /// Serialized bytes waiting to go out (head or one chunk frame).
    pub flush: Span,
    pub flush_len: usize,
    pub flushed: usize,
    /// Scratch region for the body producer.
    pub scratch: Span,
    /// Byte position within the response payload.
    pub body_pos: u64,
    /// Remaining payload for fixed-length bodies, `None` for
    /// until-close or chunked.
    pub body_left: Option<u64>,
    pub chunked: bool,
    pub suppress_body: bool,
    /// The terminal `0\r\n\r\n` frame is in the flush buffer.
    pub final_frame: bool,
}

/// One accepted socket and its in-flight request.
///
/// The connection owns its pool and header store; the pool owns every
/// request-scoped byte. The daemon drives the automaton with
/// [`Connection::tick`] on readiness and reaps it once
/// [`Connection::is_closed`] reports true.
pub struct Connection {
    pub(crate) peer: SocketAddr,
    pub(crate) transport: Transport,
    pub(crate) pool: Pool,
    pub(crate) store: HeaderStore,
    pub(crate) state: State,
    pub(crate) callbacks: Arc<Callbacks>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) last_activity: Instant,

    // read side
    pub(crate) read_buf: Span,
    pub(crate) read_have: usize,
    pub(crate) read_eof: bool,

    // parsed request line
    pub(crate) method: Span,
    pub(crate) url: Span,
    pub(crate) version: Version,
    pub(crate) head_request: bool,

    // header parsing
    pub(crate) last_header: Option<usize>,
    pub(crate) headers_size: usize,

    // upload body
    pub(crate) body_kind: Option<BodyKind>,
    pub(crate) body_progress: BodyProgress,
    pub(crate) body: Span,
    pub(crate) body_len: usize,

    pub(crate) expect_continue: bool,
    pub(crate) continue_offset: usize,

    pub(crate) keep_alive: bool,
    pub(crate) must_close: bool,

    // response side
    pub(crate) response: Option<Arc<Response>>,
    pub(crate) response_status: u16,
    pub(crate) write: WriteState,

    /// Error that produced the in-flight error page, reported once the
    /// page is flushed (or immediately when no page can be sent).
    pub(crate) pending_error: Option<ConnectionError>,
    pub(crate) termination: Option<Termination>,
    /// Set by the parser whenever it consumed buffered input.
    pub(crate) consumed_flag: bool,
}

impl Connection {
    pub fn new(
        peer: SocketAddr,
        transport: Transport,
        pool_size: usize,
        timeout: Option<Duration>,
        callbacks: Arc<Callbacks>,
    ) -> Connection {
        let mut pool = Pool::new(pool_size);
        // the read buffer lives below the mark so leftover pipelined
        // bytes survive the keep-alive reset
        let read_buf = pool
            .allocate(pool_size / 2)
            .unwrap_or_else(|_| Span::empty());
        pool.mark();
        #[cfg(feature = "tls")]
        let state = if transport.is_tls() { State::TlsHandshake } else { State::Init };
        #[cfg(not(feature = "tls"))]
        let state = State::Init;
        Connection {
            peer,
            transport,
            pool,
            store: HeaderStore::new(),
            state,
            callbacks,
            timeout,
            last_activity: Instant::now(),
            read_buf,
            read_have: 0,
            read_eof: false,
            method: Span::empty(),
            url: Span::empty(),
            version: Version::Http10,
            head_request: false,
            last_header: None,
            headers_size: 0,
            body_kind: None,
            body_progress: BodyProgress::Fixed(0),
            body: Span::empty(),
            body_len: 0,
            expect_continue: false,
            continue_offset: 0,
            keep_alive: false,
            must_close: false,
            response: None,
            response_status: 0,
            write: WriteState::default(),
            pending_error: None,
            termination: None,
            consumed_flag: false,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn is_closed(&self) -> bool {
        self.state == State::Closed
    }

    /// Parked waiting on the body producer; the scheduler retries these
    /// after a short delay instead of socket readiness.
    pub fn is_parked(&self) -> bool {
        matches!(self.state, State::NormalBodyUnready | State::ChunkedBodyUnready)
    }

    /// Between requests with nothing buffered; safe to drop during
    /// shutdown without cutting an exchange short.
    pub fn at_request_boundary(&self) -> bool {
        self.state == State::Init && self.read_have == 0
    }

    /// The termination code, once closed.
    pub fn termination(&self) -> Termination {
        self.termination.unwrap_or(Termination::CompletedOk)
    }

    /// Readiness the automaton wants next: (readable, writable).
    pub fn interest(&self) -> (bool, bool) {
        let (mut rd, mut wr) = match self.state {
            #[cfg(feature = "tls")]
            State::TlsHandshake => (true, true),
            State::Init | State::UrlReceived | State::HeaderPartReceived => (true, false),
            State::HeadersReceived
            | State::HeadersProcessed
            | State::ContinueSent
            | State::BodyReceived
            | State::FootersReceived => (true, false),
            State::ContinueSending
            | State::HeadersSending
            | State::NormalBodyReady
            | State::ChunkedBodyReady => (false, true),
            State::NormalBodyUnready | State::ChunkedBodyUnready => (false, false),
            State::HeadersSent | State::BodySent | State::FootersSent => (false, false),
            State::Closed => (false, false),
        };
        let (trd, twr) = self.transport.wants();
        rd |= trd;
        wr |= twr;
        (rd, wr)
    }

    /// Absolute deadline of the idle timeout, when one is configured.
    pub fn deadline(&self) -> Option<Instant> {
        self.timeout.map(|t| self.last_activity + t)
    }

    /// Marks the connection for close after the current exchange; used
    /// during daemon shutdown.
    pub fn shutdown_mark(&mut self) {
        self.must_close = true;
    }

    /// Drops the connection right now with the given termination code.
    pub fn force_close(&mut self, termination: Termination) {
        if self.state != State::Closed {
            self.close_with(termination);
        }
    }

    /// Advances the automaton. `readable`/`writable` reflect socket
    /// readiness; idle maintenance (parsing, dispatch, timeout) runs
    /// unconditionally.
    pub fn tick(&mut self, mut readable: bool, mut writable: bool) {
        #[cfg(feature = "tls")]
        if self.state == State::TlsHandshake && (readable || writable) {
            match self.transport.handshake() {
                Ok(true) => {
                    trace!("{}: tls handshake complete", self.peer);
                    self.state = State::Init;
                    self.last_activity = Instant::now();
                }
                Ok(false) => {
                    self.last_activity = Instant::now();
                }
                Err(e) => {
                    self.callbacks
                        .log(format_args!("{}: tls handshake failed: {}", self.peer, e));
                    self.close_with(Termination::TlsError);
                }
            }
        }
        while self.state != State::Closed {
            let mut progress = false;
            if readable && self.wants_read() {
                match self.fill_read_buffer() {
                    ReadOutcome::Progress => progress = true,
                    ReadOutcome::WouldBlock => readable = false,
                    ReadOutcome::Closed => return,
                }
            }
            progress |= self.process();
            if self.state == State::Closed {
                break;
            }
            if writable && self.wants_write() {
                match self.flush_output() {
                    WriteOutcome::Progress => progress = true,
                    WriteOutcome::WouldBlock => writable = false,
                    WriteOutcome::Closed => return,
                }
            }
            if !progress {
                break;
            }
        }
        self.check_timeout();
    }

    /// Idle-tick entry point for time-based maintenance alone.
    pub fn tick_idle(&mut self) {
        self.tick(false, false);
    }

    fn wants_read(&self) -> bool {
        !self.read_eof
            && matches!(
                self.state,
                State::Init
                    | State::UrlReceived
                    | State::HeaderPartReceived
                    | State::HeadersProcessed
                    | State::ContinueSent
                    | State::BodyReceived
            )
            && self.read_have < self.read_buf.len()
    }

    fn wants_write(&self) -> bool {
        matches!(
            self.state,
            State::ContinueSending
                | State::HeadersSending
                | State::NormalBodyReady
                | State::ChunkedBodyReady
        )
    }

    fn check_timeout(&mut self) {
        if self.state == State::Closed {
            return;
        }
        if let Some(timeout) = self.timeout {
            if self.last_activity.elapsed() > timeout {
                trace!("{}: idle timeout", self.peer);
                self.close_with(Termination::Timeout);
            }
        }
    }

    /// Non-I/O state advancement: parsing, dispatch, body production,
    /// keep-alive transitions. Returns true when anything changed.
    fn process(&mut self) -> bool {
        let mut progress = false;
        loop {
            let before = self.state;
            match self.state {
                #[cfg(feature = "tls")]
                State::TlsHandshake => {}
                State::Init | State::UrlReceived | State::HeaderPartReceived => {
                    self.parse_head();
                }
                State::HeadersReceived => self.process_headers(),
                State::HeadersProcessed | State::ContinueSent => self.read_body(),
                State::BodyReceived => {
                    if self.body_kind == Some(BodyKind::Chunked) {
                        self.parse_footers();
                    } else {
                        self.state = State::FootersReceived;
                    }
                }
                State::FootersReceived => self.dispatch(),
                State::HeadersSent => self.begin_body(),
                State::NormalBodyUnready | State::NormalBodyReady => {
                    self.fill_normal_body();
                }
                State::ChunkedBodyUnready | State::ChunkedBodyReady => {
                    self.fill_chunked_body();
                }
                State::BodySent | State::FootersSent => self.finish_request(),
                State::ContinueSending
                | State::HeadersSending
                | State::Closed => {}
            }
            if self.state == before && !self.took_read_bytes() {
                break;
            }
            progress = true;
            if self.state == State::Closed {
                break;
            }
        }
        progress
    }

    /// Whether the last processing step consumed buffered input; used
    /// to keep looping while the same state eats bytes (header lines,
    /// body chunks).
    fn took_read_bytes(&mut self) -> bool {
        let consumed = self.consumed_flag;
        self.consumed_flag = false;
        consumed
    }

    pub(crate) fn close_with(&mut self, termination: Termination) {
        self.transport.close();
        self.response = None;
        self.state = State::Closed;
        if self.termination.is_none() {
            self.termination = Some(termination);
        }
    }

    /// Protocol or resource error: emit the best-effort error page when
    /// one applies and the response has not started, then close.
    pub(crate) fn protocol_error(&mut self, err: ConnectionError) {
        let started = matches!(
            self.state,
            State::HeadersSending
                | State::HeadersSent
                | State::NormalBodyReady
                | State::NormalBodyUnready
                | State::ChunkedBodyReady
                | State::ChunkedBodyUnready
                | State::BodySent
                | State::FootersSent
        );
        self.callbacks
            .log(format_args!("{}: {}", self.peer, err));
        match err.http_status() {
            Some((status, reason)) if !started => {
                self.must_close = true;
                self.pending_error = Some(err);
                let page = error_page(status, reason);
                let response = Arc::new(Response::from_vec(page));
                let _ = response.add_header("Content-Type", "text/html");
                self.start_response(status, response);
            }
            _ => {
                self.close_with(err.termination());
            }
        }
    }

    /// After BodySent/FootersSent: either reset for the next keep-alive
    /// request or close.
    fn finish_request(&mut self) {
        if let Some(err) = self.pending_error.take() {
            self.close_with(err.termination());
            return;
        }
        if self.must_close || !self.keep_alive || self.read_eof {
            self.close_with(Termination::CompletedOk);
            return;
        }
        trace!("{}: keep-alive, resetting for next request", self.peer);
        self.response = None;
        self.response_status = 0;
        self.store.clear();
        self.pool.reset_to_mark();
        self.method = Span::empty();
        self.url = Span::empty();
        self.head_request = false;
        self.last_header = None;
        self.headers_size = 0;
        self.body_kind = None;
        self.body_progress = BodyProgress::Fixed(0);
        self.body = Span::empty();
        self.body_len = 0;
        self.expect_continue = false;
        self.continue_offset = 0;
        self.keep_alive = false;
        self.write = WriteState::default();
        self.state = State::Init;
    }

    /// Runs the application request handler with a [`Request`] view and
    /// queues whatever it responded with.
    fn dispatch(&mut self) {
        if let Err(err) = self.decode_post() {
            self.protocol_error(err);
            return;
        }
        self.decode_cookies();
        let callbacks = Arc::clone(&self.callbacks);
        let mut queued: Option<(u16, Arc<Response>)> = None;
        let result = {
            let mut request = Request { conn: self, queued: &mut queued };
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                (callbacks.handler)(&mut request)
            }))
        };
        let result = match result {
            Ok(result) => result,
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .copied()
                    .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
                    .unwrap_or("handler panicked");
                match self.callbacks.panic_handler {
                    Some(ref hook) => hook(message),
                    None => self
                        .callbacks
                        .log(format_args!("{}: handler panicked: {}", self.peer, message)),
                }
                Err(HandlerError)
            }
        };
        match result {
            Ok(()) => match queued {
                Some((status, response)) => self.start_response(status, response),
                None => self.protocol_error(ConnectionError::Internal),
            },
            Err(HandlerError) => {
                // application errors do not terminate the connection;
                // answer 500 and carry on
                self.callbacks
                    .log(format_args!("{}: {}", self.peer, ConnectionError::Application));
                let page = error_page(500, "Internal Server Error");
                let response = Arc::new(Response::from_vec(page));
                let _ = response.add_header("Content-Type", "text/html");
                self.start_response(500, response);
            }
        }
    }
}

pub(crate) fn error_page(status: u16, reason: &str) -> Vec<u8> {
    format!(
        "<html><head><title>{code} {reason}</title></head>\
         <body><h1>{code} {reason}</h1></body></html>\n",
        code = status,
        reason = reason
    )
    .into_bytes()
}

pub(crate) enum ReadOutcome {
    Progress,
    WouldBlock,
    Closed,
}

pub(crate) enum WriteOutcome {
    Progress,
    WouldBlock,
    Closed,
}

/// The application's view of one parsed request, alive for the duration
/// of the handler call.
pub struct Request<'c> {
    conn: &'c mut Connection,
    queued: &'c mut Option<(u16, Arc<Response>)>,
}

impl<'c> Request<'c> {
    pub fn method(&self) -> &str {
        self.conn.pool.str(self.conn.method)
    }

    /// Request path with the query string stripped; query arguments are
    /// available as [`HeaderKind::GetArg`] entries.
    pub fn url(&self) -> &str {
        self.conn.pool.str(self.conn.url)
    }

    pub fn version(&self) -> Version {
        self.conn.version
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.conn.peer
    }

    /// First request header stored under `name`, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.value(HeaderKind::Request, name)
    }

    /// First stored value of the given kind under `name`.
    pub fn value(&self, kind: HeaderKind, name: &str) -> Option<&str> {
        self.conn.store.lookup(&self.conn.pool, kind, name)
    }

    /// Iterates stored values in insertion order, optionally filtered
    /// by kind, until the callback returns false. Returns the number of
    /// entries visited.
    pub fn each<F>(&self, kind: Option<HeaderKind>, f: F) -> usize
    where
        F: FnMut(&str, &str) -> bool,
    {
        self.conn.store.each(&self.conn.pool, kind, f)
    }

    /// The buffered upload body.
    pub fn body(&self) -> &[u8] {
        self.conn.pool.get(self.conn.body.slice(0, self.conn.body_len))
    }

    /// Attaches a response; the first queue wins and later calls report
    /// false. The connection holds one reference until it finishes with
    /// the response.
    pub fn queue(&mut self, status: u16, response: Arc<Response>) -> bool {
        if self.queued.is_some() {
            return false;
        }
        *self.queued = Some((status, response));
        true
    }

    /// Negotiated TLS parameters, `None` on plain connections.
    #[cfg(feature = "tls")]
    pub fn tls_info(&self) -> Option<crate::transport::TlsInfo> {
        self.conn.transport.tls_info()
    }
}

#[cfg(test)]
mod test {
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    use super::{Connection, Request, State};
    use crate::daemon::{Callbacks, HandlerError, Policy};
    use crate::error::Termination;
    use crate::headers::HeaderKind;
    use crate::response::{ReaderResult, Response};
    use crate::transport::Transport;

    fn callbacks<F>(handler: F) -> Arc<Callbacks>
    where
        F: Fn(&mut Request) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        Arc::new(Callbacks {
            handler: Box::new(handler),
            accept_policy: None,
            notify_completed: None,
            logger: None,
            panic_handler: None,
            post_limit: 64 * 1024,
        })
    }

    fn pair(callbacks: Arc<Callbacks>, timeout: Option<Duration>) -> (TcpStream, Connection) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        client
            .set_read_timeout(Some(Duration::from_millis(10)))
            .unwrap();
        let conn = Connection::new(peer, Transport::plain(server), 32 * 1024, timeout, callbacks);
        (client, conn)
    }

    fn hello_callbacks() -> Arc<Callbacks> {
        callbacks(|req| {
            req.queue(200, Arc::new(Response::from_static(b"hello, world\n")));
            Ok(())
        })
    }

    /// Interleaves machine ticks with client reads until `done` says
    /// the collected output is complete (or the connection dies).
    fn exchange<F>(conn: &mut Connection, client: &mut TcpStream, input: &[u8], done: F) -> Vec<u8>
    where
        F: Fn(&[u8]) -> bool,
    {
        if !input.is_empty() {
            client.write_all(input).unwrap();
        }
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            conn.tick(true, true);
            match client.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(ref e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => panic!("client read failed: {}", e),
            }
            if done(&out) {
                break;
            }
            if conn.is_closed() {
                // drain whatever is still in flight
                while let Ok(n) = client.read(&mut buf) {
                    if n == 0 {
                        break;
                    }
                    out.extend_from_slice(&buf[..n]);
                }
                break;
            }
        }
        out
    }

    fn header_block(out: &[u8]) -> String {
        let end = out
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .map_or(out.len(), |i| i + 4);
        String::from_utf8_lossy(&out[..end]).into_owned()
    }

    #[test]
    fn test_get_close() {
        let (mut client, mut conn) = pair(hello_callbacks(), None);
        let out = exchange(
            &mut conn,
            &mut client,
            b"GET / HTTP/1.0\r\n\r\n",
            |out| out.ends_with(b"hello, world\n"),
        );
        let head = header_block(&out);
        assert!(head.starts_with("HTTP/1.0 200 OK\r\n"), "head: {}", head);
        assert!(head.contains("Content-Length: 13\r\n"));
        assert!(head.contains("Connection: close\r\n"));
        assert!(head.contains("Date: "));
        assert!(out.ends_with(b"\r\n\r\nhello, world\n") || out.ends_with(b"hello, world\n"));
        assert!(conn.is_closed());
        assert_eq!(conn.termination(), Termination::CompletedOk);
    }

    #[test]
    fn test_keep_alive_two_requests() {
        let urls = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&urls);
        let cb = callbacks(move |req| {
            seen.lock().unwrap().push(req.url().to_string());
            req.queue(200, Arc::new(Response::from_static(b"ok")));
            Ok(())
        });
        let (mut client, mut conn) = pair(cb, None);
        let out = exchange(
            &mut conn,
            &mut client,
            b"GET /a HTTP/1.1\r\nHost: x\r\n\r\nGET /b HTTP/1.1\r\nHost: x\r\n\r\n",
            |out| String::from_utf8_lossy(out).matches("\r\n\r\nok").count() >= 2,
        );
        assert_eq!(*urls.lock().unwrap(), ["/a", "/b"]);
        let text = String::from_utf8_lossy(&out);
        assert_eq!(text.matches("HTTP/1.1 200 OK").count(), 2);
        assert!(text.contains("Connection: keep-alive"));
        // the socket is still open after the second response
        assert!(!conn.is_closed());
    }

    #[test]
    fn test_pool_mark_restored_between_requests() {
        let (mut client, mut conn) = pair(hello_callbacks(), None);
        exchange(&mut conn, &mut client, b"GET /a HTTP/1.1\r\nHost: x\r\n\r\n", |out| {
            out.ends_with(b"hello, world\n")
        });
        assert_eq!(conn.state, State::Init);
        let after_first = conn.pool.used();
        exchange(&mut conn, &mut client, b"GET /b HTTP/1.1\r\nHost: x\r\n\r\n", |out| {
            out.ends_with(b"hello, world\n")
        });
        assert_eq!(conn.state, State::Init);
        assert_eq!(conn.pool.used(), after_first);
    }

    #[test]
    fn test_expect_continue() {
        let body = Arc::new(Mutex::new(Vec::new()));
        let got = Arc::clone(&body);
        let cb = callbacks(move |req| {
            got.lock().unwrap().extend_from_slice(req.body());
            req.queue(200, Arc::new(Response::from_static(b"done")));
            Ok(())
        });
        let (mut client, mut conn) = pair(cb, None);
        let out = exchange(
            &mut conn,
            &mut client,
            b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 4\r\nExpect: 100-continue\r\n\r\n",
            |out| String::from_utf8_lossy(out).contains("100 Continue\r\n\r\n"),
        );
        assert!(String::from_utf8_lossy(&out).starts_with("HTTP/1.1 100 Continue\r\n\r\n"));
        let out = exchange(&mut conn, &mut client, b"ping", |out| out.ends_with(b"done"));
        assert!(String::from_utf8_lossy(&out).contains("200 OK"));
        assert_eq!(*body.lock().unwrap(), b"ping");
    }

    #[test]
    fn test_chunked_request() {
        let body = Arc::new(Mutex::new(Vec::new()));
        let got = Arc::clone(&body);
        let cb = callbacks(move |req| {
            got.lock().unwrap().extend_from_slice(req.body());
            req.queue(200, Arc::new(Response::from_static(b"ok")));
            Ok(())
        });
        let (mut client, mut conn) = pair(cb, None);
        let out = exchange(
            &mut conn,
            &mut client,
            b"POST / HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n\
              5\r\nhello\r\n0\r\n\r\n",
            |out| out.ends_with(b"ok"),
        );
        assert!(String::from_utf8_lossy(&out).contains("200 OK"));
        assert_eq!(*body.lock().unwrap(), b"hello");
    }

    #[test]
    fn test_chunked_request_with_trailers() {
        let trailer = Arc::new(Mutex::new(None));
        let got = Arc::clone(&trailer);
        let cb = callbacks(move |req| {
            *got.lock().unwrap() = req
                .value(HeaderKind::Footer, "X-Checksum")
                .map(|v| v.to_string());
            req.queue(200, Arc::new(Response::from_static(b"ok")));
            Ok(())
        });
        let (mut client, mut conn) = pair(cb, None);
        exchange(
            &mut conn,
            &mut client,
            b"POST / HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n\
              4\r\nWiki\r\n5\r\npedia\r\n0\r\nX-Checksum: abc\r\n\r\n",
            |out| out.ends_with(b"ok"),
        );
        assert_eq!(trailer.lock().unwrap().as_deref(), Some("abc"));
    }

    #[test]
    fn test_malformed_request_line() {
        let (mut client, mut conn) = pair(hello_callbacks(), None);
        let out = exchange(
            &mut conn,
            &mut client,
            b"GET /\x00 HTTP/1.1\r\n\r\n",
            |_| false,
        );
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("400 Bad Request"), "got: {}", text);
        assert!(text.contains("Connection: close"));
        assert!(conn.is_closed());
        assert_eq!(conn.termination(), Termination::WithError);
    }

    #[test]
    fn test_content_length_with_chunked_is_rejected() {
        let (mut client, mut conn) = pair(hello_callbacks(), None);
        let out = exchange(
            &mut conn,
            &mut client,
            b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\
              Transfer-Encoding: chunked\r\n\r\n",
            |_| false,
        );
        assert!(String::from_utf8_lossy(&out).contains("400 Bad Request"));
        assert!(conn.is_closed());
    }

    #[test]
    fn test_unknown_version() {
        let (mut client, mut conn) = pair(hello_callbacks(), None);
        let out = exchange(&mut conn, &mut client, b"GET / HTTP/4.2\r\n\r\n", |_| false);
        assert!(String::from_utf8_lossy(&out).contains("505 HTTP Version Not Supported"));
        assert!(conn.is_closed());
    }

    #[test]
    fn test_http10_default_close_and_opt_in_keep_alive() {
        let (mut client, mut conn) = pair(hello_callbacks(), None);
        let out = exchange(
            &mut conn,
            &mut client,
            b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n",
            |out| out.ends_with(b"hello, world\n"),
        );
        assert!(String::from_utf8_lossy(&out).contains("Connection: keep-alive"));
        assert!(!conn.is_closed());
    }

    #[test]
    fn test_header_folding_and_case_insensitive_lookup() {
        let seen = Arc::new(Mutex::new(None));
        let got = Arc::clone(&seen);
        let cb = callbacks(move |req| {
            *got.lock().unwrap() = req.header("x-long").map(|v| v.to_string());
            assert_eq!(req.header("X-LONG"), req.header("x-long"));
            req.queue(200, Arc::new(Response::from_static(b"ok")));
            Ok(())
        });
        let (mut client, mut conn) = pair(cb, None);
        exchange(
            &mut conn,
            &mut client,
            b"GET / HTTP/1.1\r\nHost: x\r\nX-Long: first\r\n  second\r\n\r\n",
            |out| out.ends_with(b"ok"),
        );
        assert_eq!(seen.lock().unwrap().as_deref(), Some("first second"));
    }

    #[test]
    fn test_bare_lf_line_endings() {
        let (mut client, mut conn) = pair(hello_callbacks(), None);
        let out = exchange(
            &mut conn,
            &mut client,
            b"GET / HTTP/1.1\nHost: x\nConnection: close\n\n",
            |out| out.ends_with(b"hello, world\n"),
        );
        assert!(String::from_utf8_lossy(&out).contains("200 OK"));
    }

    #[test]
    fn test_query_and_cookie_decoding() {
        let seen = Arc::new(Mutex::new((None, None, None)));
        let got = Arc::clone(&seen);
        let cb = callbacks(move |req| {
            let mut s = got.lock().unwrap();
            s.0 = req.value(HeaderKind::GetArg, "q").map(|v| v.to_string());
            s.1 = req.value(HeaderKind::GetArg, "lang").map(|v| v.to_string());
            s.2 = req.value(HeaderKind::Cookie, "session").map(|v| v.to_string());
            assert_eq!(req.url(), "/search");
            req.queue(200, Arc::new(Response::from_static(b"ok")));
            Ok(())
        });
        let (mut client, mut conn) = pair(cb, None);
        exchange(
            &mut conn,
            &mut client,
            b"GET /search?q=rust+http&lang=e%6e HTTP/1.1\r\nHost: x\r\n\
              Cookie: session=abc123; theme=dark\r\n\r\n",
            |out| out.ends_with(b"ok"),
        );
        let s = seen.lock().unwrap();
        assert_eq!(s.0.as_deref(), Some("rust http"));
        assert_eq!(s.1.as_deref(), Some("en"));
        assert_eq!(s.2.as_deref(), Some("abc123"));
    }

    #[test]
    fn test_urlencoded_post_args() {
        let seen = Arc::new(Mutex::new(None));
        let got = Arc::clone(&seen);
        let cb = callbacks(move |req| {
            *got.lock().unwrap() = req.value(HeaderKind::PostArg, "name").map(|v| v.to_string());
            req.queue(200, Arc::new(Response::from_static(b"ok")));
            Ok(())
        });
        let (mut client, mut conn) = pair(cb, None);
        exchange(
            &mut conn,
            &mut client,
            b"POST /submit HTTP/1.1\r\nHost: x\r\n\
              Content-Type: application/x-www-form-urlencoded\r\n\
              Content-Length: 20\r\n\r\nname=alan+turing&x=1",
            |out| out.ends_with(b"ok"),
        );
        assert_eq!(seen.lock().unwrap().as_deref(), Some("alan turing"));
    }

    #[test]
    fn test_multipart_post_args() {
        let seen = Arc::new(Mutex::new(None));
        let got = Arc::clone(&seen);
        let cb = callbacks(move |req| {
            *got.lock().unwrap() = req.value(HeaderKind::PostArg, "field").map(|v| v.to_string());
            req.queue(200, Arc::new(Response::from_static(b"ok")));
            Ok(())
        });
        let body = b"--XX\r\nContent-Disposition: form-data; name=\"field\"\r\n\r\nvalue!\r\n--XX--\r\n";
        let request = format!(
            "POST / HTTP/1.1\r\nHost: x\r\n\
             Content-Type: multipart/form-data; boundary=XX\r\n\
             Content-Length: {}\r\n\r\n",
            body.len()
        );
        let mut input = request.into_bytes();
        input.extend_from_slice(body);
        let (mut client, mut conn) = pair(cb, None);
        exchange(&mut conn, &mut client, &input, |out| out.ends_with(b"ok"));
        assert_eq!(seen.lock().unwrap().as_deref(), Some("value!"));
    }

    #[test]
    fn test_head_suppresses_body() {
        let (mut client, mut conn) = pair(hello_callbacks(), None);
        let out = exchange(
            &mut conn,
            &mut client,
            b"HEAD / HTTP/1.1\r\nHost: x\r\n\r\n",
            |out| out.windows(4).any(|w| w == b"\r\n\r\n"),
        );
        // give any stray body bytes a chance to show up
        std::thread::sleep(Duration::from_millis(20));
        let out = {
            let mut out = out;
            let mut buf = [0u8; 256];
            conn.tick(true, true);
            if let Ok(n) = client.read(&mut buf) {
                out.extend_from_slice(&buf[..n]);
            }
            out
        };
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("Content-Length: 13"));
        assert!(text.ends_with("\r\n\r\n"), "unexpected body: {}", text);
    }

    #[test]
    fn test_chunked_response_producer() {
        let waited = Arc::new(AtomicBool::new(false));
        let gate = Arc::clone(&waited);
        let cb = callbacks(move |req| {
            let gate = Arc::clone(&gate);
            let response = Response::from_reader(None, move |pos, buf| {
                if pos == 0 {
                    buf[..100].fill(b'a');
                    ReaderResult::Data(100)
                } else if pos == 100 {
                    if !gate.swap(true, Ordering::SeqCst) {
                        return ReaderResult::Again;
                    }
                    buf[..200].fill(b'b');
                    ReaderResult::Data(200)
                } else {
                    ReaderResult::End
                }
            });
            req.queue(200, Arc::new(response));
            Ok(())
        });
        let (mut client, mut conn) = pair(cb, None);
        let out = exchange(
            &mut conn,
            &mut client,
            b"GET / HTTP/1.1\r\nHost: x\r\n\r\n",
            |out| out.ends_with(b"0\r\n\r\n"),
        );
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("Transfer-Encoding: chunked"));
        assert!(text.contains("64\r\n"), "missing 100-byte chunk: {}", text);
        assert!(text.contains("c8\r\n"), "missing 200-byte chunk: {}", text);
        assert!(out.ends_with(b"0\r\n\r\n"));
        assert!(waited.load(Ordering::SeqCst));
    }

    #[test]
    fn test_response_refcount_restored() {
        let shared = Arc::new(Response::from_static(b"shared"));
        let baseline = Arc::strong_count(&shared);
        let handler_copy = Arc::clone(&shared);
        let cb = callbacks(move |req| {
            req.queue(200, Arc::clone(&handler_copy));
            Ok(())
        });
        let (mut client, mut conn) = pair(cb, None);
        for _ in 0..3 {
            exchange(&mut conn, &mut client, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n", |out| {
                out.ends_with(b"shared")
            });
        }
        // the handler clone is still alive, the connection holds nothing
        assert_eq!(Arc::strong_count(&shared), baseline + 1);
        drop(conn);
        // dropping the connection released its callbacks and with them
        // the handler's clone
        assert_eq!(Arc::strong_count(&shared), baseline);
    }

    #[test]
    fn test_timeout_closes_silently() {
        let cb = hello_callbacks();
        let (mut client, mut conn) = pair(cb, Some(Duration::from_millis(30)));
        client.write_all(b"GET ").unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while !conn.is_closed() && Instant::now() < deadline {
            conn.tick(true, false);
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(conn.is_closed());
        assert_eq!(conn.termination(), Termination::Timeout);
        // no bytes were written by the server
        let mut buf = [0u8; 64];
        match client.read(&mut buf) {
            Ok(0) => {}
            Ok(n) => panic!("server wrote {} bytes before timing out", n),
            Err(_) => {}
        }
    }

    #[test]
    fn test_accept_policy_reject() {
        let cb = Arc::new(Callbacks {
            handler: Box::new(|_req: &mut Request| panic!("handler must not run")),
            accept_policy: Some(Box::new(|_addr| Policy::Reject)),
            notify_completed: None,
            logger: None,
            panic_handler: None,
            post_limit: 64 * 1024,
        });
        let (mut client, mut conn) = pair(cb, None);
        let out = exchange(
            &mut conn,
            &mut client,
            b"GET / HTTP/1.1\r\nHost: x\r\n\r\n",
            |_| false,
        );
        assert!(String::from_utf8_lossy(&out).contains("403 Forbidden"));
        assert!(conn.is_closed());
    }

    #[test]
    fn test_handler_error_answers_500_and_keeps_alive() {
        let flip = Arc::new(AtomicBool::new(true));
        let state = Arc::clone(&flip);
        let cb = callbacks(move |req| {
            if state.swap(false, Ordering::SeqCst) {
                Err(HandlerError)
            } else {
                req.queue(200, Arc::new(Response::from_static(b"fine")));
                Ok(())
            }
        });
        let (mut client, mut conn) = pair(cb, None);
        let out = exchange(&mut conn, &mut client, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n", |out| {
            String::from_utf8_lossy(out).contains("</html>")
        });
        assert!(String::from_utf8_lossy(&out).contains("500 Internal Server Error"));
        assert!(!conn.is_closed());
        let out = exchange(&mut conn, &mut client, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n", |out| {
            out.ends_with(b"fine")
        });
        assert!(String::from_utf8_lossy(&out).contains("200 OK"));
    }

    #[test]
    fn test_handler_panic_is_contained() {
        let caught = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&caught);
        let cb = Arc::new(Callbacks {
            handler: Box::new(|_req: &mut Request| panic!("boom")),
            accept_policy: None,
            notify_completed: None,
            logger: None,
            panic_handler: Some(Box::new(move |message| {
                *sink.lock().unwrap() = Some(message.to_string());
            })),
            post_limit: 64 * 1024,
        });
        let (mut client, mut conn) = pair(cb, None);
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(|_| {}));
        let out = exchange(&mut conn, &mut client, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n", |out| {
            String::from_utf8_lossy(out).contains("</html>")
        });
        std::panic::set_hook(previous);
        assert!(String::from_utf8_lossy(&out).contains("500 Internal Server Error"));
        assert_eq!(caught.lock().unwrap().as_deref(), Some("boom"));
        assert!(!conn.is_closed());
    }

    #[test]
    fn test_oversized_body_gets_413() {
        let (mut client, mut conn) = pair(hello_callbacks(), None);
        let out = exchange(
            &mut conn,
            &mut client,
            b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 9999999\r\n\r\n",
            |_| false,
        );
        assert!(String::from_utf8_lossy(&out).contains("413 Payload Too Large"));
        assert!(conn.is_closed());
    }
}
