use std::sync::Arc;
use std::time::{Instant, SystemTime};

use log::trace;

use crate::error::{reason_phrase, Termination};
use crate::pool::{Pool, PoolFull, Span};
use crate::response::{ReaderResult, Response};
use crate::version::Version;

use super::{Connection, State, WriteOutcome, WriteState, CONTINUE_RESPONSE, WRITE_SCRATCH};

/// Room left in front of a chunk for its hex size line.
const CHUNK_HEAD_ROOM: usize = 8;

/// Grow-in-place buffer for serializing the response head into the
/// pool. The head is flushed as one contiguous write.
struct HeadBuf {
    span: Span,
    len: usize,
}

impl HeadBuf {
    fn new(pool: &mut Pool) -> Result<HeadBuf, PoolFull> {
        let span = pool.allocate(256)?;
        Ok(HeadBuf { span, len: 0 })
    }

    fn push(&mut self, pool: &mut Pool, bytes: &[u8]) -> Result<(), PoolFull> {
        if self.len + bytes.len() > self.span.len() {
            let want = (self.len + bytes.len()).max(self.span.len() * 2);
            self.span = pool.reallocate(self.span, want)?;
        }
        pool.write_into(self.span, self.len, bytes);
        self.len += bytes.len();
        Ok(())
    }
}

impl Connection {
    /// Attaches a response and switches the automaton to the
    /// response-writing branch. The serialized head consists of the
    /// status line, the caller's headers, and the injected `Date`,
    /// `Content-Length`/`Transfer-Encoding` and `Connection` headers;
    /// caller-supplied duplicates of the injected names are dropped.
    pub(crate) fn start_response(&mut self, status: u16, response: Arc<Response>) {
        let size = response.total_size();
        let suppress = self.head_request || status < 200 || status == 204 || status == 304;
        let chunked =
            !suppress && size.is_none() && self.version == Version::Http11 && !self.must_close;
        if !suppress && size.is_none() && !chunked {
            // identity body terminated by connection close
            self.must_close = true;
        }
        let close = self.must_close || !self.keep_alive;

        let head = self.serialize_head(status, &response, size, chunked, close);
        let head = match head {
            Ok(head) => head,
            Err(PoolFull) => {
                self.callbacks.log(format_args!(
                    "{}: pool exhausted serializing response head",
                    self.peer
                ));
                self.close_with(Termination::WithError);
                return;
            }
        };
        self.response_status = status;
        self.response = Some(response);
        self.write = WriteState {
            flush: head.span,
            flush_len: head.len,
            flushed: 0,
            scratch: Span::empty(),
            body_pos: 0,
            body_left: if suppress { Some(0) } else { size },
            chunked,
            suppress_body: suppress,
            final_frame: false,
        };
        self.state = State::HeadersSending;
        trace!("{}: responding {} {}", self.peer, status, reason_phrase(status));
    }

    fn serialize_head(
        &mut self,
        status: u16,
        response: &Response,
        size: Option<u64>,
        chunked: bool,
        close: bool,
    ) -> Result<HeadBuf, PoolFull> {
        let mut head = HeadBuf::new(&mut self.pool)?;
        let status_line = format!(
            "{} {} {}\r\n",
            self.version,
            status,
            reason_phrase(status)
        );
        head.push(&mut self.pool, status_line.as_bytes())?;
        let date = format!("Date: {}\r\n", httpdate::fmt_http_date(SystemTime::now()));
        head.push(&mut self.pool, date.as_bytes())?;

        let mut fail = None;
        response.for_each_header(|name, value| {
            if name.eq_ignore_ascii_case("date")
                || name.eq_ignore_ascii_case("content-length")
                || name.eq_ignore_ascii_case("connection")
                || name.eq_ignore_ascii_case("transfer-encoding")
            {
                return true;
            }
            let line = format!("{}: {}\r\n", name, value);
            if let Err(e) = head.push(&mut self.pool, line.as_bytes()) {
                fail = Some(e);
                return false;
            }
            true
        });
        if let Some(e) = fail {
            return Err(e);
        }

        if chunked {
            head.push(&mut self.pool, b"Transfer-Encoding: chunked\r\n")?;
        } else if let Some(n) = size {
            let line = format!("Content-Length: {}\r\n", n);
            head.push(&mut self.pool, line.as_bytes())?;
        }
        let connection = if close {
            b"Connection: close\r\n\r\n" as &[u8]
        } else {
            b"Connection: keep-alive\r\n\r\n" as &[u8]
        };
        head.push(&mut self.pool, connection)?;
        Ok(head)
    }

    /// After the head is flushed: pick the body branch.
    pub(super) fn begin_body(&mut self) {
        if self.write.suppress_body || self.write.body_left == Some(0) {
            self.state = State::BodySent;
        } else if self.write.chunked {
            self.state = State::ChunkedBodyUnready;
        } else {
            self.state = State::NormalBodyUnready;
        }
    }

    fn ensure_scratch(&mut self) -> Result<Span, Termination> {
        if self.write.scratch.is_empty() {
            let want = WRITE_SCRATCH
                .min(self.pool.remaining().saturating_sub(16))
                .max(64);
            match self.pool.allocate(want) {
                Ok(span) => self.write.scratch = span,
                Err(PoolFull) => {
                    self.callbacks.log(format_args!(
                        "{}: pool exhausted allocating body scratch",
                        self.peer
                    ));
                    return Err(Termination::WithError);
                }
            }
        }
        Ok(self.write.scratch)
    }

    /// Produces the next piece of an identity body. In-memory payloads
    /// are written straight from the response buffer; producer
    /// callbacks fill the pool scratch region.
    pub(super) fn fill_normal_body(&mut self) {
        if self.write.flushed < self.write.flush_len {
            self.state = State::NormalBodyReady;
            return;
        }
        let response = match self.response {
            Some(ref r) => Arc::clone(r),
            None => {
                self.close_with(Termination::WithError);
                return;
            }
        };
        if response.data().is_some() {
            if self.write.body_left == Some(0) {
                self.state = State::BodySent;
            } else {
                self.state = State::NormalBodyReady;
            }
            return;
        }
        let scratch = match self.ensure_scratch() {
            Ok(span) => span,
            Err(t) => {
                self.close_with(t);
                return;
            }
        };
        let cap = match self.write.body_left {
            Some(left) => (scratch.len() as u64).min(left) as usize,
            None => scratch.len(),
        };
        let pos = self.write.body_pos;
        let result = response.produce(pos, &mut self.pool.get_mut(scratch)[..cap]);
        match result {
            ReaderResult::Data(0) | ReaderResult::Again => {
                self.state = State::NormalBodyUnready;
            }
            ReaderResult::Data(n) => {
                let n = n.min(cap);
                self.write.flush = scratch.slice(0, n);
                self.write.flush_len = n;
                self.write.flushed = 0;
                self.write.body_pos += n as u64;
                if let Some(left) = self.write.body_left {
                    self.write.body_left = Some(left - n as u64);
                }
                self.state = State::NormalBodyReady;
            }
            ReaderResult::End => {
                match self.write.body_left {
                    Some(left) if left > 0 => {
                        // producer ended short of the declared length;
                        // the only safe move is dropping the connection
                        self.callbacks.log(format_args!(
                            "{}: body producer ended {} bytes early",
                            self.peer, left
                        ));
                        self.close_with(Termination::WithError);
                    }
                    _ => self.state = State::BodySent,
                }
            }
            ReaderResult::Error => {
                self.callbacks
                    .log(format_args!("{}: body producer failed", self.peer));
                self.close_with(Termination::WithError);
            }
        }
    }

    /// Produces the next chunk frame (`size-hex CRLF data CRLF`), or
    /// the terminal `0 CRLF CRLF`.
    pub(super) fn fill_chunked_body(&mut self) {
        if self.write.flushed < self.write.flush_len {
            self.state = State::ChunkedBodyReady;
            return;
        }
        if self.write.final_frame {
            self.state = State::FootersSent;
            return;
        }
        let response = match self.response {
            Some(ref r) => Arc::clone(r),
            None => {
                self.close_with(Termination::WithError);
                return;
            }
        };
        let scratch = match self.ensure_scratch() {
            Ok(span) => span,
            Err(t) => {
                self.close_with(t);
                return;
            }
        };
        let cap = scratch.len() - CHUNK_HEAD_ROOM - 2;
        let pos = self.write.body_pos;
        let data_at = CHUNK_HEAD_ROOM;
        let result = {
            let buf = self.pool.get_mut(scratch);
            response.produce(pos, &mut buf[data_at..data_at + cap])
        };
        match result {
            ReaderResult::Data(0) | ReaderResult::Again => {
                self.state = State::ChunkedBodyUnready;
            }
            ReaderResult::Data(n) => {
                let n = n.min(cap);
                let head = format!("{:x}\r\n", n);
                let start = data_at - head.len();
                self.pool.write_into(scratch, start, head.as_bytes());
                self.pool.write_into(scratch, data_at + n, b"\r\n");
                self.write.flush = scratch.slice(start, data_at + n + 2);
                self.write.flush_len = self.write.flush.len();
                self.write.flushed = 0;
                self.write.body_pos += n as u64;
                self.state = State::ChunkedBodyReady;
            }
            ReaderResult::End => {
                self.pool.write_into(scratch, 0, b"0\r\n\r\n");
                self.write.flush = scratch.slice(0, 5);
                self.write.flush_len = 5;
                self.write.flushed = 0;
                self.write.final_frame = true;
                self.state = State::ChunkedBodyReady;
            }
            ReaderResult::Error => {
                self.callbacks
                    .log(format_args!("{}: body producer failed", self.peer));
                self.close_with(Termination::WithError);
            }
        }
    }

    /// Pushes pending output to the transport; covers ContinueSending,
    /// HeadersSending and the body-ready states.
    pub(super) fn flush_output(&mut self) -> WriteOutcome {
        match self.state {
            State::ContinueSending => {
                let pending = &CONTINUE_RESPONSE[self.continue_offset..];
                match self.transport.send(pending) {
                    Ok(n) => {
                        self.continue_offset += n;
                        self.last_activity = Instant::now();
                        if self.continue_offset == CONTINUE_RESPONSE.len() {
                            self.state = State::ContinueSent;
                        }
                        WriteOutcome::Progress
                    }
                    Err(e) => self.write_error(e),
                }
            }
            State::HeadersSending | State::NormalBodyReady | State::ChunkedBodyReady
                if self.write.flushed < self.write.flush_len =>
            {
                let result = {
                    let bytes = self.pool.get(self.write.flush);
                    let pending = &bytes[self.write.flushed..self.write.flush_len];
                    self.transport.send(pending)
                };
                match result {
                    Ok(n) => {
                        self.write.flushed += n;
                        self.last_activity = Instant::now();
                        if self.write.flushed == self.write.flush_len {
                            self.write.flush = Span::empty();
                            self.write.flush_len = 0;
                            self.write.flushed = 0;
                            self.state = match self.state {
                                State::HeadersSending => State::HeadersSent,
                                State::NormalBodyReady => {
                                    if self.write.body_left == Some(0) {
                                        State::BodySent
                                    } else {
                                        State::NormalBodyUnready
                                    }
                                }
                                State::ChunkedBodyReady => {
                                    if self.write.final_frame {
                                        State::FootersSent
                                    } else {
                                        State::ChunkedBodyUnready
                                    }
                                }
                                other => other,
                            };
                        }
                        WriteOutcome::Progress
                    }
                    Err(e) => self.write_error(e),
                }
            }
            State::NormalBodyReady => {
                // streamed straight from the in-memory payload
                let response = match self.response {
                    Some(ref r) => Arc::clone(r),
                    None => {
                        self.close_with(Termination::WithError);
                        return WriteOutcome::Closed;
                    }
                };
                let data = match response.data() {
                    Some(data) => data,
                    None => return WriteOutcome::WouldBlock,
                };
                let pos = self.write.body_pos as usize;
                if pos >= data.len() {
                    self.state = State::BodySent;
                    return WriteOutcome::Progress;
                }
                match self.transport.send(&data[pos..]) {
                    Ok(n) => {
                        self.write.body_pos += n as u64;
                        if let Some(left) = self.write.body_left {
                            self.write.body_left = Some(left.saturating_sub(n as u64));
                        }
                        self.last_activity = Instant::now();
                        if self.write.body_pos as usize >= data.len() {
                            self.state = State::BodySent;
                        }
                        WriteOutcome::Progress
                    }
                    Err(e) => self.write_error(e),
                }
            }
            _ => WriteOutcome::WouldBlock,
        }
    }

    fn write_error(&mut self, e: std::io::Error) -> WriteOutcome {
        match e.kind() {
            std::io::ErrorKind::WouldBlock => WriteOutcome::WouldBlock,
            std::io::ErrorKind::Interrupted => WriteOutcome::Progress,
            kind => {
                self.callbacks
                    .log(format_args!("{}: write failed: {}", self.peer, e));
                let termination = if self.transport.is_tls()
                    && kind == std::io::ErrorKind::InvalidData
                {
                    Termination::TlsError
                } else {
                    Termination::WithError
                };
                self.close_with(termination);
                WriteOutcome::Closed
            }
        }
    }
}
