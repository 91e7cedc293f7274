use std::cmp::min;
use std::time::Instant;

use log::trace;

use crate::daemon::Policy;
use crate::error::{ConnectionError, Termination};
use crate::headers::HeaderKind;
use crate::pool::Span;
use crate::version::Version;

use super::{
    BodyKind, BodyProgress, Connection, ReadOutcome, State, MAX_CHUNK_HEAD, MAX_HEADERS_SIZE,
    WRITE_RESERVE,
};

impl Connection {
    /// Pulls bytes from the transport into the pool-owned read buffer.
    pub(super) fn fill_read_buffer(&mut self) -> ReadOutcome {
        if self.read_have >= self.read_buf.len() {
            return ReadOutcome::WouldBlock;
        }
        let span = self.read_buf;
        let have = self.read_have;
        loop {
            let result = {
                let buf = &mut self.pool.get_mut(span)[have..];
                self.transport.recv(buf)
            };
            match result {
                Ok(0) => {
                    self.read_eof = true;
                    if self.state == State::Init && self.read_have == 0 {
                        self.close_with(Termination::CompletedOk);
                        return ReadOutcome::Closed;
                    }
                    return ReadOutcome::Progress;
                }
                Ok(n) => {
                    self.read_have += n;
                    self.last_activity = Instant::now();
                    return ReadOutcome::Progress;
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    return ReadOutcome::WouldBlock;
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.callbacks
                        .log(format_args!("{}: read failed: {}", self.peer, e));
                    let termination = if self.transport.is_tls()
                        && e.kind() == std::io::ErrorKind::InvalidData
                    {
                        Termination::TlsError
                    } else {
                        Termination::WithError
                    };
                    self.close_with(termination);
                    return ReadOutcome::Closed;
                }
            }
        }
    }

    /// Drops `n` consumed bytes off the front of the read buffer. After
    /// this the buffer again holds exactly the unconsumed prefix of the
    /// inbound stream.
    pub(super) fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.read_have);
        let left = self.read_have - n;
        if left > 0 {
            self.pool.shift_down(self.read_buf, n, left);
        }
        self.read_have = left;
        self.consumed_flag = true;
    }

    /// Next complete line of the read buffer, without consuming it.
    /// CRLF is canonical but a bare CR or bare LF terminates a line
    /// too. Returns the line span (terminator excluded) and the number
    /// of bytes to consume.
    fn take_line(&self) -> Option<(Span, usize)> {
        let bytes = &self.pool.get(self.read_buf)[..self.read_have];
        for (i, &b) in bytes.iter().enumerate() {
            match b {
                b'\n' => return Some((self.read_buf.slice(0, i), i + 1)),
                b'\r' => {
                    if i + 1 < bytes.len() {
                        let eat = if bytes[i + 1] == b'\n' { i + 2 } else { i + 1 };
                        return Some((self.read_buf.slice(0, i), eat));
                    }
                    // CR at the end of the buffer: cannot yet tell CR
                    // from CRLF unless the stream already ended
                    if self.read_eof {
                        return Some((self.read_buf.slice(0, i), i + 1));
                    }
                    return None;
                }
                _ => {}
            }
        }
        None
    }

    /// Request line and header section parsing; covers the Init,
    /// UrlReceived and HeaderPartReceived states, one line per call.
    pub(super) fn parse_head(&mut self) {
        let (line, eat) = match self.take_line() {
            Some(pair) => pair,
            None => {
                if self.read_have >= self.read_buf.len() {
                    self.protocol_error(ConnectionError::HeadersTooLarge);
                } else if self.read_eof {
                    if self.state == State::Init && self.read_have == 0 {
                        self.close_with(Termination::CompletedOk);
                    } else {
                        self.protocol_error(ConnectionError::MalformedRequest);
                    }
                } else if self.state == State::UrlReceived && self.read_have > 0 {
                    self.state = State::HeaderPartReceived;
                }
                return;
            }
        };
        match self.state {
            State::Init => {
                if line.is_empty() {
                    // tolerate empty line(s) before the request line
                    self.consume(eat);
                    return;
                }
                self.headers_size = eat;
                let parsed = self.parse_request_line(line);
                self.consume(eat);
                match parsed {
                    Ok(()) => self.state = State::UrlReceived,
                    Err(e) => self.protocol_error(e),
                }
            }
            State::UrlReceived | State::HeaderPartReceived => {
                self.headers_size += eat;
                if self.headers_size > MAX_HEADERS_SIZE {
                    self.protocol_error(ConnectionError::HeadersTooLarge);
                    return;
                }
                if line.is_empty() {
                    self.consume(eat);
                    self.state = State::HeadersReceived;
                    return;
                }
                let parsed = self.parse_header_line(line, HeaderKind::Request);
                self.consume(eat);
                match parsed {
                    Ok(()) => self.state = State::UrlReceived,
                    Err(e) => self.protocol_error(e),
                }
            }
            _ => {}
        }
    }

    fn parse_request_line(&mut self, line: Span) -> Result<(), ConnectionError> {
        let (method_end, url_start, url_end, version_start, query_at) = {
            let bytes = self.pool.get(line);
            if bytes.iter().any(|&b| b < 0x20 || b == 0x7f) {
                return Err(ConnectionError::MalformedRequest);
            }
            if std::str::from_utf8(bytes).is_err() {
                return Err(ConnectionError::MalformedRequest);
            }
            let method_end = bytes
                .iter()
                .position(|&b| b == b' ')
                .ok_or(ConnectionError::MalformedRequest)?;
            let url_start = method_end + 1;
            let url_end = url_start
                + bytes[url_start..]
                    .iter()
                    .position(|&b| b == b' ')
                    .ok_or(ConnectionError::MalformedRequest)?;
            let version_start = url_end + 1;
            if method_end == 0 || url_end == url_start || version_start >= bytes.len() {
                return Err(ConnectionError::MalformedRequest);
            }
            let query_at = bytes[url_start..url_end]
                .iter()
                .position(|&b| b == b'?')
                .map(|i| url_start + i);
            (method_end, url_start, url_end, version_start, query_at)
        };

        let version = {
            let bytes = self.pool.get(line);
            let token = std::str::from_utf8(&bytes[version_start..]).unwrap_or("");
            Version::parse(token.trim_end()).ok_or(ConnectionError::UnsupportedVersion)?
        };
        self.version = version;

        let oversized = |_| ConnectionError::HeadersTooLarge;
        self.method = self.pool.alloc_copy(line.slice(0, method_end)).map_err(oversized)?;
        let path_end = query_at.unwrap_or(url_end);
        self.url = self
            .pool
            .alloc_copy(line.slice(url_start, path_end))
            .map_err(oversized)?;
        self.head_request = self.pool.get(self.method) == b"HEAD";
        if let Some(q) = query_at {
            self.parse_query(line.slice(q + 1, url_end))?;
        }
        trace!(
            "{}: {} {} {}",
            self.peer,
            self.pool.str(self.method),
            self.pool.str(self.url),
            version
        );
        Ok(())
    }

    /// One header (or trailer) line. Continuation lines fold into the
    /// previous entry's value joined by a single space; values are
    /// trimmed of surrounding whitespace.
    pub(super) fn parse_header_line(
        &mut self,
        line: Span,
        kind: HeaderKind,
    ) -> Result<(), ConnectionError> {
        let oversized = |_| ConnectionError::HeadersTooLarge;
        let first = self.pool.get(line)[0];
        if first == b' ' || first == b'\t' {
            let idx = self.last_header.ok_or(ConnectionError::MalformedRequest)?;
            let folded = {
                let bytes = self.pool.get(line);
                let start = bytes
                    .iter()
                    .position(|&b| b != b' ' && b != b'\t')
                    .unwrap_or(bytes.len());
                let end = trimmed_end(bytes);
                if start >= end {
                    // blank continuation adds nothing
                    return Ok(());
                }
                check_value(&bytes[start..end])?;
                line.slice(start, end)
            };
            let old = self.store.value_span(idx);
            let new = self
                .pool
                .reallocate(old, old.len() + 1 + folded.len())
                .map_err(oversized)?;
            self.pool.write_into(new, old.len(), b" ");
            self.pool.copy_into(folded, new, old.len() + 1);
            self.store.set_value(idx, new);
            return Ok(());
        }

        let (name, value) = {
            let bytes = self.pool.get(line);
            let colon = bytes
                .iter()
                .position(|&b| b == b':')
                .ok_or(ConnectionError::MalformedRequest)?;
            let name_end = trimmed_end(&bytes[..colon]);
            if name_end == 0 {
                return Err(ConnectionError::MalformedRequest);
            }
            check_name(&bytes[..name_end])?;
            let value_start = colon
                + 1
                + bytes[colon + 1..]
                    .iter()
                    .position(|&b| b != b' ' && b != b'\t')
                    .unwrap_or(bytes.len() - colon - 1);
            let value_end = trimmed_end(bytes).max(value_start);
            check_value(&bytes[value_start..value_end])?;
            (line.slice(0, name_end), line.slice(value_start, value_end))
        };
        let name = self.pool.alloc_copy(name).map_err(oversized)?;
        let value = self.pool.alloc_copy(value).map_err(oversized)?;
        let idx = self.store.append(kind, name, value);
        self.last_header = Some(idx);
        Ok(())
    }

    /// Pre-application decisions once the whole header section is in:
    /// body framing, keep-alive, expect-continue, accept policy.
    pub(super) fn process_headers(&mut self) {
        let mut content_length: Option<u64> = None;
        let mut duplicate_cl = false;
        let mut bad_cl = false;
        let mut chunked = false;
        let mut close_hdr = false;
        let mut keep_alive_hdr = false;
        let mut expect = false;
        self.store.each(&self.pool, Some(HeaderKind::Request), |name, value| {
            if name.eq_ignore_ascii_case("transfer-encoding") {
                chunked = crate::headers::is_chunked(value.as_bytes());
            } else if name.eq_ignore_ascii_case("content-length") {
                if content_length.is_some() {
                    duplicate_cl = true;
                } else {
                    match value.trim().parse::<u64>() {
                        Ok(n) => content_length = Some(n),
                        Err(_) => bad_cl = true,
                    }
                }
            } else if name.eq_ignore_ascii_case("connection") {
                close_hdr |= crate::headers::is_close(value.as_bytes());
                keep_alive_hdr |= crate::headers::is_keep_alive(value.as_bytes());
            } else if name.eq_ignore_ascii_case("expect") {
                expect = crate::headers::is_continue(value.as_bytes());
            }
            true
        });

        if duplicate_cl || bad_cl || (chunked && content_length.is_some()) {
            self.protocol_error(ConnectionError::MalformedRequest);
            return;
        }

        self.keep_alive =
            !close_hdr && (self.version.default_keep_alive() || keep_alive_hdr);
        self.expect_continue = expect && self.version == Version::Http11;

        let kind = if chunked {
            BodyKind::Chunked
        } else {
            BodyKind::Fixed(content_length.unwrap_or(0))
        };
        if let BodyKind::Fixed(len) = kind {
            let budget = self.pool.remaining().saturating_sub(WRITE_RESERVE) as u64;
            if len > budget {
                self.protocol_error(ConnectionError::OversizedRequest);
                return;
            }
        }
        self.body_kind = Some(kind);
        self.body_progress = match kind {
            BodyKind::Fixed(n) => BodyProgress::Fixed(n),
            BodyKind::Chunked => BodyProgress::ChunkHead,
        };

        if let Some(ref policy) = self.callbacks.accept_policy {
            if policy(&self.peer) == Policy::Reject {
                self.protocol_error(ConnectionError::PolicyRejected);
                return;
            }
        }

        self.state = if self.expect_continue {
            State::ContinueSending
        } else {
            State::HeadersProcessed
        };
    }

    /// Buffers the upload body; covers HeadersProcessed and
    /// ContinueSent until the body is complete.
    pub(super) fn read_body(&mut self) {
        match self.body_progress {
            BodyProgress::Fixed(0) => {
                self.state = State::BodyReceived;
            }
            BodyProgress::Fixed(left) => {
                if self.read_have == 0 {
                    if self.read_eof {
                        self.protocol_error(ConnectionError::MalformedRequest);
                    }
                    return;
                }
                let take = min(self.read_have as u64, left) as usize;
                if let Err(e) = self.append_body(take) {
                    self.protocol_error(e);
                    return;
                }
                self.consume(take);
                let left = left - take as u64;
                self.body_progress = BodyProgress::Fixed(left);
                if left == 0 {
                    self.state = State::BodyReceived;
                }
            }
            BodyProgress::ChunkHead => {
                let parsed = {
                    let bytes = &self.pool.get(self.read_buf)[..self.read_have];
                    httparse::parse_chunk_size(bytes)
                };
                match parsed {
                    Ok(httparse::Status::Complete((eat, size))) => {
                        self.consume(eat);
                        if size == 0 {
                            // trailers follow; continuation lines must
                            // not fold into request headers
                            self.last_header = None;
                            self.body_progress = BodyProgress::Footers;
                            self.state = State::BodyReceived;
                        } else {
                            self.body_progress = BodyProgress::ChunkData(size);
                        }
                    }
                    Ok(httparse::Status::Partial) => {
                        if self.read_have > MAX_CHUNK_HEAD {
                            self.protocol_error(ConnectionError::MalformedRequest);
                        } else if self.read_eof {
                            self.protocol_error(ConnectionError::MalformedRequest);
                        }
                    }
                    Err(_) => {
                        self.protocol_error(ConnectionError::MalformedRequest);
                    }
                }
            }
            BodyProgress::ChunkData(left) => {
                if self.read_have == 0 {
                    if self.read_eof {
                        self.protocol_error(ConnectionError::MalformedRequest);
                    }
                    return;
                }
                let take = min(self.read_have as u64, left) as usize;
                if let Err(e) = self.append_body(take) {
                    self.protocol_error(e);
                    return;
                }
                self.consume(take);
                let left = left - take as u64;
                self.body_progress = if left == 0 {
                    BodyProgress::ChunkPad
                } else {
                    BodyProgress::ChunkData(left)
                };
            }
            BodyProgress::ChunkPad => {
                let bytes = &self.pool.get(self.read_buf)[..self.read_have];
                match bytes.first() {
                    None => {
                        if self.read_eof {
                            self.protocol_error(ConnectionError::MalformedRequest);
                        }
                    }
                    Some(b'\n') => {
                        self.consume(1);
                        self.body_progress = BodyProgress::ChunkHead;
                    }
                    Some(b'\r') => {
                        if bytes.len() >= 2 {
                            let eat = if bytes[1] == b'\n' { 2 } else { 1 };
                            self.consume(eat);
                            self.body_progress = BodyProgress::ChunkHead;
                        } else if self.read_eof {
                            self.protocol_error(ConnectionError::MalformedRequest);
                        }
                    }
                    Some(_) => {
                        self.protocol_error(ConnectionError::MalformedRequest);
                    }
                }
            }
            BodyProgress::Footers => {
                self.state = State::BodyReceived;
            }
        }
    }

    /// Trailer lines of a chunked upload, stored as footer entries.
    pub(super) fn parse_footers(&mut self) {
        if self.body_progress != BodyProgress::Footers {
            // identity body has no trailers
            self.state = State::FootersReceived;
            return;
        }
        let (line, eat) = match self.take_line() {
            Some(pair) => pair,
            None => {
                if self.read_have >= self.read_buf.len() {
                    self.protocol_error(ConnectionError::HeadersTooLarge);
                } else if self.read_eof {
                    self.protocol_error(ConnectionError::MalformedRequest);
                }
                return;
            }
        };
        if line.is_empty() {
            self.consume(eat);
            self.state = State::FootersReceived;
            return;
        }
        let parsed = self.parse_header_line(line, HeaderKind::Footer);
        self.consume(eat);
        if let Err(e) = parsed {
            self.protocol_error(e);
        }
    }

    /// Appends the first `n` read-buffer bytes to the buffered body.
    fn append_body(&mut self, n: usize) -> Result<(), ConnectionError> {
        let oversized = |_| ConnectionError::OversizedRequest;
        if self.body.is_empty() && self.body_len == 0 {
            self.body = self.pool.allocate(n).map_err(oversized)?;
        } else if self.body_len + n > self.body.len() {
            self.body = self
                .pool
                .reallocate(self.body, self.body_len + n)
                .map_err(oversized)?;
        }
        self.pool
            .copy_into(self.read_buf.slice(0, n), self.body, self.body_len);
        self.body_len += n;
        Ok(())
    }
}

fn trimmed_end(bytes: &[u8]) -> usize {
    let mut end = bytes.len();
    while end > 0 && (bytes[end - 1] == b' ' || bytes[end - 1] == b'\t') {
        end -= 1;
    }
    end
}

fn check_name(bytes: &[u8]) -> Result<(), ConnectionError> {
    if bytes
        .iter()
        .any(|&b| b <= 0x20 || b >= 0x7f || b == b':')
    {
        return Err(ConnectionError::MalformedRequest);
    }
    Ok(())
}

fn check_value(bytes: &[u8]) -> Result<(), ConnectionError> {
    if bytes.iter().any(|&b| (b < 0x20 && b != b'\t') || b == 0x7f) {
        return Err(ConnectionError::MalformedRequest);
    }
    if std::str::from_utf8(bytes).is_err() {
        return Err(ConnectionError::MalformedRequest);
    }
    Ok(())
}
