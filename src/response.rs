use std::borrow::Cow;
use std::fmt;
use std::sync::Mutex;

/// Outcome of one call to a content-reader callback.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReaderResult {
    /// This many bytes were written to the front of the buffer.
    Data(usize),
    /// Nothing to produce right now, try again later.
    Again,
    /// End of the stream.
    End,
    /// The producer failed; the connection is terminated.
    Error,
}

type ContentReader = Box<dyn Fn(u64, &mut [u8]) -> ReaderResult + Send + Sync>;

enum Body {
    /// In-memory payload. `Cow::Borrowed` is the no-copy/no-free
    /// variant, `Cow::Owned` covers both must-copy and must-free: an
    /// owned buffer is always freed with the response.
    Buffer(Cow<'static, [u8]>),
    /// Produced on demand. The reader is called with the byte position
    /// and a scratch buffer; captured state replaces the opaque context
    /// pointer and its free callback, it is dropped with the response.
    Reader { read: ContentReader, size: Option<u64> },
}

/// A frozen response payload plus its headers.
///
/// Responses are created by the application, possibly shared by many
/// connections at once, and carry no per-connection state. Share one as
/// `Arc<Response>`: queueing on a connection clones the `Arc` (+1),
/// connection teardown drops it (−1), and the payload is freed when the
/// last reference goes away. The status code is *not* part of the
/// response; it is chosen each time the response is queued.
///
/// Headers may be edited only until the response is first queued. This
/// is a contract, not enforced at runtime.
pub struct Response {
    body: Body,
    headers: Mutex<Vec<(String, String)>>,
}

/// Rejected header name or value (empty, or containing TAB, CR or LF).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct InvalidHeader;

impl fmt::Display for InvalidHeader {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("header name or value is empty or contains TAB/CR/LF")
    }
}

impl std::error::Error for InvalidHeader {}

fn bad_field(s: &str) -> bool {
    s.is_empty() || s.bytes().any(|b| b == b'\t' || b == b'\r' || b == b'\n')
}

impl Response {
    fn with_body(body: Body) -> Response {
        Response { body, headers: Mutex::new(Vec::new()) }
    }

    /// Response backed by a static buffer; nothing is copied or freed.
    pub fn from_static(data: &'static [u8]) -> Response {
        Response::with_body(Body::Buffer(Cow::Borrowed(data)))
    }

    /// Response that takes ownership of the buffer and frees it when
    /// the last reference goes away.
    pub fn from_vec(data: Vec<u8>) -> Response {
        Response::with_body(Body::Buffer(Cow::Owned(data)))
    }

    /// Response that copies the buffer right away; the argument may be
    /// released as soon as this returns.
    pub fn from_copy(data: &[u8]) -> Response {
        Response::from_vec(data.to_vec())
    }

    /// Response with an empty payload.
    pub fn empty() -> Response {
        Response::from_static(b"")
    }

    /// Response produced by a callback.
    ///
    /// `size` of `None` means the total length is unknown; such a
    /// response is sent with chunked transfer encoding on HTTP/1.1 and
    /// terminated by connection close on HTTP/1.0. The reader is invoked
    /// with the current position and a scratch buffer and reports
    /// progress through [`ReaderResult`].
    pub fn from_reader<F>(size: Option<u64>, read: F) -> Response
    where
        F: Fn(u64, &mut [u8]) -> ReaderResult + Send + Sync + 'static,
    {
        Response::with_body(Body::Reader { read: Box::new(read), size })
    }

    /// Total payload size, `None` when only the producer knows.
    pub fn total_size(&self) -> Option<u64> {
        match self.body {
            Body::Buffer(ref data) => Some(data.len() as u64),
            Body::Reader { size, .. } => size,
        }
    }

    /// Adds a header line. Header order is preserved and duplicate
    /// names are allowed. Fails on empty names or values and on any
    /// TAB, CR or LF byte, so a stored header can never split the
    /// serialized head.
    pub fn add_header(&self, name: &str, value: &str) -> Result<(), InvalidHeader> {
        if bad_field(name) || bad_field(value) {
            return Err(InvalidHeader);
        }
        let mut headers = self.headers.lock().unwrap();
        headers.push((name.to_string(), value.to_string()));
        Ok(())
    }

    /// Deletes the header line matching both name and value exactly.
    /// Returns false when no such line exists.
    pub fn delete_header(&self, name: &str, value: &str) -> bool {
        let mut headers = self.headers.lock().unwrap();
        match headers.iter().position(|(n, v)| n == name && v == value) {
            Some(idx) => {
                headers.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Visits headers in insertion order until the callback returns
    /// `false`; returns the total number of headers.
    pub fn for_each_header<F>(&self, mut f: F) -> usize
    where
        F: FnMut(&str, &str) -> bool,
    {
        let headers = self.headers.lock().unwrap();
        for (name, value) in headers.iter() {
            if !f(name, value) {
                break;
            }
        }
        headers.len()
    }

    /// The in-memory payload, when there is one.
    pub(crate) fn data(&self) -> Option<&[u8]> {
        match self.body {
            Body::Buffer(ref data) => Some(data),
            Body::Reader { .. } => None,
        }
    }

    /// Produces payload bytes at `pos` into `buf`.
    pub(crate) fn produce(&self, pos: u64, buf: &mut [u8]) -> ReaderResult {
        match self.body {
            Body::Buffer(ref data) => {
                if pos >= data.len() as u64 {
                    return ReaderResult::End;
                }
                let data = &data[pos as usize..];
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                ReaderResult::Data(n)
            }
            Body::Reader { ref read, .. } => read(pos, buf),
        }
    }

    /// Snapshot of the header list for serialization.
    pub(crate) fn header_snapshot(&self) -> Vec<(String, String)> {
        self.headers.lock().unwrap().clone()
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Response")
            .field("size", &self.total_size())
            .field("headers", &self.headers.lock().unwrap().len())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::{ReaderResult, Response};
    use std::sync::Arc;

    #[test]
    fn buffer_sizes() {
        assert_eq!(Response::from_static(b"hello").total_size(), Some(5));
        assert_eq!(Response::from_copy(b"abc").total_size(), Some(3));
        assert_eq!(Response::empty().total_size(), Some(0));
        assert_eq!(Response::from_reader(None, |_, _| ReaderResult::End).total_size(), None);
        assert_eq!(
            Response::from_reader(Some(7), |_, _| ReaderResult::End).total_size(),
            Some(7)
        );
    }

    #[test]
    fn header_injection_rejected() {
        let resp = Response::empty();
        assert!(resp.add_header("X-Foo", "a\r\nSet-Cookie: evil").is_err());
        assert!(resp.add_header("X\rFoo", "a").is_err());
        assert!(resp.add_header("X\tFoo", "a").is_err());
        assert!(resp.add_header("", "a").is_err());
        assert!(resp.add_header("X-Foo", "").is_err());
        // the table is unchanged
        assert_eq!(resp.for_each_header(|_, _| true), 0);
    }

    #[test]
    fn header_order_and_duplicates() {
        let resp = Response::empty();
        resp.add_header("Set-Cookie", "a=1").unwrap();
        resp.add_header("X-One", "1").unwrap();
        resp.add_header("Set-Cookie", "b=2").unwrap();
        let mut seen = Vec::new();
        let total = resp.for_each_header(|n, v| {
            seen.push(format!("{}: {}", n, v));
            true
        });
        assert_eq!(total, 3);
        assert_eq!(seen, ["Set-Cookie: a=1", "X-One: 1", "Set-Cookie: b=2"]);
    }

    #[test]
    fn iteration_stops_early() {
        let resp = Response::empty();
        resp.add_header("A", "1").unwrap();
        resp.add_header("B", "2").unwrap();
        let mut seen = 0;
        resp.for_each_header(|_, _| {
            seen += 1;
            false
        });
        assert_eq!(seen, 1);
    }

    #[test]
    fn delete_header_exact_match() {
        let resp = Response::empty();
        resp.add_header("X", "1").unwrap();
        assert!(!resp.delete_header("X", "2"));
        assert!(resp.delete_header("X", "1"));
        assert!(!resp.delete_header("X", "1"));
    }

    #[test]
    fn produce_from_buffer() {
        let resp = Response::from_static(b"hello, world");
        let mut buf = [0u8; 5];
        assert_eq!(resp.produce(0, &mut buf), ReaderResult::Data(5));
        assert_eq!(&buf, b"hello");
        assert_eq!(resp.produce(7, &mut buf), ReaderResult::Data(5));
        assert_eq!(&buf, b"world");
        assert_eq!(resp.produce(12, &mut buf), ReaderResult::End);
    }

    #[test]
    fn shared_refcount() {
        let resp = Arc::new(Response::from_static(b"x"));
        let before = Arc::strong_count(&resp);
        {
            let _a = Arc::clone(&resp);
            let _b = Arc::clone(&resp);
            assert_eq!(Arc::strong_count(&resp), before + 2);
        }
        assert_eq!(Arc::strong_count(&resp), before);
    }
}
