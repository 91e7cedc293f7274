use crate::pool::{Pool, PoolFull, Span};

/// Classifies an entry of the per-connection header store.
///
/// Request headers, decoded cookies, GET and POST arguments and chunked
/// trailers all land in the same append-ordered table, distinguished by
/// kind.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HeaderKind {
    /// Header of the incoming request.
    Request,
    /// Header of the outgoing response.
    Response,
    /// A cookie decoded from a `Cookie` request header.
    Cookie,
    /// An argument decoded from the query string.
    GetArg,
    /// An argument decoded from a form-encoded request body.
    PostArg,
    /// A trailer of a chunked upload.
    Footer,
}

#[derive(Debug, Copy, Clone)]
struct Entry {
    kind: HeaderKind,
    name: Span,
    value: Span,
}

/// Append-ordered key/value table with case-insensitive lookup.
///
/// All name and value bytes live in the pool of the owning connection and
/// never outlive it. Appending is O(1); lookup is a linear scan, which is
/// fine since n is tens at most. Duplicates are permitted and preserved
/// in insertion order.
#[derive(Debug, Default)]
pub struct HeaderStore {
    entries: Vec<Entry>,
}

impl HeaderStore {
    pub fn new() -> HeaderStore {
        HeaderStore { entries: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every entry. Called together with the pool reset on
    /// keep-alive transitions; the spans become dangling at that point
    /// so they must not survive it.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Appends an entry. Returns its index, which stays valid until
    /// `clear()`.
    pub fn append(&mut self, kind: HeaderKind, name: Span, value: Span) -> usize {
        self.entries.push(Entry { kind, name, value });
        self.entries.len() - 1
    }

    /// Replaces the value of an earlier entry. Used when a continuation
    /// line is folded into the previous header.
    pub fn set_value(&mut self, index: usize, value: Span) {
        self.entries[index].value = value;
    }

    pub fn value_span(&self, index: usize) -> Span {
        self.entries[index].value
    }

    /// First value stored under `name` with the given kind,
    /// case-insensitive.
    pub fn lookup<'p>(&self, pool: &'p Pool, kind: HeaderKind, name: &str) -> Option<&'p str> {
        self.entries
            .iter()
            .find(|e| e.kind == kind && pool.str(e.name).eq_ignore_ascii_case(name))
            .map(|e| pool.str(e.value))
    }

    /// Walks entries in insertion order, filtered by kind when given.
    /// Stops early when the callback returns `false`; returns the number
    /// of entries visited.
    pub fn each<F>(&self, pool: &Pool, kind: Option<HeaderKind>, mut f: F) -> usize
    where
        F: FnMut(&str, &str) -> bool,
    {
        let mut seen = 0;
        for e in &self.entries {
            if kind.map_or(false, |k| k != e.kind) {
                continue;
            }
            seen += 1;
            if !f(pool.str(e.name), pool.str(e.value)) {
                break;
            }
        }
        seen
    }

    /// Spans of every entry of the given kind whose name matches,
    /// case-insensitive. Used where decoding must interleave reads
    /// with pool allocation.
    pub(crate) fn matching_spans(&self, pool: &Pool, kind: HeaderKind, name: &str) -> Vec<Span> {
        self.entries
            .iter()
            .filter(|e| e.kind == kind && pool.str(e.name).eq_ignore_ascii_case(name))
            .map(|e| e.value)
            .collect()
    }

    /// Copies `name` and `value` into the pool and appends.
    pub fn append_copy(
        &mut self,
        pool: &mut Pool,
        kind: HeaderKind,
        name: &[u8],
        value: &[u8],
    ) -> Result<usize, PoolFull> {
        let name = pool.alloc_bytes(name)?;
        let value = pool.alloc_bytes(value)?;
        Ok(self.append(kind, name, value))
    }
}

// Header *values* are byte sequences scanned case-insensitively with
// surrounding whitespace stripped, one comma-separated token at a time.

#[inline]
pub fn value_has_token(value: &[u8], token: &[u8]) -> bool {
    value
        .split(|&b| b == b',')
        .any(|part| trim_bytes(part).eq_ignore_ascii_case(token))
}

#[inline]
pub fn is_close(value: &[u8]) -> bool {
    value_has_token(value, b"close")
}

#[inline]
pub fn is_keep_alive(value: &[u8]) -> bool {
    value_has_token(value, b"keep-alive")
}

/// True when the *last* transfer coding is chunked, per the message body
/// length rules of RFC7230.
#[inline]
pub fn is_chunked(value: &[u8]) -> bool {
    value
        .split(|&b| b == b',')
        .last()
        .map_or(false, |part| trim_bytes(part).eq_ignore_ascii_case(b"chunked"))
}

#[inline]
pub fn is_continue(value: &[u8]) -> bool {
    trim_bytes(value).eq_ignore_ascii_case(b"100-continue")
}

pub fn trim_bytes(mut value: &[u8]) -> &[u8] {
    while let Some((&b, rest)) = value.split_first() {
        if b == b' ' || b == b'\t' || b == b'\r' || b == b'\n' {
            value = rest;
        } else {
            break;
        }
    }
    while let Some((&b, rest)) = value.split_last() {
        if b == b' ' || b == b'\t' || b == b'\r' || b == b'\n' {
            value = rest;
        } else {
            break;
        }
    }
    value
}

#[cfg(test)]
mod test {
    use super::{is_chunked, is_close, is_continue, is_keep_alive, trim_bytes};
    use super::{HeaderKind, HeaderStore};
    use crate::pool::Pool;

    #[test]
    fn test_close() {
        assert!(is_close(b"close"));
        assert!(is_close(b"Close"));
        assert!(is_close(b"clOSE"));
        assert!(is_close(b" CLOSE"));
        assert!(is_close(b"   close   "));
        assert!(is_close(b"keep-alive, close"));
        assert!(!is_close(b"keep-alive"));
        assert!(!is_close(b"closed"));
    }

    #[test]
    fn test_keep_alive() {
        assert!(is_keep_alive(b"keep-alive"));
        assert!(is_keep_alive(b"Keep-Alive"));
        assert!(!is_keep_alive(b"close"));
    }

    #[test]
    fn test_chunked() {
        assert!(is_chunked(b"chunked"));
        assert!(is_chunked(b"Chunked"));
        assert!(is_chunked(b"   CHUNKED  "));
        assert!(is_chunked(b"gzip, chunked"));
        // chunked must be the last coding
        assert!(!is_chunked(b"chunked, gzip"));
        assert!(!is_chunked(b"identity"));
    }

    #[test]
    fn test_continue() {
        assert!(is_continue(b"100-continue"));
        assert!(is_continue(b"100-Continue"));
        assert!(!is_continue(b"100"));
    }

    #[test]
    fn test_trim() {
        assert_eq!(trim_bytes(b"  a b \t"), b"a b");
        assert_eq!(trim_bytes(b""), b"");
        assert_eq!(trim_bytes(b"   "), b"");
    }

    #[test]
    fn store_lookup_is_case_insensitive() {
        let mut pool = Pool::new(1024);
        let mut store = HeaderStore::new();
        store
            .append_copy(&mut pool, HeaderKind::Request, b"Content-Length", b"42")
            .unwrap();
        assert_eq!(
            store.lookup(&pool, HeaderKind::Request, "content-length"),
            Some("42")
        );
        assert_eq!(
            store.lookup(&pool, HeaderKind::Request, "CONTENT-LENGTH"),
            Some("42")
        );
        assert_eq!(store.lookup(&pool, HeaderKind::Cookie, "content-length"), None);
    }

    #[test]
    fn store_preserves_duplicates_in_order() {
        let mut pool = Pool::new(1024);
        let mut store = HeaderStore::new();
        store
            .append_copy(&mut pool, HeaderKind::Request, b"Accept", b"text/html")
            .unwrap();
        store
            .append_copy(&mut pool, HeaderKind::Request, b"Accept", b"text/plain")
            .unwrap();
        let mut seen = Vec::new();
        store.each(&pool, Some(HeaderKind::Request), |_, v| {
            seen.push(v.to_string());
            true
        });
        assert_eq!(seen, ["text/html", "text/plain"]);
        // lookup returns the first one
        assert_eq!(
            store.lookup(&pool, HeaderKind::Request, "accept"),
            Some("text/html")
        );
    }

    #[test]
    fn each_stops_on_false() {
        let mut pool = Pool::new(1024);
        let mut store = HeaderStore::new();
        for i in 0..4 {
            store
                .append_copy(&mut pool, HeaderKind::GetArg, b"k", format!("{}", i).as_bytes())
                .unwrap();
        }
        let visited = store.each(&pool, Some(HeaderKind::GetArg), |_, v| v != "1");
        assert_eq!(visited, 2);
    }
}
