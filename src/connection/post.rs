use log::debug;

use crate::error::ConnectionError;
use crate::headers::HeaderKind;
use crate::pool::{Pool, Span};

use super::Connection;

impl Connection {
    /// Decodes the query string into GET-argument entries. Called with
    /// a span into the (not yet consumed) read buffer, so everything is
    /// copied into request-scoped pool storage first.
    pub(super) fn parse_query(&mut self, raw: Span) -> Result<(), ConnectionError> {
        let stable = self
            .pool
            .alloc_copy(raw)
            .map_err(|_| ConnectionError::HeadersTooLarge)?;
        self.decode_pairs(stable, b'&', HeaderKind::GetArg, true)
            .map_err(|_| ConnectionError::HeadersTooLarge)
    }

    /// Splits `src` on `sep` into `name=value` pairs, percent-decodes
    /// both sides when asked, and appends them under `kind`.
    fn decode_pairs(
        &mut self,
        src: Span,
        sep: u8,
        kind: HeaderKind,
        unescape: bool,
    ) -> Result<(), crate::pool::PoolFull> {
        let mut start = 0;
        while start < src.len() {
            let (seg_end, eq_at) = {
                let bytes = self.pool.get(src);
                let seg_end = bytes[start..]
                    .iter()
                    .position(|&b| b == sep)
                    .map_or(bytes.len(), |i| start + i);
                let eq_at = bytes[start..seg_end]
                    .iter()
                    .position(|&b| b == b'=')
                    .map(|i| start + i);
                (seg_end, eq_at)
            };
            if seg_end > start {
                let (name_raw, value_raw) = match eq_at {
                    Some(eq) => (src.slice(start, eq), src.slice(eq + 1, seg_end)),
                    None => (src.slice(start, seg_end), src.slice(seg_end, seg_end)),
                };
                let mut name = self.pool.alloc_copy(name_raw)?;
                let mut value = self.pool.alloc_copy(value_raw)?;
                if unescape {
                    name = decode_in_place(&mut self.pool, name);
                    value = decode_in_place(&mut self.pool, value);
                }
                if !name.is_empty() {
                    self.store.append(kind, name, value);
                }
            }
            start = seg_end + 1;
        }
        Ok(())
    }

    /// Splits every `Cookie` request header into cookie entries.
    /// Surrounding double quotes on a value are dropped.
    pub(super) fn decode_cookies(&mut self) {
        let cookies = self
            .store
            .matching_spans(&self.pool, HeaderKind::Request, "cookie");
        for header in cookies {
            let mut start = 0;
            while start < header.len() {
                let parsed = {
                    let bytes = self.pool.get(header);
                    let seg_end = bytes[start..]
                        .iter()
                        .position(|&b| b == b';')
                        .map_or(bytes.len(), |i| start + i);
                    parse_cookie_pair(bytes, start, seg_end).map(|p| (p, seg_end))
                };
                let seg_end = match parsed {
                    Some(((name_lo, name_hi, val_lo, val_hi), seg_end)) => {
                        let name = header.slice(name_lo, name_hi);
                        let value = header.slice(val_lo, val_hi);
                        let copied = self
                            .pool
                            .alloc_copy(name)
                            .and_then(|n| self.pool.alloc_copy(value).map(|v| (n, v)));
                        match copied {
                            Ok((n, v)) => {
                                self.store.append(HeaderKind::Cookie, n, v);
                            }
                            Err(_) => {
                                debug!("{}: pool exhausted decoding cookies", self.peer);
                                return;
                            }
                        }
                        seg_end
                    }
                    None => {
                        let bytes = self.pool.get(header);
                        bytes[start..]
                            .iter()
                            .position(|&b| b == b';')
                            .map_or(bytes.len(), |i| start + i)
                    }
                };
                start = seg_end + 1;
            }
        }
    }

    /// Decodes a form-encoded upload into POST-argument entries, up to
    /// the configured limit.
    pub(super) fn decode_post(&mut self) -> Result<(), ConnectionError> {
        if self.body_len == 0 {
            return Ok(());
        }
        let content_type = match self
            .store
            .lookup(&self.pool, HeaderKind::Request, "content-type")
        {
            Some(value) => value.to_string(),
            None => return Ok(()),
        };
        let lowered = content_type.to_ascii_lowercase();
        if lowered.starts_with("application/x-www-form-urlencoded") {
            if self.body_len > self.callbacks.post_limit {
                return Err(ConnectionError::OversizedRequest);
            }
            let body = self.body.slice(0, self.body_len);
            self.decode_pairs(body, b'&', HeaderKind::PostArg, true)
                .map_err(|_| ConnectionError::OversizedRequest)
        } else if lowered.starts_with("multipart/form-data") {
            if self.body_len > self.callbacks.post_limit {
                return Err(ConnectionError::OversizedRequest);
            }
            let boundary = match boundary_param(&content_type) {
                Some(b) => b,
                None => return Err(ConnectionError::MalformedRequest),
            };
            self.decode_multipart(&boundary)
        } else {
            Ok(())
        }
    }

    fn decode_multipart(&mut self, boundary: &str) -> Result<(), ConnectionError> {
        let body = self.body.slice(0, self.body_len);
        // collect (field name, content) ranges first; appending below
        // moves the pool cursor
        let parts = {
            let bytes = self.pool.get(body);
            collect_multipart_parts(bytes, boundary.as_bytes())?
        };
        for (name_lo, name_hi, val_lo, val_hi) in parts {
            let name = body.slice(name_lo, name_hi);
            let value = body.slice(val_lo, val_hi);
            let name = self
                .pool
                .alloc_copy(name)
                .map_err(|_| ConnectionError::OversizedRequest)?;
            let value = self
                .pool
                .alloc_copy(value)
                .map_err(|_| ConnectionError::OversizedRequest)?;
            self.store.append(HeaderKind::PostArg, name, value);
        }
        Ok(())
    }
}

/// In-place `%xx` and `+` decoding; returns the shrunk span.
fn decode_in_place(pool: &mut Pool, span: Span) -> Span {
    let bytes = pool.get_mut(span);
    let mut w = 0;
    let mut r = 0;
    while r < bytes.len() {
        match bytes[r] {
            b'+' => {
                bytes[w] = b' ';
                r += 1;
            }
            b'%' if r + 2 < bytes.len() => match (hex_digit(bytes[r + 1]), hex_digit(bytes[r + 2])) {
                (Some(hi), Some(lo)) => {
                    bytes[w] = hi * 16 + lo;
                    r += 3;
                }
                _ => {
                    bytes[w] = b'%';
                    r += 1;
                }
            },
            b => {
                bytes[w] = b;
                r += 1;
            }
        }
        w += 1;
    }
    span.slice(0, w)
}

fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Offsets of `name=value` inside one cookie segment, quotes stripped.
fn parse_cookie_pair(
    bytes: &[u8],
    start: usize,
    end: usize,
) -> Option<(usize, usize, usize, usize)> {
    let eq = bytes[start..end].iter().position(|&b| b == b'=')? + start;
    let mut name_lo = start;
    while name_lo < eq && (bytes[name_lo] == b' ' || bytes[name_lo] == b'\t') {
        name_lo += 1;
    }
    let mut name_hi = eq;
    while name_hi > name_lo && (bytes[name_hi - 1] == b' ' || bytes[name_hi - 1] == b'\t') {
        name_hi -= 1;
    }
    if name_lo == name_hi {
        return None;
    }
    let mut val_lo = eq + 1;
    let mut val_hi = end;
    while val_lo < val_hi && (bytes[val_lo] == b' ' || bytes[val_lo] == b'\t') {
        val_lo += 1;
    }
    while val_hi > val_lo && (bytes[val_hi - 1] == b' ' || bytes[val_hi - 1] == b'\t') {
        val_hi -= 1;
    }
    if val_hi - val_lo >= 2 && bytes[val_lo] == b'"' && bytes[val_hi - 1] == b'"' {
        val_lo += 1;
        val_hi -= 1;
    }
    Some((name_lo, name_hi, val_lo, val_hi))
}

/// The `boundary` parameter of a multipart content type.
fn boundary_param(content_type: &str) -> Option<String> {
    let lowered = content_type.to_ascii_lowercase();
    let at = lowered.find("boundary=")?;
    let rest = &content_type[at + "boundary=".len()..];
    let rest = rest.trim_start();
    let boundary = if let Some(stripped) = rest.strip_prefix('"') {
        stripped.split('"').next()?
    } else {
        rest.split(|c: char| c == ';' || c == ' ').next()?
    };
    if boundary.is_empty() {
        None
    } else {
        Some(boundary.to_string())
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Ranges of (field name, part content) for each part of a multipart
/// body. File parts are stored like ordinary fields; the filename
/// parameter is ignored.
fn collect_multipart_parts(
    bytes: &[u8],
    boundary: &[u8],
) -> Result<Vec<(usize, usize, usize, usize)>, ConnectionError> {
    let mut delim = Vec::with_capacity(boundary.len() + 2);
    delim.extend_from_slice(b"--");
    delim.extend_from_slice(boundary);

    let mut parts = Vec::new();
    let mut pos = find(bytes, &delim).ok_or(ConnectionError::MalformedRequest)? + delim.len();
    loop {
        if bytes[pos..].starts_with(b"--") {
            break; // closing delimiter
        }
        // skip the CRLF after the delimiter
        if bytes[pos..].starts_with(b"\r\n") {
            pos += 2;
        } else if bytes[pos..].starts_with(b"\n") {
            pos += 1;
        } else {
            return Err(ConnectionError::MalformedRequest);
        }
        let head_end = find(&bytes[pos..], b"\r\n\r\n")
            .map(|i| (pos + i, pos + i + 4))
            .or_else(|| find(&bytes[pos..], b"\n\n").map(|i| (pos + i, pos + i + 2)))
            .ok_or(ConnectionError::MalformedRequest)?;
        let name = part_field_name(&bytes[pos..head_end.0])
            .map(|(lo, hi)| (pos + lo, pos + hi))
            .ok_or(ConnectionError::MalformedRequest)?;
        let content_start = head_end.1;
        let mut tail = Vec::with_capacity(delim.len() + 2);
        tail.extend_from_slice(b"\r\n");
        tail.extend_from_slice(&delim);
        let content_end = find(&bytes[content_start..], &tail)
            .map(|i| content_start + i)
            .ok_or(ConnectionError::MalformedRequest)?;
        parts.push((name.0, name.1, content_start, content_end));
        pos = content_end + tail.len();
    }
    Ok(parts)
}

/// The `name="..."` parameter of a part's Content-Disposition header.
fn part_field_name(head: &[u8]) -> Option<(usize, usize)> {
    let lowered: Vec<u8> = head.iter().map(|b| b.to_ascii_lowercase()).collect();
    let disp = find(&lowered, b"content-disposition:")?;
    let line_end = find(&lowered[disp..], b"\n").map_or(head.len(), |i| disp + i);
    let name_at = find(&lowered[disp..line_end], b"name=")? + disp + "name=".len();
    // reject a match inside "filename="
    if name_at >= "filename=".len() + disp
        && &lowered[name_at - "filename=".len()..name_at] == b"filename="
    {
        // look for a second occurrence past this one
        let next = find(&lowered[name_at..line_end], b"name=")? + name_at + "name=".len();
        return field_name_range(head, next, line_end);
    }
    field_name_range(head, name_at, line_end)
}

fn field_name_range(head: &[u8], start: usize, line_end: usize) -> Option<(usize, usize)> {
    if start < head.len() && head[start] == b'"' {
        let lo = start + 1;
        let hi = lo + find(&head[lo..line_end], b"\"")?;
        Some((lo, hi))
    } else {
        let hi = head[start..line_end]
            .iter()
            .position(|&b| b == b';' || b == b' ' || b == b'\r')
            .map_or(line_end, |i| start + i);
        Some((start, hi))
    }
}
