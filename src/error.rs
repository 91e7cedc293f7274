use std::io;

use quick_error::quick_error;

/// Why a connection terminated. Reported exactly once per connection
/// through the daemon's notify-completed callback.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Termination {
    /// The last response was sent in full and the stream ended cleanly.
    CompletedOk,
    /// Protocol, resource or application error; see the log for detail.
    WithError,
    /// No activity within the configured connection timeout.
    Timeout,
    /// The daemon is shutting down.
    DaemonShutdown,
    /// TLS alert or fatal TLS failure.
    TlsError,
}

quick_error! {
    /// Error that tears down a single connection.
    ///
    /// You should not make an exhaustive match over the enum; more
    /// variants will be added at will.
    #[derive(Debug)]
    pub enum ConnectionError {
        /// Request syntax the parser refused.
        MalformedRequest {
            display("malformed request")
        }
        /// Request line carried a version other than HTTP/1.0 or 1.1.
        UnsupportedVersion {
            display("unsupported HTTP version")
        }
        /// Header section exceeded the pool or the configured limits.
        HeadersTooLarge {
            display("request header fields too large")
        }
        /// Upload body exceeded the pool or the configured limits.
        OversizedRequest {
            display("request payload too large")
        }
        /// No bytes moved within the connection timeout.
        Timeout {
            display("connection timed out")
        }
        Io(err: io::Error) {
            from()
            display("i/o error: {}", err)
        }
        Tls(msg: &'static str) {
            display("tls error: {}", msg)
        }
        /// Allocation failure or invariant violation.
        Internal {
            display("internal error")
        }
        /// The request handler reported failure.
        Application {
            display("request handler failed")
        }
        /// The accept policy callback refused the client.
        PolicyRejected {
            display("client rejected by accept policy")
        }
    }
}

impl ConnectionError {
    /// The best-effort error page for this error, if one is sent at
    /// all. Timeouts and I/O failures produce no response, just a
    /// close.
    pub fn http_status(&self) -> Option<(u16, &'static str)> {
        use self::ConnectionError::*;
        match *self {
            MalformedRequest => Some((400, "Bad Request")),
            UnsupportedVersion => Some((505, "HTTP Version Not Supported")),
            HeadersTooLarge => Some((431, "Request Header Fields Too Large")),
            OversizedRequest => Some((413, "Payload Too Large")),
            Internal => Some((500, "Internal Server Error")),
            Application => Some((500, "Internal Server Error")),
            PolicyRejected => Some((403, "Forbidden")),
            Timeout | Io(..) | Tls(..) => None,
        }
    }

    /// The termination code reported to notify-completed.
    pub fn termination(&self) -> Termination {
        use self::ConnectionError::*;
        match *self {
            Timeout => Termination::Timeout,
            Tls(..) => Termination::TlsError,
            _ => Termination::WithError,
        }
    }
}

quick_error! {
    /// Error starting or stopping a daemon.
    #[derive(Debug)]
    pub enum Error {
        Io(err: io::Error) {
            from()
            display("i/o error: {}", err)
        }
        /// Bad PEM material or TLS configuration.
        TlsSetup(msg: String) {
            display("tls setup: {}", msg)
        }
        /// Inconsistent daemon options.
        BadOptions(msg: &'static str) {
            display("bad options: {}", msg)
        }
    }
}

/// Reason phrase for a status code, `"Unknown"` when the code has none
/// registered. Applications picking exotic codes still get a valid
/// status line.
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        411 => "Length Required",
        412 => "Precondition Failed",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        415 => "Unsupported Media Type",
        416 => "Range Not Satisfiable",
        417 => "Expectation Failed",
        426 => "Upgrade Required",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod test {
    use super::{reason_phrase, ConnectionError, Termination};

    #[test]
    fn status_mapping() {
        assert_eq!(
            ConnectionError::MalformedRequest.http_status(),
            Some((400, "Bad Request"))
        );
        assert_eq!(
            ConnectionError::OversizedRequest.http_status(),
            Some((413, "Payload Too Large"))
        );
        assert_eq!(ConnectionError::Timeout.http_status(), None);
    }

    #[test]
    fn termination_mapping() {
        assert_eq!(ConnectionError::Timeout.termination(), Termination::Timeout);
        assert_eq!(
            ConnectionError::Tls("alert").termination(),
            Termination::TlsError
        );
        assert_eq!(
            ConnectionError::MalformedRequest.termination(),
            Termination::WithError
        );
    }

    #[test]
    fn reason_phrases() {
        assert_eq!(reason_phrase(200), "OK");
        assert_eq!(reason_phrase(505), "HTTP Version Not Supported");
        assert_eq!(reason_phrase(799), "Unknown");
    }
}
