use std::fmt::{self, Display};

/// Represents a version of the HTTP spec.
///
/// HTTP/0.9 is only of historic importance. It is not supported by
/// minihttpd and it will never be. Most requests that appear to be
/// HTTP/0.9 are malformed HTTP/1.0 requests.
#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Version {
    /// HTTP/1.0 protocol version.
    Http10,
    /// HTTP/1.1 protocol version as described in RFC7230 and others.
    Http11,
}

impl Version {
    /// Parses the version token of a request line.
    ///
    /// Anything that is not literally `HTTP/1.0` or `HTTP/1.1` is an
    /// unknown version and the caller must answer with
    /// `505 HTTP Version Not Supported`.
    pub fn parse(token: &str) -> Option<Version> {
        match token {
            "HTTP/1.0" => Some(Version::Http10),
            "HTTP/1.1" => Some(Version::Http11),
            _ => None,
        }
    }

    /// Keep-alive is the default for HTTP/1.1 and opt-in for HTTP/1.0.
    pub fn default_keep_alive(self) -> bool {
        self == Version::Http11
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match *self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        })
    }
}

#[cfg(test)]
mod test {
    use super::Version;

    #[test]
    fn parse_known() {
        assert_eq!(Version::parse("HTTP/1.0"), Some(Version::Http10));
        assert_eq!(Version::parse("HTTP/1.1"), Some(Version::Http11));
    }

    #[test]
    fn parse_unknown() {
        assert_eq!(Version::parse("HTTP/2.0"), None);
        assert_eq!(Version::parse("HTTP/0.9"), None);
        assert_eq!(Version::parse("http/1.1"), None);
        assert_eq!(Version::parse(""), None);
    }

    #[test]
    fn keep_alive_defaults() {
        assert!(Version::Http11.default_keep_alive());
        assert!(!Version::Http10.default_keep_alive());
    }
}
