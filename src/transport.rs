use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};

#[cfg(feature = "tls")]
use std::sync::Arc;

/// Negotiated TLS parameters of a live connection.
#[cfg(feature = "tls")]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsInfo {
    pub protocol: String,
    pub cipher_suite: String,
}

/// Byte transport under the connection state machine.
///
/// The state machine above this type is identical for plain and TLS
/// connections; only recv/send/shutdown differ. TLS would-block and
/// interrupted conditions surface as `io::ErrorKind::WouldBlock` /
/// `Interrupted` so the caller suspends without advancing state.
pub enum Transport {
    Plain(TcpStream),
    #[cfg(feature = "tls")]
    Tls(TlsStream),
}

impl Transport {
    pub fn plain(socket: TcpStream) -> Transport {
        Transport::Plain(socket)
    }

    #[cfg(feature = "tls")]
    pub fn tls(socket: TcpStream, config: Arc<rustls::ServerConfig>) -> io::Result<Transport> {
        let mut session = rustls::ServerConnection::new(config)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        // bound the plaintext rustls will buffer ahead of the socket
        session.set_buffer_limit(Some(64 * 1024));
        Ok(Transport::Tls(TlsStream { socket, session }))
    }

    pub fn socket(&self) -> &TcpStream {
        match *self {
            Transport::Plain(ref s) => s,
            #[cfg(feature = "tls")]
            Transport::Tls(ref t) => &t.socket,
        }
    }

    pub fn is_tls(&self) -> bool {
        match *self {
            Transport::Plain(..) => false,
            #[cfg(feature = "tls")]
            Transport::Tls(..) => true,
        }
    }

    /// Advances the TLS handshake. `Ok(true)` when the session is
    /// established (immediately so for plain sockets), `Ok(false)` when
    /// the handshake is waiting for socket readiness.
    pub fn handshake(&mut self) -> io::Result<bool> {
        match *self {
            Transport::Plain(..) => Ok(true),
            #[cfg(feature = "tls")]
            Transport::Tls(ref mut t) => t.handshake(),
        }
    }

    /// Reads plaintext. `Ok(0)` is end of stream.
    pub fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match *self {
            Transport::Plain(ref mut s) => s.read(buf),
            #[cfg(feature = "tls")]
            Transport::Tls(ref mut t) => t.recv(buf),
        }
    }

    /// Writes plaintext, returning how much was accepted.
    pub fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        match *self {
            Transport::Plain(ref mut s) => s.write(buf),
            #[cfg(feature = "tls")]
            Transport::Tls(ref mut t) => t.send(buf),
        }
    }

    /// Whether the transport itself wants socket readability /
    /// writability beyond what the state machine asked for. Only TLS
    /// sessions ever do (handshake and close-notify traffic).
    pub fn wants(&self) -> (bool, bool) {
        match *self {
            Transport::Plain(..) => (false, false),
            #[cfg(feature = "tls")]
            Transport::Tls(ref t) => (t.session.wants_read(), t.session.wants_write()),
        }
    }

    /// Orderly close: close-notify for TLS, then socket shutdown.
    pub fn close(&mut self) {
        #[cfg(feature = "tls")]
        if let Transport::Tls(ref mut t) = *self {
            t.session.send_close_notify();
            while t.session.wants_write() {
                match t.session.write_tls(&mut t.socket) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        }
        let _ = self.socket().shutdown(Shutdown::Both);
    }

    #[cfg(feature = "tls")]
    pub fn tls_info(&self) -> Option<TlsInfo> {
        match *self {
            Transport::Plain(..) => None,
            Transport::Tls(ref t) => {
                let protocol = t.session.protocol_version()?;
                let suite = t.session.negotiated_cipher_suite()?;
                Some(TlsInfo {
                    protocol: format!("{:?}", protocol),
                    cipher_suite: format!("{:?}", suite.suite()),
                })
            }
        }
    }
}

#[cfg(feature = "tls")]
pub struct TlsStream {
    socket: TcpStream,
    session: rustls::ServerConnection,
}

#[cfg(feature = "tls")]
fn tls_err(err: rustls::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

#[cfg(feature = "tls")]
impl TlsStream {
    fn handshake(&mut self) -> io::Result<bool> {
        while self.session.is_handshaking() {
            if self.session.wants_write() {
                match self.session.write_tls(&mut self.socket) {
                    Ok(_) => continue,
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            }
            match self.session.read_tls(&mut self.socket) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer closed during tls handshake",
                    ))
                }
                Ok(_) => {
                    self.session.process_new_packets().map_err(tls_err)?;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        // flush handshake tail (tickets, finished) opportunistically
        while self.session.wants_write() {
            match self.session.write_tls(&mut self.socket) {
                Ok(_) => {}
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.session.reader().read(buf) {
                Ok(n) => return Ok(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
            // no plaintext buffered, pull more ciphertext
            match self.session.read_tls(&mut self.socket)? {
                0 => return Ok(0),
                _ => {
                    self.session.process_new_packets().map_err(tls_err)?;
                }
            }
        }
    }

    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.session.writer().write(buf)?;
        while self.session.wants_write() {
            match self.session.write_tls(&mut self.socket) {
                Ok(_) => {}
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        if n == 0 && !buf.is_empty() {
            // session buffer full and the socket will not take more
            return Err(io::ErrorKind::WouldBlock.into());
        }
        Ok(n)
    }
}

/// Builds a rustls server config from PEM-encoded certificate chain and
/// private key, optionally restricted to the named cipher suites in
/// priority order.
#[cfg(feature = "tls")]
pub fn make_server_config(
    cert_pem: &[u8],
    key_pem: &[u8],
    cipher_priority: Option<&[String]>,
) -> Result<Arc<rustls::ServerConfig>, crate::error::Error> {
    use crate::error::Error;

    let certs = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::TlsSetup(format!("bad certificate pem: {}", e)))?;
    if certs.is_empty() {
        return Err(Error::TlsSetup("no certificate in pem".into()));
    }
    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| Error::TlsSetup(format!("bad key pem: {}", e)))?
        .ok_or_else(|| Error::TlsSetup("no private key in pem".into()))?;

    let mut provider = rustls::crypto::ring::default_provider();
    if let Some(names) = cipher_priority {
        let mut picked = Vec::new();
        for name in names {
            if let Some(&suite) = provider
                .cipher_suites
                .iter()
                .find(|s| format!("{:?}", s.suite()).eq_ignore_ascii_case(name))
            {
                picked.push(suite);
            }
        }
        if picked.is_empty() {
            return Err(Error::TlsSetup("cipher priority matches no suite".into()));
        }
        provider.cipher_suites = picked;
    }

    let config = rustls::ServerConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(rustls::ALL_VERSIONS)
        .map_err(|e| Error::TlsSetup(format!("protocol versions: {}", e)))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::TlsSetup(format!("certificate setup: {}", e)))?;
    Ok(Arc::new(config))
}
