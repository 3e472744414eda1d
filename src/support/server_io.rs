//-
// Copyright (c) 2026, The Mailgate developers
//
// This file is part of Mailgate.
//
// Mailgate is free software: you can  redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Mailgate is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Mailgate. If not, see <http://www.gnu.org/licenses/>.

//! The byte stream a POP3 or SMTP session runs over.
//!
//! Sessions start in cleartext and may be upgraded to TLS in place by STLS or
//! STARTTLS, so the stream is held behind a shared cell: the session's
//! `BufReader` and its writer both refer to the same `SessionIo`, and the
//! upgrade swaps the underlying mode without either of them noticing.

use std::cell::RefCell;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{IpAddr, TcpStream};
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::time::Duration;

use openssl::ssl::{HandshakeError, SslAcceptor, SslStream};

use super::error::Error;

/// A connected, blocking, bidirectional socket.
pub trait Socket: Read + Write + Send + fmt::Debug {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
    /// The remote IP address, if this is an IP socket.
    fn peer_ip(&self) -> Option<IpAddr>;
}

impl Socket for TcpStream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }

    fn peer_ip(&self) -> Option<IpAddr> {
        self.peer_addr().ok().map(|a| a.ip())
    }
}

impl Socket for UnixStream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        UnixStream::set_read_timeout(self, timeout)
    }

    fn peer_ip(&self) -> Option<IpAddr> {
        None
    }
}

enum Mode {
    Cleartext(Box<dyn Socket>),
    Ssl(SslStream<Box<dyn Socket>>),
    /// The handshake failed part way; the connection is unusable.
    Broken,
}

pub struct ServerIo {
    mode: Mode,
}

impl ServerIo {
    pub fn new(sock: impl Socket + 'static) -> Self {
        ServerIo {
            mode: Mode::Cleartext(Box::new(sock)),
        }
    }

    pub fn is_ssl(&self) -> bool {
        matches!(self.mode, Mode::Ssl(..))
    }

    /// Describe the negotiated TLS session, if any.
    pub fn ssl_string(&self) -> Option<String> {
        match self.mode {
            Mode::Ssl(ref s) => {
                let ssl = s.ssl();
                Some(format!(
                    "{} {}",
                    ssl.version_str(),
                    ssl.current_cipher().map_or("?", |c| c.name())
                ))
            }
            _ => None,
        }
    }

    fn socket(&self) -> Option<&dyn Socket> {
        match self.mode {
            Mode::Cleartext(ref s) => Some(&**s),
            Mode::Ssl(ref s) => Some(&**s.get_ref()),
            Mode::Broken => None,
        }
    }

    pub fn set_read_timeout(
        &self,
        timeout: Option<Duration>,
    ) -> io::Result<()> {
        match self.socket() {
            Some(s) => s.set_read_timeout(timeout),
            None => Ok(()),
        }
    }

    pub fn peer_ip(&self) -> Option<IpAddr> {
        self.socket().and_then(|s| s.peer_ip())
    }

    /// Perform the server side of a TLS handshake over the current
    /// cleartext stream.
    pub fn ssl_accept(&mut self, acceptor: &SslAcceptor) -> Result<(), Error> {
        let sock = match std::mem::replace(&mut self.mode, Mode::Broken) {
            Mode::Cleartext(sock) => sock,
            other => {
                self.mode = other;
                return Err(Error::Protocol("TLS already active".to_owned()));
            }
        };

        match acceptor.accept(sock) {
            Ok(stream) => {
                self.mode = Mode::Ssl(stream);
                Ok(())
            }
            Err(HandshakeError::SetupFailure(e)) => Err(e.into()),
            Err(HandshakeError::Failure(mid)) => Err(mid.into_error().into()),
            Err(HandshakeError::WouldBlock(_)) => Err(Error::TimedOut),
        }
    }
}

fn broken() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "TLS handshake failed")
}

impl Read for ServerIo {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        match self.mode {
            Mode::Cleartext(ref mut s) => s.read(dst),
            Mode::Ssl(ref mut s) => s.read(dst),
            Mode::Broken => Err(broken()),
        }
    }
}

impl Write for ServerIo {
    fn write(&mut self, src: &[u8]) -> io::Result<usize> {
        match self.mode {
            Mode::Cleartext(ref mut s) => s.write(src),
            Mode::Ssl(ref mut s) => s.write(src),
            Mode::Broken => Err(broken()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.mode {
            Mode::Cleartext(ref mut s) => s.flush(),
            Mode::Ssl(ref mut s) => s.flush(),
            Mode::Broken => Ok(()),
        }
    }
}

/// A shared handle to a `ServerIo`, so that one stream can be split into a
/// buffered reader half and a writer half.
///
/// Handles are not `Send`; a session creates them on its own thread.
#[derive(Clone)]
pub struct SessionIo(Rc<RefCell<ServerIo>>);

impl SessionIo {
    pub fn new(io: ServerIo) -> Self {
        SessionIo(Rc::new(RefCell::new(io)))
    }

    pub fn is_ssl(&self) -> bool {
        self.0.borrow().is_ssl()
    }

    pub fn ssl_string(&self) -> Option<String> {
        self.0.borrow().ssl_string()
    }

    pub fn peer_ip(&self) -> Option<IpAddr> {
        self.0.borrow().peer_ip()
    }

    pub fn set_idle_timeout(&self, timeout: Duration) -> io::Result<()> {
        let timeout = if timeout == Duration::from_secs(0) {
            None
        } else {
            Some(timeout)
        };
        self.0.borrow().set_read_timeout(timeout)
    }

    pub fn ssl_accept(&self, acceptor: &SslAcceptor) -> Result<(), Error> {
        self.0.borrow_mut().ssl_accept(acceptor)
    }
}

impl Read for SessionIo {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        self.0.borrow_mut().read(dst)
    }
}

impl Write for SessionIo {
    fn write(&mut self, src: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().write(src)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.borrow_mut().flush()
    }
}
