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

//! Dialling, and the proxy handshakes that turn a connection to a proxy into
//! a connection to the real destination.

use std::fmt;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpStream, ToSocketAddrs};
use std::os::unix::io::FromRawFd;
use std::time::Duration;

use log::debug;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::socket::{
    self, sockopt, AddressFamily, InetAddr, SockAddr, SockFlag, SockType,
};
use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};

use super::proxy::ProxyKind;
use crate::support::error::Error;

/// A connected byte stream to somewhere on the network, possibly tunnelled
/// and possibly encrypted.
pub trait Conduit: Read + Write + Send + fmt::Debug {}
impl<T: Read + Write + Send + fmt::Debug> Conduit for T {}

pub type BoxConduit = Box<dyn Conduit>;

/// Open a TCP connection to `host:port`, optionally from the local address
/// `local`, giving up after `timeout`.
pub fn dial(
    host: &str,
    port: u16,
    local: Option<IpAddr>,
    timeout: Duration,
) -> Result<TcpStream, Error> {
    let mut last_error = None::<Error>;
    for addr in (host, port).to_socket_addrs()? {
        let result = match local {
            None => TcpStream::connect_timeout(&addr, timeout)
                .map_err(Error::from),
            Some(local) => dial_from(addr, local, timeout),
        };

        match result {
            Ok(stream) => {
                stream.set_read_timeout(Some(timeout))?;
                stream.set_write_timeout(Some(timeout))?;
                return Ok(stream);
            }
            Err(e) => {
                debug!("Connect to {} failed: {}", addr, e);
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| {
        Error::Protocol(format!("{} did not resolve to anything", host))
    }))
}

fn dial_from(
    addr: SocketAddr,
    local: IpAddr,
    timeout: Duration,
) -> Result<TcpStream, Error> {
    let family = match addr {
        SocketAddr::V4(..) => AddressFamily::Inet,
        SocketAddr::V6(..) => AddressFamily::Inet6,
    };
    if local.is_ipv4() != addr.is_ipv4() {
        return Err(Error::Protocol(format!(
            "Cannot reach {} from {}",
            addr, local
        )));
    }

    let fd = socket::socket(
        family,
        SockType::Stream,
        SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
        None,
    )?;
    // Owned from here on so that every error path closes it
    let stream = unsafe { TcpStream::from_raw_fd(fd) };

    socket::bind(
        fd,
        &SockAddr::new_inet(InetAddr::from_std(&SocketAddr::new(local, 0))),
    )?;
    match socket::connect(fd, &SockAddr::new_inet(InetAddr::from_std(&addr)))
    {
        Ok(()) => (),
        Err(nix::Error::Sys(Errno::EINPROGRESS)) => {
            let mut fds = [PollFd::new(fd, PollFlags::POLLOUT)];
            let millis = timeout.as_millis().min(i32::MAX as u128) as i32;
            if 0 == poll(&mut fds, millis)? {
                return Err(Error::TimedOut);
            }

            let status = socket::getsockopt(fd, sockopt::SocketError)?;
            if 0 != status {
                return Err(io::Error::from_raw_os_error(status).into());
            }
        }
        Err(e) => return Err(e.into()),
    }

    stream.set_nonblocking(false)?;
    Ok(stream)
}

/// Perform the handshake for a proxy of the given kind over `stream`, which
/// is connected to the proxy itself, so that it becomes connected to
/// `host:port`.
pub fn handshake(
    kind: ProxyKind,
    stream: TcpStream,
    proxy_host: &str,
    host: &str,
    port: u16,
) -> Result<BoxConduit, Error> {
    match kind {
        ProxyKind::Http => {
            let mut stream = stream;
            http_connect(&mut stream, host, port)?;
            Ok(Box::new(stream))
        }
        ProxyKind::Https => {
            // Public proxy lists do not come with trustworthy certificates;
            // the destination's own TLS is what authenticates it.
            let mut connector = SslConnector::builder(SslMethod::tls())?;
            connector.set_verify(SslVerifyMode::NONE);
            let mut stream = connector
                .build()
                .configure()?
                .verify_hostname(false)
                .connect(proxy_host, stream)
                .map_err(|e| Error::Protocol(format!("TLS to proxy: {}", e)))?;
            http_connect(&mut stream, host, port)?;
            Ok(Box::new(stream))
        }
        ProxyKind::Socks4 => {
            let mut stream = stream;
            socks4_connect(&mut stream, host, port)?;
            Ok(Box::new(stream))
        }
        ProxyKind::Socks5 => {
            let mut stream = stream;
            socks5_connect(&mut stream, host, port)?;
            Ok(Box::new(stream))
        }
    }
}

const MAX_HTTP_HEADER: usize = 8192;

/// Ask an HTTP proxy to open a tunnel with `CONNECT`.
pub fn http_connect(
    stream: &mut (impl Read + Write),
    host: &str,
    port: u16,
) -> Result<(), Error> {
    let authority = if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    };
    write!(
        stream,
        "CONNECT {0} HTTP/1.1\r\nHost: {0}\r\n\r\n",
        authority
    )?;
    stream.flush()?;

    // Read byte-at-a-time so nothing past the header is consumed
    let mut reader = BufReader::with_capacity(1, stream);
    let mut status = String::new();
    let mut total = 0;
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line)?;
        if 0 == n {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "Proxy closed connection during CONNECT",
            )
            .into());
        }

        total += n;
        if total > MAX_HTTP_HEADER {
            return Err(Error::Protocol("Proxy response too long".to_owned()));
        }

        if status.is_empty() {
            status = line.trim_end().to_owned();
        } else if line == "\r\n" || line == "\n" {
            break;
        }
    }

    let mut parts = status.splitn(3, ' ');
    match (parts.next(), parts.next()) {
        (Some(version), Some(code))
            if version.starts_with("HTTP/") && code.starts_with('2') =>
        {
            Ok(())
        }
        _ => Err(Error::Protocol(format!("Proxy refused: {}", status))),
    }
}

/// SOCKS4 `CONNECT`, using the 4a extension when `host` is not an IPv4
/// address.
pub fn socks4_connect(
    stream: &mut (impl Read + Write),
    host: &str,
    port: u16,
) -> Result<(), Error> {
    let mut request = vec![4u8, 1];
    request.extend_from_slice(&port.to_be_bytes());
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            request.extend_from_slice(&ip.octets());
            request.push(0);
        }
        Ok(IpAddr::V6(_)) => {
            return Err(Error::Protocol("SOCKS4 cannot reach IPv6".to_owned()))
        }
        Err(_) => {
            request.extend_from_slice(&[0, 0, 0, 1, 0]);
            request.extend_from_slice(host.as_bytes());
            request.push(0);
        }
    }
    stream.write_all(&request)?;
    stream.flush()?;

    let mut reply = [0u8; 8];
    stream.read_exact(&mut reply)?;
    if 0x5A != reply[1] {
        return Err(Error::Protocol(format!(
            "SOCKS4 request rejected ({:#04x})",
            reply[1]
        )));
    }

    Ok(())
}

/// SOCKS5 `CONNECT` without authentication.
pub fn socks5_connect(
    stream: &mut (impl Read + Write),
    host: &str,
    port: u16,
) -> Result<(), Error> {
    stream.write_all(&[5, 1, 0])?;
    stream.flush()?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice)?;
    if [5, 0] != choice {
        return Err(Error::Protocol(
            "SOCKS5 proxy requires authentication".to_owned(),
        ));
    }

    let mut request = vec![5u8, 1, 0];
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            request.push(1);
            request.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            request.push(4);
            request.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            if host.len() > 255 {
                return Err(Error::Protocol("Host name too long".to_owned()));
            }
            request.push(3);
            request.push(host.len() as u8);
            request.extend_from_slice(host.as_bytes());
        }
    }
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request)?;
    stream.flush()?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head)?;
    if 0 != head[1] {
        return Err(Error::Protocol(format!(
            "SOCKS5 request rejected ({:#04x})",
            head[1]
        )));
    }

    // Skip the bound address
    let addr_len = match head[3] {
        1 => 4,
        4 => 16,
        3 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len)?;
            len[0] as usize
        }
        other => {
            return Err(Error::Protocol(format!(
                "SOCKS5 reply has unknown address type {}",
                other
            )))
        }
    };
    let mut rest = vec![0u8; addr_len + 2];
    stream.read_exact(&mut rest)?;

    Ok(())
}
