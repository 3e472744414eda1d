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

//! Minimal clients for the remote mail servers Mailgate fetches from and
//! relays through.
//!
//! Each client only knows the handful of commands Mailgate issues; anything
//! unexpected from the server becomes an `Error::Rejected` carrying the
//! offending line.

use std::io::{self, BufRead, BufReader, Read, Write};

use log::debug;
use openssl::ssl::{SslConnector, SslMethod};

use super::tunnel::BoxConduit;
use crate::support::dot_stuffing::{read_dot_stuffed, write_dot_stuffed};
use crate::support::error::Error;

const MAX_LINE: u64 = 4096;

/// Which kind of server a connection is for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    Pop3,
    Imap,
    Smtp,
}

/// A line-oriented conversation over a conduit.
#[derive(Debug)]
struct LineIo {
    io: BufReader<BoxConduit>,
}

impl LineIo {
    fn new(conduit: BoxConduit) -> Self {
        LineIo {
            io: BufReader::new(conduit),
        }
    }

    fn read_line(&mut self) -> Result<String, Error> {
        let mut buffer = Vec::new();
        (&mut self.io)
            .take(MAX_LINE)
            .read_until(b'\n', &mut buffer)?;
        if !buffer.ends_with(b"\n") {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "Server closed connection or sent an overlong line",
            )
            .into());
        }

        while buffer.ends_with(b"\n") || buffer.ends_with(b"\r") {
            buffer.pop();
        }
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    fn send(&mut self, line: &str) -> Result<(), Error> {
        let w = self.io.get_mut();
        w.write_all(line.as_bytes())?;
        w.write_all(b"\r\n")?;
        w.flush()?;
        Ok(())
    }

    fn into_conduit(self) -> BoxConduit {
        self.io.into_inner()
    }
}

fn rejected(line: &str) -> Error {
    Error::Rejected(line.to_owned())
}

#[derive(Debug)]
pub struct Pop3Client {
    io: LineIo,
}

impl Pop3Client {
    /// Wait for the server greeting.
    pub fn connect(conduit: BoxConduit) -> Result<Self, Error> {
        let mut this = Pop3Client {
            io: LineIo::new(conduit),
        };
        let greeting = this.io.read_line()?;
        if !greeting.starts_with("+OK") {
            return Err(rejected(&greeting));
        }
        Ok(this)
    }

    fn command(&mut self, line: &str) -> Result<String, Error> {
        self.io.send(line)?;
        let response = self.io.read_line()?;
        if response.starts_with("+OK") {
            Ok(response[3..].trim().to_owned())
        } else {
            Err(rejected(&response))
        }
    }

    pub fn login(&mut self, user: &str, password: &str) -> Result<(), Error> {
        self.command(&format!("USER {}", user))?;
        self.command(&format!("PASS {}", password))?;
        Ok(())
    }

    /// Returns the message count and total size.
    pub fn stat(&mut self) -> Result<(u32, u64), Error> {
        let response = self.command("STAT")?;
        let mut parts = response.split_whitespace();
        match (
            parts.next().and_then(|s| s.parse().ok()),
            parts.next().and_then(|s| s.parse().ok()),
        ) {
            (Some(count), Some(size)) => Ok((count, size)),
            _ => Err(rejected(&response)),
        }
    }

    pub fn retr(&mut self, id: u32, limit: u64) -> Result<Vec<u8>, Error> {
        self.command(&format!("RETR {}", id))?;
        let mut data = Vec::new();
        read_dot_stuffed(&mut data, &mut self.io.io, limit)?;
        Ok(data)
    }

    pub fn dele(&mut self, id: u32) -> Result<(), Error> {
        self.command(&format!("DELE {}", id)).map(|_| ())
    }

    pub fn quit(mut self) -> Result<(), Error> {
        self.command("QUIT").map(|_| ())
    }
}

#[derive(Debug)]
pub struct SmtpClient {
    io: LineIo,
    extensions: Vec<String>,
}

impl SmtpClient {
    /// Wait for the greeting and introduce ourselves as `local_name`.
    ///
    /// If the connection is not yet encrypted and the server offers
    /// `STARTTLS`, the connection is upgraded, verifying the server as
    /// `server_name`.
    pub fn connect(
        conduit: BoxConduit,
        server_name: &str,
        local_name: &str,
        encrypted: bool,
    ) -> Result<Self, Error> {
        let mut this = SmtpClient {
            io: LineIo::new(conduit),
            extensions: Vec::new(),
        };
        this.expect(&[220])?;
        this.ehlo(local_name)?;

        if !encrypted && this.has_extension("STARTTLS") {
            this.io.send("STARTTLS")?;
            this.expect(&[220])?;
            let conduit = this.io.into_conduit();
            let stream = SslConnector::builder(SslMethod::tls())?
                .build()
                .connect(server_name, conduit)
                .map_err(|e| Error::Protocol(format!("STARTTLS: {}", e)))?;
            this = SmtpClient {
                io: LineIo::new(Box::new(stream)),
                extensions: Vec::new(),
            };
            this.ehlo(local_name)?;
        }

        Ok(this)
    }

    /// Read one possibly multi-line reply, returning its code and text lines.
    fn reply(&mut self) -> Result<(u16, Vec<String>), Error> {
        let mut lines = Vec::new();
        loop {
            let line = self.io.read_line()?;
            let code = line
                .get(..3)
                .and_then(|c| c.parse::<u16>().ok())
                .ok_or_else(|| rejected(&line))?;
            let more = Some("-") == line.get(3..4);
            lines.push(line.get(4..).unwrap_or("").to_owned());
            if !more {
                return Ok((code, lines));
            }
        }
    }

    fn expect(&mut self, codes: &[u16]) -> Result<Vec<String>, Error> {
        let (code, lines) = self.reply()?;
        if codes.contains(&code) {
            Ok(lines)
        } else {
            Err(Error::Rejected(format!(
                "{} {}",
                code,
                lines.last().map_or("", |s| s.as_str())
            )))
        }
    }

    fn ehlo(&mut self, local_name: &str) -> Result<(), Error> {
        self.io.send(&format!("EHLO {}", local_name))?;
        let lines = self.expect(&[250])?;
        self.extensions = lines.into_iter().skip(1).collect();
        Ok(())
    }

    pub fn has_extension(&self, name: &str) -> bool {
        self.extensions.iter().any(|e| {
            e.split_whitespace()
                .next()
                .map_or(false, |k| k.eq_ignore_ascii_case(name))
        })
    }

    pub fn auth_plain(
        &mut self,
        user: &str,
        password: &str,
    ) -> Result<(), Error> {
        let token = base64::encode(format!("\0{}\0{}", user, password));
        self.io.send(&format!("AUTH PLAIN {}", token))?;
        self.expect(&[235]).map(|_| ())
    }

    /// Send one message. `data` is the raw message, without dot stuffing.
    pub fn send_mail(
        &mut self,
        from: &str,
        recipients: &[String],
        data: &[u8],
    ) -> Result<(), Error> {
        self.io.send(&format!("MAIL FROM:<{}>", from))?;
        self.expect(&[250])?;
        for recipient in recipients {
            self.io.send(&format!("RCPT TO:<{}>", recipient))?;
            self.expect(&[250, 251])?;
        }
        self.io.send("DATA")?;
        self.expect(&[354])?;

        let mut src = data;
        write_dot_stuffed(self.io.io.get_mut(), &mut src)?;
        self.expect(&[250])?;
        debug!("Sent {} bytes to {} recipients", data.len(), recipients.len());
        Ok(())
    }

    /// Abandon the current transaction.
    pub fn reset(&mut self) -> Result<(), Error> {
        self.io.send("RSET")?;
        self.expect(&[250]).map(|_| ())
    }

    pub fn quit(mut self) -> Result<(), Error> {
        self.io.send("QUIT")?;
        self.expect(&[221]).map(|_| ())
    }
}

#[derive(Debug)]
pub struct ImapClient {
    io: LineIo,
    next_tag: u32,
}

fn imap_quote(s: &str) -> String {
    let mut quoted = String::with_capacity(s.len() + 2);
    quoted.push('"');
    for c in s.chars() {
        if '"' == c || '\\' == c {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

impl ImapClient {
    pub fn connect(conduit: BoxConduit) -> Result<Self, Error> {
        let mut this = ImapClient {
            io: LineIo::new(conduit),
            next_tag: 1,
        };
        let greeting = this.io.read_line()?;
        if !greeting.starts_with("* OK") {
            return Err(rejected(&greeting));
        }
        Ok(this)
    }

    fn command(&mut self, command: &str) -> Result<(), Error> {
        let tag = format!("a{}", self.next_tag);
        self.next_tag += 1;
        self.io.send(&format!("{} {}", tag, command))?;

        loop {
            let line = self.io.read_line()?;
            if line.starts_with("* ") {
                continue;
            }

            let mut parts = line.splitn(3, ' ');
            return match (parts.next(), parts.next()) {
                (Some(t), Some(status))
                    if t == tag && status.eq_ignore_ascii_case("OK") =>
                {
                    Ok(())
                }
                _ => Err(rejected(&line)),
            };
        }
    }

    pub fn login(&mut self, user: &str, password: &str) -> Result<(), Error> {
        self.command(&format!(
            "LOGIN {} {}",
            imap_quote(user),
            imap_quote(password)
        ))
    }

    pub fn logout(mut self) -> Result<(), Error> {
        self.command("LOGOUT")
    }
}

/// An authenticated client of whichever role was asked for.
#[derive(Debug)]
pub enum MailClient {
    Pop3(Pop3Client),
    Smtp(SmtpClient),
    Imap(ImapClient),
}

impl MailClient {
    pub fn role(&self) -> Role {
        match *self {
            MailClient::Pop3(..) => Role::Pop3,
            MailClient::Smtp(..) => Role::Smtp,
            MailClient::Imap(..) => Role::Imap,
        }
    }

    /// Politely end the session.
    pub fn close(self) -> Result<(), Error> {
        match self {
            MailClient::Pop3(c) => c.quit(),
            MailClient::Smtp(c) => c.quit(),
            MailClient::Imap(c) => c.logout(),
        }
    }
}
