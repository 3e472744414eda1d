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

use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Unsafe mailbox name")]
    UnsafeName,
    #[error("Mailbox is busy")]
    MailboxBusy,
    #[error("Mailbox is not open")]
    MailboxNotOpen,
    #[error("No such message")]
    NxMessage,
    #[error("Message already deleted")]
    ExpungedMessage,
    #[error("No such account")]
    NoSuchAccount,
    #[error("No usable outbound route")]
    NoRoute,
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Remote rejected: {0}")]
    Rejected(String),
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Operation timed out")]
    TimedOut,
    #[error("Malformed candidate line: {0}")]
    BadCandidate(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Ssl(#[from] openssl::error::ErrorStack),
    #[error(transparent)]
    SslStream(#[from] openssl::ssl::Error),
    #[error(transparent)]
    Cbor(#[from] serde_cbor::error::Error),
    #[error(transparent)]
    Toml(#[from] toml::de::Error),
    #[error(transparent)]
    Nix(#[from] nix::Error),
}

impl Error {
    /// Whether this error represents the remote end going away or the
    /// connection idling out.
    pub fn is_disconnect(&self) -> bool {
        match *self {
            Error::Io(ref e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::WouldBlock
            ),
            Error::TimedOut | Error::Cancelled => true,
            _ => false,
        }
    }

    /// Whether this error is a read timing out on an idle connection.
    pub fn is_idle_timeout(&self) -> bool {
        match *self {
            Error::Io(ref e) => matches!(
                e.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

/// Render `e` for inclusion in socket-level diagnostics, capped at `max`
/// characters.
pub fn summarise(e: &dyn std::fmt::Display, max: usize) -> String {
    let mut s = e.to_string();
    s.retain(|c| !c.is_control());
    if let Some((truncate_len, _)) = s.char_indices().nth(max) {
        s.truncate(truncate_len);
        s.push('…');
    }
    s
}
