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

//! Transparency ("dot stuffing") for the multi-line payloads of SMTP DATA and
//! POP3 RETR/TOP.

use std::io::{self, BufRead, Write};

/// Copy `src` into `dst`, applying CRLF-strict dot stuffing. The copy includes
/// the terminating ".\r\n".
pub fn write_dot_stuffed(
    dst: &mut impl Write,
    src: &mut impl BufRead,
) -> io::Result<()> {
    let mut start_of_line = true;
    let mut prev_end = 0u8;

    loop {
        let mut buffer = src.fill_buf()?;
        if buffer.is_empty() {
            break;
        }

        if let Some(eol) = memchr::memchr(b'\n', buffer) {
            buffer = &buffer[..eol + 1];
        }

        if start_of_line && Some(&b'.') == buffer.first() {
            dst.write_all(b".")?;
        }
        dst.write_all(buffer)?;

        let last = buffer[buffer.len() - 1];
        let prev = buffer
            .get(buffer.len().wrapping_sub(2))
            .copied()
            .unwrap_or(prev_end);
        start_of_line = b'\r' == prev && b'\n' == last;
        prev_end = last;

        let buffer_len = buffer.len();
        src.consume(buffer_len);
    }

    if !start_of_line {
        dst.write_all(b"\r\n")?;
    }
    dst.write_all(b".\r\n")?;
    dst.flush()
}

/// The outcome of reading one dot-stuffed payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Unstuffed {
    /// Bytes of content read, after removing transparency dots.
    pub size: u64,
    /// Whether content beyond the limit was discarded.
    pub truncated: bool,
}

/// Read a dot-stuffed payload from `src` up to and including the lone "."
/// terminator line, writing the content without transparency dots to `dst`.
///
/// Content past `limit` bytes is still consumed from `src` so the protocol
/// stays in sync, but is not written.
pub fn read_dot_stuffed(
    dst: &mut impl Write,
    src: &mut impl BufRead,
    limit: u64,
) -> io::Result<Unstuffed> {
    let mut line = Vec::new();
    let mut result = Unstuffed {
        size: 0,
        truncated: false,
    };

    loop {
        line.clear();
        if 0 == src.read_until(b'\n', &mut line)? {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "EOF encountered in dot-stuffed payload",
            ));
        }

        if b".\r\n" == &line[..] || b".\n" == &line[..] {
            break;
        }

        let content = if Some(&b'.') == line.first() {
            &line[1..]
        } else {
            &line[..]
        };

        if result.truncated || result.size + content.len() as u64 > limit {
            result.truncated = true;
            continue;
        }

        dst.write_all(content)?;
        result.size += content.len() as u64;
    }

    Ok(result)
}
