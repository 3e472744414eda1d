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

//! Just enough RFC 5322 header handling to index and route messages.

use chrono::prelude::*;
use lazy_static::lazy_static;
use regex::Regex;

use super::encoded_word::decode_words;

/// The unfolded header block of a message.
#[derive(Clone, Debug, Default)]
pub struct Headers {
    fields: Vec<(String, String)>,
    /// Offset of the first body byte in the original data.
    body_offset: usize,
}

impl Headers {
    /// Parse the header block at the start of `data`.
    ///
    /// Parsing stops at the first empty line or at the first line which is
    /// neither a field nor a continuation. Non-UTF-8 bytes are replaced.
    pub fn parse(data: &[u8]) -> Self {
        let mut fields: Vec<(String, String)> = Vec::new();
        let mut offset = 0;

        while offset < data.len() {
            let end = memchr::memchr(b'\n', &data[offset..])
                .map_or(data.len(), |eol| offset + eol + 1);
            let raw = &data[offset..end];
            let line = String::from_utf8_lossy(raw);
            let line = line.trim_end_matches(|c| c == '\r' || c == '\n');

            if line.is_empty() {
                offset = end;
                break;
            }

            if line.starts_with(' ') || line.starts_with('\t') {
                if let Some(last) = fields.last_mut() {
                    last.1.push(' ');
                    last.1.push_str(line.trim());
                    offset = end;
                    continue;
                }
            }

            match line.find(':') {
                Some(colon) if colon > 0 && !line[..colon].contains(' ') => {
                    fields.push((
                        line[..colon].to_owned(),
                        line[colon + 1..].trim().to_owned(),
                    ));
                }
                _ => break,
            }

            offset = end;
        }

        Headers {
            fields,
            body_offset: offset,
        }
    }

    pub fn body_offset(&self) -> usize {
        self.body_offset
    }

    /// The raw value of the first field named `name`, case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|&&(ref n, _)| n.eq_ignore_ascii_case(name))
            .map(|&(_, ref v)| v.as_str())
    }

    pub fn get_all<'a>(
        &'a self,
        name: &'a str,
    ) -> impl Iterator<Item = &'a str> + 'a {
        self.fields
            .iter()
            .filter(move |&&(ref n, _)| n.eq_ignore_ascii_case(name))
            .map(|&(_, ref v)| v.as_str())
    }

    /// The value of `name` with any RFC 2047 encoded words decoded.
    pub fn decoded(&self, name: &str) -> Option<String> {
        self.get(name).map(decode_words)
    }

    /// All addresses listed in every field named `name`.
    pub fn addresses(&self, name: &str) -> Vec<Mailbox> {
        self.get_all(name).flat_map(parse_address_list).collect()
    }

    pub fn date(&self) -> Option<DateTime<Utc>> {
        self.get("Date").and_then(parse_date)
    }
}

/// One `name <address>` element of an address list.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Mailbox {
    pub name: String,
    pub address: String,
}

lazy_static! {
    static ref ANGLE_ADDR: Regex = Regex::new(r"<([^<>\s]*)>").unwrap();
    static ref BARE_ADDR: Regex =
        Regex::new(r"([^\s<>,;:@]+@[^\s<>,;:@]+)").unwrap();
}

/// Split an address list on commas which are outside quotes, comments and
/// angle brackets, and extract the name and address of each element.
///
/// Groups are flattened; elements without an address are skipped.
pub fn parse_address_list(value: &str) -> Vec<Mailbox> {
    let mut elements = Vec::new();
    let mut start = 0;
    let mut in_quote = false;
    let mut escaped = false;
    let mut depth = 0i32;

    for (ix, c) in value.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '"' => in_quote = !in_quote,
            '(' | '<' if !in_quote => depth += 1,
            ')' | '>' if !in_quote => depth -= 1,
            ',' | ';' if !in_quote && depth <= 0 => {
                elements.push(&value[start..ix]);
                start = ix + 1;
            }
            _ => (),
        }
    }
    elements.push(&value[start..]);

    elements.into_iter().filter_map(parse_mailbox).collect()
}

fn parse_mailbox(element: &str) -> Option<Mailbox> {
    // Strip a group name if present
    let element = match element.find(':') {
        Some(colon) if !element[..colon].contains('<') => {
            &element[colon + 1..]
        }
        _ => element,
    };

    if let Some(captures) = ANGLE_ADDR.captures(element) {
        let whole = captures.get(0)?;
        let address = captures[1].to_owned();
        if address.is_empty() {
            return None;
        }
        let name = element[..whole.start()].trim().trim_matches('"').trim();
        return Some(Mailbox {
            name: decode_words(name),
            address,
        });
    }

    BARE_ADDR.captures(element).map(|captures| Mailbox {
        name: String::new(),
        address: captures[1].to_owned(),
    })
}

pub fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    // Drop trailing comments like "(UTC)", which chrono does not accept
    let value = match value.find('(') {
        Some(paren) => value[..paren].trim(),
        None => value.trim(),
    };
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

/// Remove every field named `name` from the header block of `data`,
/// returning the values of the removed fields and the remaining message.
pub fn strip_field(data: &[u8], name: &str) -> (Vec<String>, Vec<u8>) {
    let headers = Headers::parse(data);
    let values: Vec<String> =
        headers.get_all(name).map(str::to_owned).collect();
    if values.is_empty() {
        return (values, data.to_vec());
    }

    let mut out = Vec::with_capacity(data.len());
    let mut dropping = false;
    let mut offset = 0;
    while offset < headers.body_offset() {
        let end = memchr::memchr(b'\n', &data[offset..])
            .map_or(data.len(), |eol| offset + eol + 1);
        let line = &data[offset..end];
        let continuation = line.starts_with(b" ") || line.starts_with(b"\t");
        if !continuation {
            dropping = line.len() > name.len()
                && b':' == line[name.len()]
                && line[..name.len()].eq_ignore_ascii_case(name.as_bytes());
        }
        if !dropping {
            out.extend_from_slice(line);
        }
        offset = end;
    }
    out.extend_from_slice(&data[offset..]);

    (values, out)
}

#[cfg(test)]
mod test {
    use super::*;

    const MESSAGE: &[u8] = b"From: \"Zim, Invader\" <zim@irk.example>\r\n\
To: gir@irk.example, Dib <dib@earth.example>\r\n\
Cc: undisclosed-recipients:;\r\n\
Subject: =?ISO-8859-1?Q?Andr=E9?=\r\n\
\x20is here\r\n\
Date: Tue, 1 Jul 2003 10:52:37 +0200 (CEST)\r\n\
Message-ID: <1234@irk.example>\r\n\
\r\n\
Body: not a header\r\n";

    #[test]
    fn parse_headers() {
        let headers = Headers::parse(MESSAGE);
        assert_eq!(Some("<1234@irk.example>"), headers.get("message-id"));
        assert_eq!(
            Some("André is here".to_owned()),
            headers.decoded("Subject")
        );
        assert_eq!(None, headers.get("Body"));
        assert_eq!(
            b"Body: not a header\r\n",
            &MESSAGE[headers.body_offset()..]
        );

        let from = headers.addresses("From");
        assert_eq!(
            vec![Mailbox {
                name: "Zim, Invader".to_owned(),
                address: "zim@irk.example".to_owned(),
            }],
            from
        );

        let to: Vec<String> = headers
            .addresses("To")
            .into_iter()
            .map(|m| m.address)
            .collect();
        assert_eq!(vec!["gir@irk.example", "dib@earth.example"], to);
        assert!(headers.addresses("Cc").is_empty());

        assert_eq!(
            Utc.ymd(2003, 7, 1).and_hms(8, 52, 37),
            headers.date().unwrap()
        );
    }

    #[test]
    fn strip_envelope_field() {
        let data = b"X-Envelope: a@b.example,\r\n c@d.example\r\n\
Subject: hi\r\n\r\nbody\r\n";
        let (values, rest) = strip_field(data, "X-Envelope");
        assert_eq!(vec!["a@b.example, c@d.example".to_owned()], values);
        assert_eq!(b"Subject: hi\r\n\r\nbody\r\n".to_vec(), rest);

        let (values, rest) = strip_field(&rest, "X-Envelope");
        assert!(values.is_empty());
        assert_eq!(b"Subject: hi\r\n\r\nbody\r\n".to_vec(), rest);
    }

    #[test]
    fn headerless_message() {
        let headers = Headers::parse(b"just some text\r\n");
        assert_eq!(None, headers.get("just some text"));
        assert_eq!(0, headers.body_offset());
    }
}
