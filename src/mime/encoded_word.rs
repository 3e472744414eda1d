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

use std::borrow::Cow;

use encoding_rs::Encoding;
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref ENCODED_WORD: Regex =
        Regex::new(r"^=\?([!->@-~]*)\?([!->@-~]*)\?([!->@-~]*)\?=$").unwrap();
}

/// Test if `word` (in its entirety) is an RFC 2047 "encoded word", and decode
/// it if so.
///
/// Returns `None` if it is not an encoded word or if it could not be decoded.
/// The distinction matters because whitespace between adjacent encoded words
/// is dropped.
pub fn ew_decode(word: &str) -> Option<String> {
    let captures = ENCODED_WORD.captures(word)?;

    // RFC 2231 allows a language suffix on the charset
    let charset = captures[1].split('*').next().unwrap_or("");
    let content = captures[3].as_bytes();

    let raw: Cow<[u8]> = match &captures[2] {
        "q" | "Q" => Cow::Owned(q_decode(content)?),
        "b" | "B" => Cow::Owned(base64::decode(content).ok()?),
        _ => return None,
    };

    let encoding = Encoding::for_label_no_replacement(charset.as_bytes())?;
    Some(encoding.decode_with_bom_removal(&raw).0.into_owned())
}

/// Decode the "Q" encoding, where `_` is a space and `=XX` is a hex octet.
fn q_decode(content: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(content.len());
    let mut it = content.iter().copied();
    while let Some(b) = it.next() {
        match b {
            b'_' => out.push(b' '),
            b'=' => {
                let hi = (it.next()? as char).to_digit(16)?;
                let lo = (it.next()? as char).to_digit(16)?;
                out.push((hi * 16 + lo) as u8);
            }
            b => out.push(b),
        }
    }
    Some(out)
}

/// Decode every encoded word within an unstructured header value such as
/// `Subject`.
pub fn decode_words(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut pending_space = String::new();
    let mut prev_encoded = false;

    for (ix, part) in value.split(|c| c == ' ' || c == '\t').enumerate() {
        if 0 != ix {
            pending_space.push(' ');
        }
        if part.is_empty() {
            continue;
        }

        match ew_decode(part) {
            Some(decoded) => {
                if !prev_encoded {
                    out.push_str(&pending_space);
                }
                out.push_str(&decoded);
                prev_encoded = true;
            }
            None => {
                out.push_str(&pending_space);
                out.push_str(part);
                prev_encoded = false;
            }
        }
        pending_space.clear();
    }

    out
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_ew_decode() {
        assert_eq!(None, ew_decode("hello world"));
        assert_eq!(
            Some("Keith Moore".to_owned()),
            ew_decode("=?US-ASCII?Q?Keith_Moore?=")
        );
        assert_eq!(
            Some("Keld Jørn Simonsen".to_owned()),
            ew_decode("=?ISO-8859-1?Q?Keld_J=F8rn_Simonsen?=")
        );
        assert_eq!(
            Some("If you can read this yo".to_owned()),
            ew_decode("=?ISO-8859-1?B?SWYgeW91IGNhbiByZWFkIHRoaXMgeW8=?=")
        );
        assert_eq!(None, ew_decode("=?no-such-charset?Q?x?="));
        assert_eq!(None, ew_decode("=?utf-8?Q?bad=G0?="));
    }

    #[test]
    fn test_decode_words() {
        assert_eq!("plain subject", decode_words("plain subject"));
        assert_eq!(
            "Re: If you can read this you understand the example.",
            decode_words(
                "Re: =?ISO-8859-1?B?SWYgeW91IGNhbiByZWFkIHRoaXMgeW8=?= \
                 =?ISO-8859-2?B?dSB1bmRlcnN0YW5kIHRoZSBleGFtcGxlLg==?="
            )
        );
        assert_eq!(
            "André wrote",
            decode_words("=?ISO-8859-1?Q?Andr=E9?= wrote")
        );
    }

    proptest! {
        #[test]
        fn ew_decode_never_panics(s in r"=\?.*\?.*\?.*\?=") {
            ew_decode(&s);
        }
    }
}
