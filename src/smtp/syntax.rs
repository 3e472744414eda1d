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

use std::str::FromStr;

use lazy_static::lazy_static;
use regex::Regex;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// (HELO|EHLO) origin-host ignored...
    Helo(String, String),
    /// AUTH mechanism [base64]
    Auth(String, Option<String>),
    /// MAIL FROM:<return-path> [SIZE=sz] [BODY=encoding]
    /// The final element is a list of warnings.
    MailFrom(String, Option<u64>, Vec<String>),
    /// RCPT TO:<ignored...:email>
    /// The final element is a list of warnings.
    Recipient(String, Vec<String>),
    /// DATA
    Data,
    /// RSET
    Reset,
    /// VRFY ignored...
    Verify,
    /// HELP ignored...
    Help,
    /// NOOP
    Noop,
    /// QUIT
    Quit,
    /// STARTTLS
    StartTls,
    /// Anything that looks like a common HTTP command.
    Http,
}

const MAX_WARNINGS: usize = 4;

static SIMPLE_COMMANDS: &[(&str, Command, bool)] = &[
    ("DATA", Command::Data, false),
    ("RSET", Command::Reset, false),
    ("VRFY", Command::Verify, true),
    ("HELP", Command::Help, true),
    ("NOOP", Command::Noop, true),
    ("QUIT", Command::Quit, false),
    ("STARTTLS", Command::StartTls, false),
    ("GET ", Command::Http, true),
    ("HEAD ", Command::Http, true),
    ("PUT ", Command::Http, true),
    ("POST ", Command::Http, true),
    ("DELETE ", Command::Http, true),
    ("OPTIONS ", Command::Http, true),
    ("CONNECT ", Command::Http, true),
];

// Clients in the wild write `MAIL FROM:<a>`, `MAIL FROM: <a>`,
// `MAIL FROM <a>` and `MAIL FROM:a`; all of them are accepted.
lazy_static! {
    static ref RX_HELO: Regex =
        Regex::new("^(?i)(HELO|EHLO)(?:[ :] *([^ ]*).*)?$").unwrap();
    static ref RX_MAIL: Regex = Regex::new(
        "^(?i)MAIL +FROM *[: ] *(?:<([^>]*)>|([^ <>]+))(.*)$"
    )
    .unwrap();
    static ref RX_MAIL_BODY_PARM: Regex =
        Regex::new("(?i)^BODY=(7BIT|8BITMIME)$").unwrap();
    static ref RX_MAIL_SIZE_PARM: Regex =
        Regex::new("(?i)^SIZE=([0-9]+)$").unwrap();
    static ref RX_MAIL_SMTPUTF8_PARM: Regex =
        Regex::new("(?i)^SMTPUTF8$").unwrap();
    static ref RX_RCPT: Regex = Regex::new(
        "^(?i)RCPT +TO *[: ] *(?:<(?:@[^:]+:)?([^>]*)>|([^ <>]+))(.*)$"
    )
    .unwrap();
    static ref RX_AUTH: Regex = Regex::new(
        "^(?i)AUTH[ :] *([A-Z0-9-]+)(?: +([0-9A-Za-z+/=]+))? *$"
    )
    .unwrap();
    static ref RX_KNOWN_COMMANDS: Regex = Regex::new(
        "^(?i)(DATA|RSET|VRFY|HELP|NOOP|QUIT|\
         STARTTLS|MAIL|RCPT|HELO|EHLO|AUTH)([ :].*)?$"
    )
    .unwrap();
}

pub fn looks_like_known_command(s: &str) -> bool {
    RX_KNOWN_COMMANDS.is_match(s)
}

fn truncate(s: &str) -> &str {
    &s[..s.char_indices().nth(64).map_or(s.len(), |(ix, _)| ix)]
}

/// The address from a capture with a bracketed form in group `bracketed` and
/// a bare form in the group after it.
fn address(cap: &regex::Captures, bracketed: usize) -> String {
    cap.get(bracketed)
        .or_else(|| cap.get(bracketed + 1))
        .map_or_else(String::new, |m| m.as_str().trim().to_owned())
}

impl FromStr for Command {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        let mut warnings = Vec::<String>::new();
        let mut add_warning = |w: String| {
            if warnings.len() < MAX_WARNINGS {
                warnings.push(w);
            }
        };

        for &(prefix, ref cmd, allow_trailing_garbage) in SIMPLE_COMMANDS {
            if (allow_trailing_garbage
                || s.get(prefix.len()..)
                    .map_or(false, |rest| rest.trim().is_empty()))
                && s.get(0..prefix.len())
                    .map_or(false, |sp| prefix.eq_ignore_ascii_case(sp))
            {
                return Ok(cmd.clone());
            }
        }

        if let Some(cap) = RX_HELO.captures(s) {
            Ok(Command::Helo(
                cap.get(1).unwrap().as_str().to_ascii_uppercase(),
                cap.get(2).map_or_else(String::new, |m| m.as_str().to_owned()),
            ))
        } else if let Some(cap) = RX_MAIL.captures(s) {
            let mut size = None::<u64>;
            for parm in cap
                .get(3)
                .map_or("", |c| c.as_str())
                .split(' ')
                .filter(|s| !s.is_empty())
            {
                if let Some(cap) = RX_MAIL_SIZE_PARM.captures(parm) {
                    match cap.get(1).and_then(|c| c.as_str().parse().ok()) {
                        Some(s) => size = Some(s),
                        None => add_warning(format!(
                            "Ignoring invalid MAIL FROM parameter {:?}",
                            truncate(parm),
                        )),
                    }
                } else if !RX_MAIL_BODY_PARM.is_match(parm)
                    && !RX_MAIL_SMTPUTF8_PARM.is_match(parm)
                {
                    add_warning(format!(
                        "Ignoring unknown MAIL FROM parameter {:?}",
                        truncate(parm),
                    ));
                }
            }

            Ok(Command::MailFrom(address(&cap, 1), size, warnings))
        } else if let Some(cap) = RX_RCPT.captures(s) {
            if let Some(extra) =
                cap.get(3).map(|c| c.as_str().trim()).filter(|c| !c.is_empty())
            {
                add_warning(format!(
                    "Ignoring extraneous RCPT TO parameters: {:?}",
                    truncate(extra)
                ));
            }

            let to = address(&cap, 1);
            if to.is_empty() {
                return Err(());
            }
            Ok(Command::Recipient(to, warnings))
        } else if let Some(cap) = RX_AUTH.captures(s) {
            Ok(Command::Auth(
                cap.get(1).unwrap().as_str().to_ascii_uppercase(),
                cap.get(2).map(|data| data.as_str().to_owned()),
            ))
        } else {
            Err(())
        }
    }
}
