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
    /// USER name
    User(String),
    /// PASS password (which may contain spaces)
    Pass(String),
    /// APOP name digest
    Apop(String, String),
    /// AUTH [mechanism [initial-response]]
    ///
    /// The bare `LOGIN` and `PLAIN` commands parse as AUTH with the
    /// corresponding mechanism.
    Auth(Option<String>, Option<String>),
    /// CAPA
    Capa,
    /// STAT
    Stat,
    /// RSET
    Rset,
    /// RETR msg
    Retr(u32),
    /// LIST [msg]
    List(Option<u32>),
    /// DELE msg
    Dele(u32),
    /// NOOP
    Noop,
    /// UIDL [msg]
    Uidl(Option<u32>),
    /// QUIT
    Quit,
    /// HELP ignored...
    Help,
    /// STLS or STARTTLS
    Stls,
    /// TOP msg lines
    Top(u32, u32),
}

static SIMPLE_COMMANDS: &[(&str, Command, bool)] = &[
    ("CAPA", Command::Capa, false),
    ("STAT", Command::Stat, false),
    ("RSET", Command::Rset, false),
    ("NOOP", Command::Noop, false),
    ("QUIT", Command::Quit, false),
    ("HELP", Command::Help, true),
    ("STLS", Command::Stls, false),
    ("STARTTLS", Command::Stls, false),
];

// Arguments may be separated from the command by a space or a colon.
lazy_static! {
    static ref RX_USER: Regex = Regex::new("^(?i)USER[ :] *(.+)$").unwrap();
    static ref RX_PASS: Regex = Regex::new("^(?i)PASS[ :](.*)$").unwrap();
    static ref RX_APOP: Regex =
        Regex::new("^(?i)APOP[ :] *([^ ]+) +([0-9A-Fa-f]{32}) *$").unwrap();
    static ref RX_AUTH: Regex = Regex::new(
        "^(?i)AUTH(?:[ :] *([A-Z0-9-]+)(?: +([0-9A-Za-z+/=]+))?)? *$"
    )
    .unwrap();
    static ref RX_SHORT_AUTH: Regex =
        Regex::new("^(?i)(LOGIN|PLAIN)(?:[ :] *([0-9A-Za-z+/=]+))? *$")
            .unwrap();
    static ref RX_ONE_ARG: Regex =
        Regex::new("^(?i)(RETR|DELE)[ :] *([0-9]+) *$").unwrap();
    static ref RX_OPTIONAL_ARG: Regex =
        Regex::new("^(?i)(LIST|UIDL)(?:[ :] *([0-9]+))? *$").unwrap();
    static ref RX_TOP: Regex =
        Regex::new("^(?i)TOP[ :] *([0-9]+) +([0-9]+) *$").unwrap();
    static ref RX_KNOWN_COMMANDS: Regex = Regex::new(
        "^(?i)(USER|PASS|APOP|AUTH|CAPA|STAT|RSET|RETR|LIST|LOGIN|PLAIN|\
         DELE|NOOP|UIDL|QUIT|HELP|STLS|STARTTLS|TOP)([ :].*)?$"
    )
    .unwrap();
}

/// Whether `s` names a command we know, regardless of whether its arguments
/// are valid.
pub fn looks_like_known_command(s: &str) -> bool {
    RX_KNOWN_COMMANDS.is_match(s)
}

fn number(s: &str) -> Result<u32, ()> {
    s.parse::<u32>().map_err(|_| ())
}

impl FromStr for Command {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
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

        if let Some(cap) = RX_USER.captures(s) {
            Ok(Command::User(cap.get(1).unwrap().as_str().trim().to_owned()))
        } else if let Some(cap) = RX_PASS.captures(s) {
            Ok(Command::Pass(cap.get(1).unwrap().as_str().to_owned()))
        } else if let Some(cap) = RX_APOP.captures(s) {
            Ok(Command::Apop(
                cap.get(1).unwrap().as_str().to_owned(),
                cap.get(2).unwrap().as_str().to_owned(),
            ))
        } else if let Some(cap) = RX_AUTH.captures(s) {
            Ok(Command::Auth(
                cap.get(1).map(|m| m.as_str().to_ascii_uppercase()),
                cap.get(2).map(|m| m.as_str().to_owned()),
            ))
        } else if let Some(cap) = RX_SHORT_AUTH.captures(s) {
            Ok(Command::Auth(
                Some(cap.get(1).unwrap().as_str().to_ascii_uppercase()),
                cap.get(2).map(|m| m.as_str().to_owned()),
            ))
        } else if let Some(cap) = RX_ONE_ARG.captures(s) {
            let id = number(cap.get(2).unwrap().as_str())?;
            if cap.get(1).unwrap().as_str().eq_ignore_ascii_case("RETR") {
                Ok(Command::Retr(id))
            } else {
                Ok(Command::Dele(id))
            }
        } else if let Some(cap) = RX_OPTIONAL_ARG.captures(s) {
            let id = match cap.get(2) {
                Some(m) => Some(number(m.as_str())?),
                None => None,
            };
            if cap.get(1).unwrap().as_str().eq_ignore_ascii_case("LIST") {
                Ok(Command::List(id))
            } else {
                Ok(Command::Uidl(id))
            }
        } else if let Some(cap) = RX_TOP.captures(s) {
            Ok(Command::Top(
                number(cap.get(1).unwrap().as_str())?,
                number(cap.get(2).unwrap().as_str())?,
            ))
        } else {
            Err(())
        }
    }
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn command_parsing() {
        assert_eq!(Ok(Command::Capa), "CAPA".parse());
        assert_eq!(Ok(Command::Stat), "stat".parse());
        assert_eq!(Ok(Command::Quit), "QUIT ".parse());
        assert_eq!(Ok(Command::Help), "HELP me please".parse());
        assert_eq!(Ok(Command::Stls), "STLS".parse());
        assert_eq!(Ok(Command::Stls), "starttls".parse());
        assert_eq!(Err(()), "NOOPS".parse::<Command>());
        assert_eq!(Err(()), "STAT 1".parse::<Command>());

        assert_eq!(Ok(Command::User("zim".to_owned())), "USER zim".parse());
        assert_eq!(Ok(Command::User("zim".to_owned())), "user:zim".parse());
        assert_eq!(
            Ok(Command::User("zim@irk.example".to_owned())),
            "USER: zim@irk.example ".parse()
        );
        assert_eq!(Err(()), "USER".parse::<Command>());

        assert_eq!(
            Ok(Command::Pass("hunter 2 ".to_owned())),
            "PASS hunter 2 ".parse()
        );
        assert_eq!(Ok(Command::Pass(String::new())), "PASS ".parse());

        assert_eq!(
            Ok(Command::Apop(
                "zim".to_owned(),
                "c4c9334bac560ecc979e58001b3e22fb".to_owned()
            )),
            "APOP zim c4c9334bac560ecc979e58001b3e22fb".parse()
        );
        assert_eq!(Err(()), "APOP zim c4c9334b".parse::<Command>());

        assert_eq!(Ok(Command::Auth(None, None)), "AUTH".parse());
        assert_eq!(
            Ok(Command::Auth(Some("CRAM-MD5".to_owned()), None)),
            "auth cram-md5".parse()
        );
        assert_eq!(
            Ok(Command::Auth(
                Some("PLAIN".to_owned()),
                Some("AHppbQB0YW5zdGFhZg==".to_owned())
            )),
            "AUTH PLAIN AHppbQB0YW5zdGFhZg==".parse()
        );
        assert_eq!(
            Ok(Command::Auth(Some("LOGIN".to_owned()), None)),
            "LOGIN".parse()
        );
        assert_eq!(
            Ok(Command::Auth(
                Some("PLAIN".to_owned()),
                Some("AHppbQB0YW5zdGFhZg==".to_owned())
            )),
            "plain:AHppbQB0YW5zdGFhZg==".parse()
        );

        assert_eq!(Ok(Command::Retr(1)), "RETR 1".parse());
        assert_eq!(Ok(Command::Dele(42)), "dele:42".parse());
        assert_eq!(Err(()), "RETR".parse::<Command>());
        assert_eq!(Err(()), "RETR x".parse::<Command>());
        assert_eq!(Err(()), "RETR 99999999999999".parse::<Command>());

        assert_eq!(Ok(Command::List(None)), "LIST".parse());
        assert_eq!(Ok(Command::List(Some(3))), "LIST 3".parse());
        assert_eq!(Ok(Command::Uidl(None)), "uidl".parse());
        assert_eq!(Ok(Command::Uidl(Some(7))), "UIDL:7".parse());

        assert_eq!(Ok(Command::Top(2, 10)), "TOP 2 10".parse());
        assert_eq!(Err(()), "TOP 2".parse::<Command>());
    }

    #[test]
    fn known_command_detection() {
        assert!(looks_like_known_command("RETR"));
        assert!(looks_like_known_command("retr x"));
        assert!(looks_like_known_command("TOP:1"));
        assert!(!looks_like_known_command("RETRIEVE 1"));
        assert!(!looks_like_known_command("GET / HTTP/1.1"));
    }

    proptest! {
        #[test]
        fn parsing_never_panics(s in "\\PC{0,40}") {
            let _ = s.parse::<Command>();
        }

        #[test]
        fn numeric_arguments_survive(id in 0u32.., lines in 0u32..) {
            prop_assert_eq!(
                Ok(Command::Top(id, lines)),
                format!("TOP {} {}", id, lines).parse()
            );
            prop_assert_eq!(
                Ok(Command::List(Some(id))),
                format!("list {}", id).parse()
            );
        }
    }
}
