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

//! The RFC 5321 reply codes Mailgate sends.
//!
//! The module is designed to be wildcard-imported; `pc::Ok` and friends read
//! naturally at the call sites.

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u16)]
pub enum PrimaryCode {
    CommandSyntaxError = 500,
    ParameterSyntaxError = 501,
    CommandNotImplemented = 502,
    BadSequenceOfCommands = 503,
    CommandParameterNotImplemented = 504,
    HelpMessage = 214,
    ServiceReady = 220,
    ServiceClosing = 221,
    AuthenticationSucceeded = 235,
    Ok = 250,
    CannotVerify = 252,
    ServerChallenge = 334,
    StartMailInput = 354,
    ServiceNotAvailableClosing = 421,
    ActionAborted = 451,
    TlsNotAvailable = 454,
    SenderMismatch = 521,
    AuthenticationRequired = 530,
    AuthenticationCredentialsInvalid = 535,
    ActionNotTakenPermanent = 550,
    ExceededStorageAllocation = 552,
    TransactionFailed = 554,
}

impl PrimaryCode {
    /// Whether sending this code ends the session.
    pub fn closes(self) -> bool {
        match self {
            PrimaryCode::ServiceClosing
            | PrimaryCode::ServiceNotAvailableClosing
            | PrimaryCode::SenderMismatch => true,
            _ => false,
        }
    }
}

pub mod pc {
    pub use super::PrimaryCode::*;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn numeric_values() {
        assert_eq!(250, pc::Ok as u16);
        assert_eq!(354, pc::StartMailInput as u16);
        assert_eq!(521, pc::SenderMismatch as u16);
        assert!(pc::ServiceClosing.closes());
        assert!(pc::SenderMismatch.closes());
        assert!(!pc::ActionNotTakenPermanent.closes());
    }
}
