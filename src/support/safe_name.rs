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
/// Determine whether the given name is "safe" to use as a mailbox directory
/// name.
///
/// Mailbox directories are named after the account's email address, which
/// arrives from the network in RCPT TO and USER lines, so this excludes empty
/// names and anything that could cause directory traversal or hidden files.
pub fn is_safe_name(name: &str) -> bool {
    !name.is_empty() &&
        name.len() <= 254 &&
        // Block directory traversal through .. and hidden files
        name.chars().next() != Some('.') &&
        name.find('/').is_none() &&
        name.find('\\').is_none() &&
        name.find(|c| c < ' ' || c == '\x7F').is_none() &&
        name.find(|c: char| c.is_whitespace()).is_none()
}
