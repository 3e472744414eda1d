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

use std::fmt;
use std::sync::{Arc, Mutex};

/// Tracks text that should be included at the start of every log statement
/// emitted on behalf of one session.
///
/// Clones of a `LogPrefix` share the same underlying data, so the mailbox
/// opener thread spawned by a POP3 session logs with the user name the
/// session learns later.
#[derive(Clone)]
pub struct LogPrefix {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Clone)]
struct Inner {
    protocol: String,
    peer: String,
    user: Option<String>,
    helo: Option<String>,
}

impl LogPrefix {
    pub fn new(protocol: impl Into<String>, peer: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                protocol: protocol.into(),
                peer: sanitise(peer.into()),
                user: None,
                helo: None,
            })),
        }
    }

    pub fn set_user(&self, user: String) {
        self.lock().user = Some(sanitise(user));
    }

    pub fn clear_user(&self) {
        self.lock().user = None;
    }

    pub fn set_helo(&self, helo: String) {
        self.lock().helo = Some(sanitise(helo));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A panic while holding this lock only ever interrupts a field
        // assignment, so the data is still coherent.
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl fmt::Display for LogPrefix {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = self.lock();
        write!(f, "{}:{}", inner.protocol, inner.peer)?;
        match (&inner.user, &inner.helo) {
            (None, None) => Ok(()),
            (Some(user), None) => write!(f, "[{}]", user),
            (None, Some(helo)) => write!(f, "[helo={}]", helo),
            (Some(user), Some(helo)) => {
                write!(f, "[{} helo={}]", user, helo)
            }
        }
    }
}

fn sanitise(mut s: String) -> String {
    s.retain(|c| !c.is_control());
    if let Some((truncate_len, _)) = s.char_indices().nth(64) {
        s.truncate(truncate_len);
    }

    s
}
