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

//! Candidate proxy lists and the stateful iteration over them.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, SystemTime};

use log::{info, warn};

use crate::support::error::Error;
use crate::support::file_ops::{self, IgnoreKinds};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProxyKind {
    Http,
    Https,
    Socks4,
    Socks5,
}

impl ProxyKind {
    /// The order in which "all types" mode tries the kinds.
    pub const ALL: [ProxyKind; 4] = [
        ProxyKind::Http,
        ProxyKind::Https,
        ProxyKind::Socks4,
        ProxyKind::Socks5,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ProxyKind::Http => "http",
            ProxyKind::Https => "https",
            ProxyKind::Socks4 => "socks4",
            ProxyKind::Socks5 => "socks5",
        }
    }

    /// The name of the persisted candidate list within the proxy directory.
    pub fn file_name(self) -> String {
        format!("{}.txt", self.name())
    }
}

impl fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ProxyCandidate {
    pub host: String,
    pub port: u16,
}

impl ProxyCandidate {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        ProxyCandidate {
            host: host.into(),
            port,
        }
    }
}

impl FromStr for ProxyCandidate {
    type Err = Error;

    /// Parse `host:port` or `[v6-address]:port`.
    fn from_str(s: &str) -> Result<Self, Error> {
        let bad = || Error::BadCandidate(s.to_owned());
        let s = s.trim();
        let colon = s.rfind(':').ok_or_else(bad)?;
        let (host, port) = (&s[..colon], &s[colon + 1..]);
        let host = if host.starts_with('[') && host.ends_with(']') {
            &host[1..host.len() - 1]
        } else {
            host
        };

        if host.is_empty() || host.contains(char::is_whitespace) {
            return Err(bad());
        }

        Ok(ProxyCandidate {
            host: host.to_owned(),
            port: port.parse().map_err(|_| bad())?,
        })
    }
}

impl fmt::Display for ProxyCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Where fresh candidate lists come from when the persisted one is empty.
pub trait CandidateSource: Send + Sync {
    fn fetch(&self, kind: ProxyKind) -> Result<Vec<ProxyCandidate>, Error>;
}

/// A `CandidateSource` that never has anything to offer.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoSource;

impl CandidateSource for NoSource {
    fn fetch(&self, _: ProxyKind) -> Result<Vec<ProxyCandidate>, Error> {
        Ok(Vec::new())
    }
}

/// The ordered candidates of one proxy kind.
///
/// `next` walks the list once; after returning the last candidate it returns
/// `None` a single time and starts over. `selected` is whatever `next`
/// returned last, `active` is the candidate most recently proven to work.
#[derive(Clone, Debug)]
pub struct ProxyRegistry {
    kind: ProxyKind,
    candidates: Vec<ProxyCandidate>,
    cursor: usize,
    selected: Option<ProxyCandidate>,
    active: Option<ProxyCandidate>,
    dead: HashSet<ProxyCandidate>,
}

impl ProxyRegistry {
    pub fn new(kind: ProxyKind) -> Self {
        ProxyRegistry {
            kind,
            candidates: Vec::new(),
            cursor: 0,
            selected: None,
            active: None,
            dead: HashSet::new(),
        }
    }

    pub fn kind(&self) -> ProxyKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn candidates(&self) -> &[ProxyCandidate] {
        &self.candidates
    }

    /// Replace the candidate list, dropping duplicates and resetting the
    /// iteration.
    pub fn set(&mut self, candidates: Vec<ProxyCandidate>) {
        let mut seen = HashSet::new();
        self.candidates = candidates
            .into_iter()
            .filter(|c| seen.insert(c.clone()))
            .collect();
        self.dead.retain(|c| seen.contains(c));
        if self.active.as_ref().map_or(false, |a| !seen.contains(a)) {
            self.active = None;
        }
        self.rewind();
    }

    pub fn clear(&mut self) {
        self.set(Vec::new());
    }

    pub fn remove(&mut self, candidate: &ProxyCandidate) -> bool {
        let before = self.candidates.len();
        if let Some(ix) = self.candidates.iter().position(|c| c == candidate) {
            self.candidates.remove(ix);
            if ix < self.cursor {
                self.cursor -= 1;
            }
        }
        if self.active.as_ref() == Some(candidate) {
            self.active = None;
        }
        self.dead.remove(candidate);
        before != self.candidates.len()
    }

    /// Restart iteration from the front of the list.
    pub fn rewind(&mut self) {
        self.cursor = 0;
        self.selected = None;
    }

    pub fn next(&mut self) -> Option<ProxyCandidate> {
        if self.cursor >= self.candidates.len() {
            self.rewind();
            return None;
        }

        let candidate = self.candidates[self.cursor].clone();
        self.cursor += 1;
        self.selected = Some(candidate.clone());
        Some(candidate)
    }

    pub fn selected(&self) -> Option<&ProxyCandidate> {
        self.selected.as_ref()
    }

    pub fn active(&self) -> Option<&ProxyCandidate> {
        self.active.as_ref()
    }

    pub fn set_active(&mut self, candidate: ProxyCandidate) {
        self.dead.remove(&candidate);
        self.active = Some(candidate);
    }

    pub fn clear_active(&mut self) {
        self.active = None;
    }

    /// Record that `candidate` failed to connect.
    pub fn mark_dead(&mut self, candidate: &ProxyCandidate) {
        if self.active.as_ref() == Some(candidate) {
            self.active = None;
        }
        self.dead.insert(candidate.clone());
    }

    pub fn is_dead(&self, candidate: &ProxyCandidate) -> bool {
        self.dead.contains(candidate)
    }

    pub fn path(&self, dir: &Path) -> PathBuf {
        dir.join(self.kind.file_name())
    }

    /// Replace the candidates with those in the persisted list under `dir`.
    ///
    /// A missing file is an empty list. Lines that do not parse are skipped.
    pub fn load(&mut self, dir: &Path) -> Result<usize, Error> {
        let path = self.path(dir);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if io::ErrorKind::NotFound == e.kind() => String::new(),
            Err(e) => return Err(e.into()),
        };

        let mut candidates = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            match line.parse() {
                Ok(c) => candidates.push(c),
                Err(e) => warn!("{}: {}", path.display(), e),
            }
        }

        self.set(candidates);
        Ok(self.len())
    }

    pub fn save(&self, dir: &Path) -> Result<(), Error> {
        fs::create_dir_all(dir)?;
        let mut text = String::new();
        for candidate in &self.candidates {
            text.push_str(&candidate.to_string());
            text.push('\n');
        }
        file_ops::spit(self.path(dir), 0o600, text.as_bytes())?;
        Ok(())
    }

    /// Whether the persisted list is missing or older than `max_age`.
    pub fn is_stale(&self, dir: &Path, max_age: Duration) -> bool {
        fs::metadata(self.path(dir))
            .and_then(|md| md.modified())
            .ok()
            .and_then(|modified| {
                SystemTime::now().duration_since(modified).ok()
            })
            .map_or(true, |age| age > max_age)
    }

    /// Drop the run of dead candidates at the front of the list and rewrite
    /// the persisted list if anything was dropped.
    ///
    /// Returns the number of candidates dropped.
    pub fn merge(&mut self, dir: &Path) -> Result<usize, Error> {
        let dead_prefix = self
            .candidates
            .iter()
            .take_while(|c| self.dead.contains(c))
            .count();
        if 0 == dead_prefix {
            return Ok(0);
        }

        for candidate in self.candidates.drain(..dead_prefix) {
            self.dead.remove(&candidate);
        }
        self.cursor = self.cursor.saturating_sub(dead_prefix);
        self.save(dir)?;
        info!(
            "Pruned {} dead {} proxies, {} remain",
            dead_prefix,
            self.kind,
            self.candidates.len()
        );
        Ok(dead_prefix)
    }

    /// Delete the persisted list, if any.
    pub fn forget(&self, dir: &Path) -> Result<(), Error> {
        fs::remove_file(self.path(dir)).ignore_not_found()?;
        Ok(())
    }
}
