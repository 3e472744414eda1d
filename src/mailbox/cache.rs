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

//! Sharing of message stores between concurrent consumers.
//!
//! Every consumer (a POP3 session, one SMTP delivery, a fetch or relay cycle)
//! identifies itself with a unique `Opener`. The cache keeps at most one live
//! `MessageStore` per email address and tracks which openers hold it; when
//! the last opener closes, the store is persisted (if modified) and dropped.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use super::message_store::MessageStore;
use crate::support::cancel::CancelToken;
use crate::support::error::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpenerKind {
    Pop3,
    Smtp,
    Fetch,
    Relay,
    Cli,
}

/// A token identifying one consumer of the cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Opener {
    id: u64,
    kind: OpenerKind,
}

static NEXT_OPENER: AtomicU64 = AtomicU64::new(1);

impl Opener {
    pub fn new(kind: OpenerKind) -> Self {
        Opener {
            id: NEXT_OPENER.fetch_add(1, Ordering::Relaxed),
            kind,
        }
    }

    pub fn kind(&self) -> OpenerKind {
        self.kind
    }
}

/// The result of `MailboxCache::reopen`.
#[derive(Debug)]
pub enum Reopened {
    /// The store was rebuilt from disk.
    Fresh(Arc<MessageStore>),
    /// Other openers hold the store, so it was left as is.
    Shared(Arc<MessageStore>),
}

struct CacheEntry {
    email: String,
    store: Arc<MessageStore>,
    openers: HashSet<Opener>,
}

pub struct MailboxCache {
    mail_root: PathBuf,
    entries: Mutex<Vec<CacheEntry>>,
}

impl MailboxCache {
    pub fn new(mail_root: impl Into<PathBuf>) -> Self {
        MailboxCache {
            mail_root: mail_root.into(),
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn mail_root(&self) -> &Path {
        &self.mail_root
    }

    fn lock(&self) -> MutexGuard<'_, Vec<CacheEntry>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Open the store for `email` on behalf of `opener`, loading it if no
    /// one else has it open.
    pub fn open(
        &self,
        opener: Opener,
        email: &str,
    ) -> Result<Arc<MessageStore>, Error> {
        let email = email.to_ascii_lowercase();
        let mut entries = self.lock();
        if let Some(entry) = entries.iter_mut().find(|e| e.email == email) {
            entry.openers.insert(opener);
            return Ok(Arc::clone(&entry.store));
        }

        let store = Arc::new(MessageStore::new(&self.mail_root, &email)?);
        store.load()?;
        debug!("{}: opened by {:?}", email, opener);
        entries.push(CacheEntry {
            email,
            store: Arc::clone(&store),
            openers: std::iter::once(opener).collect(),
        });
        Ok(store)
    }

    /// Like `open`, but rebuild the store from disk.
    ///
    /// If any other opener holds the store, it is left untouched and
    /// returned as `Reopened::Shared`. If the rebuild fails, `opener` no
    /// longer holds the store.
    pub fn reopen(
        &self,
        opener: Opener,
        email: &str,
    ) -> Result<Reopened, Error> {
        let email = email.to_ascii_lowercase();
        let mut entries = self.lock();
        let existing = entries.iter().position(|e| e.email == email);

        if let Some(ix) = existing {
            let entry = &mut entries[ix];
            entry.openers.insert(opener);
            if entry.openers.len() > 1 {
                let kinds: Vec<OpenerKind> =
                    entry.openers.iter().map(Opener::kind).collect();
                info!(
                    "{}: refusing to reopen store held by {:?}",
                    email, kinds
                );
                return Ok(Reopened::Shared(Arc::clone(&entry.store)));
            }

            if let Err(e) = entry.store.dispose() {
                warn!("{}: failed to persist before reopen: {}", email, e);
            }
        }

        let store = MessageStore::new(&self.mail_root, &email)
            .and_then(|store| store.scan().map(|_| Arc::new(store)));
        let store = match store {
            Ok(store) => store,
            Err(e) => {
                // The old store stays cached, left for the sweeper if no
                // one else holds it
                if let Some(ix) = existing {
                    entries[ix].openers.remove(&opener);
                }
                return Err(e);
            }
        };
        match existing {
            Some(ix) => entries[ix].store = Arc::clone(&store),
            None => entries.push(CacheEntry {
                email,
                store: Arc::clone(&store),
                openers: std::iter::once(opener).collect(),
            }),
        }
        Ok(Reopened::Fresh(store))
    }

    /// Release `opener`'s hold on the store for `email`, or on every store if
    /// `email` is `None`.
    ///
    /// Stores left without openers are disposed. Returns the number of
    /// stores disposed.
    pub fn close(&self, opener: Opener, email: Option<&str>) -> usize {
        let email = email.map(str::to_ascii_lowercase);
        let mut entries = self.lock();
        for entry in entries.iter_mut() {
            if email.as_ref().map_or(true, |e| *e == entry.email) {
                entry.openers.remove(&opener);
            }
        }

        dispose_unheld(&mut entries)
    }

    /// Dispose any store left without openers.
    ///
    /// `close` already does this; the sweep catches entries orphaned by a
    /// failed reopen.
    pub fn sweep(&self) -> usize {
        dispose_unheld(&mut self.lock())
    }

    /// Run `sweep` every `interval` until `cancel` fires.
    pub fn start_sweeper(
        this: Arc<Self>,
        interval: Duration,
        cancel: CancelToken,
    ) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            while cancel.sleep(interval).is_ok() {
                let swept = this.sweep();
                if swept > 0 {
                    info!("Swept {} idle mailboxes", swept);
                }
            }
        })
    }

    /// Dispose every store regardless of its openers. Used at shutdown.
    pub fn dispose_all(&self) -> usize {
        let mut entries = self.lock();
        let count = entries.len();
        for entry in entries.drain(..) {
            dispose(&entry);
        }
        count
    }

    pub fn opener_count(&self, email: &str) -> usize {
        let email = email.to_ascii_lowercase();
        self.lock()
            .iter()
            .find(|e| e.email == email)
            .map_or(0, |e| e.openers.len())
    }

    pub fn is_open(&self, email: &str) -> bool {
        let email = email.to_ascii_lowercase();
        self.lock().iter().any(|e| e.email == email)
    }
}

fn dispose_unheld(entries: &mut Vec<CacheEntry>) -> usize {
    let before = entries.len();
    entries.retain(|entry| {
        if entry.openers.is_empty() {
            dispose(entry);
            false
        } else {
            true
        }
    });
    before - entries.len()
}

fn dispose(entry: &CacheEntry) {
    match entry.store.dispose() {
        Ok(()) => debug!("{}: disposed", entry.email),
        Err(e) => warn!("{}: failed to persist on dispose: {}", entry.email, e),
    }
}

#[cfg(test)]
mod test {
    use tempfile::TempDir;

    use super::*;
    use crate::support::wait::BoundedWait;

    fn cache() -> (TempDir, MailboxCache) {
        let root = TempDir::new().unwrap();
        let cache = MailboxCache::new(root.path());
        (root, cache)
    }

    #[test]
    fn openers_share_one_store() {
        let (root, cache) = cache();
        let pop3 = Opener::new(OpenerKind::Pop3);
        let smtp = Opener::new(OpenerKind::Smtp);

        let a = cache.open(pop3, "zim@irk.example").unwrap();
        let b = cache.open(smtp, "ZIM@irk.example").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(2, cache.opener_count("zim@irk.example"));

        a.spool_in_to_msg(b"Subject: hi\r\n\r\n").unwrap();

        assert_eq!(0, cache.close(pop3, Some("zim@irk.example")));
        assert!(cache.is_open("zim@irk.example"));
        assert!(!root
            .path()
            .join("zim@irk.example")
            .join("mailbox.cache")
            .exists());

        assert_eq!(1, cache.close(smtp, None));
        assert!(!cache.is_open("zim@irk.example"));
        assert!(root
            .path()
            .join("zim@irk.example")
            .join("mailbox.cache")
            .exists());

        // Closing again disposes nothing further
        assert_eq!(0, cache.close(smtp, None));
        assert_eq!(0, cache.sweep());
    }

    #[test]
    fn reopen_refused_while_shared() {
        let (_root, cache) = cache();
        let pop3 = Opener::new(OpenerKind::Pop3);
        let fetch = Opener::new(OpenerKind::Fetch);

        let original = cache.open(pop3, "zim@irk.example").unwrap();
        original.spool_in_to_msg(b"Subject: one\r\n\r\n").unwrap();

        match cache.reopen(pop3, "zim@irk.example").unwrap() {
            Reopened::Fresh(store) => {
                assert!(!Arc::ptr_eq(&original, &store));
                assert_eq!(1, store.count());
            }
            r => panic!("Unexpected result: {:?}", r),
        }

        let current = cache.open(fetch, "zim@irk.example").unwrap();
        match cache.reopen(pop3, "zim@irk.example").unwrap() {
            Reopened::Shared(store) => assert!(Arc::ptr_eq(&current, &store)),
            r => panic!("Unexpected result: {:?}", r),
        }
    }

    #[test]
    fn close_without_email_releases_everything() {
        let (_root, cache) = cache();
        let relay = Opener::new(OpenerKind::Relay);
        cache.open(relay, "zim@irk.example").unwrap();
        cache.open(relay, "gir@irk.example").unwrap();
        assert_eq!(2, cache.close(relay, None));
    }

    #[test]
    fn dispose_all_ignores_openers() {
        let (_root, cache) = cache();
        cache
            .open(Opener::new(OpenerKind::Cli), "zim@irk.example")
            .unwrap();
        assert_eq!(1, cache.dispose_all());
        assert!(!cache.is_open("zim@irk.example"));
    }

    #[test]
    fn sweeper_disposes_store_orphaned_by_failed_reopen() {
        let (root, cache) = cache();
        let cache = Arc::new(cache);
        let cli = Opener::new(OpenerKind::Cli);

        let store = cache.open(cli, "zim@irk.example").unwrap();
        store.spool_in_to_msg(b"Subject: one\r\n\r\n").unwrap();
        drop(store);

        // A file where the inbox should be makes the rebuild fail
        let inbox = root.path().join("zim@irk.example").join("Msg");
        std::fs::remove_dir_all(&inbox).unwrap();
        std::fs::write(&inbox, b"").unwrap();
        assert!(cache.reopen(cli, "zim@irk.example").is_err());
        assert!(cache.is_open("zim@irk.example"));
        assert_eq!(0, cache.opener_count("zim@irk.example"));

        let cancel = CancelToken::new();
        let sweeper = MailboxCache::start_sweeper(
            Arc::clone(&cache),
            Duration::from_millis(10),
            cancel.clone(),
        );
        let swept = BoundedWait::new(
            Duration::from_secs(5),
            Duration::from_millis(10),
        )
        .until(|| !cache.is_open("zim@irk.example"));
        cancel.cancel();
        sweeper.join().unwrap();

        assert!(swept);
        assert_eq!(0, cache.sweep());
    }

    #[test]
    fn unsafe_email_rejected() {
        let (_root, cache) = cache();
        assert_matches!(
            Err(Error::UnsafeName),
            cache.open(Opener::new(OpenerKind::Smtp), "../../etc")
        );
        assert!(!cache.is_open("../../etc"));
    }
}
