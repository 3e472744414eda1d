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

//! The per-account message store.
//!
//! # Layout
//!
//! Each account's mailbox is a directory named after its email address under
//! `<root>/mail`. It has one subdirectory per `Folder`, each holding one
//! `.eml` file per message, and a `mailbox.cache` file holding the CBOR
//! serialisation of the full message index.
//!
//! # Concurrency
//!
//! The item lists are guarded by a mutex which is held only for the duration
//! of each list mutation. Higher-level operations which touch the disk
//! (`scan`, `load`, `save`, `delete`, `clear_deleted`) additionally take the
//! store's busy flag, which is a try-lock: a second caller fails immediately
//! with `Error::MailboxBusy` and is expected to back off and retry.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use log::{info, warn};
use serde::{Deserialize, Serialize};

use super::model::*;
use crate::support::error::Error;
use crate::support::file_ops::{self, IgnoreKinds};
use crate::support::safe_name::is_safe_name;

const CACHE_FILE: &str = "mailbox.cache";
pub const ENVELOPE_HEADER: &str = "X-Mailgate-Envelope-To";

#[derive(Debug)]
pub struct MessageStore {
    email: String,
    root: PathBuf,
    state: Mutex<State>,
    busy: AtomicBool,
    modified: AtomicBool,
}

#[derive(Debug, Default)]
struct State {
    items: Vec<Message>,
    /// Soft-deleted items, recoverable until cleared.
    deleted: Vec<Message>,
    total_size: u64,
    next_id: u32,
}

impl State {
    fn reset(&mut self, items: Vec<Message>) {
        self.total_size = items.iter().map(|m| m.size).sum();
        self.next_id = items.iter().map(|m| m.id).max().unwrap_or(0) + 1;
        self.items = items;
        self.deleted.clear();
    }
}

#[derive(Deserialize, Serialize)]
struct CacheFile {
    root: PathBuf,
    items: Vec<Message>,
}

/// Holds the busy flag of a store, releasing it on drop.
pub(crate) struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl MessageStore {
    /// Set up the store for `email` under `mail_root`, creating its
    /// directories as needed. Nothing is indexed until `load` or `scan`.
    pub fn new(mail_root: &Path, email: &str) -> Result<Self, Error> {
        let email = email.to_ascii_lowercase();
        if !is_safe_name(&email) {
            return Err(Error::UnsafeName);
        }

        let root = mail_root.join(&email);
        for folder in &Folder::ALL {
            fs::create_dir_all(root.join(folder.dir_name()))?;
        }

        Ok(MessageStore {
            email,
            root,
            state: Mutex::new(State {
                next_id: 1,
                ..State::default()
            }),
            busy: AtomicBool::new(false),
            modified: AtomicBool::new(false),
        })
    }

    pub fn folder_path(&self, folder: Folder) -> PathBuf {
        self.root.join(folder.dir_name())
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // List mutations cannot panic half way, so a poisoned lock still
        // holds a coherent state.
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Take the busy flag, failing with `Error::MailboxBusy` if someone
    /// else has it.
    pub(crate) fn begin(&self) -> Result<BusyGuard<'_>, Error> {
        self.busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .map(|_| BusyGuard(&self.busy))
            .map_err(|_| Error::MailboxBusy)
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn is_modified(&self) -> bool {
        self.modified.load(Ordering::Acquire)
    }

    fn touch(&self) {
        self.modified.store(true, Ordering::Release);
    }

    /// Rebuild the index from the message files on disk.
    ///
    /// Ids are assigned in discovery order: folder by folder, and by file name
    /// within each folder. Files which cannot be indexed are skipped.
    pub fn scan(&self) -> Result<usize, Error> {
        let _busy = self.begin()?;
        self.scan_locked().map_err(|e| self.log_failure("scan", e))
    }

    fn scan_locked(&self) -> Result<usize, Error> {
        let mut items = Vec::new();
        for &folder in &Folder::ALL {
            let mut paths = fs::read_dir(self.folder_path(folder))?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.extension().map_or(false, |e| e == "eml"))
                .collect::<Vec<_>>();
            paths.sort();

            for path in paths {
                match Message::from_file(&path, folder) {
                    Ok(mut message) => {
                        message.id = items.len() as u32 + 1;
                        items.push(message);
                    }
                    Err(e) => warn!(
                        "{}: skipping unreadable message {}: {}",
                        self.email,
                        path.display(),
                        e
                    ),
                }
            }
        }

        let count = items.len();
        self.lock().reset(items);
        self.touch();
        info!("{}: indexed {} messages", self.email, count);
        Ok(count)
    }

    /// Load the index from the cache file, falling back to `scan` if it is
    /// absent or was written for a different location.
    pub fn load(&self) -> Result<usize, Error> {
        let _busy = self.begin()?;
        self.load_locked().map_err(|e| self.log_failure("load", e))
    }

    fn load_locked(&self) -> Result<usize, Error> {
        let data = match fs::read(self.root.join(CACHE_FILE)) {
            Ok(data) => data,
            Err(e) if io::ErrorKind::NotFound == e.kind() => {
                return self.scan_locked();
            }
            Err(e) => return Err(e.into()),
        };

        let cache: CacheFile = match serde_cbor::from_slice(&data) {
            Ok(cache) => cache,
            Err(e) => {
                warn!("{}: discarding corrupt index: {}", self.email, e);
                return self.scan_locked();
            }
        };

        if cache.root != self.root {
            return self.scan_locked();
        }

        let count = cache.items.len();
        let items: Vec<Message> =
            cache.items.into_iter().filter(|m| m.path.is_file()).collect();
        let stale = count != items.len();
        let count = items.len();
        self.lock().reset(items);
        self.modified.store(stale, Ordering::Release);
        Ok(count)
    }

    /// Persist the index, renumbering the ids densely as 1..N.
    ///
    /// Items are ordered by folder and then by date.
    pub fn save(&self) -> Result<(), Error> {
        let _busy = self.begin()?;
        self.save_locked().map_err(|e| self.log_failure("save", e))
    }

    fn save_locked(&self) -> Result<(), Error> {
        let data = {
            let mut state = self.lock();
            // Soft-deleted items stay indexed until purged, since the
            // renumbering below invalidates the ids they were deleted by
            restore_all(&mut state);
            state.items.sort_by(|a, b| {
                (a.folder, a.date, &a.path).cmp(&(b.folder, b.date, &b.path))
            });
            for (ix, item) in state.items.iter_mut().enumerate() {
                item.id = ix as u32 + 1;
            }
            state.next_id = state.items.len() as u32 + 1;

            serde_cbor::to_vec(&CacheFile {
                root: self.root.clone(),
                items: state.items.clone(),
            })?
        };

        file_ops::spit(self.root.join(CACHE_FILE), 0o600, &data)?;
        self.modified.store(false, Ordering::Release);
        Ok(())
    }

    /// Persist the index if it has changed since it was loaded.
    pub fn dispose(&self) -> Result<(), Error> {
        if self.is_modified() {
            self.save()
        } else {
            Ok(())
        }
    }

    fn log_failure(&self, what: &str, e: Error) -> Error {
        warn!("{}: {} failed: {}", self.email, what, e);
        e
    }

    /// Add an already-indexed message, returning its new id.
    pub fn add(&self, mut message: Message) -> u32 {
        let mut state = self.lock();
        message.id = state.next_id;
        state.next_id += 1;
        state.total_size += message.size;
        state.items.push(message);
        self.touch();
        state.next_id - 1
    }

    /// Remove the message with the given id and delete its file.
    pub fn delete(&self, id: u32) -> Result<Message, Error> {
        let _busy = self.begin()?;
        let message = {
            let mut state = self.lock();
            let ix = state
                .items
                .iter()
                .position(|m| m.id == id)
                .ok_or(Error::NxMessage)?;
            let message = state.items.remove(ix);
            state.total_size -= message.size;
            message
        };
        self.touch();

        fs::remove_file(&message.path)
            .ignore_not_found()
            .map_err(|e| self.log_failure("delete", e.into()))?;
        Ok(message)
    }

    pub fn find(&self, id: u32) -> Option<Message> {
        self.lock().items.iter().find(|m| m.id == id).cloned()
    }

    pub fn find_msgid(&self, message_id: &str) -> Option<Message> {
        self.lock()
            .items
            .iter()
            .find(|m| m.message_id == message_id)
            .cloned()
    }

    /// Soft-delete the message with the given id.
    pub fn safe_delete(&self, id: u32) -> Result<(), Error> {
        let mut state = self.lock();
        let ix = match state.items.iter().position(|m| m.id == id) {
            Some(ix) => ix,
            None if state.deleted.iter().any(|m| m.id == id) => {
                return Err(Error::ExpungedMessage)
            }
            None => return Err(Error::NxMessage),
        };

        let message = state.items.remove(ix);
        state.total_size -= message.size;
        state.deleted.push(message);
        Ok(())
    }

    /// Restore a soft-deleted message. Returns whether it was found.
    pub fn undelete(&self, id: u32) -> bool {
        let mut state = self.lock();
        match state.deleted.iter().position(|m| m.id == id) {
            Some(ix) => {
                let message = state.deleted.remove(ix);
                restore(&mut state, message);
                true
            }
            None => false,
        }
    }

    /// Forget the soft-deleted messages with the given ids, deleting their
    /// files if `purge_files`. Returns how many were forgotten.
    ///
    /// Ids which are not soft-deleted are ignored.
    pub fn clear_deleted(
        &self,
        ids: &[u32],
        purge_files: bool,
    ) -> Result<usize, Error> {
        let _busy = self.begin()?;
        let purged = {
            let mut state = self.lock();
            let deleted = std::mem::replace(&mut state.deleted, Vec::new());
            let (purged, kept): (Vec<Message>, Vec<Message>) =
                deleted.into_iter().partition(|m| ids.contains(&m.id));
            state.deleted = kept;
            purged
        };
        if purged.is_empty() {
            return Ok(0);
        }
        self.touch();

        if purge_files {
            for message in &purged {
                let removed = fs::remove_file(&message.path).ignore_not_found();
                if let Err(e) = removed {
                    warn!(
                        "{}: failed to purge {}: {}",
                        self.email,
                        message.path.display(),
                        e
                    );
                }
            }
        }

        Ok(purged.len())
    }

    pub fn mark_read(&self, id: u32) {
        let mut state = self.lock();
        if let Some(m) = state.items.iter_mut().find(|m| m.id == id) {
            if !m.read {
                m.read = true;
                self.touch();
            }
        }
    }

    /// Write `data` as a new message in `folder` and index it.
    pub fn spool_in(
        &self,
        data: &[u8],
        folder: Folder,
    ) -> Result<Message, Error> {
        let path = file_ops::spool_new(&self.folder_path(folder), data)?;
        let mut message = Message::from_file(&path, folder)?;
        message.id = self.add(message.clone());
        Ok(message)
    }

    /// Spool a message received for this account into `Msg`.
    pub fn spool_in_to_msg(&self, data: &[u8]) -> Result<Message, Error> {
        self.spool_in(data, Folder::Msg)
    }

    /// Queue a message for relay to `recipients`, recording the envelope in
    /// a leading header which the relay strips again.
    pub fn spool_out_to_out(
        &self,
        data: &[u8],
        recipients: &[String],
    ) -> Result<Message, Error> {
        let mut with_envelope = format!(
            "{}: {}\r\n",
            ENVELOPE_HEADER,
            recipients.join(", ")
        )
        .into_bytes();
        with_envelope.extend_from_slice(data);
        self.spool_in(&with_envelope, Folder::Out)
    }

    /// Move a message into another folder, keeping its id.
    pub fn move_to(&self, id: u32, folder: Folder) -> Result<Message, Error> {
        let mut state = self.lock();
        let message = state
            .items
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or(Error::NxMessage)?;
        if message.folder == folder {
            return Ok(message.clone());
        }

        let file_name = message
            .path
            .file_name()
            .map(|n| n.to_owned())
            .ok_or(Error::NxMessage)?;
        let dst = self.folder_path(folder).join(file_name);
        fs::rename(&message.path, &dst)?;
        message.path = dst;
        message.folder = folder;
        let message = message.clone();
        drop(state);
        self.touch();
        Ok(message)
    }

    pub fn read_message(&self, id: u32) -> Result<Vec<u8>, Error> {
        let message = self.find(id).ok_or(Error::NxMessage)?;
        Ok(fs::read(&message.path)?)
    }

    /// Snapshot the visible items which match `filter`, in id order.
    pub fn items(&self, filter: impl Fn(&Message) -> bool) -> Vec<Message> {
        let mut items: Vec<Message> =
            self.lock().items.iter().filter(|m| filter(m)).cloned().collect();
        items.sort_by_key(|m| m.id);
        items
    }

    pub fn count(&self) -> usize {
        self.lock().items.len()
    }

    pub fn total_size(&self) -> u64 {
        self.lock().total_size
    }

}

fn restore_all(state: &mut State) {
    let deleted = std::mem::replace(&mut state.deleted, Vec::new());
    for message in deleted {
        restore(state, message);
    }
}

fn restore(state: &mut State, message: Message) {
    state.total_size += message.size;
    let ix = state
        .items
        .iter()
        .position(|m| m.id > message.id)
        .unwrap_or(state.items.len());
    state.items.insert(ix, message);
}

#[cfg(test)]
mod test {
    use chrono::prelude::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    use super::*;

    fn message(n: usize, size: u64) -> Message {
        Message {
            id: 0,
            message_id: format!("<{}@test>", n),
            size,
            from: "zim@irk.example".to_owned(),
            subject: format!("message {}", n),
            path: PathBuf::from(format!("/nonexistent/{}.eml", n)),
            folder: Folder::Msg,
            read: false,
            date: Utc::now(),
        }
    }

    fn store() -> (TempDir, MessageStore) {
        let root = TempDir::new().unwrap();
        let store = MessageStore::new(root.path(), "Zim@Irk.Example").unwrap();
        (root, store)
    }

    #[derive(Clone, Debug)]
    enum Op {
        Add(u64),
        Delete(usize),
        SafeDelete(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u64..10_000).prop_map(Op::Add),
            (0usize..20).prop_map(Op::Delete),
            (0usize..20).prop_map(Op::SafeDelete),
        ]
    }

    proptest! {
        #[test]
        fn count_and_size_track_adds_and_deletes(
            ops in prop::collection::vec(op(), 0..60)
        ) {
            let (_root, store) = store();
            let mut expected: Vec<(u32, u64)> = Vec::new();

            for (n, op) in ops.into_iter().enumerate() {
                match op {
                    Op::Add(size) => {
                        let id = store.add(message(n, size));
                        expected.push((id, size));
                    }
                    Op::Delete(ix) | Op::SafeDelete(ix)
                        if ix >= expected.len() => {}
                    Op::Delete(ix) => {
                        let (id, _) = expected.remove(ix);
                        store.delete(id).unwrap();
                    }
                    Op::SafeDelete(ix) => {
                        let (id, _) = expected.remove(ix);
                        store.safe_delete(id).unwrap();
                    }
                }

                prop_assert_eq!(expected.len(), store.count());
                prop_assert_eq!(
                    expected.iter().map(|&(_, s)| s).sum::<u64>(),
                    store.total_size()
                );
            }
        }
    }

    #[test]
    fn save_then_load_round_trip() {
        let (root, store) = store();
        store
            .spool_in_to_msg(
                b"Message-ID: <a@x>\r\n\
                  Date: Tue, 1 Jul 2003 10:00:00 +0000\r\n\r\na\r\n",
            )
            .unwrap();
        store
            .spool_in(
                b"Message-ID: <b@x>\r\n\
                  Date: Mon, 1 Jul 2002 10:00:00 +0000\r\n\r\nb\r\n",
                Folder::Error,
            )
            .unwrap();
        store
            .spool_in_to_msg(
                b"Message-ID: <c@x>\r\n\
                  Date: Mon, 1 Jul 2002 10:00:00 +0000\r\n\r\nc\r\n",
            )
            .unwrap();
        store.delete(1).unwrap();
        store.save().unwrap();
        assert!(!store.is_modified());

        let saved = store.items(|_| true);
        assert_eq!(
            vec![1, 2],
            saved.iter().map(|m| m.id).collect::<Vec<_>>()
        );
        assert_eq!("<c@x>", saved[0].message_id);
        assert_eq!(Folder::Msg, saved[0].folder);
        assert_eq!("<b@x>", saved[1].message_id);
        assert_eq!(Folder::Error, saved[1].folder);

        let fresh = MessageStore::new(root.path(), "zim@irk.example").unwrap();
        assert_eq!(2, fresh.load().unwrap());
        let loaded = fresh.items(|_| true);
        assert_eq!(
            saved
                .iter()
                .map(|m| (m.id, m.message_id.clone(), m.folder))
                .collect::<Vec<_>>(),
            loaded
                .iter()
                .map(|m| (m.id, m.message_id.clone(), m.folder))
                .collect::<Vec<_>>()
        );
        assert_eq!(store.total_size(), fresh.total_size());
    }

    #[test]
    fn load_without_cache_scans() {
        let (root, store) = store();
        store.spool_in_to_msg(b"Subject: one\r\n\r\n").unwrap();
        store.spool_in(b"Subject: two\r\n\r\n", Folder::Bounced).unwrap();
        fs::write(store.folder_path(Folder::Msg).join("junk.txt"), b"x")
            .unwrap();

        let fresh = MessageStore::new(root.path(), "zim@irk.example").unwrap();
        assert_eq!(2, fresh.load().unwrap());
        assert!(fresh.is_modified());
        assert_eq!(Folder::Msg, fresh.find(1).unwrap().folder);
        assert_eq!(Folder::Bounced, fresh.find(2).unwrap().folder);
    }

    #[test]
    fn soft_delete_and_recover() {
        let (_root, store) = store();
        let a = store.spool_in_to_msg(b"Subject: a\r\n\r\n").unwrap();
        let b = store.spool_in_to_msg(b"Subject: b\r\n\r\n").unwrap();
        let c = store.spool_in_to_msg(b"Subject: c\r\n\r\n").unwrap();

        store.safe_delete(a.id).unwrap();
        store.safe_delete(c.id).unwrap();
        assert_matches!(Err(Error::ExpungedMessage), store.safe_delete(a.id));
        assert_matches!(Err(Error::NxMessage), store.safe_delete(99));
        assert_eq!(1, store.count());
        assert_eq!(b.size, store.total_size());

        assert!(store.undelete(c.id));
        assert!(!store.undelete(c.id));
        assert_eq!(
            vec![b.id, c.id],
            store.items(|_| true).iter().map(|m| m.id).collect::<Vec<_>>()
        );

        assert!(store.undelete(a.id));
        assert_eq!(3, store.count());

        store.safe_delete(a.id).unwrap();
        store.safe_delete(b.id).unwrap();
        assert_eq!(1, store.clear_deleted(&[b.id, 99], true).unwrap());
        assert!(!b.path.exists());
        assert!(a.path.exists());
        assert!(!store.undelete(b.id));
        assert!(store.undelete(a.id));
        assert_eq!(0, store.clear_deleted(&[a.id], true).unwrap());
    }

    #[test]
    fn save_keeps_soft_deleted_items() {
        let (root, store) = store();
        let a = store
            .spool_in_to_msg(
                b"Message-ID: <a@x>\r\n\
                  Date: Mon, 1 Jul 2002 10:00:00 +0000\r\n\r\na\r\n",
            )
            .unwrap();
        let b = store
            .spool_in_to_msg(
                b"Message-ID: <b@x>\r\n\
                  Date: Tue, 1 Jul 2003 10:00:00 +0000\r\n\r\nb\r\n",
            )
            .unwrap();

        store.safe_delete(a.id).unwrap();
        assert_eq!(1, store.count());
        store.save().unwrap();

        assert_eq!(2, store.count());
        assert_eq!(a.size + b.size, store.total_size());
        assert_eq!(0, store.clear_deleted(&[a.id], true).unwrap());
        assert!(a.path.exists());

        let fresh = MessageStore::new(root.path(), "zim@irk.example").unwrap();
        assert_eq!(2, fresh.load().unwrap());
        assert_eq!(
            vec!["<a@x>", "<b@x>"],
            fresh
                .items(|_| true)
                .iter()
                .map(|m| m.message_id.clone())
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn busy_flag_is_exclusive() {
        let (_root, store) = store();
        let guard = store.begin().unwrap();
        assert!(store.is_busy());
        assert_matches!(Err(Error::MailboxBusy), store.scan());
        assert_matches!(Err(Error::MailboxBusy), store.save());
        drop(guard);
        assert!(!store.is_busy());
        store.scan().unwrap();
    }

    #[test]
    fn outbound_spooling() {
        let (_root, store) = store();
        let out = store
            .spool_out_to_out(
                b"Subject: relay me\r\n\r\nbody\r\n",
                &[
                    "dib@earth.example".to_owned(),
                    "gaz@earth.example".to_owned(),
                ],
            )
            .unwrap();
        assert_eq!(Folder::Out, out.folder);
        let data = fs::read(&out.path).unwrap();
        assert!(data.starts_with(
            b"X-Mailgate-Envelope-To: dib@earth.example, gaz@earth.example\r\n"
        ));

        let sent = store.move_to(out.id, Folder::Send).unwrap();
        assert_eq!(Folder::Send, sent.folder);
        assert!(sent.path.starts_with(store.folder_path(Folder::Send)));
        assert!(!out.path.exists());
        assert_eq!(data, store.read_message(out.id).unwrap());
    }

    #[test]
    fn unsafe_names_rejected() {
        let root = TempDir::new().unwrap();
        assert_matches!(
            Err(Error::UnsafeName),
            MessageStore::new(root.path(), "../etc")
        );
    }
}
