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

//! Writing an accepted message into the mailboxes its routes name.

use std::collections::BTreeMap;
use std::path::Path;

use log::{info, warn};

use crate::credentials::route::Route;
use crate::credentials::Credentials;
use crate::crypt::Crypto;
use crate::mailbox::cache::{MailboxCache, Opener};
use crate::mailbox::message_store::MessageStore;
use crate::mailbox::model::Folder;
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;

/// What happened to one message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Delivered {
    /// Copies placed in local recipients' mailboxes.
    pub local: usize,
    /// Copies queued in the sender's `Out` folder for relay.
    pub queued: usize,
    /// Copies placed in the sender's `Error` folder because no relay is
    /// possible.
    pub errors: usize,
}

/// Delivers messages on behalf of one consumer of the mailbox cache.
///
/// Each mailbox is opened for the duration of a single write and closed again
/// straight away, since one message may touch many mailboxes.
pub struct Deliverer<'a> {
    pub cache: &'a MailboxCache,
    pub crypto: &'a dyn Crypto,
    pub opener: Opener,
    pub log_prefix: &'a LogPrefix,
}

impl Deliverer<'_> {
    /// Route `data` with `creds` and write every copy.
    ///
    /// Fails with `Error::NoRoute` if the message has nowhere to go. A
    /// failure to write one copy aborts the rest; copies already written stay.
    pub fn deliver(
        &self,
        creds: &Credentials,
        data: &[u8],
        dsn: bool,
    ) -> Result<Delivered, Error> {
        let routes = creds.route(self.cache.mail_root(), data, dsn);
        if routes.is_empty() {
            warn!("{} Message has no deliverable recipient", self.log_prefix);
            return Err(Error::NoRoute);
        }

        let mut delivered = Delivered::default();
        // Relayed copies are spooled once per sender mailbox and folder,
        // carrying every recipient in the envelope header.
        let mut relayed = BTreeMap::<(String, Folder), Vec<String>>::new();

        for route in &routes {
            if route.local {
                self.deliver_local(route, data)?;
                delivered.local += 1;
            } else {
                relayed
                    .entry((mailbox_email(&route.root)?, route.folder))
                    .or_default()
                    .push(route.address.clone());
            }
        }

        for ((email, folder), recipients) in relayed {
            self.with_store(&email, |store| {
                let message = if Folder::Out == folder {
                    store.spool_out_to_out(data, &recipients)?
                } else {
                    store.spool_in(data, folder)?
                };
                info!(
                    "{} Spooled {} for {} into {}/{}",
                    self.log_prefix,
                    message.message_id,
                    recipients.join(", "),
                    email,
                    folder
                );
                Ok(())
            })?;

            if Folder::Out == folder {
                delivered.queued += recipients.len();
            } else {
                delivered.errors += recipients.len();
            }
        }

        Ok(delivered)
    }

    fn deliver_local(&self, route: &Route, data: &[u8]) -> Result<(), Error> {
        let mut decrypted;
        let mut data = data;
        if route.auto_decrypt && self.crypto.check_crypted(data) {
            decrypted = data.to_vec();
            if self.crypto.decrypt(&mut decrypted) {
                data = &decrypted;
            } else {
                warn!(
                    "{} Could not decrypt message for {}",
                    self.log_prefix, route.address
                );
            }
        }

        self.with_store(&route.address, |store| {
            let message = if Folder::Msg == route.folder {
                store.spool_in_to_msg(data)?
            } else {
                store.spool_in(data, route.folder)?
            };
            info!(
                "{} Delivered {} to {}/{}",
                self.log_prefix, message.message_id, route.address, route.folder
            );
            Ok(())
        })
    }

    fn with_store<R>(
        &self,
        email: &str,
        f: impl FnOnce(&MessageStore) -> Result<R, Error>,
    ) -> Result<R, Error> {
        let store = self.cache.open(self.opener, email)?;
        let result = f(&store);
        drop(store);
        self.cache.close(self.opener, Some(email));
        result
    }
}

fn mailbox_email(root: &Path) -> Result<String, Error> {
    root.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_owned)
        .ok_or(Error::UnsafeName)
}
