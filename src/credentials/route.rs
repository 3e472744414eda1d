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

//! Resolution of a message's recipients into delivery routes.

use std::path::{Path, PathBuf};

use log::warn;

use super::Credentials;
use crate::mailbox::model::Folder;
use crate::mime::header::{Headers, Mailbox};

/// Where one copy of a message goes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Route {
    /// Whether this is a delivery into a local recipient's mailbox (as
    /// opposed to a copy kept in the sender's mailbox for relay or error
    /// reporting).
    pub local: bool,
    pub folder: Folder,
    pub name: String,
    pub address: String,
    /// The mailbox the copy is written to.
    pub root: PathBuf,
    pub auto_decrypt: bool,
}

impl Credentials {
    /// Route a message to its recipients.
    ///
    /// The recipients are the envelope recipients if any were given, or else
    /// the `To`, `Cc` and `Bcc` addresses of the message itself. If `dsn` is
    /// true, the message is a delivery-status report and local copies go to
    /// `Error` instead of `Msg`.
    pub fn route(
        &self,
        mail_root: &Path,
        data: &[u8],
        dsn: bool,
    ) -> Vec<Route> {
        let recipients: Vec<Mailbox> = if self.to.is_empty() {
            let headers = Headers::parse(data);
            ["To", "Cc", "Bcc"]
                .iter()
                .flat_map(|field| headers.addresses(field))
                .collect()
        } else {
            self.to
                .iter()
                .map(|address| Mailbox {
                    name: String::new(),
                    address: address.clone(),
                })
                .collect()
        };

        self.route_recipients(mail_root, &recipients, dsn)
    }

    pub fn route_recipients(
        &self,
        mail_root: &Path,
        recipients: &[Mailbox],
        dsn: bool,
    ) -> Vec<Route> {
        let sender = self.account().filter(|_| !self.is_local_delivery());
        let mut routes: Vec<Route> = Vec::new();

        for recipient in recipients {
            let account = self.accounts().find_by_email(&recipient.address);
            let route = match account {
                Some(ref account) if account.is_complete() => Route {
                    local: true,
                    folder: if dsn { Folder::Error } else { Folder::Msg },
                    name: if recipient.name.is_empty() {
                        account.name.clone()
                    } else {
                        recipient.name.clone()
                    },
                    address: account.email.to_ascii_lowercase(),
                    root: mail_root.join(account.email.to_ascii_lowercase()),
                    auto_decrypt: account.auto_decrypt,
                },

                _ => match sender {
                    Some(sender) => Route {
                        local: false,
                        folder: if sender.has_outbound() {
                            Folder::Out
                        } else {
                            Folder::Error
                        },
                        name: recipient.name.clone(),
                        address: recipient.address.to_ascii_lowercase(),
                        root: mail_root.join(sender.email.to_ascii_lowercase()),
                        auto_decrypt: false,
                    },
                    None => {
                        warn!(
                            "No route to <{}> for an unauthenticated sender",
                            recipient.address
                        );
                        continue;
                    }
                },
            };

            let duplicate = routes.iter().any(|r| {
                r.address == route.address && r.folder == route.folder
            });
            if !duplicate {
                routes.push(route);
            }
        }

        routes
    }
}
