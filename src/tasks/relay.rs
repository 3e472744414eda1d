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

//! Sending mail queued in each account's `Out` folder through the account's
//! upstream SMTP server.
//!
//! A message the upstream server refuses is moved to `Bounced`, and a
//! delivery-status report explaining why lands in the sender's `Error`
//! folder. Transport failures leave the remaining messages queued for the
//! next cycle.

use std::sync::Arc;

use chrono::prelude::*;
use log::{info, warn};
use rand::{rngs::OsRng, Rng};

use super::Running;
use crate::account::model::{Account, AccountCapabilities};
use crate::account::store::AccountStore;
use crate::credentials::Credentials;
use crate::crypt::Crypto;
use crate::mailbox::cache::{MailboxCache, Opener, OpenerKind};
use crate::mailbox::message_store::{MessageStore, ENVELOPE_HEADER};
use crate::mailbox::model::{Folder, Message};
use crate::mime::header::{strip_field, Headers};
use crate::outbound::client::{MailClient, Role, SmtpClient};
use crate::outbound::connector::{Connect, NetConnect, OutboundConnector};
use crate::server::context::Context;
use crate::smtp::delivery::Deliverer;
use crate::support::cancel::CancelToken;
use crate::support::error::{summarise, Error};
use crate::support::log_prefix::LogPrefix;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RelayReport {
    /// Messages accepted upstream and moved to `Send`.
    pub sent: usize,
    /// Messages refused upstream and moved to `Bounced`.
    pub bounced: usize,
    /// Accounts whose queue could not be worked through.
    pub failed: usize,
}

impl RelayReport {
    fn add(&mut self, other: RelayReport) {
        self.sent += other.sent;
        self.bounced += other.bounced;
        self.failed += other.failed;
    }
}

pub struct Relayer<'a, C: Connect> {
    pub connector: &'a OutboundConnector<C>,
    pub accounts: &'a Arc<dyn AccountStore>,
    pub cache: &'a MailboxCache,
    pub crypto: &'a dyn Crypto,
    pub running: &'a Running,
    pub host_name: &'a str,
}

impl<'a> Relayer<'a, NetConnect> {
    pub fn new(ctx: &'a Context) -> Self {
        Relayer {
            connector: &ctx.connector,
            accounts: &ctx.accounts,
            cache: &ctx.cache,
            crypto: &*ctx.crypto,
            running: &ctx.relaying,
            host_name: &ctx.host_name,
        }
    }
}

impl<C: Connect<Client = MailClient>> Relayer<'_, C> {
    /// Relay the queue of every enabled account with an SMTP server.
    ///
    /// Returns `None` without doing anything if another cycle is running.
    pub fn run(&self, cancel: &CancelToken) -> Option<RelayReport> {
        let _running = match self.running.try_start() {
            Some(guard) => guard,
            None => {
                info!("Relay already in progress, skipping");
                return None;
            }
        };

        let now = Utc::now();
        let mut report = RelayReport::default();
        for account in self.accounts.accounts() {
            if cancel.is_cancelled() {
                info!("Relay cancelled");
                break;
            }
            if !account.is_usable(now) || !account.has_outbound() {
                continue;
            }

            match self.relay_account(&account, cancel) {
                Ok(r) => report.add(r),
                Err(e) => {
                    warn!(
                        "Relay for {} failed: {}",
                        account.email,
                        summarise(&e, 96)
                    );
                    report.failed += 1;
                }
            }
        }

        Some(report)
    }

    /// Send everything in the `Out` folder of `account`.
    pub fn relay_account(
        &self,
        account: &Account,
        cancel: &CancelToken,
    ) -> Result<RelayReport, Error> {
        let opener = Opener::new(OpenerKind::Relay);
        let store = self.cache.open(opener, &account.email)?;
        let result = self.relay_store(account, &store, cancel);
        drop(store);
        self.cache.close(opener, Some(&account.email));
        result
    }

    fn relay_store(
        &self,
        account: &Account,
        store: &MessageStore,
        cancel: &CancelToken,
    ) -> Result<RelayReport, Error> {
        let queued = store.items(|m| Folder::Out == m.folder);
        if queued.is_empty() {
            return Ok(RelayReport::default());
        }

        let connection = self
            .connector
            .connect(account, Role::Smtp, cancel)
            .ok_or_else(|| {
                Error::Protocol(format!(
                    "No path to the SMTP server of {}",
                    account.email
                ))
            })?;
        let mut client = match connection.client {
            MailClient::Smtp(client) => client,
            other => {
                let _ = other.close();
                return Err(Error::Protocol(
                    "Connector returned a non-SMTP client".to_owned(),
                ));
            }
        };

        let mut report = RelayReport::default();
        for message in &queued {
            cancel.check()?;
            if self.send_one(account, store, &mut client, message)? {
                report.sent += 1;
            } else {
                report.bounced += 1;
            }
        }

        client.quit()?;
        info!(
            "Relayed {} of {} messages for {} via {}",
            report.sent,
            queued.len(),
            account.email,
            connection.hop
        );
        Ok(report)
    }

    /// Returns whether the message was accepted. Refusals are handled here;
    /// only transport failures are returned as errors.
    fn send_one(
        &self,
        account: &Account,
        store: &MessageStore,
        client: &mut SmtpClient,
        message: &Message,
    ) -> Result<bool, Error> {
        let raw = store.read_message(message.id)?;
        let (envelope, data) = strip_field(&raw, ENVELOPE_HEADER);
        let recipients = envelope_recipients(&envelope, &data);

        if recipients.is_empty() {
            self.bounce(account, store, message, &data, "No recipients")?;
            return Ok(false);
        }

        match client.send_mail(&account.email, &recipients, &data) {
            Ok(()) => {
                store.move_to(message.id, Folder::Send)?;
                info!(
                    "Sent {} from {} to {}",
                    message.message_id,
                    account.email,
                    recipients.join(", ")
                );
                Ok(true)
            }
            Err(Error::Rejected(reason)) => {
                client.reset()?;
                self.bounce(account, store, message, &data, &reason)?;
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn bounce(
        &self,
        account: &Account,
        store: &MessageStore,
        message: &Message,
        data: &[u8],
        reason: &str,
    ) -> Result<(), Error> {
        warn!(
            "Upstream refused {} from {}: {}",
            message.message_id,
            account.email,
            summarise(&reason, 96)
        );
        store.move_to(message.id, Folder::Bounced)?;

        let log_prefix = LogPrefix::new("relay", self.host_name);
        let mut creds =
            Credentials::new(Arc::clone(self.accounts), log_prefix.clone());
        creds.from = Some(format!("MAILER-DAEMON@{}", self.host_name));
        creds.to = vec![account.email.clone()];

        let report = delivery_status_report(
            self.host_name,
            &account.email,
            &message.message_id,
            reason,
            data,
        );
        Deliverer {
            cache: self.cache,
            crypto: self.crypto,
            opener: Opener::new(OpenerKind::Relay),
            log_prefix: &log_prefix,
        }
        .deliver(&creds, &report, true)?;
        Ok(())
    }
}

/// The recipients from the envelope header, or from the message's own
/// address fields if the header is missing.
fn envelope_recipients(envelope: &[String], data: &[u8]) -> Vec<String> {
    let mut recipients: Vec<String> = envelope
        .iter()
        .flat_map(|value| value.split(','))
        .map(|address| address.trim().to_owned())
        .filter(|address| !address.is_empty())
        .collect();

    if recipients.is_empty() {
        let headers = Headers::parse(data);
        recipients = ["To", "Cc", "Bcc"]
            .iter()
            .flat_map(|field| headers.addresses(field))
            .map(|mailbox| mailbox.address)
            .collect();
    }

    let mut unique: Vec<String> = Vec::with_capacity(recipients.len());
    for recipient in recipients {
        if !unique.iter().any(|u| u.eq_ignore_ascii_case(&recipient)) {
            unique.push(recipient);
        }
    }
    unique
}

/// A plain-text report telling `sender` that a message was refused.
fn delivery_status_report(
    host_name: &str,
    sender: &str,
    message_id: &str,
    reason: &str,
    original: &[u8],
) -> Vec<u8> {
    let headers_end = Headers::parse(original).body_offset();
    let now = Utc::now();

    let mut report = format!(
        "From: Mail Delivery System <MAILER-DAEMON@{host}>\r\n\
         To: <{sender}>\r\n\
         Subject: Undelivered Mail Returned to Sender\r\n\
         Date: {date}\r\n\
         Message-ID: <dsn.{stamp}.{nonce:08x}@{host}>\r\n\
         Auto-Submitted: auto-replied\r\n\
         MIME-Version: 1.0\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         \r\n\
         Your message {message_id} could not be delivered.\r\n\
         \r\n\
         The upstream server said: {reason}\r\n\
         \r\n\
         ----- Original message headers -----\r\n\
         \r\n",
        host = host_name,
        sender = sender,
        date = now.to_rfc2822(),
        stamp = now.timestamp(),
        nonce = OsRng.gen::<u32>(),
        message_id = message_id,
        reason = reason,
    )
    .into_bytes();
    report.extend_from_slice(&original[..headers_end]);
    report
}
