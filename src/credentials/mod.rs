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

//! Per-connection authentication state and message routing.

pub mod route;

use std::collections::HashSet;
use std::sync::Arc;

use chrono::prelude::*;
use log::warn;
use openssl::hash::{hash, MessageDigest};
use openssl::pkey::PKey;
use openssl::sign::Signer;
use rand::{rngs::OsRng, Rng};

use crate::account::model::Account;
use crate::account::store::AccountStore;
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;

/// Which half of a credential pair is being checked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CredentialKind {
    Login,
    Password,
}

/// A multi-step exchange a session may have in flight.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PendingCheck {
    AuthPlain,
    AuthLogin,
    CramMd5,
}

/// The authentication state of one connection.
///
/// The login and password bits are independent: USER/PASS sets them one at
/// a time, while the SASL mechanisms and APOP set both at once.
pub struct Credentials {
    accounts: Arc<dyn AccountStore>,
    log_prefix: LogPrefix,
    account: Option<Account>,
    login_ok: bool,
    password_ok: bool,
    local_delivery: bool,
    challenge: Option<String>,
    pending: HashSet<PendingCheck>,
    /// Envelope sender of the message in flight.
    pub from: Option<String>,
    /// Envelope recipients of the message in flight.
    pub to: Vec<String>,
}

impl Credentials {
    pub fn new(accounts: Arc<dyn AccountStore>, log_prefix: LogPrefix) -> Self {
        Credentials {
            accounts,
            log_prefix,
            account: None,
            login_ok: false,
            password_ok: false,
            local_delivery: false,
            challenge: None,
            pending: HashSet::new(),
            from: None,
            to: Vec::new(),
        }
    }

    pub fn accounts(&self) -> &Arc<dyn AccountStore> {
        &self.accounts
    }

    pub fn account(&self) -> Option<&Account> {
        self.account.as_ref()
    }

    pub fn is_login_verified(&self) -> bool {
        self.login_ok
    }

    pub fn is_password_verified(&self) -> bool {
        self.password_ok
    }

    /// Whether the client may use the mailbox and relay mail.
    pub fn is_authorized(&self) -> bool {
        self.login_ok && self.password_ok && !self.local_delivery
    }

    pub fn is_local_delivery(&self) -> bool {
        self.local_delivery
    }

    /// Flip whether `check` is in flight, returning true if it was just
    /// started and false if it was just finished.
    pub fn toggle_pending(&mut self, check: PendingCheck) -> bool {
        if self.pending.insert(check) {
            true
        } else {
            self.pending.remove(&check);
            false
        }
    }

    /// The exchange in flight, if any.
    ///
    /// Sessions toggle a check off once the client answers, so one still
    /// pending when the session fails was abandoned by the client.
    pub fn pending(&self) -> Option<PendingCheck> {
        self.pending.iter().next().copied()
    }

    /// Check one half of a credential pair.
    ///
    /// A login resolves the account and sets only the login bit; a password
    /// is compared against the resolved account and sets only the password
    /// bit. Any mismatch clears the corresponding bit.
    pub fn verify(&mut self, kind: CredentialKind, value: &str) -> bool {
        match kind {
            CredentialKind::Login => {
                self.password_ok = false;
                self.account = self.accounts.find_account(value);
                self.login_ok = self.account.is_some();
                if self.login_ok {
                    self.log_prefix.set_user(value.to_owned());
                }
                self.login_ok
            }
            CredentialKind::Password => {
                self.password_ok = self.login_ok
                    && self.account.as_ref().map_or(false, |a| {
                        !a.password.is_empty() && a.password == value
                    });
                self.password_ok
            }
        }
    }

    /// USER/PASS in one step.
    pub fn auth_user_pass(&mut self, login: &str, password: &str) -> bool {
        let ok = self.verify(CredentialKind::Login, login)
            && self.verify(CredentialKind::Password, password);
        self.log_result("USER/PASS", login, ok);
        ok
    }

    /// RFC 4616 PLAIN, given the base64 initial response.
    pub fn auth_plain(&mut self, response: &str) -> bool {
        let decoded = match decode_base64(response) {
            Some(s) => s,
            None => return self.fail(),
        };

        // Format is <authorise-id>NUL<authenticate-id>NUL<password>
        let mut parts = decoded.split('\x00');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(authorise), Some(authenticate), Some(password), None)
                if authorise.is_empty() || authorise == authenticate =>
            {
                let ok = self.verify(CredentialKind::Login, authenticate)
                    && self.verify(CredentialKind::Password, password);
                self.log_result("PLAIN", authenticate, ok);
                ok
            }
            _ => self.fail(),
        }
    }

    /// First step of LOGIN: the base64 user name.
    pub fn auth_login_user(&mut self, response: &str) -> bool {
        match decode_base64(response) {
            Some(login) => self.verify(CredentialKind::Login, &login),
            None => self.fail(),
        }
    }

    /// Second step of LOGIN: the base64 password.
    pub fn auth_login_password(&mut self, response: &str) -> bool {
        let ok = match decode_base64(response) {
            Some(password) => self.verify(CredentialKind::Password, &password),
            None => false,
        };
        let login = self.account.as_ref().map(|a| a.login.clone());
        self.log_result("LOGIN", login.as_deref().unwrap_or("?"), ok);
        ok
    }

    /// Generate and remember a CRAM-MD5 challenge, returning it base64
    /// encoded.
    pub fn new_cram_challenge(&mut self, host: &str) -> String {
        let challenge = format!(
            "<{}.{}@{}>",
            OsRng.gen::<u32>(),
            Utc::now().timestamp(),
            host
        );
        let encoded = base64::encode(&challenge);
        self.challenge = Some(challenge);
        encoded
    }

    /// Check the base64 response `user hex-hmac` against the last challenge.
    pub fn auth_cram_md5(&mut self, response: &str) -> bool {
        let challenge = match self.challenge.take() {
            Some(c) => c,
            None => return self.fail(),
        };
        let decoded = match decode_base64(response) {
            Some(s) => s,
            None => return self.fail(),
        };
        let (login, digest) = match decoded.rfind(' ') {
            Some(space) => (&decoded[..space], &decoded[space + 1..]),
            None => return self.fail(),
        };

        let ok = self.check_digest(login, digest, |password| {
            cram_md5_digest(&challenge, password)
        });
        self.log_result("CRAM-MD5", login, ok);
        ok
    }

    /// Check an APOP digest against the greeting's timestamp.
    pub fn apop(&mut self, login: &str, digest: &str, stamp: &str) -> bool {
        let ok = self.check_digest(login, digest, |password| {
            apop_digest(stamp, password)
        });
        self.log_result("APOP", login, ok);
        ok
    }

    fn check_digest(
        &mut self,
        login: &str,
        digest: &str,
        compute: impl FnOnce(&str) -> Result<String, Error>,
    ) -> bool {
        if !self.verify(CredentialKind::Login, login) {
            return false;
        }

        let password = self
            .account
            .as_ref()
            .map(|a| a.password.clone())
            .unwrap_or_default();
        self.password_ok = !password.is_empty()
            && match compute(&password) {
                Ok(expected) => expected.eq_ignore_ascii_case(digest),
                Err(e) => {
                    warn!(
                        "{} Digest computation failed: {}",
                        self.log_prefix, e
                    );
                    false
                }
            };
        self.password_ok
    }

    fn fail(&mut self) -> bool {
        self.password_ok = false;
        false
    }

    fn log_result(&self, mechanism: &str, login: &str, ok: bool) {
        if !ok {
            warn!(
                "{} Rejected {} login for '{}'",
                self.log_prefix, mechanism, login
            );
        }
    }

    /// Restrict this connection to delivering to `address`, if it names a
    /// complete local account.
    ///
    /// This is the only way an unauthenticated SMTP client can deliver.
    pub fn check_to_local_delivery(&mut self, address: &str) -> bool {
        let local = self
            .accounts
            .find_by_email(address)
            .map_or(false, |a| a.is_complete());
        if local && !self.is_authorized() {
            self.local_delivery = true;
        }
        local
    }

    /// Reset both verified bits, keeping the resolved account.
    pub fn clear_credentials(&mut self) {
        self.login_ok = false;
        self.password_ok = false;
        self.challenge = None;
        self.pending.clear();
    }

    /// Forget the envelope of the message in flight.
    pub fn clear_envelope(&mut self) {
        self.from = None;
        self.to.clear();
        self.local_delivery = false;
    }
}

fn decode_base64(data: &str) -> Option<String> {
    base64::decode(data.trim())
        .ok()
        .and_then(|decoded| String::from_utf8(decoded).ok())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// HMAC-MD5 of `challenge` keyed by `password`, as lowercase hex.
pub fn cram_md5_digest(
    challenge: &str,
    password: &str,
) -> Result<String, Error> {
    let key = PKey::hmac(password.as_bytes())?;
    let mut signer = Signer::new(MessageDigest::md5(), &key)?;
    signer.update(challenge.as_bytes())?;
    Ok(hex(&signer.sign_to_vec()?))
}

/// MD5 of `stamp` followed by `password`, as lowercase hex.
pub fn apop_digest(stamp: &str, password: &str) -> Result<String, Error> {
    let mut data = stamp.as_bytes().to_vec();
    data.extend_from_slice(password.as_bytes());
    Ok(hex(&hash(MessageDigest::md5(), &data)?))
}
