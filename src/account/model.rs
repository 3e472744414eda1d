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

use std::net::IpAddr;

use chrono::prelude::*;
use serde::{Deserialize, Serialize};

/// How to reach one remote mail server on behalf of an account.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    /// Whether to negotiate TLS (implicit for POP3/IMAP, STARTTLS for SMTP).
    #[serde(default)]
    pub tls: bool,
    /// Remote login; defaults to the account's own login.
    #[serde(default)]
    pub login: Option<String>,
    /// Remote password; defaults to the account's own password.
    #[serde(default)]
    pub password: Option<String>,
}

impl Endpoint {
    pub fn is_usable(&self) -> bool {
        !self.host.is_empty() && 0 != self.port
    }
}

/// A local mail user.
///
/// The login and password are what local POP3/SMTP clients present; the
/// endpoints describe the user's upstream provider.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Account {
    pub login: String,
    pub password: String,
    pub email: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub pop3: Option<Endpoint>,
    #[serde(default)]
    pub smtp: Option<Endpoint>,
    #[serde(default)]
    pub imap: Option<Endpoint>,
    /// Decrypt PGP-encrypted mail on local delivery.
    #[serde(default)]
    pub auto_decrypt: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
}

fn default_true() -> bool {
    true
}

impl Account {
    /// Whether the account has everything needed to accept local mail.
    pub fn is_complete(&self) -> bool {
        !self.login.is_empty()
            && !self.password.is_empty()
            && !self.email.is_empty()
    }

    /// Whether mail from this account can be relayed to the outside.
    pub fn has_outbound(&self) -> bool {
        self.smtp.as_ref().map_or(false, Endpoint::is_usable)
    }

    pub fn has_inbound(&self) -> bool {
        self.pop3.as_ref().map_or(false, Endpoint::is_usable)
    }

    pub fn remote_login<'a>(&'a self, endpoint: &'a Endpoint) -> &'a str {
        endpoint.login.as_deref().unwrap_or(&self.login)
    }

    pub fn remote_password<'a>(&'a self, endpoint: &'a Endpoint) -> &'a str {
        endpoint.password.as_deref().unwrap_or(&self.password)
    }

    pub fn owns_address(&self, address: &str) -> bool {
        self.email.eq_ignore_ascii_case(address.trim())
    }
}

/// An SSH server that can provide a local SOCKS tunnel.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct SshAccount {
    pub name: String,
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub login: String,
    #[serde(default)]
    pub password: String,
    /// The local port the tunnel's SOCKS5 listener binds.
    pub local_port: u16,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
}

fn default_ssh_port() -> u16 {
    22
}

/// A VPN profile managed by an external tunnel service.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct VpnAccount {
    pub name: String,
    pub endpoint: String,
    /// The address assigned to this side of the tunnel, to which outbound
    /// sockets are bound.
    #[serde(default)]
    pub local_address: Option<IpAddr>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
}

/// The capabilities shared by every kind of account.
pub trait AccountCapabilities {
    fn display_name(&self) -> String;
    fn is_enabled(&self) -> bool;
    fn is_expired(&self, now: DateTime<Utc>) -> bool;

    fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.is_enabled() && !self.is_expired(now)
    }
}

fn expired(expires: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    expires.map_or(false, |e| e <= now)
}

impl AccountCapabilities for Account {
    fn display_name(&self) -> String {
        if self.name.is_empty() {
            self.email.clone()
        } else {
            format!("{} <{}>", self.name, self.email)
        }
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        expired(self.expires, now)
    }
}

impl AccountCapabilities for SshAccount {
    fn display_name(&self) -> String {
        format!("{} ({}@{}:{})", self.name, self.login, self.host, self.port)
    }

    fn is_enabled(&self) -> bool {
        self.enabled && !self.host.is_empty() && 0 != self.local_port
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        expired(self.expires, now)
    }
}

impl AccountCapabilities for VpnAccount {
    fn display_name(&self) -> String {
        format!("{} ({})", self.name, self.endpoint)
    }

    fn is_enabled(&self) -> bool {
        self.enabled && !self.endpoint.is_empty()
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        expired(self.expires, now)
    }
}

#[cfg(test)]
mod test {
    use chrono::Duration;

    use super::*;

    #[test]
    fn capabilities() {
        let now = Utc::now();
        let mut ssh = SshAccount {
            name: "tunnel".to_owned(),
            host: "ssh.example".to_owned(),
            port: 22,
            login: "zim".to_owned(),
            local_port: 1080,
            enabled: true,
            ..SshAccount::default()
        };
        assert!(ssh.is_usable(now));
        assert_eq!("tunnel (zim@ssh.example:22)", ssh.display_name());

        ssh.expires = Some(now - Duration::days(1));
        assert!(ssh.is_expired(now));
        assert!(!ssh.is_usable(now));

        let vpn = VpnAccount {
            name: "wg".to_owned(),
            endpoint: String::new(),
            enabled: true,
            ..VpnAccount::default()
        };
        assert!(!vpn.is_usable(now));
    }

    #[test]
    fn account_completeness() {
        let mut account = Account {
            login: "zim".to_owned(),
            password: "gir".to_owned(),
            email: "zim@irk.example".to_owned(),
            enabled: true,
            ..Account::default()
        };
        assert!(account.is_complete());
        assert!(!account.has_outbound());
        assert!(account.owns_address("ZIM@irk.example"));
        assert_eq!("zim@irk.example", account.display_name());

        account.smtp = Some(Endpoint {
            host: "smtp.irk.example".to_owned(),
            port: 587,
            tls: true,
            login: Some("zim-remote".to_owned()),
            password: None,
        });
        assert!(account.has_outbound());
        let smtp = account.smtp.clone().unwrap();
        assert_eq!("zim-remote", account.remote_login(&smtp));
        assert_eq!("gir", account.remote_password(&smtp));

        account.password.clear();
        assert!(!account.is_complete());
    }
}
