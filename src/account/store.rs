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

//! Lookup of local accounts.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::model::*;
use crate::support::error::Error;

/// The account collaborator consumed by sessions, routing and the outbound
/// tasks.
pub trait AccountStore: Send + Sync {
    /// Find a user account by its exact login.
    fn find_account(&self, login: &str) -> Option<Account>;
    /// Find a user account by email address, ignoring ASCII case.
    fn find_by_email(&self, email: &str) -> Option<Account>;
    fn accounts(&self) -> Vec<Account>;
    fn ssh_accounts(&self) -> Vec<SshAccount>;
    fn vpn_accounts(&self) -> Vec<VpnAccount>;
}

/// The contents of `accounts.toml`.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct AccountsFile {
    #[serde(default)]
    pub user: Vec<Account>,
    #[serde(default)]
    pub ssh: Vec<SshAccount>,
    #[serde(default)]
    pub vpn: Vec<VpnAccount>,
}

/// An `AccountStore` over a fixed set of accounts, normally loaded from
/// `accounts.toml` at start-up.
#[derive(Clone, Debug, Default)]
pub struct FileAccountStore {
    file: AccountsFile,
}

impl FileAccountStore {
    pub fn new(file: AccountsFile) -> Self {
        FileAccountStore { file }
    }

    /// Load `accounts.toml` from `root`. A missing file yields an empty
    /// store.
    pub fn load(root: &Path) -> Result<Self, Error> {
        match fs::read_to_string(root.join("accounts.toml")) {
            Ok(s) => Ok(Self::new(toml::from_str(&s)?)),
            Err(e) if std::io::ErrorKind::NotFound == e.kind() => {
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl AccountStore for FileAccountStore {
    fn find_account(&self, login: &str) -> Option<Account> {
        self.file
            .user
            .iter()
            .find(|a| a.enabled && a.login == login)
            .cloned()
    }

    fn find_by_email(&self, email: &str) -> Option<Account> {
        self.file
            .user
            .iter()
            .find(|a| a.enabled && a.owns_address(email))
            .cloned()
    }

    fn accounts(&self) -> Vec<Account> {
        self.file.user.clone()
    }

    fn ssh_accounts(&self) -> Vec<SshAccount> {
        self.file.ssh.clone()
    }

    fn vpn_accounts(&self) -> Vec<VpnAccount> {
        self.file.vpn.clone()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const ACCOUNTS: &str = r#"
[[user]]
login = "zim"
password = "secret"
email = "zim@irk.example"

[user.smtp]
host = "smtp.irk.example"
port = 587
tls = true

[[user]]
login = "gir"
password = "tacos"
email = "gir@irk.example"
enabled = false

[[ssh]]
name = "tunnel"
host = "ssh.example"
login = "zim"
local_port = 1080
"#;

    #[test]
    fn lookups() {
        let store = FileAccountStore::new(toml::from_str(ACCOUNTS).unwrap());

        let zim = store.find_account("zim").unwrap();
        assert_eq!("zim@irk.example", zim.email);
        assert!(zim.has_outbound());
        assert!(store.find_account("ZIM").is_none());
        assert!(store.find_by_email("Zim@Irk.Example").is_some());

        // Disabled accounts are invisible
        assert!(store.find_account("gir").is_none());
        assert!(store.find_by_email("gir@irk.example").is_none());

        assert_eq!(22, store.ssh_accounts()[0].port);
        assert!(store.vpn_accounts().is_empty());
    }
}
