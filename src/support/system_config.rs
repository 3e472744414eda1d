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

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::error::Error;

/// The system-wide configuration for Mailgate.
///
/// This is stored in a file named `mailgate.toml` under the Mailgate root.
/// Every section may be omitted, in which case its defaults apply.
#[derive(Clone, Debug, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct SystemConfig {
    /// The host name announced in greetings. If empty, the system host name
    /// is used.
    pub host_name: String,
    pub pop3: Pop3Config,
    pub smtp: SmtpConfig,
    /// Configuration for TLS. STLS and STARTTLS are only offered when this
    /// is present.
    pub tls: Option<TlsConfig>,
    pub filter: FilterConfig,
    pub proxy: ProxyConfig,
    pub vpn: VpnConfig,
    pub fetch: FetchConfig,
    pub diagnostic: DiagnosticConfig,
}

impl SystemConfig {
    /// Load `mailgate.toml` from `root`.
    ///
    /// A missing file yields the default configuration.
    pub fn load(root: &Path) -> Result<Self, Error> {
        match fs::read_to_string(root.join("mailgate.toml")) {
            Ok(s) => Ok(toml::from_str(&s)?),
            Err(e) if std::io::ErrorKind::NotFound == e.kind() => {
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Pop3Config {
    pub enabled: bool,
    pub listen: String,
    /// Sessions with no traffic for this long are disconnected.
    pub idle_timeout_secs: u64,
    /// If true, QUIT deletes the files of soft-deleted messages. Otherwise
    /// they are only dropped from the mailbox index.
    pub delete_on_quit: bool,
}

impl Default for Pop3Config {
    fn default() -> Self {
        Pop3Config {
            enabled: true,
            listen: "127.0.0.1:110".to_owned(),
            idle_timeout_secs: 600,
            delete_on_quit: false,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct SmtpConfig {
    pub enabled: bool,
    pub listen: String,
    pub idle_timeout_secs: u64,
    /// If true, MAIL FROM must name the authenticated account's own address.
    pub check_from: bool,
    /// If true, unauthenticated clients may deliver to local mailboxes.
    pub delivery_local: bool,
    pub max_message_size: u64,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        SmtpConfig {
            enabled: true,
            listen: "127.0.0.1:25".to_owned(),
            idle_timeout_secs: 600,
            check_from: true,
            delivery_local: false,
            max_message_size: 64 * 1024 * 1024,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, Default)]
pub struct TlsConfig {
    /// The path to the TLS private key, which must be in PEM format.
    pub private_key: PathBuf,
    /// The path to the TLS certificate chain, which must be in PEM format.
    pub certificate_chain: PathBuf,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Number of authentication failures after which a peer is refused.
    pub spam_check_count: u32,
    pub ban_secs: u64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        FilterConfig {
            spam_check_count: 3,
            ban_secs: 900,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyMode {
    None,
    Ssh,
    All,
    Http,
    Https,
    Socks4,
    Socks5,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub mode: ProxyMode,
    /// Directory holding the `<type>.txt` candidate lists, relative to the
    /// root.
    pub list_dir: PathBuf,
    pub connect_timeout_ms: u64,
    /// Candidate lists older than this are considered stale.
    pub stale_days: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            mode: ProxyMode::None,
            list_dir: PathBuf::from("proxy"),
            connect_timeout_ms: 5000,
            stale_days: 3,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct VpnConfig {
    pub enabled: bool,
    pub ready_timeout_secs: u64,
}

impl Default for VpnConfig {
    fn default() -> Self {
        VpnConfig {
            enabled: false,
            ready_timeout_secs: 45,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct FetchConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub delete_after_fetch: bool,
}

impl Default for FetchConfig {
    fn default() -> Self {
        FetchConfig {
            enabled: false,
            interval_secs: 300,
            delete_after_fetch: false,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, Default)]
pub struct DiagnosticConfig {
    /// If set, redirect standard error to this file, relative to the root.
    pub stderr: Option<PathBuf>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn partial_config_uses_defaults() {
        let config: SystemConfig = toml::from_str(
            r#"
host_name = "mx.irk.example"

[smtp]
check_from = false
delivery_local = true

[proxy]
mode = "socks5"
"#,
        )
        .unwrap();

        assert_eq!("mx.irk.example", config.host_name);
        assert!(!config.smtp.check_from);
        assert!(config.smtp.delivery_local);
        assert_eq!(600, config.smtp.idle_timeout_secs);
        assert_eq!(ProxyMode::Socks5, config.proxy.mode);
        assert_eq!(3, config.proxy.stale_days);
        assert_eq!(3, config.filter.spam_check_count);
        assert!(config.tls.is_none());
        assert!(config.pop3.enabled);
    }

    #[test]
    fn missing_file_is_default() {
        let root = tempfile::TempDir::new().unwrap();
        let config = SystemConfig::load(root.path()).unwrap();
        assert_eq!(45, config.vpn.ready_timeout_secs);
    }
}
