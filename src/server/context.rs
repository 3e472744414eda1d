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

//! The application context shared by every service and session.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::info;
use openssl::ssl::{SslAcceptor, SslFiletype, SslMethod};

use super::filter::{AuthFilter, PeerFilter};
use super::listener::SessionTracker;
use crate::account::store::{AccountStore, FileAccountStore};
use crate::crypt::{Crypto, NoCrypto};
use crate::mailbox::cache::MailboxCache;
use crate::outbound::connector::{NetConnect, OutboundConnector};
use crate::support::cancel::CancelToken;
use crate::support::error::Error;
use crate::support::system_config::{SystemConfig, TlsConfig};
use crate::tasks::Running;

/// Everything a Mailgate process needs, built once at start-up.
pub struct Context {
    pub root: PathBuf,
    pub config: SystemConfig,
    pub host_name: String,
    pub accounts: Arc<dyn AccountStore>,
    pub cache: Arc<MailboxCache>,
    pub filter: Arc<dyn PeerFilter>,
    pub crypto: Arc<dyn Crypto>,
    pub connector: Arc<OutboundConnector<NetConnect>>,
    pub ssl_acceptor: Option<Arc<SslAcceptor>>,
    pub sessions: SessionTracker,
    pub cancel: CancelToken,
    /// Held while a fetch cycle runs.
    pub fetching: Running,
    /// Held while a relay cycle runs.
    pub relaying: Running,
}

impl Context {
    /// Assemble a context from already-loaded parts.
    pub fn new(
        root: PathBuf,
        config: SystemConfig,
        host_name: String,
        accounts: Arc<dyn AccountStore>,
        ssl_acceptor: Option<Arc<SslAcceptor>>,
    ) -> Self {
        let connector = OutboundConnector::new(
            NetConnect::new(
                Duration::from_millis(config.proxy.connect_timeout_ms),
                host_name.clone(),
            ),
            Arc::clone(&accounts),
            &root,
            config.proxy.clone(),
            config.vpn.clone(),
        );

        Context {
            cache: Arc::new(MailboxCache::new(mail_root(&root))),
            filter: Arc::new(AuthFilter::new(&config.filter)),
            crypto: Arc::new(NoCrypto),
            connector: Arc::new(connector),
            sessions: SessionTracker::default(),
            cancel: CancelToken::new(),
            fetching: Running::default(),
            relaying: Running::default(),
            root,
            config,
            host_name,
            accounts,
            ssl_acceptor,
        }
    }

    /// Load `mailgate.toml`, `accounts.toml` and the TLS material from `root`.
    pub fn load(root: &Path) -> Result<Self, Error> {
        let config = SystemConfig::load(root)?;
        let accounts: Arc<dyn AccountStore> =
            Arc::new(FileAccountStore::load(root)?);
        let ssl_acceptor = match config.tls {
            Some(ref tls) => Some(Arc::new(create_ssl_acceptor(root, tls)?)),
            None => None,
        };
        let host_name = if config.host_name.is_empty() {
            system_host_name()?
        } else {
            config.host_name.clone()
        };

        info!("Loaded configuration from {}", root.display());
        Ok(Self::new(
            root.to_owned(),
            config,
            host_name,
            accounts,
            ssl_acceptor,
        ))
    }

    pub fn mail_root(&self) -> &Path {
        self.cache.mail_root()
    }
}

pub fn mail_root(root: &Path) -> PathBuf {
    root.join("mail")
}

pub fn create_ssl_acceptor(
    root: &Path,
    tls: &TlsConfig,
) -> Result<SslAcceptor, Error> {
    let mut acceptor =
        SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server())?;
    acceptor
        .set_private_key_file(root.join(&tls.private_key), SslFiletype::PEM)?;
    acceptor.set_certificate_chain_file(root.join(&tls.certificate_chain))?;
    acceptor.check_private_key()?;
    Ok(acceptor.build())
}

fn system_host_name() -> Result<String, Error> {
    let mut buf = [0u8; 256];
    let host_name = nix::unistd::gethostname(&mut buf)?;
    host_name
        .to_str()
        .map(str::to_owned)
        .map_err(|_| {
            Error::Protocol("System host name is not UTF-8".to_owned())
        })
}
