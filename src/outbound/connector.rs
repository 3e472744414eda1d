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

//! Selection of the network path to a remote mail server.
//!
//! Depending on the proxy mode, a connection goes out directly, through an
//! SSH tunnel, or through one of the candidate proxies. Each attempt dials,
//! performs any proxy handshake, and authenticates to the mail server; a
//! candidate only counts as working once all of that succeeds.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::{IpAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::prelude::*;
use log::{debug, info, warn};
use openssl::ssl::{SslConnector, SslMethod};

use super::client::*;
use super::proxy::*;
use super::tunnel::{self, BoxConduit};
use crate::account::model::{
    Account, AccountCapabilities, Endpoint, SshAccount, VpnAccount,
};
use crate::account::store::AccountStore;
use crate::support::cancel::CancelToken;
use crate::support::error::{summarise, Error};
use crate::support::system_config::{ProxyConfig, ProxyMode, VpnConfig};
use crate::support::wait::BoundedWait;

/// Maximum length of a failure reason in the log.
const MAX_REASON: usize = 96;

/// How a connection reaches the mail server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Hop {
    Direct,
    Proxy(ProxyKind, ProxyCandidate),
    /// Through the SOCKS listener of the named SSH tunnel.
    Ssh { account: String, port: u16 },
}

impl fmt::Display for Hop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Hop::Direct => f.write_str("direct"),
            Hop::Proxy(kind, ref candidate) => {
                write!(f, "{} proxy {}", kind, candidate)
            }
            Hop::Ssh { ref account, port } => {
                write!(f, "ssh tunnel {} (port {})", account, port)
            }
        }
    }
}

/// One connection attempt: dial through `hop`, then authenticate.
pub trait Connect: Send + Sync {
    type Client;

    fn connect(
        &self,
        hop: &Hop,
        account: &Account,
        endpoint: &Endpoint,
        role: Role,
        local: Option<IpAddr>,
    ) -> Result<Self::Client, Error>;
}

/// The real `Connect`, over TCP.
pub struct NetConnect {
    timeout: Duration,
    local_name: String,
}

impl NetConnect {
    pub fn new(timeout: Duration, local_name: impl Into<String>) -> Self {
        NetConnect {
            timeout,
            local_name: local_name.into(),
        }
    }

    fn dial(
        &self,
        hop: &Hop,
        endpoint: &Endpoint,
        local: Option<IpAddr>,
    ) -> Result<BoxConduit, Error> {
        match *hop {
            Hop::Direct => Ok(Box::new(tunnel::dial(
                &endpoint.host,
                endpoint.port,
                local,
                self.timeout,
            )?)),
            Hop::Proxy(kind, ref candidate) => {
                let stream = tunnel::dial(
                    &candidate.host,
                    candidate.port,
                    local,
                    self.timeout,
                )?;
                tunnel::handshake(
                    kind,
                    stream,
                    &candidate.host,
                    &endpoint.host,
                    endpoint.port,
                )
            }
            Hop::Ssh { port, .. } => {
                let mut stream =
                    tunnel::dial("127.0.0.1", port, None, self.timeout)?;
                tunnel::socks5_connect(
                    &mut stream,
                    &endpoint.host,
                    endpoint.port,
                )?;
                Ok(Box::new(stream))
            }
        }
    }
}

impl Connect for NetConnect {
    type Client = MailClient;

    fn connect(
        &self,
        hop: &Hop,
        account: &Account,
        endpoint: &Endpoint,
        role: Role,
        local: Option<IpAddr>,
    ) -> Result<MailClient, Error> {
        let mut conduit = self.dial(hop, endpoint, local)?;
        if endpoint.tls {
            let stream = SslConnector::builder(SslMethod::tls())?
                .build()
                .connect(&endpoint.host, conduit)
                .map_err(|e| Error::Protocol(format!("TLS: {}", e)))?;
            conduit = Box::new(stream);
        }

        let login = account.remote_login(endpoint);
        let password = account.remote_password(endpoint);
        match role {
            Role::Pop3 => {
                let mut client = Pop3Client::connect(conduit)?;
                client.login(login, password)?;
                Ok(MailClient::Pop3(client))
            }
            Role::Smtp => {
                let mut client = SmtpClient::connect(
                    conduit,
                    &endpoint.host,
                    &self.local_name,
                    endpoint.tls,
                )?;
                if !password.is_empty() {
                    client.auth_plain(login, password)?;
                }
                Ok(MailClient::Smtp(client))
            }
            Role::Imap => {
                let mut client = ImapClient::connect(conduit)?;
                client.login(login, password)?;
                Ok(MailClient::Imap(client))
            }
        }
    }
}

/// The VPN tunnel collaborator.
pub trait VpnService: Send + Sync {
    /// Bring the tunnel for `account` up. May return before it is ready.
    fn start(&self, account: &VpnAccount) -> Result<(), Error>;
    fn is_ready(&self) -> bool;
    /// The local address of the tunnel, if the service knows it.
    fn local_address(&self) -> Option<IpAddr>;
}

/// A `VpnService` for builds without one; it never becomes ready.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoVpn;

impl VpnService for NoVpn {
    fn start(&self, account: &VpnAccount) -> Result<(), Error> {
        warn!("No VPN service available to start {}", account.name);
        Err(Error::NoRoute)
    }

    fn is_ready(&self) -> bool {
        false
    }

    fn local_address(&self) -> Option<IpAddr> {
        None
    }
}

/// The SSH tunnel collaborator.
pub trait SshTunnels: Send + Sync {
    /// Make sure a tunnel for `account` is running and return the local
    /// SOCKS5 port it listens on.
    fn ensure(&self, account: &SshAccount) -> Result<u16, Error>;
}

/// `SshTunnels` running `ssh -D` child processes.
///
/// Authentication is left to the user's ssh configuration; the child runs in
/// batch mode so it fails instead of prompting.
pub struct SshCommandTunnels {
    children: Mutex<HashMap<String, Child>>,
    ready: BoundedWait,
}

impl SshCommandTunnels {
    pub fn new() -> Self {
        SshCommandTunnels {
            children: Mutex::new(HashMap::new()),
            ready: BoundedWait::new(
                Duration::from_secs(10),
                Duration::from_millis(200),
            ),
        }
    }

    fn children(&self) -> MutexGuard<'_, HashMap<String, Child>> {
        self.children.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Default for SshCommandTunnels {
    fn default() -> Self {
        Self::new()
    }
}

impl SshTunnels for SshCommandTunnels {
    fn ensure(&self, account: &SshAccount) -> Result<u16, Error> {
        let mut children = self.children();
        if let Some(child) = children.get_mut(&account.name) {
            if let Ok(None) = child.try_wait() {
                return Ok(account.local_port);
            }
            info!("SSH tunnel {} has exited", account.name);
        }

        let child = Command::new("ssh")
            .arg("-N")
            .args(&["-o", "BatchMode=yes"])
            .args(&["-o", "ExitOnForwardFailure=yes"])
            .arg("-D")
            .arg(format!("127.0.0.1:{}", account.local_port))
            .arg("-p")
            .arg(account.port.to_string())
            .arg(format!("{}@{}", account.login, account.host))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .spawn()?;
        info!("Started {}", account.display_name());
        children.insert(account.name.clone(), child);

        let port = account.local_port;
        if self.ready.until(|| TcpStream::connect(("127.0.0.1", port)).is_ok())
        {
            Ok(port)
        } else {
            if let Some(mut child) = children.remove(&account.name) {
                let _ = child.kill();
                let _ = child.wait();
            }
            Err(Error::TimedOut)
        }
    }
}

impl Drop for SshCommandTunnels {
    fn drop(&mut self) {
        for (_, mut child) in self.children().drain() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// A successful connection and the path it took.
#[derive(Debug)]
pub struct Connection<T> {
    pub client: T,
    pub hop: Hop,
}

pub struct OutboundConnector<C: Connect> {
    connect: C,
    accounts: Arc<dyn AccountStore>,
    proxy: ProxyConfig,
    vpn_config: VpnConfig,
    list_dir: PathBuf,
    registries: Mutex<BTreeMap<ProxyKind, ProxyRegistry>>,
    source: Box<dyn CandidateSource>,
    vpn: Box<dyn VpnService>,
    vpn_poll: Duration,
    ssh: Box<dyn SshTunnels>,
    ssh_current: Mutex<Option<String>>,
}

impl<C: Connect> OutboundConnector<C> {
    pub fn new(
        connect: C,
        accounts: Arc<dyn AccountStore>,
        root: &Path,
        proxy: ProxyConfig,
        vpn_config: VpnConfig,
    ) -> Self {
        OutboundConnector {
            connect,
            accounts,
            list_dir: root.join(&proxy.list_dir),
            proxy,
            vpn_config,
            registries: Mutex::new(
                ProxyKind::ALL
                    .iter()
                    .map(|&k| (k, ProxyRegistry::new(k)))
                    .collect(),
            ),
            source: Box::new(NoSource),
            vpn: Box::new(NoVpn),
            vpn_poll: Duration::from_millis(250),
            ssh: Box::new(SshCommandTunnels::new()),
            ssh_current: Mutex::new(None),
        }
    }

    pub fn with_source(
        mut self,
        source: impl CandidateSource + 'static,
    ) -> Self {
        self.source = Box::new(source);
        self
    }

    pub fn with_vpn(mut self, vpn: impl VpnService + 'static) -> Self {
        self.vpn = Box::new(vpn);
        self
    }

    pub fn with_ssh(mut self, ssh: impl SshTunnels + 'static) -> Self {
        self.ssh = Box::new(ssh);
        self
    }

    /// The underlying per-attempt connector.
    pub fn transport(&self) -> &C {
        &self.connect
    }

    pub fn mode(&self) -> ProxyMode {
        self.proxy.mode
    }

    fn registries(&self) -> MutexGuard<'_, BTreeMap<ProxyKind, ProxyRegistry>> {
        self.registries.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Run `f` on the registry for `kind`.
    pub fn with_registry<R>(
        &self,
        kind: ProxyKind,
        f: impl FnOnce(&mut ProxyRegistry) -> R,
    ) -> R {
        let mut registries = self.registries();
        let registry = registries
            .entry(kind)
            .or_insert_with(|| ProxyRegistry::new(kind));
        f(registry)
    }

    /// Connect to the `role` server of `account`.
    ///
    /// Every failure along the way is logged; `None` means no path worked.
    pub fn connect(
        &self,
        account: &Account,
        role: Role,
        cancel: &CancelToken,
    ) -> Option<Connection<C::Client>> {
        let endpoint = match role {
            Role::Pop3 => account.pop3.as_ref(),
            Role::Smtp => account.smtp.as_ref(),
            Role::Imap => account.imap.as_ref(),
        };
        let endpoint = match endpoint.filter(|e| e.is_usable()) {
            Some(e) => e,
            None => {
                warn!("{} has no usable {:?} server", account.email, role);
                return None;
            }
        };

        let local = if self.vpn_config.enabled {
            match self.vpn_ready(cancel) {
                Ok(local) => local,
                Err(e) => {
                    warn!("VPN unavailable: {}", summarise(&e, MAX_REASON));
                    return None;
                }
            }
        } else {
            None
        };

        let result = match self.proxy.mode {
            ProxyMode::Ssh => self.via_ssh(account, endpoint, role, local),
            ProxyMode::None => {
                self.attempt(Hop::Direct, account, endpoint, role, local)
            }
            ProxyMode::All => ProxyKind::ALL
                .iter()
                .find_map(|&kind| {
                    self.via_active(kind, account, endpoint, role, local)
                })
                .or_else(|| {
                    ProxyKind::ALL.iter().find_map(|&kind| {
                        self.via_list(
                            kind, account, endpoint, role, local, cancel,
                        )
                    })
                }),
            ProxyMode::Http => self.via_kind(
                ProxyKind::Http,
                account,
                endpoint,
                role,
                local,
                cancel,
            ),
            ProxyMode::Https => self.via_kind(
                ProxyKind::Https,
                account,
                endpoint,
                role,
                local,
                cancel,
            ),
            ProxyMode::Socks4 => self.via_kind(
                ProxyKind::Socks4,
                account,
                endpoint,
                role,
                local,
                cancel,
            ),
            ProxyMode::Socks5 => self.via_kind(
                ProxyKind::Socks5,
                account,
                endpoint,
                role,
                local,
                cancel,
            ),
        };

        match result {
            Some(ref connection) => info!(
                "Connected to {:?} server of {} via {}",
                role, account.email, connection.hop
            ),
            None => warn!(
                "No path to {:?} server of {} ({:?} mode)",
                role, account.email, self.proxy.mode
            ),
        }
        result
    }

    fn attempt(
        &self,
        hop: Hop,
        account: &Account,
        endpoint: &Endpoint,
        role: Role,
        local: Option<IpAddr>,
    ) -> Option<Connection<C::Client>> {
        match self.connect.connect(&hop, account, endpoint, role, local) {
            Ok(client) => Some(Connection { client, hop }),
            Err(e) => {
                info!(
                    "{}:{} via {} failed: {}",
                    endpoint.host,
                    endpoint.port,
                    hop,
                    summarise(&e, MAX_REASON)
                );
                None
            }
        }
    }

    fn via_kind(
        &self,
        kind: ProxyKind,
        account: &Account,
        endpoint: &Endpoint,
        role: Role,
        local: Option<IpAddr>,
        cancel: &CancelToken,
    ) -> Option<Connection<C::Client>> {
        self.via_active(kind, account, endpoint, role, local)
            .or_else(|| {
                self.via_list(kind, account, endpoint, role, local, cancel)
            })
    }

    /// Reuse the active candidate of `kind`, if there is one and it still
    /// works.
    fn via_active(
        &self,
        kind: ProxyKind,
        account: &Account,
        endpoint: &Endpoint,
        role: Role,
        local: Option<IpAddr>,
    ) -> Option<Connection<C::Client>> {
        let active = self.with_registry(kind, |r| r.active().cloned())?;
        let result = self.attempt(
            Hop::Proxy(kind, active.clone()),
            account,
            endpoint,
            role,
            local,
        );
        if result.is_none() {
            self.with_registry(kind, |r| r.mark_dead(&active));
        }
        result
    }

    /// Try every candidate of `kind` in order.
    fn via_list(
        &self,
        kind: ProxyKind,
        account: &Account,
        endpoint: &Endpoint,
        role: Role,
        local: Option<IpAddr>,
        cancel: &CancelToken,
    ) -> Option<Connection<C::Client>> {
        self.ensure_candidates(kind);
        self.with_registry(kind, ProxyRegistry::rewind);

        loop {
            if cancel.is_cancelled() {
                return None;
            }

            let candidate = self.with_registry(kind, ProxyRegistry::next)?;
            let hop = Hop::Proxy(kind, candidate.clone());
            match self.attempt(hop, account, endpoint, role, local) {
                Some(connection) => {
                    self.with_registry(kind, |r| r.set_active(candidate));
                    return Some(connection);
                }
                None => self.with_registry(kind, |r| r.mark_dead(&candidate)),
            }
        }
    }

    /// Load the candidates of `kind` if none are in memory, and refresh them
    /// from the candidate source if the persisted list is empty or stale.
    fn ensure_candidates(&self, kind: ProxyKind) {
        let dir = &self.list_dir;
        let max_age =
            Duration::from_secs(self.proxy.stale_days.saturating_mul(86400));
        let (empty, stale) = self.with_registry(kind, |r| {
            if r.is_empty() {
                if let Err(e) = r.load(dir) {
                    warn!("Failed to load {} proxies: {}", kind, e);
                }
            }
            (r.is_empty(), r.is_stale(dir, max_age))
        });

        if !empty && !stale {
            return;
        }

        match self.source.fetch(kind) {
            Ok(fresh) if !fresh.is_empty() => {
                self.with_registry(kind, |r| {
                    r.set(fresh);
                    info!("Fetched {} {} proxies", r.len(), kind);
                    if let Err(e) = r.save(dir) {
                        warn!("Failed to save {} proxies: {}", kind, e);
                    }
                });
            }
            Ok(_) => {
                if stale && !empty {
                    debug!("{} proxy list is stale, keeping it", kind);
                }
            }
            Err(e) => warn!(
                "Failed to fetch {} proxies: {}",
                kind,
                summarise(&e, MAX_REASON)
            ),
        }
    }

    /// Prune proven-dead candidates from the front of every list and
    /// rewrite the persisted lists. Returns the number pruned.
    pub fn merge(&self) -> usize {
        let mut registries = self.registries();
        let mut pruned = 0;
        for registry in registries.values_mut() {
            match registry.merge(&self.list_dir) {
                Ok(n) => pruned += n,
                Err(e) => warn!(
                    "Failed to rewrite {} proxies: {}",
                    registry.kind(),
                    e
                ),
            }
        }
        pruned
    }

    fn via_ssh(
        &self,
        account: &Account,
        endpoint: &Endpoint,
        role: Role,
        local: Option<IpAddr>,
    ) -> Option<Connection<C::Client>> {
        let ssh = match self.select_ssh() {
            Some(ssh) => ssh,
            None => {
                warn!("No usable SSH account");
                return None;
            }
        };

        let port = match self.ssh.ensure(&ssh) {
            Ok(port) => port,
            Err(e) => {
                warn!(
                    "SSH tunnel {} failed: {}",
                    ssh.name,
                    summarise(&e, MAX_REASON)
                );
                *self.ssh_current.lock().unwrap_or_else(|p| p.into_inner()) =
                    None;
                return None;
            }
        };

        self.attempt(
            Hop::Ssh {
                account: ssh.name,
                port,
            },
            account,
            endpoint,
            role,
            local,
        )
    }

    /// The SSH account in use if it is still usable, or else the first
    /// usable one, which becomes the one in use.
    fn select_ssh(&self) -> Option<SshAccount> {
        let now = Utc::now();
        let usable: Vec<SshAccount> = self
            .accounts
            .ssh_accounts()
            .into_iter()
            .filter(|a| a.is_usable(now))
            .collect();

        let mut current =
            self.ssh_current.lock().unwrap_or_else(|p| p.into_inner());
        let selected = current
            .as_ref()
            .and_then(|name| usable.iter().find(|a| a.name == *name))
            .or_else(|| usable.first())
            .cloned();
        *current = selected.as_ref().map(|a| a.name.clone());
        selected
    }

    /// Bring the VPN up if needed and wait for it, retrying once.
    ///
    /// Returns the local address to bind outbound sockets to.
    fn vpn_ready(&self, cancel: &CancelToken) -> Result<Option<IpAddr>, Error> {
        let now = Utc::now();
        let account = self
            .accounts
            .vpn_accounts()
            .into_iter()
            .find(|a| a.is_usable(now))
            .ok_or(Error::NoRoute)?;

        let wait = BoundedWait::new(
            Duration::from_secs(self.vpn_config.ready_timeout_secs),
            self.vpn_poll,
        );
        for attempt in 1..=2 {
            cancel.check()?;
            if !self.vpn.is_ready() {
                info!("Starting VPN {} (attempt {})", account.name, attempt);
                if let Err(e) = self.vpn.start(&account) {
                    warn!("VPN {} failed to start: {}", account.name, e);
                    continue;
                }
            }

            if wait.until(|| cancel.is_cancelled() || self.vpn.is_ready()) {
                cancel.check()?;
                return Ok(account
                    .local_address
                    .or_else(|| self.vpn.local_address()));
            }
        }

        Err(Error::TimedOut)
    }
}
