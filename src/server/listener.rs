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

//! Accept loops and the registry of live sessions.

use std::collections::BTreeMap;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use chrono::prelude::*;
use log::{error, info, warn};

use super::context::Context;
use crate::support::cancel::CancelToken;
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;
use crate::support::server_io::ServerIo;

/// How often an idle accept loop re-checks cancellation.
const ACCEPT_POLL: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
    Pop3,
    Smtp,
}

impl Protocol {
    pub fn name(self) -> &'static str {
        match self {
            Protocol::Pop3 => "pop3",
            Protocol::Smtp => "smtp",
        }
    }
}

#[derive(Clone, Debug)]
pub struct SessionInfo {
    pub protocol: Protocol,
    pub peer: String,
    pub started: DateTime<Utc>,
}

/// The set of sessions currently running.
#[derive(Debug, Default)]
pub struct SessionTracker {
    next_id: AtomicU64,
    live: Mutex<BTreeMap<u64, SessionInfo>>,
}

/// Unregisters its session when dropped.
pub struct SessionGuard<'a> {
    tracker: &'a SessionTracker,
    id: u64,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.tracker.lock().remove(&self.id);
    }
}

impl SessionTracker {
    fn lock(&self) -> MutexGuard<'_, BTreeMap<u64, SessionInfo>> {
        self.live.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn register(
        &self,
        protocol: Protocol,
        peer: impl Into<String>,
    ) -> SessionGuard<'_> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(
            id,
            SessionInfo {
                protocol,
                peer: peer.into(),
                started: Utc::now(),
            },
        );
        SessionGuard { tracker: self, id }
    }

    pub fn count(&self) -> usize {
        self.lock().len()
    }

    pub fn snapshot(&self) -> Vec<SessionInfo> {
        self.lock().values().cloned().collect()
    }
}

/// Runs one session to completion on the calling thread.
pub type SessionFn = fn(Arc<Context>, ServerIo, LogPrefix) -> Result<(), Error>;

pub fn bind(addr: &str) -> Result<TcpListener, Error> {
    let listener = TcpListener::bind(addr)?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// Spawn the accept loop for `protocol` on its own thread.
///
/// The loop ends when `cancel` fires. Sessions already running are not
/// affected by `cancel`; they watch the context's token.
pub fn spawn(
    ctx: Arc<Context>,
    protocol: Protocol,
    listener: TcpListener,
    session: SessionFn,
    cancel: CancelToken,
) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("{}-listener", protocol.name()))
        .spawn(move || accept_loop(ctx, protocol, listener, session, cancel))
}

fn accept_loop(
    ctx: Arc<Context>,
    protocol: Protocol,
    listener: TcpListener,
    session: SessionFn,
    cancel: CancelToken,
) {
    if let Ok(addr) = listener.local_addr() {
        info!("{} listening on {}", protocol.name(), addr);
    }

    while !cancel.is_cancelled() {
        match listener.accept() {
            Ok((stream, addr)) => {
                admit(&ctx, protocol, stream, addr, session)
            }
            Err(e) if io::ErrorKind::WouldBlock == e.kind() => {
                if cancel.sleep(ACCEPT_POLL).is_err() {
                    break;
                }
            }
            Err(e) if io::ErrorKind::Interrupted == e.kind() => (),
            Err(e) => {
                error!("{} accept failed: {}", protocol.name(), e);
                if cancel.sleep(ACCEPT_POLL).is_err() {
                    break;
                }
            }
        }
    }

    info!("{} listener stopped", protocol.name());
}

fn admit(
    ctx: &Arc<Context>,
    protocol: Protocol,
    stream: TcpStream,
    addr: SocketAddr,
    session: SessionFn,
) {
    if !ctx.filter.check(addr.ip()) {
        info!("{}:{} refused by filter", protocol.name(), addr);
        return;
    }

    // The listener is non-blocking but sessions use blocking reads with
    // timeouts.
    if let Err(e) = stream.set_nonblocking(false) {
        warn!(
            "{}:{} unable to configure socket: {}",
            protocol.name(),
            addr,
            e
        );
        return;
    }
    let _ = stream.set_nodelay(true);

    let ctx = Arc::clone(ctx);
    let spawned = thread::Builder::new()
        .name(format!("{}-{}", protocol.name(), addr))
        .spawn(move || {
            let peer = addr.to_string();
            let _guard = ctx.sessions.register(protocol, peer.clone());
            let io = ServerIo::new(stream);
            run_session(Arc::clone(&ctx), protocol, io, peer, session)
        });
    if let Err(e) = spawned {
        error!("{}:{} unable to spawn session: {}", protocol.name(), addr, e);
    }
}

/// Run `session` and log how it ended.
pub fn run_session(
    ctx: Arc<Context>,
    protocol: Protocol,
    io: ServerIo,
    peer: String,
    session: SessionFn,
) {
    let log_prefix = LogPrefix::new(protocol.name(), peer);
    match session(ctx, io, log_prefix.clone()) {
        Ok(()) => info!("{} Normal client disconnect", log_prefix),
        Err(Error::Cancelled) => info!("{} Session cancelled", log_prefix),
        Err(e) if e.is_disconnect() => {
            info!("{} Client went away: {}", log_prefix, e)
        }
        Err(e) => warn!("{} Abnormal client disconnect: {}", log_prefix, e),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tracker_unregisters_on_drop() {
        let tracker = SessionTracker::default();
        let a = tracker.register(Protocol::Pop3, "127.0.0.1:1000");
        {
            let _b = tracker.register(Protocol::Smtp, "127.0.0.1:1001");
            assert_eq!(2, tracker.count());
        }

        let live = tracker.snapshot();
        assert_eq!(1, live.len());
        assert_eq!(Protocol::Pop3, live[0].protocol);
        assert_eq!("127.0.0.1:1000", live[0].peer);

        drop(a);
        assert_eq!(0, tracker.count());
    }
}
