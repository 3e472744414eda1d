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

//! Transient table of peers that failed authentication.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::{info, warn};

use crate::support::system_config::FilterConfig;

/// The spam/IP filter collaborator.
pub trait PeerFilter: Send + Sync {
    /// Whether a peer at `ip` may talk to us.
    fn check(&self, ip: IpAddr) -> bool;
    /// Record an authentication failure or abuse attempt from `ip`.
    fn register(&self, ip: IpAddr);
}

#[derive(Clone, Copy, Debug)]
struct Strikes {
    count: u32,
    expires: Instant,
}

/// In-memory `PeerFilter`.
///
/// A peer is refused once it has accumulated `spam_check_count` strikes.
/// Each strike pushes the expiry of the whole record out by `ban_secs`.
/// Nothing is persisted.
pub struct AuthFilter {
    max_strikes: u32,
    ban: Duration,
    table: Mutex<HashMap<IpAddr, Strikes>>,
}

impl AuthFilter {
    pub fn new(config: &FilterConfig) -> Self {
        AuthFilter {
            max_strikes: config.spam_check_count.max(1),
            ban: Duration::from_secs(config.ban_secs),
            table: Mutex::new(HashMap::new()),
        }
    }

    fn check_at(&self, ip: IpAddr, now: Instant) -> bool {
        let mut table = self.table.lock().unwrap_or_else(|p| p.into_inner());
        match table.get(&ip).copied() {
            None => true,
            Some(strikes) if strikes.expires <= now => {
                table.remove(&ip);
                true
            }
            Some(strikes) => strikes.count < self.max_strikes,
        }
    }

    fn register_at(&self, ip: IpAddr, now: Instant) {
        let mut table = self.table.lock().unwrap_or_else(|p| p.into_inner());
        // Drop anything stale while we hold the lock anyway
        table.retain(|_, s| s.expires > now);

        let strikes = table.entry(ip).or_insert(Strikes {
            count: 0,
            expires: now,
        });
        strikes.count += 1;
        strikes.expires = now + self.ban;

        if strikes.count == self.max_strikes {
            warn!("Banning {} after {} strikes", ip, strikes.count);
        } else {
            info!("Strike {} against {}", strikes.count, ip);
        }
    }

    pub fn len(&self) -> usize {
        self.table.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

impl PeerFilter for AuthFilter {
    fn check(&self, ip: IpAddr) -> bool {
        self.check_at(ip, Instant::now())
    }

    fn register(&self, ip: IpAddr) {
        self.register_at(ip, Instant::now())
    }
}
