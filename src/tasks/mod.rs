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

//! Background work against the remote mail servers: fetching new mail and
//! relaying queued mail.

pub mod fetch;
pub mod relay;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{error, info};

use self::fetch::Fetcher;
use self::relay::Relayer;
use crate::server::context::Context;
use crate::server::lifecycle::{self, Service};
use crate::support::cancel::CancelToken;
use crate::support::error::Error;

/// Ensures only one cycle of a kind runs at a time.
#[derive(Debug, Default)]
pub struct Running(AtomicBool);

/// Releases its `Running` on drop.
#[derive(Debug)]
pub struct RunningGuard<'a>(&'a AtomicBool);

impl Running {
    /// Claim the flag, or return `None` if a cycle is already running.
    pub fn try_start(&self) -> Option<RunningGuard<'_>> {
        if self
            .0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            Some(RunningGuard(&self.0))
        } else {
            None
        }
    }

    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Runs a fetch cycle followed by a relay cycle every `[fetch]
/// interval_secs`.
pub struct FetchScheduler {
    ctx: Arc<Context>,
    cancel: Option<CancelToken>,
    handle: Option<JoinHandle<()>>,
}

impl FetchScheduler {
    pub fn new(ctx: Arc<Context>) -> Self {
        FetchScheduler {
            ctx,
            cancel: None,
            handle: None,
        }
    }
}

/// One fetch cycle and one relay cycle with everything in `ctx`.
pub fn run_cycles(ctx: &Context, cancel: &CancelToken) {
    if let Some(report) = Fetcher::new(ctx).run(cancel) {
        info!(
            "Fetched {} messages for {} accounts, {} failed",
            report.messages, report.accounts, report.failed
        );
    }
    if let Some(report) = Relayer::new(ctx).run(cancel) {
        info!(
            "Relayed {} messages, {} bounced, {} accounts failed",
            report.sent, report.bounced, report.failed
        );
    }
}

impl Service for FetchScheduler {
    fn name(&self) -> &str {
        "fetch scheduler"
    }

    fn start(&mut self) -> Result<(), Error> {
        if !self.ctx.config.fetch.enabled {
            info!("Periodic fetching is disabled");
            return Ok(());
        }

        let cancel = self.ctx.cancel.child();
        let interval =
            Duration::from_secs(self.ctx.config.fetch.interval_secs.max(1));
        let ctx = Arc::clone(&self.ctx);
        let thread_cancel = cancel.clone();
        self.handle = Some(
            thread::Builder::new()
                .name("fetch".to_owned())
                .spawn(move || {
                    while !thread_cancel.is_cancelled() {
                        run_cycles(&ctx, &thread_cancel);
                        if thread_cancel.sleep(interval).is_err() {
                            break;
                        }
                    }
                })
                .map_err(|e| {
                    error!("Failed to spawn fetch thread: {}", e);
                    Error::Io(e)
                })?,
        );
        self.cancel = Some(cancel);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        let handle = self.handle.take();
        lifecycle::join(self.name(), handle);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn running_is_exclusive() {
        let running = Running::default();
        let guard = running.try_start().unwrap();
        assert!(running.is_running());
        assert!(running.try_start().is_none());
        drop(guard);
        assert!(!running.is_running());
        assert!(running.try_start().is_some());
    }
}
