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

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::info;
use nix::sys::signal;

use crate::pop3;
use crate::server::context::Context;
use crate::server::lifecycle::{CacheService, Lifecycle, ListenerService};
use crate::server::listener::Protocol;
use crate::smtp;
use crate::tasks::FetchScheduler;

static TERMINATE: AtomicBool = AtomicBool::new(false);

extern "C" fn on_terminate(_: nix::libc::c_int) {
    TERMINATE.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() {
    let action = signal::SigAction::new(
        signal::SigHandler::Handler(on_terminate),
        signal::SaFlags::empty(),
        signal::SigSet::empty(),
    );
    for &sig in &[signal::Signal::SIGINT, signal::Signal::SIGTERM] {
        // Safe since the handler only touches an atomic
        if let Err(e) = unsafe { signal::sigaction(sig, &action) } {
            fatal!(EX_OSERR, "Failed to install {:?} handler: {}", sig, e);
        }
    }

    // Peers hanging up mid-write must not kill the process
    if let Err(e) = unsafe {
        signal::signal(signal::Signal::SIGPIPE, signal::SigHandler::SigIgn)
    } {
        fatal!(EX_OSERR, "Failed to ignore SIGPIPE: {}", e);
    }
}

pub fn serve(ctx: Arc<Context>) {
    install_signal_handlers();

    let mut lifecycle = Lifecycle::new();
    lifecycle.add(CacheService::new(&ctx, Duration::from_secs(60)));
    if ctx.config.pop3.enabled {
        lifecycle.add(ListenerService::new(
            Arc::clone(&ctx),
            Protocol::Pop3,
            ctx.config.pop3.listen.clone(),
            pop3::server::run,
        ));
    }
    if ctx.config.smtp.enabled {
        lifecycle.add(ListenerService::new(
            Arc::clone(&ctx),
            Protocol::Smtp,
            ctx.config.smtp.listen.clone(),
            smtp::server::run,
        ));
    }
    lifecycle.add(FetchScheduler::new(Arc::clone(&ctx)));

    if let Err(e) = lifecycle.start_all() {
        fatal!(EX_UNAVAILABLE, "Failed to start: {}", e);
    }
    info!("{} {} started", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    while !TERMINATE.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(250));
    }

    info!(
        "Shutting down with {} sessions active",
        ctx.sessions.count()
    );
    ctx.cancel.cancel();
    lifecycle.stop_all();
    info!("Shutdown complete");
}
