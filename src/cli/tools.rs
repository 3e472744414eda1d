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

use crate::mailbox::cache::{Opener, OpenerKind, Reopened};
use crate::server::context::Context;
use crate::tasks::fetch::Fetcher;
use crate::tasks::relay::Relayer;

pub fn scan(ctx: &Context, email: &str) {
    let opener = Opener::new(OpenerKind::Cli);
    let store = match ctx.cache.reopen(opener, email) {
        Ok(Reopened::Fresh(store)) => store,
        Ok(Reopened::Shared(_)) => {
            ctx.cache.close(opener, Some(email));
            die!(EX_TEMPFAIL, "{} is in use; try again later", email)
        }
        Err(e) => die!(EX_IOERR, "Failed to scan {}: {}", email, e),
    };

    let (count, total_size) = (store.count(), store.total_size());
    let saved = store.save();
    ctx.cache.close(opener, Some(email));

    if let Err(e) = saved {
        die!(EX_IOERR, "Failed to save index of {}: {}", email, e);
    }
    println!("{}: {} messages, {} bytes", email, count, total_size);
}

pub fn fetch(ctx: &Context) {
    let report = match Fetcher::new(ctx).run(&ctx.cancel) {
        Some(report) => report,
        None => die!(EX_TEMPFAIL, "A fetch cycle is already running"),
    };

    println!(
        "Fetched {} messages for {} accounts",
        report.messages, report.accounts
    );
    if report.failed > 0 {
        die!(EX_TEMPFAIL, "{} accounts failed", report.failed);
    }
}

pub fn relay(ctx: &Context) {
    let report = match Relayer::new(ctx).run(&ctx.cancel) {
        Some(report) => report,
        None => die!(EX_TEMPFAIL, "A relay cycle is already running"),
    };

    println!("Sent {} messages, {} bounced", report.sent, report.bounced);
    if report.failed > 0 {
        die!(EX_TEMPFAIL, "{} accounts failed", report.failed);
    }
}
