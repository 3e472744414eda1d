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

use std::path::{Path, PathBuf};
use std::sync::Arc;

use structopt::StructOpt;

use crate::server::context::Context;
use crate::support::diagnostic;
use crate::support::system_config::SystemConfig;

#[derive(StructOpt)]
#[structopt(max_term_width = 80)]
enum Command {
    /// Run the POP3 and SMTP servers and the fetch scheduler until
    /// terminated.
    ///
    /// SIGINT or SIGTERM stops the listeners, lets running sessions wind
    /// down, and persists every open mailbox before exiting.
    Serve(CommonOptions),
    /// Rebuild the index of one mailbox from the files on disk.
    ///
    /// This also recovers messages that were removed from the index by a
    /// POP3 session without being purged.
    Scan(ScanSubcommand),
    /// Run one fetch cycle against every account's POP3 server.
    Fetch(CommonOptions),
    /// Run one relay cycle, sending everything queued in `Out` folders.
    Relay(CommonOptions),
}

#[derive(StructOpt, Default)]
pub(super) struct CommonOptions {
    /// The directory containing `mailgate.toml` etc
    /// [default: /etc/mailgate or /usr/local/etc/mailgate]
    #[structopt(long, parse(from_os_str))]
    root: Option<PathBuf>,
}

#[derive(StructOpt)]
pub(super) struct ScanSubcommand {
    #[structopt(flatten)]
    common: CommonOptions,

    /// The email address of the mailbox to rescan.
    pub(super) email: String,
}

impl Command {
    fn common_options(&mut self) -> CommonOptions {
        match *self {
            Command::Serve(ref mut c)
            | Command::Fetch(ref mut c)
            | Command::Relay(ref mut c) => std::mem::take(c),
            Command::Scan(ref mut c) => std::mem::take(&mut c.common),
        }
    }
}

pub fn main() {
    // Clap exits with status 1 instead of EX_USAGE if we use the more concise
    // API
    let mut cmd = Command::from_clap(&match Command::clap().get_matches_safe()
    {
        Ok(matches) => matches,
        Err(
            e @ clap::Error {
                kind: clap::ErrorKind::HelpDisplayed,
                ..
            },
        )
        | Err(
            e @ clap::Error {
                kind: clap::ErrorKind::VersionDisplayed,
                ..
            },
        ) => {
            println!("{}", e.message);
            return;
        }
        Err(e) => die!(EX_USAGE, "{}", e.message),
    });

    let common = cmd.common_options();
    let root = common.root.unwrap_or_else(|| {
        if Path::new("/etc/mailgate/mailgate.toml").is_file() {
            "/etc/mailgate".to_owned().into()
        } else if Path::new("/usr/local/etc/mailgate/mailgate.toml").is_file()
        {
            "/usr/local/etc/mailgate".to_owned().into()
        } else {
            die!(
                EX_CONFIG,
                "Neither /etc/mailgate nor /usr/local/etc/mailgate looks like\n\
                 the Mailgate root; use --root=/path/to/mailgate if your\n\
                 installation is elsewhere."
            )
        }
    });

    init_logging(&root);

    if let Command::Serve(..) = cmd {
        let config = match SystemConfig::load(&root) {
            Ok(config) => config,
            Err(e) => fatal!(EX_CONFIG, "Error in mailgate.toml: {}", e),
        };
        if let Err(exit) =
            diagnostic::apply_diagnostics(&root, &config.diagnostic)
        {
            exit.exit();
        }
    }

    let ctx = match Context::load(&root) {
        Ok(ctx) => Arc::new(ctx),
        Err(e) => fatal!(
            EX_CONFIG,
            "Unable to load configuration from '{}': {}",
            root.display(),
            e
        ),
    };

    match cmd {
        Command::Serve(_) => super::serve::serve(ctx),
        Command::Scan(cmd) => super::tools::scan(&ctx, &cmd.email),
        Command::Fetch(_) => super::tools::fetch(&ctx),
        Command::Relay(_) => super::tools::relay(&ctx),
    }
}

fn init_logging(root: &Path) {
    if Ok(true) == nix::unistd::isatty(2) {
        // Running interactively; ignore logging configuration and just write
        // to stderr.
        crate::init_simple_log();
        return;
    }

    let log_config_file = root.join("logging.toml");
    if log_config_file.is_file() {
        if let Err(e) = log4rs::init_file(
            &log_config_file,
            log4rs::file::Deserializers::new(),
        ) {
            die!(
                EX_CONFIG,
                "Failed to initialise logging from '{}': {}",
                log_config_file.display(),
                e
            );
        }
    } else {
        let formatter = syslog::Formatter3164 {
            facility: syslog::Facility::LOG_MAIL,
            hostname: None,
            process: env!("CARGO_PKG_NAME").to_owned(),
            pid: nix::unistd::getpid().as_raw(),
        };

        let logger = match syslog::unix(formatter) {
            Ok(logger) => logger,
            Err(e) => die!(EX_OSERR, "Failed to connect to syslog: {}", e),
        };
        if let Err(e) =
            log::set_boxed_logger(Box::new(syslog::BasicLogger::new(logger)))
                .map(|_| log::set_max_level(log::LevelFilter::Info))
        {
            die!(EX_SOFTWARE, "Failed to initialise logging: {}", e);
        }
    }
}
