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

#[cfg(test)]
macro_rules! assert_matches {
    ($expected:pat, $actual:expr) => {
        match $actual {
            $expected => (),
            unexpected => panic!(
                "Expected {} matches {}, got {:?}",
                stringify!($expected),
                stringify!($actual),
                unexpected
            ),
        }
    };
}

mod account;
mod cli;
mod credentials;
mod crypt;
mod mailbox;
mod mime;
mod outbound;
mod pop3;
mod server;
mod smtp;
mod support;
mod tasks;

#[cfg(test)]
mod test_data;

fn main() {
    cli::main::main();
}

fn stderr_log_config(
    level: log::LevelFilter,
) -> Result<log4rs::config::Config, log4rs::config::Errors> {
    use log4rs::append::console::{ConsoleAppender, Target};
    use log4rs::config::{Appender, Config, Root};
    use log4rs::encode::pattern::PatternEncoder;

    let stderr = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new(
            "{d(%H:%M:%S%.3f)} [{l}][{t}] {m}{n}",
        )))
        .build();
    Config::builder()
        .appender(Appender::builder().build("stderr", Box::new(stderr)))
        .build(Root::builder().appender("stderr").build(level))
}

fn init_simple_log() {
    let installed = stderr_log_config(log::LevelFilter::Info)
        .map_err(|e| e.to_string())
        .and_then(|config| {
            log4rs::init_config(config).map_err(|e| e.to_string())
        });
    if let Err(e) = installed {
        eprintln!("Failed to initialise logging: {}", e);
        crate::support::sysexits::EX_SOFTWARE.exit();
    }
}

#[cfg(test)]
static INIT_TEST_LOG: std::sync::Once = std::sync::Once::new();

#[cfg(test)]
fn init_test_log() {
    INIT_TEST_LOG.call_once(|| {
        let config = stderr_log_config(log::LevelFilter::Debug).unwrap();
        log4rs::init_config(config).unwrap();
    })
}
