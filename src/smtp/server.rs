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

use std::borrow::Cow;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::str;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};

use super::codes::*;
use super::delivery::Deliverer;
use super::syntax::*;
use crate::credentials::{Credentials, PendingCheck};
use crate::mailbox::cache::{Opener, OpenerKind};
use crate::server::context::Context;
use crate::support::dot_stuffing::read_dot_stuffed;
use crate::support::error::{summarise, Error};
use crate::support::log_prefix::LogPrefix;
use crate::support::server_io::{ServerIo, SessionIo};

const MAX_LINE: u64 = 1024;
/// Commands a client may issue in a row without advancing a mail
/// transaction.
const MAX_INEFFECTIVE_COMMANDS: u32 = 30;

static EXTENSIONS: &[&str] = &[
    "8BITMIME",
    "STARTTLS",
    "SMTPUTF8",
    "AUTH LOGIN PLAIN CRAM-MD5",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseKind {
    /// The last in a series of responses.
    ///
    /// Indicates no continuation and forces a flush.
    Final,
    /// A non-final response that is safe to buffer.
    Delayable,
}

impl ResponseKind {
    fn or_final(self, phinal: bool) -> Self {
        if phinal {
            Final
        } else {
            self
        }
    }

    fn indicator(self) -> char {
        match self {
            Final => ' ',
            Delayable => '-',
        }
    }
}

use self::ResponseKind::*;

macro_rules! require {
    ($this:expr, $($fn:ident = $arg:expr),*) => {
        $(if let Some(r) = $this.$fn($arg) { return r; })*
    }
}

/// Run an SMTP session over `io` until the client quits or goes away.
pub fn run(
    ctx: Arc<Context>,
    io: ServerIo,
    log_prefix: LogPrefix,
) -> Result<(), Error> {
    Server::new(ctx, io, log_prefix).run()
}

pub struct Server {
    ctx: Arc<Context>,
    io: SessionIo,
    reader: BufReader<SessionIo>,
    writer: BufWriter<SessionIo>,
    log_prefix: LogPrefix,
    creds: Credentials,

    ineffective_commands: u32,
    quit: bool,
    has_helo: bool,
    has_mail_from: bool,
}

impl Server {
    pub fn new(ctx: Arc<Context>, io: ServerIo, log_prefix: LogPrefix) -> Self {
        let io = SessionIo::new(io);
        Server {
            reader: BufReader::new(io.clone()),
            writer: BufWriter::new(io.clone()),
            io,
            creds: Credentials::new(
                Arc::clone(&ctx.accounts),
                log_prefix.clone(),
            ),
            log_prefix,
            ctx,
            ineffective_commands: 0,
            quit: false,
            has_helo: false,
            has_mail_from: false,
        }
    }

    pub fn run(&mut self) -> Result<(), Error> {
        self.io.set_idle_timeout(Duration::from_secs(
            self.ctx.config.smtp.idle_timeout_secs,
        ))?;
        self.send_greeting()?;

        let mut buffer = Vec::new();
        while !self.quit {
            self.ctx.cancel.check()?;
            if let Err(e) = self.run_command(&mut buffer) {
                if let Some(check) = self.creds.pending() {
                    warn!(
                        "{} {:?} exchange abandoned",
                        self.log_prefix, check
                    );
                    self.strike();
                    self.creds.clear_credentials();
                }
                if e.is_idle_timeout() {
                    info!("{} Idle timeout", self.log_prefix);
                    let _ = self.send_response(
                        Final,
                        pc::ServiceNotAvailableClosing,
                        Cow::Borrowed("Idle timeout, closing connection"),
                    );
                }
                return Err(e);
            }
        }

        Ok(())
    }

    fn run_command(&mut self, buffer: &mut Vec<u8>) -> Result<(), Error> {
        buffer.clear();
        (&mut self.reader).take(MAX_LINE).read_until(b'\n', buffer)?;
        if buffer.is_empty() {
            info!("{} EOF before QUIT", self.log_prefix);
            self.quit = true;
            return Ok(());
        }

        if !buffer.ends_with(b"\n") {
            if buffer.len() as u64 >= MAX_LINE {
                self.send_response(
                    Final,
                    pc::CommandSyntaxError,
                    Cow::Borrowed("Command line too long"),
                )?;

                // Skip the rest of the line
                let mut discard = Vec::new();
                self.reader.read_until(b'\n', &mut discard)?;
                return Ok(());
            } else {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "EOF reached within command",
                )));
            }
        }

        self.ineffective_commands += 1;
        if self.ineffective_commands > MAX_INEFFECTIVE_COMMANDS {
            warn!(
                "{} Terminating connection after too many non-mail commands",
                self.log_prefix,
            );
            return self.send_response(
                Final,
                pc::ServiceClosing,
                Cow::Borrowed("Too many commands issued without sending mail"),
            );
        }

        while buffer.ends_with(b"\n") || buffer.ends_with(b"\r") {
            buffer.pop();
        }

        if buffer.contains(&0) {
            warn!(
                "{} Remote is speaking binary, closing connection",
                self.log_prefix,
            );
            self.quit = true;
            return Ok(());
        }

        let command_line = match str::from_utf8(buffer) {
            Ok(s) => s,
            Err(_) => {
                warn!("{} Non-UTF-8 command received", self.log_prefix);
                return self.send_response(
                    Final,
                    pc::CommandSyntaxError,
                    Cow::Borrowed("Malformed UTF-8"),
                );
            }
        };

        let command = match command_line.parse::<Command>() {
            Ok(c) => c,
            Err(()) => {
                warn!(
                    "{} Received bad command {:?}",
                    self.log_prefix,
                    summarise(&command_line, 64)
                );

                return if looks_like_known_command(command_line) {
                    self.send_response(
                        Final,
                        pc::ParameterSyntaxError,
                        Cow::Borrowed("Unknown command syntax"),
                    )
                } else {
                    self.send_response(
                        Final,
                        pc::CommandSyntaxError,
                        Cow::Borrowed("Unrecognised command"),
                    )
                };
            }
        };

        match command {
            Command::Helo(command, origin) => self.cmd_helo(command, origin),
            Command::Auth(mechanism, data) => self.cmd_auth(mechanism, data),
            Command::MailFrom(email, size, warnings) => {
                for warning in warnings {
                    warn!("{} {}", self.log_prefix, warning);
                }
                self.cmd_mail_from(email, size)
            }
            Command::Recipient(email, warnings) => {
                for warning in warnings {
                    warn!("{} {}", self.log_prefix, warning);
                }
                self.cmd_recipient(email)
            }
            Command::Data => self.cmd_data(),
            Command::Reset => self.cmd_reset(),
            Command::Verify => self.cmd_verify(),
            Command::Help => self.cmd_help(),
            Command::Noop => self.cmd_noop(),
            Command::Quit => self.cmd_quit(),
            Command::StartTls => self.cmd_start_tls(),
            Command::Http => {
                warn!(
                    "{} Remote is speaking HTTP, closing connection",
                    self.log_prefix
                );
                self.quit = true;
                Ok(())
            }
        }
    }

    fn cmd_helo(
        &mut self,
        command: String,
        origin: String,
    ) -> Result<(), Error> {
        let extended = "EHLO" == command;
        self.log_prefix.set_helo(origin.clone());
        info!("{} SMTP {}", self.log_prefix, command);

        // A new greeting aborts any transaction in progress
        self.reset_transaction();

        self.send_response(
            Delayable.or_final(!extended),
            pc::Ok,
            Cow::Owned(format!("{} Hello {}", self.ctx.host_name, origin)),
        )?;
        self.has_helo = true;

        if extended {
            let tls_available =
                self.ctx.ssl_acceptor.is_some() && !self.io.is_ssl();
            for (ix, &ext) in EXTENSIONS.iter().enumerate() {
                if "STARTTLS" == ext && !tls_available {
                    continue;
                }

                self.send_response(
                    Delayable.or_final(ix + 1 == EXTENSIONS.len()),
                    pc::Ok,
                    Cow::Borrowed(ext),
                )?;
            }
        }

        Ok(())
    }

    fn cmd_auth(
        &mut self,
        mechanism: String,
        data: Option<String>,
    ) -> Result<(), Error> {
        require!(self, need_mail_from = false);

        if self.creds.is_authorized() {
            return self.send_response(
                Final,
                pc::BadSequenceOfCommands,
                Cow::Borrowed("Already authenticated"),
            );
        }

        let ok = match &mechanism[..] {
            "PLAIN" => {
                self.creds.toggle_pending(PendingCheck::AuthPlain);
                let response = match data {
                    Some(data) if "=" != data => Some(data),
                    _ => self.challenge("")?,
                };
                self.creds.toggle_pending(PendingCheck::AuthPlain);
                match response {
                    Some(r) => self.creds.auth_plain(&r),
                    None => return self.auth_cancelled(),
                }
            }

            "LOGIN" => {
                self.creds.toggle_pending(PendingCheck::AuthLogin);
                let result = self.auth_login_exchange(data)?;
                self.creds.toggle_pending(PendingCheck::AuthLogin);
                match result {
                    Some(ok) => ok,
                    None => return self.auth_cancelled(),
                }
            }

            "CRAM-MD5" => {
                self.creds.toggle_pending(PendingCheck::CramMd5);
                let challenge =
                    self.creds.new_cram_challenge(&self.ctx.host_name);
                let response = self.challenge(&challenge)?;
                self.creds.toggle_pending(PendingCheck::CramMd5);
                match response {
                    Some(r) => self.creds.auth_cram_md5(&r),
                    None => return self.auth_cancelled(),
                }
            }

            _ => {
                warn!(
                    "{} Rejected attempt to auth with method {:?}",
                    self.log_prefix,
                    summarise(&mechanism, 64)
                );
                return self.send_response(
                    Final,
                    pc::CommandParameterNotImplemented,
                    Cow::Borrowed("Unsupported AUTH mechanism"),
                );
            }
        };

        if ok && self.creds.is_authorized() {
            info!("{} Authenticated with {}", self.log_prefix, mechanism);
            self.send_response(
                Final,
                pc::AuthenticationSucceeded,
                Cow::Borrowed("Authentication successful"),
            )
        } else {
            self.strike();
            self.creds.clear_credentials();
            self.log_prefix.clear_user();
            self.quit = true;
            self.send_response(
                Final,
                pc::AuthenticationCredentialsInvalid,
                Cow::Borrowed("Authentication credentials invalid"),
            )
        }
    }

    fn auth_login_exchange(
        &mut self,
        initial: Option<String>,
    ) -> Result<Option<bool>, Error> {
        let user = match initial {
            Some(u) => u,
            None => match self.challenge("VXNlcm5hbWU6")? {
                Some(u) => u,
                None => return Ok(None),
            },
        };
        let user_ok = self.creds.auth_login_user(&user);

        let password = match self.challenge("UGFzc3dvcmQ6")? {
            Some(p) => p,
            None => return Ok(None),
        };
        Ok(Some(user_ok && self.creds.auth_login_password(&password)))
    }

    /// Send a 334 continuation and read the client's answer.
    ///
    /// Returns `None` if the client cancelled with `*`.
    fn challenge(&mut self, prompt: &str) -> Result<Option<String>, Error> {
        self.send_response(
            Final,
            pc::ServerChallenge,
            Cow::Owned(prompt.to_owned()),
        )?;

        let mut buffer = Vec::new();
        (&mut self.reader).take(MAX_LINE).read_until(b'\n', &mut buffer)?;
        if !buffer.ends_with(b"\n") {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "EOF or overlong line in authentication exchange",
            )));
        }

        while buffer.ends_with(b"\n") || buffer.ends_with(b"\r") {
            buffer.pop();
        }

        let line = String::from_utf8_lossy(&buffer).into_owned();
        if "*" == line {
            Ok(None)
        } else {
            Ok(Some(line))
        }
    }

    fn auth_cancelled(&mut self) -> Result<(), Error> {
        self.creds.clear_credentials();
        self.send_response(
            Final,
            pc::ParameterSyntaxError,
            Cow::Borrowed("SASL aborted"),
        )
    }

    fn cmd_mail_from(
        &mut self,
        from: String,
        approx_size: Option<u64>,
    ) -> Result<(), Error> {
        require!(self, need_helo = true, need_mail_from = false);

        let authorized = self.creds.is_authorized();
        if !authorized && !self.ctx.config.smtp.delivery_local {
            return self.send_response(
                Final,
                pc::AuthenticationRequired,
                Cow::Borrowed("Authentication required"),
            );
        }

        if authorized && self.ctx.config.smtp.check_from {
            let matches = self
                .creds
                .account()
                .map_or(false, |a| a.email.eq_ignore_ascii_case(&from));
            if !matches {
                warn!(
                    "{} Sender {:?} does not match the authenticated account",
                    self.log_prefix,
                    summarise(&from, 64)
                );
                return self.send_response(
                    Final,
                    pc::SenderMismatch,
                    Cow::Borrowed(
                        "sender address does not match authenticated account",
                    ),
                );
            }
        }

        let max_size = self.ctx.config.smtp.max_message_size;
        if approx_size.unwrap_or(0) > max_size {
            return self.send_response(
                Final,
                pc::ExceededStorageAllocation,
                Cow::Owned(format!(
                    "Maximum message size is {} bytes",
                    max_size
                )),
            );
        }

        info!("{} Start mail transaction", self.log_prefix);
        self.creds.from = Some(from);
        self.ineffective_commands = 0;
        self.has_mail_from = true;
        self.send_ok()
    }

    fn cmd_recipient(&mut self, to: String) -> Result<(), Error> {
        require!(self, need_mail_from = true);

        if !self.creds.is_authorized()
            && !self.creds.check_to_local_delivery(&to)
        {
            warn!(
                "{} Refused unauthenticated relay to {:?}",
                self.log_prefix,
                summarise(&to, 64)
            );
            self.strike();
            self.quit = true;
            return self.send_response(
                Final,
                pc::ActionNotTakenPermanent,
                Cow::Borrowed("not available requestted mailbox"),
            );
        }

        if !self.creds.to.iter().any(|t| t.eq_ignore_ascii_case(&to)) {
            self.creds.to.push(to);
        }
        self.ineffective_commands = 0;
        self.send_ok()
    }

    fn cmd_data(&mut self) -> Result<(), Error> {
        require!(self, need_mail_from = true, need_recipients = true);

        self.send_response(
            Final,
            pc::StartMailInput,
            Cow::Borrowed("Start mail input; end with <CRLF>.<CRLF>"),
        )?;

        let limit = self.ctx.config.smtp.max_message_size;
        let mut data = Vec::new();
        let unstuffed = read_dot_stuffed(&mut data, &mut self.reader, limit)?;
        self.ineffective_commands = 0;

        if unstuffed.truncated {
            warn!(
                "{} Rejected message larger than {} bytes",
                self.log_prefix, limit
            );
            self.reset_transaction();
            return self.send_response(
                Final,
                pc::ExceededStorageAllocation,
                Cow::Owned(format!("Maximum message size is {} bytes", limit)),
            );
        }

        let deliverer = Deliverer {
            cache: &self.ctx.cache,
            crypto: &*self.ctx.crypto,
            opener: Opener::new(OpenerKind::Smtp),
            log_prefix: &self.log_prefix,
        };
        let result = deliverer.deliver(&self.creds, &data, false);
        self.reset_transaction();

        match result {
            Ok(delivered) => {
                info!(
                    "{} Accepted {} bytes: {} local, {} queued, {} errors",
                    self.log_prefix,
                    unstuffed.size,
                    delivered.local,
                    delivered.queued,
                    delivered.errors
                );
                self.send_response(
                    Final,
                    pc::Ok,
                    Cow::Owned(format!("OK {} bytes accepted", unstuffed.size)),
                )
            }
            Err(Error::NoRoute) => self.send_response(
                Final,
                pc::TransactionFailed,
                Cow::Borrowed("No valid recipients"),
            ),
            Err(e) => {
                error!("{} Delivery failed: {}", self.log_prefix, e);
                self.send_response(
                    Final,
                    pc::ActionAborted,
                    Cow::Borrowed("Requested action aborted: local error"),
                )
            }
        }
    }

    fn cmd_reset(&mut self) -> Result<(), Error> {
        self.reset_transaction();
        self.send_ok()
    }

    fn cmd_verify(&mut self) -> Result<(), Error> {
        info!("{} Rejected attempt to use VRFY", self.log_prefix);
        self.send_response(
            Final,
            pc::CannotVerify,
            Cow::Borrowed("Cannot VRFY user"),
        )
    }

    fn cmd_help(&mut self) -> Result<(), Error> {
        self.send_response(
            Delayable,
            pc::HelpMessage,
            Cow::Borrowed("Commands: HELO EHLO AUTH MAIL RCPT DATA"),
        )?;
        self.send_response(
            Delayable,
            pc::HelpMessage,
            Cow::Borrowed("Commands: RSET VRFY NOOP HELP STARTTLS QUIT"),
        )?;
        self.send_response(
            Final,
            pc::HelpMessage,
            Cow::Borrowed("End of HELP"),
        )
    }

    fn cmd_noop(&mut self) -> Result<(), Error> {
        self.send_ok()
    }

    fn cmd_quit(&mut self) -> Result<(), Error> {
        let _ = self.send_response(
            Final,
            pc::ServiceClosing,
            Cow::Owned(format!("{} closing connection", self.ctx.host_name)),
        );
        self.quit = true;
        Ok(())
    }

    fn cmd_start_tls(&mut self) -> Result<(), Error> {
        if self.io.is_ssl() {
            return self.send_response(
                Final,
                pc::BadSequenceOfCommands,
                Cow::Borrowed("Already using TLS"),
            );
        }
        require!(self, need_mail_from = false);

        let acceptor = match self.ctx.ssl_acceptor {
            Some(ref acceptor) => Arc::clone(acceptor),
            None => {
                return self.send_response(
                    Final,
                    pc::TlsNotAvailable,
                    Cow::Borrowed("TLS not available"),
                )
            }
        };

        if !self.reader.buffer().is_empty() {
            warn!("{} Pipelined data after STARTTLS", self.log_prefix);
            self.quit = true;
            return self.send_response(
                Final,
                pc::ServiceNotAvailableClosing,
                Cow::Borrowed("Pipelining not allowed with STARTTLS"),
            );
        }

        self.send_response(
            Final,
            pc::ServiceReady,
            Cow::Borrowed("Ready to start TLS"),
        )?;

        info!("{} Start TLS handshake", self.log_prefix);
        self.io.ssl_accept(&acceptor)?;
        info!(
            "{} TLS established: {}",
            self.log_prefix,
            self.io.ssl_string().unwrap_or_default()
        );

        // Nothing learnt before the handshake may be trusted
        self.has_helo = false;
        self.creds.clear_credentials();
        self.reset_transaction();
        Ok(())
    }

    fn need_helo(&mut self, present: bool) -> Option<Result<(), Error>> {
        self.check_need(
            self.has_helo,
            present,
            "Already got HELO",
            "Still waiting for HELO",
        )
    }

    fn need_mail_from(&mut self, present: bool) -> Option<Result<(), Error>> {
        self.check_need(
            self.has_mail_from,
            present,
            "Already got MAIL FROM",
            "Still waiting for MAIL FROM",
        )
    }

    fn need_recipients(&mut self, present: bool) -> Option<Result<(), Error>> {
        self.check_need(
            !self.creds.to.is_empty(),
            present,
            "Already have recipients",
            "No recipients",
        )
    }

    fn check_need(
        &mut self,
        current_status: bool,
        desired_status: bool,
        message_if_already_present: &'static str,
        message_if_missing: &'static str,
    ) -> Option<Result<(), Error>> {
        if current_status != desired_status {
            Some(self.send_response(
                Final,
                pc::BadSequenceOfCommands,
                Cow::Borrowed(if current_status {
                    message_if_already_present
                } else {
                    message_if_missing
                }),
            ))
        } else {
            None
        }
    }

    fn reset_transaction(&mut self) {
        self.has_mail_from = false;
        self.creds.clear_envelope();
    }

    /// Record an abuse attempt against the peer.
    fn strike(&self) {
        if let Some(ip) = self.io.peer_ip() {
            self.ctx.filter.register(ip);
        }
    }

    fn send_greeting(&mut self) -> Result<(), Error> {
        let greeting = format!(
            "{} {} {} {} ready",
            self.ctx.host_name,
            if self.io.is_ssl() { "ESMTPS" } else { "ESMTP" },
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
        );
        self.send_response(Final, pc::ServiceReady, Cow::Owned(greeting))
    }

    fn send_ok(&mut self) -> Result<(), Error> {
        self.send_response(Final, pc::Ok, Cow::Borrowed("OK"))
    }

    fn send_response(
        &mut self,
        kind: ResponseKind,
        primary_code: PrimaryCode,
        quip: Cow<'_, str>,
    ) -> Result<(), Error> {
        if primary_code.closes() {
            self.quit = true;
        }

        if quip.is_empty() {
            write!(
                self.writer,
                "{}{}\r\n",
                primary_code as u16,
                kind.indicator()
            )?;
        } else {
            write!(
                self.writer,
                "{}{}{}\r\n",
                primary_code as u16,
                kind.indicator(),
                quip
            )?;
        }
        if Final == kind {
            self.writer.flush()?;
        }

        Ok(())
    }
}
