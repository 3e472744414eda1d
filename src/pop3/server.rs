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

use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, TryRecvError};
use log::{info, warn};
use rand::{rngs::OsRng, Rng};

use super::syntax::*;
use crate::credentials::{CredentialKind, Credentials, PendingCheck};
use crate::mailbox::cache::{Opener, OpenerKind};
use crate::mailbox::message_store::MessageStore;
use crate::mailbox::model::Message;
use crate::server::context::Context;
use crate::support::dot_stuffing::write_dot_stuffed;
use crate::support::error::{summarise, Error};
use crate::support::log_prefix::LogPrefix;
use crate::support::server_io::{ServerIo, SessionIo};
use crate::support::wait::BoundedWait;

const MAX_LINE: u64 = 1024;

static CAPABILITIES: &[&str] = &[
    "TOP",
    "USER",
    "UIDL",
    "APOP",
    "STLS",
    "STARTTLS",
    "SASL PLAIN LOGIN USER APOP",
    "EXPIRE 60",
    "LOGIN-DELAY 900",
];

static MECHANISMS: &[&str] = &["PLAIN", "LOGIN", "CRAM-MD5"];

static HELP: &[&str] = &[
    "USER name", "PASS password", "APOP name digest", "AUTH [mechanism]",
    "CAPA", "STAT", "LIST [msg]", "UIDL [msg]", "RETR msg", "TOP msg n",
    "DELE msg", "RSET", "NOOP", "STLS", "QUIT",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseKind {
    /// The last line of a response. Forces a flush.
    Final,
    /// A line of a multi-line response which is safe to buffer.
    Delayable,
}

use self::ResponseKind::*;

macro_rules! require {
    ($this:expr, $($fns:ident),*) => {
        $(if let Some(r) = $this.$fns() { return r; })*
    };
}

/// Run a POP3 session over `io` until the client quits or goes away.
pub fn run(
    ctx: Arc<Context>,
    io: ServerIo,
    log_prefix: LogPrefix,
) -> Result<(), Error> {
    Server::new(ctx, io, log_prefix).run()
}

struct Opening {
    rx: Receiver<Result<Arc<MessageStore>, Error>>,
    handle: JoinHandle<()>,
}

pub struct Server {
    ctx: Arc<Context>,
    io: SessionIo,
    reader: BufReader<SessionIo>,
    writer: BufWriter<SessionIo>,
    log_prefix: LogPrefix,
    creds: Credentials,
    opener: Opener,
    /// The APOP timestamp from the greeting.
    stamp: String,
    store: Option<Arc<MessageStore>>,
    opening: Option<Opening>,
    /// Ids soft-deleted by this session and not yet purged by QUIT.
    deleted: Vec<u32>,
    quit: bool,

    /// How long mailbox commands wait for the mailbox to finish opening.
    pub(super) storage_wait: BoundedWait,
    /// How long STAT waits for an in-flight mailbox mutation.
    pub(super) busy_wait: BoundedWait,
}

impl Server {
    pub fn new(ctx: Arc<Context>, io: ServerIo, log_prefix: LogPrefix) -> Self {
        let io = SessionIo::new(io);
        let stamp = format!(
            "<{}.{}@{}>",
            std::process::id(),
            OsRng.gen::<u32>(),
            ctx.host_name
        );

        Server {
            reader: BufReader::new(io.clone()),
            writer: BufWriter::new(io.clone()),
            io,
            creds: Credentials::new(
                Arc::clone(&ctx.accounts),
                log_prefix.clone(),
            ),
            log_prefix,
            opener: Opener::new(OpenerKind::Pop3),
            stamp,
            store: None,
            opening: None,
            deleted: Vec::new(),
            quit: false,
            storage_wait: BoundedWait::new(
                Duration::from_secs(6),
                Duration::from_millis(50),
            ),
            busy_wait: BoundedWait::new(
                Duration::from_secs(9),
                Duration::from_millis(50),
            ),
            ctx,
        }
    }

    pub fn run(&mut self) -> Result<(), Error> {
        self.io.set_idle_timeout(Duration::from_secs(
            self.ctx.config.pop3.idle_timeout_secs,
        ))?;

        let greeting =
            format!("+OK {} POP3 ready {}", self.ctx.host_name, self.stamp);
        self.send_response(Final, &greeting)?;

        while !self.quit {
            self.ctx.cancel.check()?;
            if let Err(e) = self.run_command() {
                self.check_abandoned_auth();
                if e.is_idle_timeout() {
                    info!("{} Idle timeout", self.log_prefix);
                    let _ = self.send_response(Final, "-ERR idle timeout");
                }
                return Err(e);
            }
        }

        Ok(())
    }

    fn run_command(&mut self) -> Result<(), Error> {
        let mut buffer = Vec::new();
        (&mut self.reader)
            .take(MAX_LINE)
            .read_until(b'\n', &mut buffer)?;

        if buffer.is_empty() {
            info!("{} EOF before QUIT", self.log_prefix);
            self.quit = true;
            return Ok(());
        }

        if !buffer.ends_with(b"\n") {
            // Skip the rest of the line
            let mut discard = Vec::new();
            self.reader.read_until(b'\n', &mut discard)?;
            warn!("{} Command line too long", self.log_prefix);
            return self.send_response(Final, "-ERR line too long");
        }

        while buffer.ends_with(b"\n") || buffer.ends_with(b"\r") {
            buffer.pop();
        }

        let line = match std::str::from_utf8(&buffer) {
            Ok(s) => s,
            Err(_) => {
                warn!("{} Non-UTF-8 command", self.log_prefix);
                return self.send_response(Final, "-ERR unknown command");
            }
        };

        let command = match line.parse::<Command>() {
            Ok(c) => c,
            Err(()) => {
                let known = looks_like_known_command(line);
                warn!(
                    "{} Bad command: {:?}",
                    self.log_prefix,
                    summarise(&line, 64)
                );
                return self.send_response(
                    Final,
                    if known {
                        "-ERR syntax error"
                    } else {
                        "-ERR unknown command"
                    },
                );
            }
        };

        match command {
            Command::User(name) => self.cmd_user(name),
            Command::Pass(password) => self.cmd_pass(password),
            Command::Apop(name, digest) => self.cmd_apop(name, digest),
            Command::Auth(mechanism, initial) => {
                self.cmd_auth(mechanism, initial)
            }
            Command::Capa => self.cmd_capa(),
            Command::Stat => self.with_store(Self::cmd_stat),
            Command::List(id) => {
                self.with_store(|this, store| this.cmd_list(store, id))
            }
            Command::Uidl(id) => {
                self.with_store(|this, store| this.cmd_uidl(store, id))
            }
            Command::Retr(id) => {
                self.with_store(|this, store| this.cmd_retr(store, id, None))
            }
            Command::Top(id, lines) => self.with_store(|this, store| {
                this.cmd_retr(store, id, Some(lines))
            }),
            Command::Dele(id) => {
                self.with_store(|this, store| this.cmd_dele(store, id))
            }
            Command::Rset => self.with_store(Self::cmd_rset),
            Command::Noop => self.cmd_noop(),
            Command::Help => self.cmd_help(),
            Command::Quit => self.cmd_quit(),
            Command::Stls => self.cmd_stls(),
        }
    }

    fn cmd_user(&mut self, name: String) -> Result<(), Error> {
        require!(self, need_logged_out);

        if self.creds.verify(CredentialKind::Login, &name) {
            self.send_response(Final, &format!("+OK {} is welcome", name))
        } else {
            self.auth_failed("USER", &name, true)
        }
    }

    fn cmd_pass(&mut self, password: String) -> Result<(), Error> {
        require!(self, need_logged_out);

        if !self.creds.is_login_verified() {
            return self.send_response(Final, "-ERR USER first");
        }

        if self.creds.verify(CredentialKind::Password, &password) {
            self.logged_in()
        } else {
            let login = self.current_login();
            self.auth_failed("PASS", &login, true)
        }
    }

    fn cmd_apop(&mut self, name: String, digest: String) -> Result<(), Error> {
        require!(self, need_logged_out);

        if self.creds.apop(&name, &digest, &self.stamp) {
            self.logged_in()
        } else {
            self.auth_failed("APOP", &name, true)
        }
    }

    fn cmd_auth(
        &mut self,
        mechanism: Option<String>,
        initial: Option<String>,
    ) -> Result<(), Error> {
        let mechanism = match mechanism {
            Some(m) => m,
            None => {
                self.send_response(Delayable, "+OK")?;
                for mechanism in MECHANISMS {
                    self.send_response(Delayable, mechanism)?;
                }
                return self.send_response(Final, ".");
            }
        };

        require!(self, need_logged_out);

        match &mechanism[..] {
            "PLAIN" => self.auth_plain(initial),
            "LOGIN" => self.auth_login(initial),
            "CRAM-MD5" => self.auth_cram_md5(),
            _ => self.send_response(Final, "-ERR unsupported mechanism"),
        }
    }

    fn auth_plain(&mut self, initial: Option<String>) -> Result<(), Error> {
        self.creds.toggle_pending(PendingCheck::AuthPlain);
        let response = match initial {
            Some(r) => Some(r),
            None => self.challenge("+ ")?,
        };
        self.creds.toggle_pending(PendingCheck::AuthPlain);

        let response = match response {
            Some(r) => r,
            None => return self.auth_cancelled(),
        };

        if self.creds.auth_plain(&response) {
            self.logged_in()
        } else {
            let login = self.current_login();
            self.auth_failed("PLAIN", &login, true)
        }
    }

    fn auth_login(&mut self, initial: Option<String>) -> Result<(), Error> {
        self.creds.toggle_pending(PendingCheck::AuthLogin);
        let result = self.auth_login_exchange(initial)?;
        self.creds.toggle_pending(PendingCheck::AuthLogin);

        match result {
            None => self.auth_cancelled(),
            Some(true) => self.logged_in(),
            Some(false) => {
                let login = self.current_login();
                self.auth_failed("LOGIN", &login, false)
            }
        }
    }

    fn auth_login_exchange(
        &mut self,
        initial: Option<String>,
    ) -> Result<Option<bool>, Error> {
        let user = match initial {
            Some(u) => u,
            None => match self.challenge("+ VXNlcm5hbWU6")? {
                Some(u) => u,
                None => return Ok(None),
            },
        };
        let user_ok = self.creds.auth_login_user(&user);

        // Always ask for the password so the exchange does not reveal
        // whether the user exists.
        let password = match self.challenge("+ UGFzc3dvcmQ6")? {
            Some(p) => p,
            None => return Ok(None),
        };
        Ok(Some(user_ok && self.creds.auth_login_password(&password)))
    }

    fn auth_cram_md5(&mut self) -> Result<(), Error> {
        self.creds.toggle_pending(PendingCheck::CramMd5);
        let challenge = self.creds.new_cram_challenge(&self.ctx.host_name);
        let response = self.challenge(&format!("+ {}", challenge))?;
        self.creds.toggle_pending(PendingCheck::CramMd5);

        match response {
            None => self.auth_cancelled(),
            Some(r) if self.creds.auth_cram_md5(&r) => self.logged_in(),
            Some(_) => {
                let login = self.current_login();
                self.auth_failed("CRAM-MD5", &login, false)
            }
        }
    }

    /// Send a SASL continuation and read the client's answer.
    ///
    /// Returns `None` if the client cancelled with `*` or went away.
    fn challenge(&mut self, prompt: &str) -> Result<Option<String>, Error> {
        self.send_response(Final, prompt)?;

        let mut line = String::new();
        (&mut self.reader).take(MAX_LINE).read_line(&mut line)?;
        if line.is_empty() {
            self.quit = true;
            return Ok(None);
        }

        let line = line.trim_end_matches(|c| '\r' == c || '\n' == c);
        if "*" == line {
            Ok(None)
        } else {
            Ok(Some(line.to_owned()))
        }
    }

    /// Count an exchange the client walked away from as a failed
    /// authentication.
    fn check_abandoned_auth(&mut self) {
        if let Some(check) = self.creds.pending() {
            warn!("{} {:?} exchange abandoned", self.log_prefix, check);
            if let Some(ip) = self.io.peer_ip() {
                self.ctx.filter.register(ip);
            }
            self.creds.clear_credentials();
        }
    }

    fn auth_cancelled(&mut self) -> Result<(), Error> {
        self.creds.clear_credentials();
        if self.quit {
            Ok(())
        } else {
            self.send_response(Final, "-ERR authentication cancelled")
        }
    }

    fn current_login(&self) -> String {
        self.creds
            .account()
            .map_or_else(|| "?".to_owned(), |a| a.login.clone())
    }

    /// Record a failed authentication against the peer and reply.
    ///
    /// If `hang_up`, the session ends after the reply.
    fn auth_failed(
        &mut self,
        mechanism: &str,
        login: &str,
        hang_up: bool,
    ) -> Result<(), Error> {
        warn!(
            "{} {} authentication failed for {:?}",
            self.log_prefix,
            mechanism,
            summarise(&login, 64)
        );
        if let Some(ip) = self.io.peer_ip() {
            self.ctx.filter.register(ip);
        }
        self.creds.clear_credentials();
        self.log_prefix.clear_user();
        self.quit |= hang_up;
        self.send_response(Final, "-ERR authentication failed")
    }

    fn logged_in(&mut self) -> Result<(), Error> {
        let email = match self.creds.account() {
            Some(account) if self.creds.is_authorized() => {
                account.email.clone()
            }
            _ => return self.send_response(Final, "-ERR authentication failed"),
        };

        info!("{} Logged in as {}", self.log_prefix, email);
        self.begin_open(email.clone());
        self.send_response(Final, &format!("+OK {} logged in", email))
    }

    /// Start opening the mailbox on a separate thread, so the reply to the
    /// login does not wait for a large mailbox to load.
    fn begin_open(&mut self, email: String) {
        let cache = Arc::clone(&self.ctx.cache);
        let opener = self.opener;
        let log_prefix = self.log_prefix.clone();
        let (tx, rx) = channel::bounded(1);

        let handle = thread::spawn(move || {
            let result = cache.open(opener, &email);
            if let Err(ref e) = result {
                warn!("{} Failed to open mailbox: {}", log_prefix, e);
            }
            let _ = tx.send(result);
        });
        self.opening = Some(Opening { rx, handle });
    }

    /// Wait for the mailbox to be open, returning it if it became available
    /// within `storage_wait`.
    fn wait_store(&mut self) -> Option<Arc<MessageStore>> {
        if self.store.is_some() {
            return self.store.clone();
        }

        if self.opening.is_none() {
            // A previous attempt failed; try again.
            let email = self.creds.account().map(|a| a.email.clone())?;
            self.begin_open(email);
        }

        let mut result = None;
        let wait = self.storage_wait;
        if let Some(ref opening) = self.opening {
            wait.until(|| match opening.rx.try_recv() {
                Ok(r) => {
                    result = Some(r);
                    true
                }
                Err(TryRecvError::Empty) => false,
                Err(TryRecvError::Disconnected) => {
                    result = Some(Err(Error::MailboxNotOpen));
                    true
                }
            });
        }

        if let Some(result) = result {
            if let Some(opening) = self.opening.take() {
                let _ = opening.handle.join();
            }
            self.store = result.ok();
        }

        self.store.clone()
    }

    fn with_store(
        &mut self,
        f: impl FnOnce(&mut Self, &MessageStore) -> Result<(), Error>,
    ) -> Result<(), Error> {
        require!(self, need_logged_in);

        match self.wait_store() {
            Some(store) => f(self, &*store),
            None => self.send_response(Final, "-ERR storage wait"),
        }
    }

    fn cmd_capa(&mut self) -> Result<(), Error> {
        let tls_available =
            self.ctx.ssl_acceptor.is_some() && !self.io.is_ssl();

        self.send_response(Delayable, "+OK Capability list follows")?;
        for &capability in CAPABILITIES {
            if !tls_available
                && ("STLS" == capability || "STARTTLS" == capability)
            {
                continue;
            }
            self.send_response(Delayable, capability)?;
        }
        self.send_response(Final, ".")
    }

    fn cmd_stat(&mut self, store: &MessageStore) -> Result<(), Error> {
        if !self.busy_wait.until(|| !store.is_busy()) {
            return self.send_response(Final, "-ERR storage wait");
        }

        let visible = visible(store);
        let size: u64 = visible.iter().map(|m| m.size).sum();
        self.send_response(Final, &format!("+OK {} {}", visible.len(), size))
    }

    fn cmd_list(
        &mut self,
        store: &MessageStore,
        id: Option<u32>,
    ) -> Result<(), Error> {
        if let Some(id) = id {
            return match find_visible(store, id) {
                Some(m) => self.send_response(
                    Final,
                    &format!("+OK {} {}", m.id, m.size),
                ),
                None => self.send_response(Final, "-ERR no such message"),
            };
        }

        let visible = visible(store);
        let size: u64 = visible.iter().map(|m| m.size).sum();
        self.send_response(
            Delayable,
            &format!("+OK {} messages ({} octets)", visible.len(), size),
        )?;
        for m in &visible {
            self.send_response(Delayable, &format!("{} {}", m.id, m.size))?;
        }
        self.send_response(Final, ".")
    }

    fn cmd_uidl(
        &mut self,
        store: &MessageStore,
        id: Option<u32>,
    ) -> Result<(), Error> {
        if let Some(id) = id {
            return match find_visible(store, id) {
                Some(m) => self.send_response(
                    Final,
                    &format!("+OK {} {}", m.id, m.uidl()),
                ),
                None => self.send_response(Final, "-ERR no such message"),
            };
        }

        self.send_response(Delayable, "+OK")?;
        for m in &visible(store) {
            self.send_response(Delayable, &format!("{} {}", m.id, m.uidl()))?;
        }
        self.send_response(Final, ".")
    }

    /// RETR, or TOP if `lines` is given.
    fn cmd_retr(
        &mut self,
        store: &MessageStore,
        id: u32,
        lines: Option<u32>,
    ) -> Result<(), Error> {
        if find_visible(store, id).is_none() {
            return self.send_response(Final, "-ERR no such message");
        }

        let data = match store.read_message(id) {
            Ok(data) => data,
            Err(e) => {
                warn!(
                    "{} Failed to read message {}: {}",
                    self.log_prefix, id, e
                );
                return self.send_response(Final, "-ERR storage error");
            }
        };

        let data = match lines {
            Some(lines) => top(&data, lines),
            None => data,
        };

        self.send_response(Delayable, &format!("+OK {} octets", data.len()))?;
        write_dot_stuffed(&mut self.writer, &mut &data[..])?;
        if lines.is_none() {
            store.mark_read(id);
        }
        Ok(())
    }

    fn cmd_dele(&mut self, store: &MessageStore, id: u32) -> Result<(), Error> {
        if store.find(id).map_or(false, |m| !m.folder.is_inbound()) {
            return self.send_response(Final, "-ERR no such message");
        }

        match store.safe_delete(id) {
            Ok(()) => {
                self.deleted.push(id);
                self.send_response(
                    Final,
                    &format!("+OK message {} deleted", id),
                )
            }
            Err(Error::ExpungedMessage) => self.send_response(
                Final,
                &format!("-ERR message {} already deleted", id),
            ),
            Err(_) => self.send_response(Final, "-ERR no such message"),
        }
    }

    fn cmd_rset(&mut self, store: &MessageStore) -> Result<(), Error> {
        for id in self.deleted.drain(..) {
            store.undelete(id);
        }
        let visible = visible(store);
        let size: u64 = visible.iter().map(|m| m.size).sum();
        self.send_response(
            Final,
            &format!(
                "+OK maildrop has {} messages ({} octets)",
                visible.len(),
                size
            ),
        )
    }

    fn cmd_noop(&mut self) -> Result<(), Error> {
        require!(self, need_logged_in);
        self.send_response(Final, "+OK")
    }

    fn cmd_help(&mut self) -> Result<(), Error> {
        self.send_response(Delayable, "+OK Commands follow")?;
        for line in HELP {
            self.send_response(Delayable, line)?;
        }
        self.send_response(Final, ".")
    }

    fn cmd_quit(&mut self) -> Result<(), Error> {
        self.quit = true;

        if let Some(store) = self.store.clone() {
            let purge = self.ctx.config.pop3.delete_on_quit;
            self.busy_wait.until(|| !store.is_busy());
            match store.clear_deleted(&self.deleted, purge) {
                Ok(0) => self.deleted.clear(),
                Ok(n) => {
                    self.deleted.clear();
                    info!(
                        "{} {} {} messages",
                        self.log_prefix,
                        if purge { "Purged" } else { "Dropped" },
                        n
                    );
                }
                Err(e) => {
                    warn!(
                        "{} Failed to apply deletions: {}",
                        self.log_prefix, e
                    );
                    return self.send_response(
                        Final,
                        "-ERR some deleted messages not removed",
                    );
                }
            }
        }

        let line = format!("+OK {} closing", self.ctx.host_name);
        self.send_response(Final, &line)
    }

    fn cmd_stls(&mut self) -> Result<(), Error> {
        if self.io.is_ssl() {
            return self.send_response(Final, "-ERR already secured");
        }
        require!(self, need_logged_out);

        let acceptor = match self.ctx.ssl_acceptor {
            Some(ref acceptor) => Arc::clone(acceptor),
            None => return self.send_response(Final, "-ERR TLS not available"),
        };

        // Anything already buffered was sent in cleartext and must not be
        // treated as if it arrived over TLS.
        if !self.reader.buffer().is_empty() {
            warn!("{} Pipelined data after STLS", self.log_prefix);
            self.quit = true;
            return self.send_response(Final, "-ERR pipelining not allowed");
        }

        self.send_response(Final, "+OK Begin TLS negotiation")?;
        self.io.ssl_accept(&acceptor)?;
        self.creds.clear_credentials();
        info!(
            "{} TLS established: {}",
            self.log_prefix,
            self.io.ssl_string().unwrap_or_default()
        );
        Ok(())
    }

    fn need_logged_out(&mut self) -> Option<Result<(), Error>> {
        if self.creds.is_authorized() {
            Some(self.send_response(Final, "-ERR already logged"))
        } else {
            None
        }
    }

    fn need_logged_in(&mut self) -> Option<Result<(), Error>> {
        if self.creds.is_authorized() {
            None
        } else {
            Some(self.send_response(Final, "-ERR needed logging"))
        }
    }

    fn send_response(
        &mut self,
        kind: ResponseKind,
        line: &str,
    ) -> Result<(), Error> {
        write!(self.writer, "{}\r\n", line)?;
        if Final == kind {
            self.writer.flush()?;
        }
        Ok(())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(opening) = self.opening.take() {
            let _ = opening.handle.join();
        }
        if let Some(store) = self.store.take() {
            // Deletions only take effect on QUIT
            let restored = self
                .deleted
                .drain(..)
                .filter(|&id| store.undelete(id))
                .count();
            if restored > 0 {
                info!(
                    "{} Restored {} messages deleted without QUIT",
                    self.log_prefix, restored
                );
            }
        }
        self.ctx.cache.close(self.opener, None);
    }
}

fn visible(store: &MessageStore) -> Vec<Message> {
    store.items(|m| m.folder.is_inbound())
}

fn find_visible(store: &MessageStore, id: u32) -> Option<Message> {
    store.find(id).filter(|m| m.folder.is_inbound())
}

/// The header of `data` followed by at most `lines` lines of its body.
fn top(data: &[u8], lines: u32) -> Vec<u8> {
    let mut out = Vec::new();
    let mut in_body = false;
    let mut body_lines = 0;

    for line in data.split_inclusive(|&b| b'\n' == b) {
        if in_body {
            if body_lines >= lines {
                break;
            }
            body_lines += 1;
        } else if b"\r\n" == line || b"\n" == line {
            in_body = true;
        }
        out.extend_from_slice(line);
    }

    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn top_takes_header_and_leading_lines() {
        let message = b"Subject: x\r\nFrom: y\r\n\r\none\r\ntwo\r\nthree\r\n";
        assert_eq!(
            b"Subject: x\r\nFrom: y\r\n\r\n".to_vec(),
            top(message, 0)
        );
        assert_eq!(
            b"Subject: x\r\nFrom: y\r\n\r\none\r\ntwo\r\n".to_vec(),
            top(message, 2)
        );
        assert_eq!(message.to_vec(), top(message, 99));
        assert_eq!(b"Subject: x".to_vec(), top(b"Subject: x", 1));
    }
}
