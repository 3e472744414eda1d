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

use std::fs;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::IpAddr;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tempfile::TempDir;

use super::server::*;
use crate::credentials::{apop_digest, cram_md5_digest};
use crate::mailbox::cache::{Opener, OpenerKind};
use crate::server::context::Context;
use crate::support::log_prefix::LogPrefix;
use crate::support::server_io::ServerIo;
use crate::support::system_config::SystemConfig;
use crate::support::wait::BoundedWait;
use crate::test_data::{self, FromPeer, SIMPLE_MESSAGE};

const ZIM: &str = "zim@irk.example";

struct Setup {
    root: TempDir,
    ctx: Arc<Context>,
    storage_wait: BoundedWait,
    busy_wait: BoundedWait,
}

fn set_up() -> Setup {
    set_up_with(SystemConfig::default())
}

fn set_up_with(config: SystemConfig) -> Setup {
    crate::init_test_log();
    let root = TempDir::new().unwrap();
    let ctx = test_data::context(root.path(), config);
    let wait =
        BoundedWait::new(Duration::from_secs(5), Duration::from_millis(10));
    Setup {
        root,
        ctx,
        storage_wait: wait,
        busy_wait: wait,
    }
}

impl Setup {
    fn connect(&self) -> (UnixStream, JoinHandle<()>) {
        self.connect_from(None)
    }

    fn connect_from(
        &self,
        peer: Option<IpAddr>,
    ) -> (UnixStream, JoinHandle<()>) {
        let (server_io, client_io) = UnixStream::pair().unwrap();
        let ctx = Arc::clone(&self.ctx);
        let (storage_wait, busy_wait) = (self.storage_wait, self.busy_wait);

        let handle = std::thread::spawn(move || {
            let io = match peer {
                Some(ip) => ServerIo::new(FromPeer(server_io, ip)),
                None => ServerIo::new(server_io),
            };
            let mut server =
                Server::new(ctx, io, LogPrefix::new("pop3", "test"));
            server.storage_wait = storage_wait;
            server.busy_wait = busy_wait;

            match server.run() {
                Ok(()) => (),
                Err(e) if e.is_disconnect() || e.is_idle_timeout() => (),
                Err(e) => panic!("Unexpected server error: {}", e),
            }
        });

        (client_io, handle)
    }

    /// Drop `data` into the inbox of `email` as file `name`.
    fn deliver(&self, email: &str, name: &str, data: &[u8]) {
        let dir = self.root.path().join("mail").join(email).join("Msg");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(name), data).unwrap();
    }

    fn inbox_files(&self, email: &str) -> usize {
        fs::read_dir(self.root.path().join("mail").join(email).join("Msg"))
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .path()
                    .extension()
                    .map_or(false, |e| e == "eml")
            })
            .count()
    }
}

fn read_line(r: &mut impl Read) -> String {
    // Read a byte at a time so nothing past the line is lost
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    while !line.ends_with(b"\n") {
        if 0 == r.read(&mut byte).unwrap() {
            break;
        }
        line.push(byte[0]);
    }
    let line = String::from_utf8(line).unwrap();
    println!("Read response: {:?}", line);
    line
}

/// Send `command` and return its single-line response.
fn command(cxn: &mut UnixStream, command: &str) -> String {
    write!(cxn, "{}\r\n", command).unwrap();
    read_line(cxn)
}

/// Send `command` and return its multi-line response, without the
/// terminating "." line.
fn multi_command(cxn: &mut UnixStream, command: &str) -> Vec<String> {
    write!(cxn, "{}\r\n", command).unwrap();
    let mut r = BufReader::new(cxn);
    let mut lines = Vec::new();
    loop {
        let mut line = String::new();
        r.read_line(&mut line).unwrap();
        if line.is_empty() {
            panic!("Unexpected EOF");
        }
        if ".\r\n" == line {
            break;
        }
        lines.push(line);
    }
    lines
}

fn assert_ok(response: &str) {
    assert!(response.starts_with("+OK"), "Unexpected: {:?}", response);
}

fn log_in(cxn: &mut UnixStream) {
    read_line(cxn);
    assert_ok(&command(cxn, "USER zim"));
    assert_eq!(
        "+OK zim@irk.example logged in\r\n",
        command(cxn, "PASS tanstaaf")
    );
}

fn assert_hung_up(cxn: &mut UnixStream) {
    let mut rest = Vec::new();
    cxn.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty(), "Unexpected data: {:?}", rest);
}

#[test]
fn first_contact() {
    let setup = set_up();
    let (mut cxn, _) = setup.connect();

    let greeting = read_line(&mut cxn);
    assert!(
        greeting.starts_with("+OK mx.irk.example POP3 ready <"),
        "Unexpected greeting: {}",
        greeting
    );
    assert_eq!("+OK mx.irk.example closing\r\n", command(&mut cxn, "QUIT"));
}

#[test]
fn empty_mailbox_session() {
    let setup = set_up();
    let (mut cxn, server) = setup.connect();

    read_line(&mut cxn);
    assert_eq!("+OK zim is welcome\r\n", command(&mut cxn, "USER zim"));
    assert_eq!(
        "+OK zim@irk.example logged in\r\n",
        command(&mut cxn, "PASS tanstaaf")
    );
    assert_eq!("+OK 0 0\r\n", command(&mut cxn, "STAT"));
    assert_eq!("+OK mx.irk.example closing\r\n", command(&mut cxn, "QUIT"));

    server.join().unwrap();
    assert!(!setup.ctx.cache.is_open(ZIM));
}

#[test]
fn commands_before_login() {
    let setup = set_up();
    let (mut cxn, _) = setup.connect();
    read_line(&mut cxn);

    for cmd in &["STAT", "LIST", "UIDL 1", "RETR 1", "TOP 1 1", "DELE 1"] {
        assert_eq!("-ERR needed logging\r\n", command(&mut cxn, cmd));
    }
    assert_eq!("-ERR needed logging\r\n", command(&mut cxn, "NOOP"));
    assert_eq!("-ERR USER first\r\n", command(&mut cxn, "PASS tanstaaf"));
    assert_eq!("-ERR unknown command\r\n", command(&mut cxn, "FROB"));
    assert_eq!("-ERR syntax error\r\n", command(&mut cxn, "RETR one"));
}

#[test]
fn commands_after_login() {
    let setup = set_up();
    let (mut cxn, _) = setup.connect();
    log_in(&mut cxn);

    assert_eq!("-ERR already logged\r\n", command(&mut cxn, "USER zim"));
    assert_eq!("-ERR already logged\r\n", command(&mut cxn, "PASS x"));
    assert_eq!(
        "-ERR already logged\r\n",
        command(&mut cxn, "APOP zim 00000000000000000000000000000000")
    );
    assert_eq!(
        "-ERR already logged\r\n",
        command(&mut cxn, "PLAIN AHppbQB0YW5zdGFhZg==")
    );
    assert_eq!("-ERR already logged\r\n", command(&mut cxn, "LOGIN"));
    assert_eq!("+OK\r\n", command(&mut cxn, "NOOP"));
}

#[test]
fn capabilities() {
    let setup = set_up();
    let (mut cxn, _) = setup.connect();
    read_line(&mut cxn);

    let capa = multi_command(&mut cxn, "CAPA");
    assert_ok(&capa[0]);
    for expected in &[
        "TOP",
        "USER",
        "UIDL",
        "APOP",
        "STLS",
        "STARTTLS",
        "SASL PLAIN LOGIN USER APOP",
        "EXPIRE 60",
        "LOGIN-DELAY 900",
    ] {
        assert!(
            capa.contains(&format!("{}\r\n", expected)),
            "Missing {} in {:?}",
            expected,
            capa
        );
    }

    let mechanisms = multi_command(&mut cxn, "AUTH");
    assert_eq!(
        vec!["+OK\r\n", "PLAIN\r\n", "LOGIN\r\n", "CRAM-MD5\r\n"],
        mechanisms
    );
}

#[test]
fn mailbox_commands() {
    let setup = set_up();
    let second: &[u8] =
        b"Subject: Second\r\nMessage-ID: <two@irk.example>\r\n\r\nx\r\n";
    setup.deliver(ZIM, "1.eml", SIMPLE_MESSAGE);
    setup.deliver(ZIM, "2.eml", second);
    let total = SIMPLE_MESSAGE.len() + second.len();

    let (mut cxn, server) = setup.connect();
    log_in(&mut cxn);

    assert_eq!(format!("+OK 2 {}\r\n", total), command(&mut cxn, "STAT"));

    let list = multi_command(&mut cxn, "LIST");
    assert_eq!(
        vec![
            format!("+OK 2 messages ({} octets)\r\n", total),
            format!("1 {}\r\n", SIMPLE_MESSAGE.len()),
            format!("2 {}\r\n", second.len()),
        ],
        list
    );
    assert_eq!(
        format!("+OK 2 {}\r\n", second.len()),
        command(&mut cxn, "LIST 2")
    );
    assert_eq!("-ERR no such message\r\n", command(&mut cxn, "LIST 3"));

    assert_eq!(
        "+OK 1 doom.1@irk.example\r\n",
        command(&mut cxn, "UIDL 1")
    );
    let uidl = multi_command(&mut cxn, "UIDL");
    assert_eq!(
        vec!["+OK\r\n", "1 doom.1@irk.example\r\n", "2 two@irk.example\r\n"],
        uidl
    );

    let retr = multi_command(&mut cxn, "RETR 1");
    assert_eq!(
        format!("+OK {} octets\r\n", SIMPLE_MESSAGE.len()),
        retr[0]
    );
    assert!(retr.contains(&"..The Earth will be mine\r\n".to_owned()));
    assert_eq!("And nothing can stop me\r\n", retr.last().unwrap());

    let top = multi_command(&mut cxn, "TOP 1 0");
    assert_eq!("\r\n", top.last().unwrap());
    assert!(top.contains(&"Subject: Doom\r\n".to_owned()));

    assert_eq!("+OK message 1 deleted\r\n", command(&mut cxn, "DELE 1"));
    assert_eq!(
        "-ERR message 1 already deleted\r\n",
        command(&mut cxn, "DELE 1")
    );
    assert_eq!("-ERR no such message\r\n", command(&mut cxn, "RETR 1"));
    assert_eq!(
        format!("+OK 1 {}\r\n", second.len()),
        command(&mut cxn, "STAT")
    );

    assert_eq!(
        format!("+OK maildrop has 2 messages ({} octets)\r\n", total),
        command(&mut cxn, "RSET")
    );

    assert_ok(&command(&mut cxn, "DELE 2"));
    assert_eq!("+OK mx.irk.example closing\r\n", command(&mut cxn, "QUIT"));
    server.join().unwrap();

    // Without delete_on_quit, the file stays on disk
    assert_eq!(2, setup.inbox_files(ZIM));

    // but a new session no longer lists it
    let (mut cxn, _) = setup.connect();
    log_in(&mut cxn);
    assert_eq!(
        format!("+OK 1 {}\r\n", SIMPLE_MESSAGE.len()),
        command(&mut cxn, "STAT")
    );
}

#[test]
fn quit_purges_when_configured() {
    let mut config = SystemConfig::default();
    config.pop3.delete_on_quit = true;
    let setup = set_up_with(config);
    setup.deliver(ZIM, "1.eml", SIMPLE_MESSAGE);

    let (mut cxn, server) = setup.connect();
    log_in(&mut cxn);
    assert_ok(&command(&mut cxn, "DELE 1"));
    assert_ok(&command(&mut cxn, "QUIT"));
    server.join().unwrap();

    assert_eq!(0, setup.inbox_files(ZIM));
}

#[test]
fn failed_pass_hangs_up_and_strikes() {
    let setup = set_up();
    let ip: IpAddr = "192.0.2.7".parse().unwrap();

    for _ in 0..3 {
        assert!(setup.ctx.filter.check(ip));
        let (mut cxn, _) = setup.connect_from(Some(ip));
        read_line(&mut cxn);
        assert_ok(&command(&mut cxn, "USER zim"));
        assert_eq!(
            "-ERR authentication failed\r\n",
            command(&mut cxn, "PASS hunter2")
        );
        assert_hung_up(&mut cxn);
    }

    assert!(!setup.ctx.filter.check(ip));
}

#[test]
fn unknown_user_hangs_up() {
    let setup = set_up();
    let (mut cxn, _) = setup.connect();
    read_line(&mut cxn);
    assert_eq!(
        "-ERR authentication failed\r\n",
        command(&mut cxn, "USER dib")
    );
    assert_hung_up(&mut cxn);
}

#[test]
fn account_without_password_cannot_log_in() {
    let setup = set_up();
    let (mut cxn, _) = setup.connect();
    read_line(&mut cxn);
    assert_ok(&command(&mut cxn, "USER tak"));
    assert_eq!("-ERR authentication failed\r\n", command(&mut cxn, "PASS "));
}

#[test]
fn auth_plain() {
    let setup = set_up();
    let (mut cxn, _) = setup.connect();
    read_line(&mut cxn);
    assert_eq!(
        "+OK zim@irk.example logged in\r\n",
        command(&mut cxn, "AUTH PLAIN AHppbQB0YW5zdGFhZg==")
    );
    assert_eq!("+OK 0 0\r\n", command(&mut cxn, "STAT"));

    let (mut cxn, _) = setup.connect();
    read_line(&mut cxn);
    assert_eq!("+ \r\n", command(&mut cxn, "PLAIN"));
    assert_eq!(
        "-ERR authentication failed\r\n",
        command(&mut cxn, "AHppbQB3cm9uZw==")
    );
    assert_hung_up(&mut cxn);
}

#[test]
fn auth_login() {
    let setup = set_up();
    let (mut cxn, _) = setup.connect();
    read_line(&mut cxn);
    assert_eq!("+ VXNlcm5hbWU6\r\n", command(&mut cxn, "AUTH LOGIN"));
    assert_eq!("+ UGFzc3dvcmQ6\r\n", command(&mut cxn, "emlt"));
    assert_eq!(
        "+OK zim@irk.example logged in\r\n",
        command(&mut cxn, "dGFuc3RhYWY=")
    );

    // A failed LOGIN does not end the session
    let (mut cxn, _) = setup.connect();
    read_line(&mut cxn);
    assert_eq!("+ UGFzc3dvcmQ6\r\n", command(&mut cxn, "LOGIN emlt"));
    assert_eq!("-ERR authentication failed\r\n", command(&mut cxn, "eA=="));
    assert_eq!("-ERR needed logging\r\n", command(&mut cxn, "STAT"));

    assert_eq!("+ VXNlcm5hbWU6\r\n", command(&mut cxn, "LOGIN"));
    assert_eq!(
        "-ERR authentication cancelled\r\n",
        command(&mut cxn, "*")
    );
}

#[test]
fn auth_cram_md5() {
    let setup = set_up();
    let (mut cxn, _) = setup.connect();
    read_line(&mut cxn);

    let challenge = command(&mut cxn, "AUTH CRAM-MD5");
    assert!(challenge.starts_with("+ "));
    let challenge =
        base64::decode(challenge[2..].trim_end()).unwrap();
    let challenge = String::from_utf8(challenge).unwrap();
    assert!(challenge.ends_with("@mx.irk.example>"));

    let digest = cram_md5_digest(&challenge, "tanstaaf").unwrap();
    let response = base64::encode(format!("zim {}", digest));
    assert_eq!(
        "+OK zim@irk.example logged in\r\n",
        command(&mut cxn, &response)
    );
}

#[test]
fn apop() {
    let setup = set_up();
    let (mut cxn, _) = setup.connect();

    let greeting = read_line(&mut cxn);
    let stamp = &greeting[greeting.find('<').unwrap()..];
    let stamp = &stamp[..=stamp.find('>').unwrap()];
    let digest = apop_digest(stamp, "tanstaaf").unwrap();

    assert_eq!(
        "+OK zim@irk.example logged in\r\n",
        command(&mut cxn, &format!("APOP zim {}", digest))
    );

    let (mut cxn, _) = setup.connect();
    read_line(&mut cxn);
    assert_eq!(
        "-ERR authentication failed\r\n",
        command(&mut cxn, &format!("APOP zim {}", digest))
    );
    assert_hung_up(&mut cxn);
}

#[test]
fn stls() {
    let setup = set_up();
    let (mut cxn, _) = setup.connect();
    read_line(&mut cxn);

    assert_eq!("+OK Begin TLS negotiation\r\n", command(&mut cxn, "STLS"));
    let mut cxn = test_data::ssl_connector()
        .connect("mx.irk.example", cxn)
        .unwrap();

    write!(cxn, "CAPA\r\n").unwrap();
    let mut capa = Vec::new();
    loop {
        let line = read_line(&mut cxn);
        if ".\r\n" == line {
            break;
        }
        capa.push(line);
    }
    assert!(!capa.contains(&"STLS\r\n".to_owned()));

    write!(cxn, "STLS\r\n").unwrap();
    assert_eq!("-ERR already secured\r\n", read_line(&mut cxn));

    write!(cxn, "AUTH PLAIN AHppbQB0YW5zdGFhZg==\r\n").unwrap();
    assert_eq!("+OK zim@irk.example logged in\r\n", read_line(&mut cxn));
}

#[test]
fn dele_without_quit_is_recovered() {
    let setup = set_up();
    let second: &[u8] =
        b"Subject: Second\r\nMessage-ID: <two@irk.example>\r\n\r\nx\r\n";
    setup.deliver(ZIM, "1.eml", SIMPLE_MESSAGE);
    setup.deliver(ZIM, "2.eml", second);
    let stat = format!("+OK 2 {}\r\n", SIMPLE_MESSAGE.len() + second.len());

    let (mut cxn, server) = setup.connect();
    log_in(&mut cxn);
    assert_eq!(stat, command(&mut cxn, "STAT"));
    assert_eq!("+OK message 1 deleted\r\n", command(&mut cxn, "DELE 1"));
    drop(cxn);
    server.join().unwrap();
    assert!(!setup.ctx.cache.is_open(ZIM));

    let (mut cxn, _) = setup.connect();
    log_in(&mut cxn);
    assert_eq!(stat, command(&mut cxn, "STAT"));
}

#[test]
fn dele_without_quit_is_recovered_while_mailbox_shared() {
    let setup = set_up();
    let second: &[u8] =
        b"Subject: Second\r\nMessage-ID: <two@irk.example>\r\n\r\nx\r\n";
    setup.deliver(ZIM, "1.eml", SIMPLE_MESSAGE);
    setup.deliver(ZIM, "2.eml", second);

    let holder = Opener::new(OpenerKind::Smtp);
    let store = setup.ctx.cache.open(holder, ZIM).unwrap();

    let (mut abandoned, abandoned_server) = setup.connect();
    log_in(&mut abandoned);
    assert_ok(&command(&mut abandoned, "DELE 1"));

    // RSET in another session only restores that session's deletions
    let (mut other, other_server) = setup.connect();
    log_in(&mut other);
    assert_ok(&command(&mut other, "DELE 2"));
    assert_eq!(
        format!("+OK maildrop has 1 messages ({} octets)\r\n", second.len()),
        command(&mut other, "RSET")
    );
    assert_ok(&command(&mut other, "QUIT"));
    other_server.join().unwrap();

    drop(abandoned);
    abandoned_server.join().unwrap();
    assert_eq!(2, store.count());
    assert_eq!(
        (SIMPLE_MESSAGE.len() + second.len()) as u64,
        store.total_size()
    );

    setup.ctx.cache.close(holder, None);
    assert_eq!(2, setup.inbox_files(ZIM));
}

#[test]
fn failed_mailbox_open_reports_storage_wait() {
    let setup = set_up();
    let mail = setup.root.path().join("mail");
    fs::create_dir_all(&mail).unwrap();
    fs::write(mail.join(ZIM), b"").unwrap();

    let (mut cxn, _) = setup.connect();
    log_in(&mut cxn);
    assert_eq!("-ERR storage wait\r\n", command(&mut cxn, "STAT"));
    assert_eq!("-ERR storage wait\r\n", command(&mut cxn, "LIST"));

    // The next mailbox command tries again
    fs::remove_file(mail.join(ZIM)).unwrap();
    setup.deliver(ZIM, "1.eml", SIMPLE_MESSAGE);
    assert_eq!(
        format!("+OK 1 {}\r\n", SIMPLE_MESSAGE.len()),
        command(&mut cxn, "STAT")
    );
}

#[test]
fn stat_waits_for_busy_mailbox() {
    let mut setup = set_up();
    setup.deliver(ZIM, "1.eml", SIMPLE_MESSAGE);
    let stat = format!("+OK 1 {}\r\n", SIMPLE_MESSAGE.len());

    let holder = Opener::new(OpenerKind::Fetch);
    let store = setup.ctx.cache.open(holder, ZIM).unwrap();

    setup.busy_wait =
        BoundedWait::new(Duration::from_millis(100), Duration::from_millis(10));
    let (mut cxn, _) = setup.connect();
    log_in(&mut cxn);
    {
        let _busy = store.begin().unwrap();
        assert_eq!("-ERR storage wait\r\n", command(&mut cxn, "STAT"));
    }
    assert_eq!(stat, command(&mut cxn, "STAT"));

    setup.busy_wait =
        BoundedWait::new(Duration::from_secs(5), Duration::from_millis(10));
    let (mut cxn, _) = setup.connect();
    log_in(&mut cxn);
    let (tx, rx) = std::sync::mpsc::channel();
    let busy_store = Arc::clone(&store);
    let busy = std::thread::spawn(move || {
        let _busy = busy_store.begin().unwrap();
        tx.send(()).unwrap();
        std::thread::sleep(Duration::from_millis(200));
    });
    rx.recv().unwrap();
    assert_eq!(stat, command(&mut cxn, "STAT"));
    busy.join().unwrap();

    setup.ctx.cache.close(holder, None);
}

#[test]
fn idle_timeout() {
    let mut config = SystemConfig::default();
    config.pop3.idle_timeout_secs = 1;
    let setup = set_up_with(config);

    let (mut cxn, server) = setup.connect();
    log_in(&mut cxn);
    assert_eq!("-ERR idle timeout\r\n", read_line(&mut cxn));
    assert_hung_up(&mut cxn);
    server.join().unwrap();
    assert!(!setup.ctx.cache.is_open(ZIM));
}

#[test]
fn abandoned_auth_exchange_strikes() {
    let mut config = SystemConfig::default();
    config.pop3.idle_timeout_secs = 1;
    config.filter.spam_check_count = 1;
    let setup = set_up_with(config);
    let ip: IpAddr = "192.0.2.9".parse().unwrap();

    let (mut cxn, server) = setup.connect_from(Some(ip));
    read_line(&mut cxn);
    assert_eq!("+ VXNlcm5hbWU6\r\n", command(&mut cxn, "AUTH LOGIN"));
    assert_eq!("-ERR idle timeout\r\n", read_line(&mut cxn));
    assert_hung_up(&mut cxn);
    server.join().unwrap();

    assert!(!setup.ctx.filter.check(ip));
}
