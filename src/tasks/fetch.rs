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

//! Collecting new mail from each account's upstream POP3 server.

use chrono::prelude::*;
use log::{debug, info, warn};

use super::Running;
use crate::account::model::{Account, AccountCapabilities};
use crate::account::store::AccountStore;
use crate::mailbox::cache::{MailboxCache, Opener, OpenerKind};
use crate::mailbox::message_store::MessageStore;
use crate::mime::header::Headers;
use crate::outbound::client::{MailClient, Pop3Client, Role};
use crate::outbound::connector::{Connect, NetConnect, OutboundConnector};
use crate::server::context::Context;
use crate::support::cancel::CancelToken;
use crate::support::error::{summarise, Error};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FetchReport {
    /// Accounts a fetch was attempted for.
    pub accounts: usize,
    /// Messages placed into local mailboxes.
    pub messages: usize,
    /// Accounts whose fetch failed.
    pub failed: usize,
}

pub struct Fetcher<'a, C: Connect> {
    pub connector: &'a OutboundConnector<C>,
    pub accounts: &'a dyn AccountStore,
    pub cache: &'a MailboxCache,
    pub running: &'a Running,
    pub delete_after_fetch: bool,
    pub max_message_size: u64,
}

impl<'a> Fetcher<'a, NetConnect> {
    pub fn new(ctx: &'a Context) -> Self {
        Fetcher {
            connector: &ctx.connector,
            accounts: &*ctx.accounts,
            cache: &ctx.cache,
            running: &ctx.fetching,
            delete_after_fetch: ctx.config.fetch.delete_after_fetch,
            max_message_size: ctx.config.smtp.max_message_size,
        }
    }
}

impl<C: Connect<Client = MailClient>> Fetcher<'_, C> {
    /// Fetch for every enabled account with a POP3 server.
    ///
    /// Returns `None` without doing anything if another cycle is running.
    pub fn run(&self, cancel: &CancelToken) -> Option<FetchReport> {
        let _running = match self.running.try_start() {
            Some(guard) => guard,
            None => {
                info!("Fetch already in progress, skipping");
                return None;
            }
        };

        let now = Utc::now();
        let mut report = FetchReport::default();
        for account in self.accounts.accounts() {
            if cancel.is_cancelled() {
                info!("Fetch cancelled");
                break;
            }
            if !account.is_usable(now) || !account.has_inbound() {
                continue;
            }

            report.accounts += 1;
            match self.fetch_account(&account, cancel) {
                Ok(n) => report.messages += n,
                Err(e) => {
                    warn!(
                        "Fetch for {} failed: {}",
                        account.email,
                        summarise(&e, 96)
                    );
                    report.failed += 1;
                }
            }
        }

        Some(report)
    }

    /// Retrieve everything waiting on the POP3 server of `account`.
    ///
    /// Messages whose `Message-ID` is already in the mailbox are not stored
    /// again.
    pub fn fetch_account(
        &self,
        account: &Account,
        cancel: &CancelToken,
    ) -> Result<usize, Error> {
        let connection = self
            .connector
            .connect(account, Role::Pop3, cancel)
            .ok_or_else(|| {
                Error::Protocol(format!(
                    "No path to the POP3 server of {}",
                    account.email
                ))
            })?;
        let mut client = match connection.client {
            MailClient::Pop3(client) => client,
            other => {
                let _ = other.close();
                return Err(Error::Protocol(
                    "Connector returned a non-POP3 client".to_owned(),
                ));
            }
        };

        let opener = Opener::new(OpenerKind::Fetch);
        let store = self.cache.open(opener, &account.email)?;
        let result = self.retrieve(&mut client, &store, cancel);
        drop(store);
        self.cache.close(opener, Some(&account.email));

        let fetched = result?;
        client.quit()?;
        info!(
            "Fetched {} messages for {} via {}",
            fetched, account.email, connection.hop
        );
        Ok(fetched)
    }

    fn retrieve(
        &self,
        client: &mut Pop3Client,
        store: &MessageStore,
        cancel: &CancelToken,
    ) -> Result<usize, Error> {
        let (count, size) = client.stat()?;
        debug!("{} messages ({} bytes) waiting", count, size);

        let mut fetched = 0;
        for id in 1..=count {
            cancel.check()?;
            let data = client.retr(id, self.max_message_size)?;

            let known = Headers::parse(&data)
                .get("Message-ID")
                .filter(|id| !id.is_empty())
                .and_then(|id| store.find_msgid(id));
            if let Some(known) = known {
                debug!("Skipping already fetched {}", known.message_id);
            } else {
                let message = store.spool_in_to_msg(&data)?;
                debug!("Stored {} as {}", message.message_id, message.id);
                fetched += 1;
            }

            if self.delete_after_fetch {
                client.dele(id)?;
            }
        }

        Ok(fetched)
    }
}

#[cfg(test)]
pub(super) mod test {
    use std::collections::VecDeque;
    use std::fs;
    use std::io::{BufRead, BufReader, Write};
    use std::net::IpAddr;
    use std::os::unix::net::UnixStream;
    use std::path::Path;
    use std::sync::Mutex;
    use std::thread::{self, JoinHandle};

    use tempfile::TempDir;

    use super::*;
    use crate::account::model::Endpoint;
    use crate::mailbox::model::Folder;
    use crate::outbound::client::SmtpClient;
    use crate::outbound::connector::Hop;
    use crate::support::system_config::{ProxyConfig, ProxyMode, VpnConfig};
    use crate::test_data::{self, SIMPLE_MESSAGE};

    /// Marks a script step which reads a dot-terminated payload instead of a
    /// single line.
    pub const PAYLOAD: &str = "<payload>";

    pub type Script = Vec<(&'static str, String)>;

    /// Serve `script` on the other end of a socket pair, returning every
    /// line seen.
    fn serve(
        greeting: &'static str,
        script: Script,
    ) -> (UnixStream, JoinHandle<Vec<String>>) {
        let (client, server) = UnixStream::pair().unwrap();
        let handle = thread::spawn(move || {
            let mut seen = Vec::new();
            let mut writer = server.try_clone().unwrap();
            let mut reader = BufReader::new(server);
            writer.write_all(greeting.as_bytes()).unwrap();

            for (expect, response) in script {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                if PAYLOAD == expect {
                    while ".\r\n" != line {
                        seen.push(line.clone());
                        line.clear();
                        assert_ne!(0, reader.read_line(&mut line).unwrap());
                    }
                } else {
                    assert!(
                        line.starts_with(expect),
                        "Expected {:?}, got {:?}",
                        expect,
                        line
                    );
                    seen.push(line);
                }
                writer.write_all(response.as_bytes()).unwrap();
            }
            seen
        });
        (client, handle)
    }

    /// A `Connect` which talks to one scripted server per connection.
    pub struct ScriptedConnect {
        scripts: Mutex<VecDeque<Script>>,
        pub servers: Mutex<Vec<JoinHandle<Vec<String>>>>,
    }

    impl ScriptedConnect {
        pub fn new(scripts: Vec<Script>) -> Self {
            ScriptedConnect {
                scripts: Mutex::new(scripts.into()),
                servers: Mutex::new(Vec::new()),
            }
        }

        /// Wait for every server and return what each one saw.
        pub fn transcripts(&self) -> Vec<Vec<String>> {
            self.servers
                .lock()
                .unwrap()
                .drain(..)
                .map(|h| h.join().unwrap())
                .collect()
        }
    }

    impl Connect for ScriptedConnect {
        type Client = MailClient;

        fn connect(
            &self,
            _: &Hop,
            account: &Account,
            endpoint: &Endpoint,
            role: Role,
            _: Option<IpAddr>,
        ) -> Result<MailClient, Error> {
            let script = match self.scripts.lock().unwrap().pop_front() {
                Some(script) => script,
                None => {
                    return Err(Error::Protocol("connection refused".to_owned()))
                }
            };

            let greeting = match role {
                Role::Smtp => "220 upstream ESMTP\r\n",
                _ => "+OK upstream ready\r\n",
            };
            let (stream, handle) = serve(greeting, script);
            self.servers.lock().unwrap().push(handle);

            let login = account.remote_login(endpoint);
            let password = account.remote_password(endpoint);
            match role {
                Role::Smtp => {
                    let mut client = SmtpClient::connect(
                        Box::new(stream),
                        &endpoint.host,
                        test_data::HOST_NAME,
                        true,
                    )?;
                    client.auth_plain(login, password)?;
                    Ok(MailClient::Smtp(client))
                }
                _ => {
                    let mut client = Pop3Client::connect(Box::new(stream))?;
                    client.login(login, password)?;
                    Ok(MailClient::Pop3(client))
                }
            }
        }
    }

    pub fn connector(
        root: &Path,
        scripts: Vec<Script>,
    ) -> OutboundConnector<ScriptedConnect> {
        let mut proxy = ProxyConfig::default();
        proxy.mode = ProxyMode::None;
        OutboundConnector::new(
            ScriptedConnect::new(scripts),
            test_data::accounts(),
            root,
            proxy,
            VpnConfig::default(),
        )
    }

    fn pop3_script(messages: &[&[u8]], delete: bool) -> Script {
        let mut script: Script = vec![
            ("USER zim", "+OK\r\n".to_owned()),
            ("PASS tanstaaf", "+OK\r\n".to_owned()),
            ("STAT", format!("+OK {} 1234\r\n", messages.len())),
        ];
        for (ix, message) in messages.iter().enumerate() {
            let mut response = "+OK\r\n".to_owned();
            for line in std::str::from_utf8(message).unwrap().split("\r\n") {
                if line.starts_with('.') {
                    response.push('.');
                }
                response.push_str(line);
                response.push_str("\r\n");
            }
            // The split leaves an empty tail after the final CRLF
            response.truncate(response.len() - 2);
            response.push_str(".\r\n");
            script.push(("RETR ", response));
            if delete {
                script.push(("DELE ", format!("+OK {} deleted\r\n", ix + 1)));
            }
        }
        script.push(("QUIT", "+OK bye\r\n".to_owned()));
        script
    }

    const SECOND: &[u8] = b"From: Gaz <gaz@earth.example>\r\n\
Subject: Pigs\r\n\
Message-ID: <pigs@earth.example>\r\n\
\r\n\
Game slave\r\n";

    struct Setup {
        root: TempDir,
        cache: MailboxCache,
        accounts: std::sync::Arc<dyn AccountStore>,
        running: Running,
    }

    fn set_up() -> Setup {
        crate::init_test_log();
        let root = TempDir::new().unwrap();
        Setup {
            cache: MailboxCache::new(root.path().join("mail")),
            root,
            accounts: test_data::accounts(),
            running: Running::default(),
        }
    }

    impl Setup {
        fn fetcher<'a>(
            &'a self,
            connector: &'a OutboundConnector<ScriptedConnect>,
            delete: bool,
        ) -> Fetcher<'a, ScriptedConnect> {
            Fetcher {
                connector,
                accounts: &*self.accounts,
                cache: &self.cache,
                running: &self.running,
                delete_after_fetch: delete,
                max_message_size: 1 << 20,
            }
        }

        fn inbox(&self) -> Vec<Vec<u8>> {
            let dir = self.cache.mail_root().join("zim@irk.example").join(
                Folder::Msg.dir_name(),
            );
            let mut files: Vec<Vec<u8>> = fs::read_dir(dir)
                .map(|rd| {
                    rd.map(|e| fs::read(e.unwrap().path()).unwrap()).collect()
                })
                .unwrap_or_default();
            files.sort();
            files
        }
    }

    #[test]
    fn fetches_into_inbox() {
        let setup = set_up();
        let connector = connector(
            setup.root.path(),
            vec![pop3_script(&[SIMPLE_MESSAGE, SECOND], false)],
        );
        let report = setup
            .fetcher(&connector, false)
            .run(&CancelToken::new())
            .unwrap();

        assert_eq!(
            FetchReport {
                accounts: 1,
                messages: 2,
                failed: 0,
            },
            report
        );

        let transcript = connector.transport().transcripts().remove(0);
        assert!(!transcript.iter().any(|l| l.starts_with("DELE")));

        let mut expected = vec![SIMPLE_MESSAGE.to_vec(), SECOND.to_vec()];
        expected.sort();
        assert_eq!(expected, setup.inbox());
        assert!(!setup.cache.is_open("zim@irk.example"));
    }

    #[test]
    fn known_messages_skipped_and_deleted() {
        let setup = set_up();
        {
            let opener = Opener::new(OpenerKind::Cli);
            let store = setup.cache.open(opener, "zim@irk.example").unwrap();
            store.spool_in_to_msg(SIMPLE_MESSAGE).unwrap();
            drop(store);
            setup.cache.close(opener, None);
        }

        let connector = connector(
            setup.root.path(),
            vec![pop3_script(&[SIMPLE_MESSAGE, SECOND], true)],
        );
        let report = setup
            .fetcher(&connector, true)
            .run(&CancelToken::new())
            .unwrap();
        assert_eq!(1, report.messages);
        assert_eq!(2, setup.inbox().len());

        let transcript = connector.transport().transcripts().remove(0);
        assert_eq!(
            2,
            transcript.iter().filter(|l| l.starts_with("DELE")).count()
        );
    }

    #[test]
    fn unreachable_server_counts_as_failure() {
        let setup = set_up();
        let connector = connector(setup.root.path(), vec![]);
        let report = setup
            .fetcher(&connector, false)
            .run(&CancelToken::new())
            .unwrap();
        assert_eq!(
            FetchReport {
                accounts: 1,
                messages: 0,
                failed: 1,
            },
            report
        );
    }

    #[test]
    fn one_cycle_at_a_time() {
        let setup = set_up();
        let connector = connector(setup.root.path(), vec![]);
        let _guard = setup.running.try_start().unwrap();
        assert!(setup
            .fetcher(&connector, false)
            .run(&CancelToken::new())
            .is_none());
    }
}
