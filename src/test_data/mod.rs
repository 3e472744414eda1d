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

//! Fixtures shared by unit and integration tests.

use std::io::{self, Read, Write};
use std::net::IpAddr;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::account::model::{Account, Endpoint};
use crate::account::store::{AccountStore, AccountsFile, FileAccountStore};
use crate::server::context::Context;
use crate::support::server_io::Socket;
use crate::support::system_config::SystemConfig;

pub const HOST_NAME: &str = "mx.irk.example";

/// A small message with every header the indexer looks at.
pub static SIMPLE_MESSAGE: &[u8] = b"From: Zim <zim@irk.example>\r\n\
To: Dib <dib@earth.example>\r\n\
Subject: Doom\r\n\
Date: Tue, 1 Jul 2003 10:52:37 +0200\r\n\
Message-ID: <doom.1@irk.example>\r\n\
\r\n\
.The Earth will be mine\r\n\
And nothing can stop me\r\n";

/// The accounts used throughout the tests.
///
/// - `zim` / `tanstaaf`, `zim@irk.example`, with an outbound SMTP server.
/// - `gir` / `tacos`, `gir@irk.example`, local only.
/// - `tak`, `tak@irk.example`, which has no password and so is incomplete.
pub fn accounts_file() -> AccountsFile {
    AccountsFile {
        user: vec![
            Account {
                login: "zim".to_owned(),
                password: "tanstaaf".to_owned(),
                email: "zim@irk.example".to_owned(),
                name: "Invader Zim".to_owned(),
                smtp: Some(Endpoint {
                    host: "smtp.irk.example".to_owned(),
                    port: 587,
                    ..Endpoint::default()
                }),
                pop3: Some(Endpoint {
                    host: "pop.irk.example".to_owned(),
                    port: 995,
                    ..Endpoint::default()
                }),
                enabled: true,
                ..Account::default()
            },
            Account {
                login: "gir".to_owned(),
                password: "tacos".to_owned(),
                email: "gir@irk.example".to_owned(),
                enabled: true,
                ..Account::default()
            },
            Account {
                login: "tak".to_owned(),
                password: String::new(),
                email: "tak@irk.example".to_owned(),
                enabled: true,
                ..Account::default()
            },
        ],
        ..AccountsFile::default()
    }
}

pub fn accounts() -> Arc<dyn AccountStore> {
    Arc::new(FileAccountStore::new(accounts_file()))
}

/// A context rooted at `root` with the test accounts and TLS available.
pub fn context(root: &Path, config: SystemConfig) -> Arc<Context> {
    Arc::new(Context::new(
        root.to_owned(),
        config,
        HOST_NAME.to_owned(),
        accounts(),
        Some(ssl_acceptor()),
    ))
}

/// A socket pair end which claims to come from a fixed IP address, so that
/// the auth-failure filter has something to record.
#[derive(Debug)]
pub struct FromPeer(pub UnixStream, pub IpAddr);

impl Read for FromPeer {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        self.0.read(dst)
    }
}

impl Write for FromPeer {
    fn write(&mut self, src: &[u8]) -> io::Result<usize> {
        self.0.write(src)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl Socket for FromPeer {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.0.set_read_timeout(timeout)
    }

    fn peer_ip(&self) -> Option<IpAddr> {
        Some(self.1)
    }
}

lazy_static::lazy_static! {
    pub static ref CERTIFICATE_PRIVATE_KEY: openssl::pkey::PKey<openssl::pkey::Private> =
        openssl::pkey::PKey::from_rsa(openssl::rsa::Rsa::generate(2048).unwrap())
            .unwrap();
    pub static ref CERTIFICATE: openssl::x509::X509 = {
        let mut builder = openssl::x509::X509Builder::new().unwrap();
        builder.set_version(2).unwrap();
        builder.set_pubkey(&CERTIFICATE_PRIVATE_KEY).unwrap();
        builder
            .set_not_before(&openssl::asn1::Asn1Time::from_unix(0).unwrap())
            .unwrap();
        builder
            .set_not_after(&openssl::asn1::Asn1Time::days_from_now(2).unwrap())
            .unwrap();
        builder
            .sign(
                &CERTIFICATE_PRIVATE_KEY,
                openssl::hash::MessageDigest::sha256(),
            )
            .unwrap();
        builder.build()
    };
}

/// An acceptor using the throwaway certificate.
pub fn ssl_acceptor() -> Arc<openssl::ssl::SslAcceptor> {
    let mut builder = openssl::ssl::SslAcceptor::mozilla_intermediate_v5(
        openssl::ssl::SslMethod::tls_server(),
    )
    .unwrap();
    builder.set_private_key(&CERTIFICATE_PRIVATE_KEY).unwrap();
    builder.set_certificate(&CERTIFICATE).unwrap();
    Arc::new(builder.build())
}

/// A connector which accepts the throwaway certificate.
pub fn ssl_connector() -> openssl::ssl::SslConnector {
    let mut builder =
        openssl::ssl::SslConnector::builder(openssl::ssl::SslMethod::tls_client())
            .unwrap();
    builder.set_verify(openssl::ssl::SslVerifyMode::NONE);
    builder.build()
}
