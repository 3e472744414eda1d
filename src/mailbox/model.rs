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

use std::fmt;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::prelude::*;
use openssl::hash::{hash, MessageDigest};
use serde::{Deserialize, Serialize};

use crate::mime::header::Headers;
use crate::support::error::Error;

/// How much of a message file is read to index its headers.
const HEADER_PROBE_SIZE: u64 = 64 * 1024;

/// The logical folders of a mailbox, each of which is a directory of the same
/// name.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Deserialize,
    Serialize,
)]
pub enum Folder {
    /// Mail received for the account.
    Msg,
    /// Delivery-status reports for mail the account sent.
    Bounced,
    /// Mail that could not be routed, and synthesised failure reports.
    Error,
    /// Mail waiting to be relayed to the outside.
    Out,
    /// Mail which has been relayed.
    Send,
}

impl Folder {
    pub const ALL: [Folder; 5] = [
        Folder::Msg,
        Folder::Bounced,
        Folder::Error,
        Folder::Out,
        Folder::Send,
    ];

    pub fn dir_name(self) -> &'static str {
        match self {
            Folder::Msg => "Msg",
            Folder::Bounced => "Bounced",
            Folder::Error => "Error",
            Folder::Out => "Out",
            Folder::Send => "Send",
        }
    }

    /// Whether the folder is visible to POP3 clients.
    pub fn is_inbound(self) -> bool {
        match self {
            Folder::Msg | Folder::Bounced | Folder::Error => true,
            Folder::Out | Folder::Send => false,
        }
    }
}

impl fmt::Display for Folder {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// One mail item in a mailbox.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Message {
    /// Sequence number within the mailbox, 1-based. Renumbered densely
    /// whenever the mailbox index is saved.
    pub id: u32,
    pub message_id: String,
    pub size: u64,
    pub from: String,
    pub subject: String,
    pub path: PathBuf,
    pub folder: Folder,
    pub read: bool,
    pub date: DateTime<Utc>,
}

impl Message {
    /// Index the message file at `path`.
    ///
    /// The returned message has id 0; the store assigns the real one.
    pub fn from_file(path: &Path, folder: Folder) -> Result<Self, Error> {
        let metadata = fs::metadata(path)?;
        let mut head = Vec::new();
        fs::File::open(path)?
            .take(HEADER_PROBE_SIZE)
            .read_to_end(&mut head)?;
        let headers = Headers::parse(&head);

        let message_id = match headers.get("Message-ID") {
            Some(id) if !id.is_empty() => id.to_owned(),
            _ => generated_message_id(&head)?,
        };

        let from = headers
            .addresses("From")
            .into_iter()
            .next()
            .map(|m| m.address)
            .or_else(|| headers.get("From").map(str::to_owned))
            .unwrap_or_default();

        let date = headers
            .date()
            .or_else(|| metadata.modified().ok().map(DateTime::<Utc>::from))
            .unwrap_or_else(Utc::now);

        Ok(Message {
            id: 0,
            message_id,
            size: metadata.len(),
            from,
            subject: headers.decoded("Subject").unwrap_or_default(),
            path: path.to_owned(),
            folder,
            read: false,
            date,
        })
    }

    /// The POP3 unique-id of this message: printable ASCII, at most 70
    /// characters, stable across renumbering.
    pub fn uidl(&self) -> String {
        let mut uid: String = self
            .message_id
            .chars()
            .filter(|&c| c > ' ' && c <= '~' && c != '<' && c != '>')
            .take(70)
            .collect();
        if uid.is_empty() {
            uid = format!("{}", self.id);
        }
        uid
    }
}

fn generated_message_id(content: &[u8]) -> Result<String, Error> {
    let digest = hash(MessageDigest::md5(), content)?;
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    Ok(format!("<{}@mailgate>", hex))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn index_message_file() {
        let root = tempfile::TempDir::new().unwrap();
        let path = root.path().join("a.eml");
        fs::write(
            &path,
            "From: Zim <zim@irk.example>\r\n\
             Subject: =?utf-8?Q?Doom_=E2=98=83?=\r\n\
             Date: Tue, 1 Jul 2003 10:52:37 +0200\r\n\
             \r\n\
             body\r\n",
        )
        .unwrap();

        let message = Message::from_file(&path, Folder::Msg).unwrap();
        assert_eq!("zim@irk.example", message.from);
        assert_eq!("Doom ☃", message.subject);
        assert_eq!(fs::metadata(&path).unwrap().len(), message.size);
        assert!(message.message_id.ends_with("@mailgate>"));
        assert_eq!(2003, message.date.year());

        let again = Message::from_file(&path, Folder::Msg).unwrap();
        assert_eq!(message.message_id, again.message_id);
        assert_eq!(32 + "@mailgate".len(), message.uidl().len());
    }

    #[test]
    fn folder_visibility() {
        let inbound: Vec<Folder> = Folder::ALL
            .iter()
            .copied()
            .filter(|f| f.is_inbound())
            .collect();
        assert_eq!(vec![Folder::Msg, Folder::Bounced, Folder::Error], inbound);
    }
}
