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
//! File helpers shared by the mailbox store and the proxy candidate lists.

use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use chrono::prelude::*;
use rand::{rngs::OsRng, Rng};

/// Atomically replace the file at `path` with `data`.
///
/// The data is staged in a temporary file in the same directory as `path`,
/// synced, and then renamed over the destination, so readers only ever see
/// the old or the new content.
pub fn spit(path: impl AsRef<Path>, mode: u32, data: &[u8]) -> io::Result<()> {
    let path = path.as_ref();
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tf = tempfile::NamedTempFile::new_in(dir)?;
    tf.as_file_mut().write_all(data)?;
    chmod(tf.path(), mode)?;
    tf.as_file_mut().sync_all()?;
    tf.persist(path).map_err(|e| e.error)?;
    Ok(())
}

pub fn chmod(path: impl AsRef<Path>, mode: u32) -> io::Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

/// Write `data` to a new `.eml` file within `dir` whose name does not
/// collide with anything already there.
///
/// Returns the path of the new file.
pub fn spool_new(dir: &Path, data: &[u8]) -> io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    loop {
        let name = format!(
            "{}.{:016x}.eml",
            Utc::now().format("%Y%m%d%H%M%S"),
            OsRng.gen::<u64>()
        );
        let dst = dir.join(name);

        let mut tf = tempfile::NamedTempFile::new_in(dir)?;
        tf.as_file_mut().write_all(data)?;
        tf.as_file_mut().sync_all()?;
        match tf.persist_noclobber(&dst) {
            Ok(_) => return Ok(dst),
            Err(e) if io::ErrorKind::AlreadyExists == e.error.kind() => {
                continue
            }
            Err(e) => return Err(e.error),
        }
    }
}

pub trait IgnoreKinds {
    fn ignore_not_found(self) -> Self;
}

impl<R: Default> IgnoreKinds for Result<R, io::Error> {
    fn ignore_not_found(self) -> Self {
        match self {
            Ok(r) => Ok(r),
            Err(e) if io::ErrorKind::NotFound == e.kind() => Ok(R::default()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn spit_replaces_atomically() {
        let root = tempfile::TempDir::new().unwrap();
        let path = root.path().join("file");

        spit(&path, 0o600, b"first").unwrap();
        spit(&path, 0o600, b"second").unwrap();
        assert_eq!(b"second".to_vec(), fs::read(&path).unwrap());
        assert_eq!(1, fs::read_dir(root.path()).unwrap().count());
    }

    #[test]
    fn spool_new_never_collides() {
        let root = tempfile::TempDir::new().unwrap();
        let dir = root.path().join("Msg");
        let a = spool_new(&dir, b"a").unwrap();
        let b = spool_new(&dir, b"b").unwrap();
        assert_ne!(a, b);
        assert_eq!(Some("eml"), a.extension().and_then(|e| e.to_str()));
        assert_eq!(b"b".to_vec(), fs::read(&b).unwrap());
    }

    #[test]
    fn ignore_not_found_swallows_only_missing() {
        let root = tempfile::TempDir::new().unwrap();
        fs::remove_file(root.path().join("nx")).ignore_not_found().unwrap();
        assert!(fs::remove_file(root.path()).ignore_not_found().is_err());
    }
}
