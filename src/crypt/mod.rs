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

//! The boundary to the message encryption collaborator.
//!
//! Mailgate does not manage keys itself. Whatever does is reached through the
//! `Crypto` trait; the in-process implementation only recognises protected
//! messages so that routing can decide whether decryption would apply.

use lazy_static::lazy_static;
use regex::bytes::Regex;

use crate::mime::header::Headers;

pub trait Crypto: Send + Sync {
    /// Encrypt `message` in place. Returns whether anything was done.
    fn encrypt(&self, message: &mut Vec<u8>) -> bool;
    /// Decrypt `message` in place. Returns whether anything was done.
    fn decrypt(&self, message: &mut Vec<u8>) -> bool;
    fn sign(&self, message: &mut Vec<u8>) -> bool;
    fn sign_encrypt(&self, message: &mut Vec<u8>) -> bool;
    /// Whether `message` carries a signature.
    fn check_signed(&self, message: &[u8]) -> bool;
    /// Whether `message` is encrypted.
    fn check_crypted(&self, message: &[u8]) -> bool;
}

lazy_static! {
    static ref ARMOR_MESSAGE: Regex =
        Regex::new("(?m)^-----BEGIN PGP MESSAGE-----\r?$").unwrap();
    static ref ARMOR_SIGNED: Regex =
        Regex::new("(?m)^-----BEGIN PGP SIGNED MESSAGE-----\r?$").unwrap();
    static ref MULTIPART_ENCRYPTED: regex::Regex =
        regex::Regex::new("(?i)^\\s*multipart/encrypted\\s*(;|$)").unwrap();
    static ref MULTIPART_SIGNED: regex::Regex =
        regex::Regex::new("(?i)^\\s*multipart/signed\\s*(;|$)").unwrap();
}

/// A `Crypto` that transforms nothing but can still tell whether a message is
/// protected.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoCrypto;

impl NoCrypto {
    fn content_type_matches(message: &[u8], re: &regex::Regex) -> bool {
        Headers::parse(message)
            .get("Content-Type")
            .map_or(false, |ct| re.is_match(ct))
    }
}

impl Crypto for NoCrypto {
    fn encrypt(&self, _: &mut Vec<u8>) -> bool {
        false
    }

    fn decrypt(&self, _: &mut Vec<u8>) -> bool {
        false
    }

    fn sign(&self, _: &mut Vec<u8>) -> bool {
        false
    }

    fn sign_encrypt(&self, _: &mut Vec<u8>) -> bool {
        false
    }

    fn check_signed(&self, message: &[u8]) -> bool {
        ARMOR_SIGNED.is_match(message)
            || Self::content_type_matches(message, &MULTIPART_SIGNED)
    }

    fn check_crypted(&self, message: &[u8]) -> bool {
        ARMOR_MESSAGE.is_match(message)
            || Self::content_type_matches(message, &MULTIPART_ENCRYPTED)
    }
}
