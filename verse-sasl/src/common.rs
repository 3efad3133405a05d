// Copyright (c) 2026 verse contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Data shared by all mechanisms.

use core::fmt::Write;

use md5::{Digest, Md5};

use crate::client::MechanismError;

/// The credentials a mechanism may draw on.
///
/// Every field is optional; each mechanism's [`test`][`crate::Mechanism::test`]
/// states which fields it requires. For an XMPP connection, `authcid` is the
/// node part of the JID, `authzid` the bare JID, and `service` the domain.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Credentials {
    /// Authentication identity (who is logging in).
    pub authcid: Option<String>,
    /// Authorization identity (who to act as).
    pub authzid: Option<String>,
    /// The shared secret, or a bearer token for the OAuth mechanisms.
    pub password: Option<String>,
    /// The host the service runs on, for mechanisms which bind to it.
    pub service: Option<String>,
}

impl Credentials {
    /// Creates an empty set of credentials.
    pub fn new() -> Credentials {
        Credentials::default()
    }

    /// Sets the authentication identity.
    pub fn with_authcid<S: Into<String>>(mut self, authcid: S) -> Credentials {
        self.authcid = Some(authcid.into());
        self
    }

    /// Sets the authorization identity.
    pub fn with_authzid<S: Into<String>>(mut self, authzid: S) -> Credentials {
        self.authzid = Some(authzid.into());
        self
    }

    /// Sets the password.
    pub fn with_password<S: Into<String>>(mut self, password: S) -> Credentials {
        self.password = Some(password.into());
        self
    }

    /// Sets the service host.
    pub fn with_service<S: Into<String>>(mut self, service: S) -> Credentials {
        self.service = Some(service.into());
        self
    }
}

/// Lowercase hex encoding, as used in DIGEST-MD5 and for nonces.
pub(crate) fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        // Writing to a String cannot fail.
        let _ = write!(out, "{:02x}", b);
    }
    out
}

/// In-place XOR of `lhs` with `rhs`; both slices must have equal length.
pub(crate) fn xor_in_place(lhs: &mut [u8], rhs: &[u8]) {
    debug_assert_eq!(lhs.len(), rhs.len());
    for (l, r) in lhs.iter_mut().zip(rhs.iter()) {
        *l ^= r;
    }
}

/// A fresh client nonce: the MD5 hex digest of 16 random bytes.
pub(crate) fn fresh_nonce() -> Result<String, MechanismError> {
    let mut seed = [0u8; 16];
    getrandom::getrandom(&mut seed).map_err(|_| MechanismError::RandomFailure)?;
    Ok(to_hex(&Md5::digest(seed)))
}
