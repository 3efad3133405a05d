// Copyright (c) 2026 verse contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The client-side mechanism contract and the mechanism registry.

use core::fmt;
use std::error::Error as StdError;

use crate::common::Credentials;

pub mod mechanisms;

/// A SASL mechanism failure, local to the client.
///
/// These are distinct from an authentication failure reported by the server:
/// a `MechanismError` means the exchange cannot even be continued.
#[derive(Debug, PartialEq, Eq)]
pub enum MechanismError {
    /// A credential field the mechanism requires is unset.
    MissingCredentials(&'static str),
    /// The OS random source failed.
    RandomFailure,
    /// The server's challenge could not be interpreted.
    InvalidChallenge(&'static str),
    /// The server echoed a nonce which does not extend ours.
    NonceMismatch,
    /// The server's final proof does not match the expected signature.
    ServerSignatureMismatch,
    /// A key or digest operation failed.
    Crypto,
}

impl fmt::Display for MechanismError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MechanismError::MissingCredentials(field) => {
                write!(fmt, "missing credentials: {}", field)
            }
            MechanismError::RandomFailure => write!(fmt, "random source failure"),
            MechanismError::InvalidChallenge(what) => write!(fmt, "invalid challenge: {}", what),
            MechanismError::NonceMismatch => write!(fmt, "server nonce does not extend ours"),
            MechanismError::ServerSignatureMismatch => {
                write!(fmt, "server signature verification failed")
            }
            MechanismError::Crypto => write!(fmt, "cryptographic operation failed"),
        }
    }
}

impl StdError for MechanismError {}

/// A SASL mechanism, from the initiating side.
///
/// Mechanisms are stateful across one authentication attempt: SCRAM keeps
/// its nonce and the expected server signature between steps, DIGEST-MD5
/// remembers that it already answered the digest challenge. A fresh value
/// must be created for every attempt, which is why the registry stores
/// factories rather than instances.
pub trait Mechanism {
    /// The mechanism name as advertised in stream features.
    fn name(&self) -> &'static str;

    /// Selection priority; higher wins. Ties keep registration order.
    fn priority(&self) -> u8;

    /// Whether the mechanism sends an initial payload in `<auth/>`.
    fn client_first(&self) -> bool;

    /// Whether the credentials at hand satisfy this mechanism.
    fn test(&self, creds: &Credentials) -> bool;

    /// The client-first payload. Only called when [`client_first`] is true.
    ///
    /// [`client_first`]: Mechanism::client_first
    fn initial(&mut self, _creds: &Credentials) -> Result<Vec<u8>, MechanismError> {
        Ok(Vec::new())
    }

    /// Responds to a server challenge.
    fn response(&mut self, creds: &Credentials, challenge: &[u8])
        -> Result<Vec<u8>, MechanismError>;

    /// Consumes the payload of the server's success report.
    ///
    /// Mechanisms which expect a final server proof verify it here; an error
    /// return must be treated like an authentication failure.
    fn success(&mut self, _creds: &Credentials, _data: &[u8]) -> Result<(), MechanismError> {
        Ok(())
    }

    /// Invoked when the server reports authentication failure.
    fn failure(&mut self) {}
}

/// Creates a fresh mechanism value for one authentication attempt.
pub type MechanismFactory = Box<dyn Fn() -> Box<dyn Mechanism + Send> + Send + Sync>;

/// The default mechanism set with default priorities.
pub fn default_mechanisms() -> Vec<MechanismFactory> {
    use self::mechanisms::{
        Anonymous, DigestMd5, External, OAuthBearer, Plain, ScramSha1, XOAuth2,
    };
    vec![
        Box::new(|| Box::new(ScramSha1::new(None))),
        Box::new(|| Box::new(Plain::new(None))),
        Box::new(|| Box::new(OAuthBearer::new(None))),
        Box::new(|| Box::new(DigestMd5::new(None))),
        Box::new(|| Box::new(XOAuth2::new(None))),
        Box::new(|| Box::new(Anonymous::new(None))),
        Box::new(|| Box::new(External::new(None))),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_set_is_complete() {
        let names: Vec<&str> = default_mechanisms()
            .iter()
            .map(|factory| factory().name())
            .collect();
        assert_eq!(
            names,
            [
                "SCRAM-SHA-1",
                "PLAIN",
                "OAUTHBEARER",
                "DIGEST-MD5",
                "X-OAUTH2",
                "ANONYMOUS",
                "EXTERNAL",
            ]
        );
    }

    #[test]
    fn default_priorities() {
        let mut prio: Vec<(&str, u8)> = default_mechanisms()
            .iter()
            .map(|factory| {
                let m = factory();
                (m.name(), m.priority())
            })
            .collect();
        prio.sort_by(|a, b| b.1.cmp(&a.1));
        assert_eq!(
            prio,
            [
                ("PLAIN", 70),
                ("OAUTHBEARER", 60),
                ("SCRAM-SHA-1", 50),
                ("DIGEST-MD5", 40),
                ("X-OAUTH2", 30),
                ("ANONYMOUS", 20),
                ("EXTERNAL", 10),
            ]
        );
    }
}
