// Copyright (c) 2026 verse contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use crate::client::{Mechanism, MechanismError};
use crate::common::Credentials;

/// PLAIN, RFC 4616. Ships the password in the clear; the transport layer is
/// expected to provide confidentiality.
pub struct Plain {
    priority: u8,
}

impl Plain {
    /// Creates the mechanism; `priority` defaults to 70.
    pub fn new(priority: Option<u8>) -> Plain {
        Plain {
            priority: priority.unwrap_or(70),
        }
    }
}

impl Mechanism for Plain {
    fn name(&self) -> &'static str {
        "PLAIN"
    }

    fn priority(&self) -> u8 {
        self.priority
    }

    fn client_first(&self) -> bool {
        true
    }

    fn test(&self, creds: &Credentials) -> bool {
        creds.authcid.is_some()
    }

    /// `authzid NUL authcid NUL password`, all UTF-8.
    fn initial(&mut self, creds: &Credentials) -> Result<Vec<u8>, MechanismError> {
        let authcid = creds
            .authcid
            .as_deref()
            .ok_or(MechanismError::MissingCredentials("authcid"))?;
        let password = creds
            .password
            .as_deref()
            .ok_or(MechanismError::MissingCredentials("password"))?;

        let mut payload = Vec::new();
        if let Some(authzid) = &creds.authzid {
            payload.extend_from_slice(authzid.as_bytes());
        }
        payload.push(0);
        payload.extend_from_slice(authcid.as_bytes());
        payload.push(0);
        payload.extend_from_slice(password.as_bytes());
        Ok(payload)
    }

    fn response(
        &mut self,
        _creds: &Credentials,
        _challenge: &[u8],
    ) -> Result<Vec<u8>, MechanismError> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_layout() {
        let creds = Credentials::new()
            .with_authcid("user")
            .with_authzid("user@example.org")
            .with_password("secret");
        let mut mech = Plain::new(None);
        assert_eq!(
            mech.initial(&creds).unwrap(),
            b"user@example.org\x00user\x00secret".to_vec()
        );
    }

    #[test]
    fn missing_password_is_an_error() {
        let creds = Credentials::new().with_authcid("user");
        let mut mech = Plain::new(None);
        assert_eq!(
            mech.initial(&creds).unwrap_err(),
            MechanismError::MissingCredentials("password")
        );
    }
}
