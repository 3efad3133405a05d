// Copyright (c) 2026 verse contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use crate::client::{Mechanism, MechanismError};
use crate::common::Credentials;

/// X-OAUTH2, the pre-OAUTHBEARER token scheme still offered by some servers.
/// The password field carries the access token.
pub struct XOAuth2 {
    priority: u8,
}

impl XOAuth2 {
    /// Creates the mechanism; `priority` defaults to 30.
    pub fn new(priority: Option<u8>) -> XOAuth2 {
        XOAuth2 {
            priority: priority.unwrap_or(30),
        }
    }
}

impl Mechanism for XOAuth2 {
    fn name(&self) -> &'static str {
        "X-OAUTH2"
    }

    fn priority(&self) -> u8 {
        self.priority
    }

    fn client_first(&self) -> bool {
        true
    }

    fn test(&self, creds: &Credentials) -> bool {
        creds.password.is_some()
    }

    /// `NUL authzid NUL token`.
    fn initial(&mut self, creds: &Credentials) -> Result<Vec<u8>, MechanismError> {
        let token = creds
            .password
            .as_deref()
            .ok_or(MechanismError::MissingCredentials("password"))?;

        let mut payload = vec![0u8];
        if let Some(authzid) = &creds.authzid {
            payload.extend_from_slice(authzid.as_bytes());
        }
        payload.push(0);
        payload.extend_from_slice(token.as_bytes());
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
            .with_authzid("user@example.org")
            .with_password("tok-123");
        let mut mech = XOAuth2::new(None);
        assert_eq!(
            mech.initial(&creds).unwrap(),
            b"\x00user@example.org\x00tok-123".to_vec()
        );
    }
}
