// Copyright (c) 2026 verse contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use crate::client::{Mechanism, MechanismError};
use crate::common::Credentials;

/// OAUTHBEARER, RFC 7628. The password field carries the bearer token.
pub struct OAuthBearer {
    priority: u8,
}

impl OAuthBearer {
    /// Creates the mechanism; `priority` defaults to 60.
    pub fn new(priority: Option<u8>) -> OAuthBearer {
        OAuthBearer {
            priority: priority.unwrap_or(60),
        }
    }
}

impl Mechanism for OAuthBearer {
    fn name(&self) -> &'static str {
        "OAUTHBEARER"
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

    /// GS2 header naming the authzid, then the `auth` key/value block framed
    /// by 0x01 separators.
    fn initial(&mut self, creds: &Credentials) -> Result<Vec<u8>, MechanismError> {
        let token = creds
            .password
            .as_deref()
            .ok_or(MechanismError::MissingCredentials("password"))?;
        let authzid = creds.authzid.as_deref().unwrap_or("");
        Ok(format!("n,a={},\x01auth=Bearer {}\x01\x01", authzid, token).into_bytes())
    }

    fn response(
        &mut self,
        _creds: &Credentials,
        _challenge: &[u8],
    ) -> Result<Vec<u8>, MechanismError> {
        Ok(Vec::new())
    }
}
