// Copyright (c) 2026 verse contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use crate::client::{Mechanism, MechanismError};
use crate::common::Credentials;

/// ANONYMOUS, RFC 4505. The server mints a throwaway identity.
pub struct Anonymous {
    priority: u8,
}

impl Anonymous {
    /// Creates the mechanism; `priority` defaults to 20.
    pub fn new(priority: Option<u8>) -> Anonymous {
        Anonymous {
            priority: priority.unwrap_or(20),
        }
    }
}

impl Mechanism for Anonymous {
    fn name(&self) -> &'static str {
        "ANONYMOUS"
    }

    fn priority(&self) -> u8 {
        self.priority
    }

    fn client_first(&self) -> bool {
        false
    }

    /// Only applicable when no authentication identity was configured.
    fn test(&self, creds: &Credentials) -> bool {
        creds.authcid.is_none()
    }

    fn response(
        &mut self,
        _creds: &Credentials,
        _challenge: &[u8],
    ) -> Result<Vec<u8>, MechanismError> {
        Ok(Vec::new())
    }
}
