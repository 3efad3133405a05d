// Copyright (c) 2026 verse contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use crate::client::{Mechanism, MechanismError};
use crate::common::Credentials;

/// EXTERNAL, RFC 4422 appendix A. Authentication happens out of band
/// (typically via the TLS client certificate); the payload only names the
/// identity to authorize as, and only when it differs from the
/// authentication identity.
pub struct External {
    priority: u8,
}

impl External {
    /// Creates the mechanism; `priority` defaults to 10.
    pub fn new(priority: Option<u8>) -> External {
        External {
            priority: priority.unwrap_or(10),
        }
    }
}

impl Mechanism for External {
    fn name(&self) -> &'static str {
        "EXTERNAL"
    }

    fn priority(&self) -> u8 {
        self.priority
    }

    fn client_first(&self) -> bool {
        true
    }

    fn test(&self, _creds: &Credentials) -> bool {
        true
    }

    fn initial(&mut self, creds: &Credentials) -> Result<Vec<u8>, MechanismError> {
        if creds.authcid != creds.authzid {
            if let Some(authzid) = &creds.authzid {
                return Ok(authzid.clone().into_bytes());
            }
        }
        Ok(Vec::new())
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
    fn authzid_sent_only_when_distinct() {
        let mut mech = External::new(None);
        let creds = Credentials::new()
            .with_authcid("romeo")
            .with_authzid("romeo@montague.example");
        assert_eq!(
            mech.initial(&creds).unwrap(),
            b"romeo@montague.example".to_vec()
        );

        let same = Credentials::new()
            .with_authcid("romeo@montague.example")
            .with_authzid("romeo@montague.example");
        assert_eq!(mech.initial(&same).unwrap(), Vec::<u8>::new());
    }
}
