// Copyright (c) 2026 verse contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use base64::engine::{general_purpose::STANDARD as Base64, Engine as _};
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2;
use sha1::{Digest, Sha1};

use crate::client::{Mechanism, MechanismError};
use crate::common::{fresh_nonce, xor_in_place, Credentials};

type HmacSha1 = Hmac<Sha1>;

/// SCRAM-SHA-1, RFC 5802.
///
/// Unlike the single-shot mechanisms this one carries state across the
/// exchange: the client nonce and first-message-bare feed the auth message,
/// and the server signature computed during the challenge round is what the
/// final `<success/>` payload is checked against. A mismatching signature
/// means the server does not actually know the password and must fail
/// authentication even though the server said "success".
pub struct ScramSha1 {
    priority: u8,
    cnonce: Option<String>,
    client_first_bare: Option<String>,
    server_signature: Option<Vec<u8>>,
}

impl ScramSha1 {
    /// Creates the mechanism; `priority` defaults to 50.
    pub fn new(priority: Option<u8>) -> ScramSha1 {
        ScramSha1 {
            priority: priority.unwrap_or(50),
            cnonce: None,
            client_first_bare: None,
            server_signature: None,
        }
    }
}

/// `,` and `=` are the protocol's field separators and must be escaped in
/// the username (RFC 5802 §5.1).
fn escape_username(name: &str) -> String {
    name.replace('=', "=3D").replace(',', "=2C")
}

/// Splits `k=v,k=v` at the first `=` of each field; values may contain `=`.
fn field<'x>(message: &'x str, key: &str) -> Option<&'x str> {
    message.split(',').find_map(|part| {
        let (k, v) = part.split_once('=')?;
        (k == key).then_some(v)
    })
}

fn hmac_sha1(key: &[u8], data: &[u8]) -> Result<Vec<u8>, MechanismError> {
    let mut mac = HmacSha1::new_from_slice(key).map_err(|_| MechanismError::Crypto)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

impl Mechanism for ScramSha1 {
    fn name(&self) -> &'static str {
        "SCRAM-SHA-1"
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

    fn initial(&mut self, creds: &Credentials) -> Result<Vec<u8>, MechanismError> {
        let authcid = creds
            .authcid
            .as_deref()
            .ok_or(MechanismError::MissingCredentials("authcid"))?;
        let cnonce = match &self.cnonce {
            Some(cnonce) => cnonce.clone(),
            None => {
                let cnonce = fresh_nonce()?;
                self.cnonce = Some(cnonce.clone());
                cnonce
            }
        };
        let bare = format!("n={},r={}", escape_username(authcid), cnonce);
        let payload = format!("n,,{}", bare);
        self.client_first_bare = Some(bare);
        Ok(payload.into_bytes())
    }

    fn response(
        &mut self,
        creds: &Credentials,
        challenge: &[u8],
    ) -> Result<Vec<u8>, MechanismError> {
        let password = creds
            .password
            .as_deref()
            .ok_or(MechanismError::MissingCredentials("password"))?;
        let cnonce = self
            .cnonce
            .as_deref()
            .ok_or(MechanismError::InvalidChallenge("challenge before client-first"))?;
        let client_first_bare = self
            .client_first_bare
            .as_deref()
            .ok_or(MechanismError::InvalidChallenge("challenge before client-first"))?;

        let server_first = core::str::from_utf8(challenge)
            .map_err(|_| MechanismError::InvalidChallenge("server-first is not UTF-8"))?;
        let nonce = field(server_first, "r")
            .ok_or(MechanismError::InvalidChallenge("server-first has no nonce"))?;
        let salt = field(server_first, "s")
            .ok_or(MechanismError::InvalidChallenge("server-first has no salt"))?;
        let iterations: u32 = field(server_first, "i")
            .ok_or(MechanismError::InvalidChallenge("server-first has no iteration count"))?
            .parse()
            .map_err(|_| MechanismError::InvalidChallenge("iteration count is not a number"))?;

        if !nonce.starts_with(cnonce) {
            return Err(MechanismError::NonceMismatch);
        }
        let salt = Base64
            .decode(salt)
            .map_err(|_| MechanismError::InvalidChallenge("salt is not base64"))?;

        let mut salted_password = [0u8; 20];
        pbkdf2::<HmacSha1>(password.as_bytes(), &salt, iterations, &mut salted_password)
            .map_err(|_| MechanismError::Crypto)?;

        let client_key = hmac_sha1(&salted_password, b"Client Key")?;
        let server_key = hmac_sha1(&salted_password, b"Server Key")?;
        let stored_key = Sha1::digest(&client_key);

        let client_final_bare = format!("c=biws,r={}", nonce);
        let auth_message = format!("{},{},{}", client_first_bare, server_first, client_final_bare);

        let client_signature = hmac_sha1(&stored_key, auth_message.as_bytes())?;
        let mut client_proof = client_key;
        xor_in_place(&mut client_proof, &client_signature);

        self.server_signature = Some(hmac_sha1(&server_key, auth_message.as_bytes())?);

        Ok(format!("{},p={}", client_final_bare, Base64.encode(client_proof)).into_bytes())
    }

    fn success(&mut self, _creds: &Credentials, data: &[u8]) -> Result<(), MechanismError> {
        let Some(expected) = self.server_signature.take() else {
            // Nothing stashed: the server short-circuited to success before
            // any challenge round; there is nothing to verify.
            return Ok(());
        };
        let message = core::str::from_utf8(data)
            .map_err(|_| MechanismError::ServerSignatureMismatch)?;
        let verifier = field(message, "v").ok_or(MechanismError::ServerSignatureMismatch)?;
        let verifier = Base64
            .decode(verifier)
            .map_err(|_| MechanismError::ServerSignatureMismatch)?;
        if verifier != expected {
            return Err(MechanismError::ServerSignatureMismatch);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The exchange from RFC 5802 §5.
    const CNONCE: &str = "fyko+d2lbbFgONRv9qkxdawL";
    const SERVER_FIRST: &[u8] =
        b"r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,s=QSXCR+Q6sek8bf92,i=4096";

    fn creds() -> Credentials {
        Credentials::new().with_authcid("user").with_password("pencil")
    }

    fn pinned() -> ScramSha1 {
        let mut mech = ScramSha1::new(None);
        mech.cnonce = Some(CNONCE.to_string());
        mech
    }

    #[test]
    fn client_first_message() {
        let mut mech = pinned();
        assert_eq!(
            mech.initial(&creds()).unwrap(),
            b"n,,n=user,r=fyko+d2lbbFgONRv9qkxdawL".to_vec()
        );
    }

    #[test]
    fn client_final_message_matches_rfc_vector() {
        let mut mech = pinned();
        mech.initial(&creds()).unwrap();
        let response = mech.response(&creds(), SERVER_FIRST).unwrap();
        assert_eq!(
            response,
            b"c=biws,r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,p=v0X8v3Bz2T0CJGbJQyF0X+HI4Ts="
                .to_vec()
        );
    }

    #[test]
    fn server_signature_verifies() {
        let mut mech = pinned();
        mech.initial(&creds()).unwrap();
        mech.response(&creds(), SERVER_FIRST).unwrap();
        assert_eq!(
            mech.success(&creds(), b"v=rmF9pqV8S7suAoZWja4dJRkFsKQ="),
            Ok(())
        );
    }

    #[test]
    fn forged_server_signature_is_rejected() {
        let mut mech = pinned();
        mech.initial(&creds()).unwrap();
        mech.response(&creds(), SERVER_FIRST).unwrap();
        assert_eq!(
            mech.success(&creds(), b"v=AAAAAAAAAAAAAAAAAAAAAAAAAAA="),
            Err(MechanismError::ServerSignatureMismatch)
        );
    }

    #[test]
    fn tampered_server_nonce_is_rejected() {
        let mut mech = pinned();
        mech.initial(&creds()).unwrap();
        let err = mech
            .response(&creds(), b"r=evil-nonce,s=QSXCR+Q6sek8bf92,i=4096")
            .unwrap_err();
        assert_eq!(err, MechanismError::NonceMismatch);
    }

    #[test]
    fn username_escaping() {
        assert_eq!(escape_username("a=b,c"), "a=3Db=2Cc");
    }
}
