// Copyright (c) 2026 verse contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use md5::{Digest, Md5};

use crate::client::{Mechanism, MechanismError};
use crate::common::{fresh_nonce, to_hex, Credentials};

/// DIGEST-MD5, RFC 2831. Obsolete but still advertised by legacy servers.
///
/// Two-phase: the digest challenge is answered with the computed response,
/// the follow-up `rspauth` challenge with an empty payload.
pub struct DigestMd5 {
    priority: u8,
    cnonce: Option<String>,
    responded: bool,
}

impl DigestMd5 {
    /// Creates the mechanism; `priority` defaults to 40.
    pub fn new(priority: Option<u8>) -> DigestMd5 {
        DigestMd5 {
            priority: priority.unwrap_or(40),
            cnonce: None,
            responded: false,
        }
    }
}

/// Splits a digest challenge into key/value pairs, honouring quoted values.
fn parse_challenge(text: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut rest = text;
    loop {
        rest = rest.trim_start_matches([',', ' ']);
        if rest.is_empty() {
            break;
        }
        let Some(eq) = rest.find('=') else {
            break;
        };
        let key = rest[..eq].trim().to_string();
        rest = &rest[eq + 1..];
        let value;
        if let Some(tail) = rest.strip_prefix('"') {
            match tail.find('"') {
                Some(end) => {
                    value = tail[..end].to_string();
                    rest = &tail[end + 1..];
                }
                None => {
                    value = tail.to_string();
                    rest = "";
                }
            }
        } else {
            match rest.find(',') {
                Some(end) => {
                    value = rest[..end].to_string();
                    rest = &rest[end..];
                }
                None => {
                    value = rest.to_string();
                    rest = "";
                }
            }
        }
        pairs.push((key, value));
    }
    pairs
}

fn md5_hex(data: &[u8]) -> String {
    to_hex(&Md5::digest(data))
}

/// The response digest of RFC 2831 §2.1.2.1, for `qop=auth` and
/// `nc=00000001`. HA1 feeds the *raw* MD5 of the credential triple into the
/// next digest, not its hex form.
fn digest_response(
    username: &str,
    realm: &str,
    password: &str,
    nonce: &str,
    cnonce: &str,
    digest_uri: &str,
) -> String {
    let mut a1 = Md5::digest(format!("{}:{}:{}", username, realm, password)).to_vec();
    a1.extend_from_slice(format!(":{}:{}", nonce, cnonce).as_bytes());
    let ha1 = md5_hex(&a1);
    let ha2 = md5_hex(format!("AUTHENTICATE:{}", digest_uri).as_bytes());
    md5_hex(format!("{}:{}:00000001:{}:auth:{}", ha1, nonce, cnonce, ha2).as_bytes())
}

impl Mechanism for DigestMd5 {
    fn name(&self) -> &'static str {
        "DIGEST-MD5"
    }

    fn priority(&self) -> u8 {
        self.priority
    }

    fn client_first(&self) -> bool {
        false
    }

    fn test(&self, creds: &Credentials) -> bool {
        creds.authcid.is_some()
    }

    fn response(
        &mut self,
        creds: &Credentials,
        challenge: &[u8],
    ) -> Result<Vec<u8>, MechanismError> {
        let text = core::str::from_utf8(challenge)
            .map_err(|_| MechanismError::InvalidChallenge("digest challenge is not UTF-8"))?;
        let pairs = parse_challenge(text);
        let field = |key: &str| {
            pairs
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
        };

        // The second challenge carries the server's rspauth and is answered
        // with an empty payload.
        if self.responded || field("rspauth").is_some() {
            return Ok(Vec::new());
        }

        let authcid = creds
            .authcid
            .as_deref()
            .ok_or(MechanismError::MissingCredentials("authcid"))?;
        let password = creds
            .password
            .as_deref()
            .ok_or(MechanismError::MissingCredentials("password"))?;
        let host = creds
            .service
            .as_deref()
            .ok_or(MechanismError::MissingCredentials("service"))?;
        let nonce = field("nonce")
            .ok_or(MechanismError::InvalidChallenge("digest challenge has no nonce"))?
            .to_string();
        let realm = field("realm").unwrap_or("").to_string();

        let cnonce = match &self.cnonce {
            Some(cnonce) => cnonce.clone(),
            None => {
                let cnonce = fresh_nonce()?;
                self.cnonce = Some(cnonce.clone());
                cnonce
            }
        };
        let digest_uri = format!("xmpp/{}", host);
        let response = digest_response(authcid, &realm, password, &nonce, &cnonce, &digest_uri);

        self.responded = true;
        Ok(format!(
            "charset=utf-8,username=\"{}\",realm=\"{}\",nonce=\"{}\",nc=00000001,\
             cnonce=\"{}\",digest-uri=\"{}\",response={},qop=auth",
            authcid, realm, nonce, cnonce, digest_uri, response
        )
        .into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> Credentials {
        Credentials::new()
            .with_authcid("chris")
            .with_password("secret")
            .with_service("elwood.innosoft.com")
    }

    #[test]
    fn challenge_parser_handles_quotes() {
        let pairs = parse_challenge(
            "realm=\"elwood.innosoft.com\",nonce=\"OA6MG9tEQGm2hh\",qop=\"auth\",\
             algorithm=md5-sess,charset=utf-8",
        );
        assert_eq!(pairs[0], ("realm".into(), "elwood.innosoft.com".into()));
        assert_eq!(pairs[1], ("nonce".into(), "OA6MG9tEQGm2hh".into()));
        assert_eq!(pairs[4], ("charset".into(), "utf-8".into()));
    }

    #[test]
    fn rfc_2831_worked_example() {
        // RFC 2831 §4: chris/secret against elwood.innosoft.com with the
        // example's nonce pair and digest-uri "imap/elwood.innosoft.com".
        assert_eq!(
            digest_response(
                "chris",
                "elwood.innosoft.com",
                "secret",
                "OA6MG9tEQGm2hh",
                "OA6MHXh6VqTrRk",
                "imap/elwood.innosoft.com",
            ),
            "d388dad90d4bbd760a152321f2143af7"
        );
    }

    #[test]
    fn first_round_response() {
        let mut mech = DigestMd5::new(None);
        mech.cnonce = Some("OA6MHXh6VqTrRk".to_string());
        let out = mech
            .response(
                &creds(),
                b"realm=\"elwood.innosoft.com\",nonce=\"OA6MG9tEQGm2hh\",qop=\"auth\",\
                  algorithm=md5-sess,charset=utf-8",
            )
            .unwrap();
        let out = String::from_utf8(out).unwrap();
        assert!(out.contains("username=\"chris\""));
        assert!(out.contains("realm=\"elwood.innosoft.com\""));
        assert!(out.contains("nonce=\"OA6MG9tEQGm2hh\""));
        assert!(out.contains("cnonce=\"OA6MHXh6VqTrRk\""));
        assert!(out.contains("nc=00000001"));
        assert!(out.contains("digest-uri=\"xmpp/elwood.innosoft.com\""));
        assert!(out.contains("qop=auth"));
        // The digest itself must be the RFC-verified computation over the
        // mechanism's own xmpp/ digest-uri.
        let expected = digest_response(
            "chris",
            "elwood.innosoft.com",
            "secret",
            "OA6MG9tEQGm2hh",
            "OA6MHXh6VqTrRk",
            "xmpp/elwood.innosoft.com",
        );
        assert!(out.contains(&format!("response={},", expected)));
    }

    #[test]
    fn second_round_is_empty() {
        let mut mech = DigestMd5::new(None);
        let first = mech.response(
            &creds(),
            b"realm=\"x\",nonce=\"abc\",qop=\"auth\",charset=utf-8",
        );
        assert!(first.is_ok());
        let second = mech.response(&creds(), b"rspauth=ea40f60335c427b5527b84dbabcdfffd");
        assert_eq!(second.unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn rspauth_without_first_round_is_empty() {
        let mut mech = DigestMd5::new(None);
        let out = mech.response(&creds(), b"rspauth=ea40f60335c427b5527b84dbabcdfffd");
        assert_eq!(out.unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn challenge_without_nonce_is_rejected() {
        let mut mech = DigestMd5::new(None);
        let out = mech.response(&creds(), b"realm=\"x\",qop=\"auth\"");
        assert!(matches!(out, Err(MechanismError::InvalidChallenge(_))));
    }
}
