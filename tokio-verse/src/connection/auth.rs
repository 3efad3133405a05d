// Copyright (c) 2026 verse contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The authentication driver: SASL negotiation, the legacy jabber:iq:auth
//! fallback, resource binding and session establishment.

use base64::engine::{general_purpose::STANDARD as Base64, Engine as _};
use jid::Jid;
use minidom::Element;

use verse_sasl::{Credentials, Mechanism};

use crate::error::{condition, AuthError, ProtocolError};
use crate::handler::{HandlerRef, Match};
use crate::ns;
use crate::stanza::{iq, Builder};
use crate::transport::TransportCtx;

use super::{Connection, Status};

const BIND_ID: &str = "_bind_auth_2";
const SESSION_ID: &str = "_session_auth_2";
const LEGACY_GET_ID: &str = "_auth_1";
const LEGACY_SET_ID: &str = "_auth_2";

/// The resource requested by legacy authentication when the JID has none.
const DEFAULT_RESOURCE: &str = "verse";

/// State of one SASL attempt: the live mechanism and the three system
/// handlers watching for its outcome.
pub(crate) struct SaslSession {
    mech: Box<dyn Mechanism + Send>,
    success_handler: HandlerRef,
    failure_handler: HandlerRef,
    challenge_handler: HandlerRef,
}

impl Connection {
    fn credentials(&self) -> Credentials {
        Credentials {
            authcid: self.authcid.clone(),
            authzid: self.authzid.clone(),
            password: self.pass.clone(),
            service: self.domain.clone(),
        }
    }

    /// Handles the response that establishes the stream: inspects it for a
    /// fatal termination, extracts the stream features and starts
    /// authentication.
    pub(crate) fn connect_cb(&mut self, body: Element, raw: Option<&str>) {
        log::debug!("connect_cb was called");
        self.run_input_hooks(&body, raw);

        let failed = self
            .transport
            .as_ref()
            .and_then(|t| t.connect_fail_condition(&body))
            .is_some();
        if failed {
            let cond = Self::terminate_condition(&body);
            log::error!("connection attempt terminated by the server: {}", cond);
            self.change_status(Status::ConnFail, Some(&cond), Some(&body));
            self.do_disconnect(Some(&cond));
            return;
        }

        let features = if body.name() == "features" {
            Some(body.clone())
        } else {
            body.children()
                .find(|child| child.name() == "features")
                .cloned()
        };
        let Some(features) = features else {
            let retried = match self.transport.as_mut() {
                Some(transport) => transport.no_auth_received(ctx!(self)),
                None => false,
            };
            if !retried {
                log::error!("{}", AuthError::NoMechanism);
                self.change_status(Status::ConnFail, Some(condition::NO_AUTH_MECH), None);
                self.do_disconnect(Some(condition::NO_AUTH_MECH));
            }
            return;
        };

        self.connected = true;
        self.features = Some(features.clone());
        if !self.do_authentication {
            return;
        }

        let offered: Vec<String> = features
            .children()
            .filter(|child| child.name() == "mechanisms")
            .flat_map(|mechs| mechs.children())
            .filter(|child| child.name() == "mechanism")
            .map(|child| child.text())
            .collect();
        log::debug!("server offers SASL mechanisms {:?}", offered);
        self.authenticate(&offered);
    }

    /// Picks the best registered mechanism the server offers, or falls back
    /// to legacy authentication where the server advertises it.
    pub(crate) fn authenticate(&mut self, offered: &[String]) {
        let creds = self.credentials();
        let mut candidates: Vec<Box<dyn Mechanism + Send>> =
            self.mechanisms.iter().map(|factory| factory()).collect();
        // Stable: ties keep registration order.
        candidates.sort_by(|a, b| b.priority().cmp(&a.priority()));
        let chosen = candidates
            .into_iter()
            .find(|m| offered.iter().any(|o| o == m.name()) && m.test(&creds));

        if let Some(mech) = chosen {
            self.sasl_auth(mech);
            return;
        }

        let legacy_offered = self
            .features
            .as_ref()
            .map_or(false, |f| f.children().any(|child| child.name() == "auth"));
        if legacy_offered {
            self.attempt_legacy_auth();
        } else {
            log::error!("{}", AuthError::NoMechanism);
            self.change_status(Status::ConnFail, Some(condition::NO_AUTH_MECH), None);
            self.do_disconnect(Some(condition::NO_AUTH_MECH));
        }
    }

    fn sasl_auth(&mut self, mut mech: Box<dyn Mechanism + Send>) {
        let name = mech.name();
        log::debug!("attempting SASL {}", name);
        self.change_status(Status::Authenticating, None, None);

        let mut auth = Builder::new("auth", &[("xmlns", ns::SASL), ("mechanism", name)]);
        if mech.client_first() {
            let creds = self.credentials();
            match mech.initial(&creds) {
                // A zero-length initial response is "=" on the wire.
                Ok(payload) if payload.is_empty() => auth = auth.t("="),
                Ok(payload) => auth = auth.t(&Base64.encode(payload)),
                Err(e) => {
                    log::error!("SASL {} could not start: {}", name, AuthError::from(e));
                    self.change_status(Status::AuthFail, None, None);
                    self.disconnect(None);
                    return;
                }
            }
        }

        let success_handler = self.add_sys_handler(
            Match::any().ns(ns::SASL).name("success"),
            Box::new(|conn, elem| {
                conn.sasl_success_cb(elem);
                false
            }),
        );
        let failure_handler = self.add_sys_handler(
            Match::any().ns(ns::SASL).name("failure"),
            Box::new(|conn, elem| {
                conn.sasl_failure_cb(Some(elem));
                false
            }),
        );
        let challenge_handler = self.add_sys_handler(
            Match::any().ns(ns::SASL).name("challenge"),
            Box::new(|conn, elem| {
                conn.sasl_challenge_cb(elem);
                true
            }),
        );
        self.sasl = Some(SaslSession {
            mech,
            success_handler,
            failure_handler,
            challenge_handler,
        });
        self.send(auth);
    }

    fn sasl_challenge_cb(&mut self, elem: &Element) {
        let challenge = match Base64.decode(elem.text().trim()) {
            Ok(challenge) => challenge,
            Err(e) => {
                log::warn!("SASL challenge is not valid base64: {}", e);
                self.sasl_failure_cb(None);
                return;
            }
        };
        let creds = self.credentials();
        let Some(mut session) = self.sasl.take() else {
            return;
        };
        match session.mech.response(&creds, &challenge) {
            Ok(payload) => {
                self.sasl = Some(session);
                let mut response = Builder::new("response", &[("xmlns", ns::SASL)]);
                if !payload.is_empty() {
                    response = response.t(&Base64.encode(payload));
                }
                self.send(response);
            }
            Err(e) => {
                self.sasl = Some(session);
                log::error!("SASL challenge handling failed: {}", AuthError::from(e));
                self.sasl_failure_cb(None);
            }
        }
    }

    fn sasl_success_cb(&mut self, elem: &Element) {
        let data = Base64.decode(elem.text().trim()).unwrap_or_default();
        let creds = self.credentials();
        let Some(mut session) = self.sasl.take() else {
            return;
        };
        // SCRAM proves the server knew the password here; a bad proof is an
        // authentication failure even though the server said success.
        if let Err(e) = session.mech.success(&creds, &data) {
            log::error!(
                "SASL {} rejected the server's success: {}",
                session.mech.name(),
                AuthError::from(e)
            );
            self.sasl = Some(session);
            self.sasl_failure_cb(None);
            return;
        }
        log::info!("SASL authentication succeeded");

        let SaslSession {
            failure_handler,
            challenge_handler,
            ..
        } = session;
        self.delete_handler(failure_handler);
        self.delete_handler(challenge_handler);
        // The success handler removes itself by returning false.

        self.add_sys_handler(
            Match::any().name("features"),
            Box::new(|conn, elem| {
                conn.post_auth_features_cb(elem);
                false
            }),
        );
        self.send_restart();
    }

    fn sasl_failure_cb(&mut self, elem: Option<&Element>) {
        if let Some(session) = self.sasl.take() {
            let SaslSession {
                mut mech,
                success_handler,
                failure_handler,
                challenge_handler,
            } = session;
            self.delete_handler(success_handler);
            self.delete_handler(failure_handler);
            self.delete_handler(challenge_handler);
            mech.failure();
        }
        if let Some(elem) = elem {
            let cond = elem
                .children()
                .find(|child| child.name() != "text")
                .map(|child| child.name().to_string())
                .unwrap_or_else(|| condition::UNKNOWN.to_string());
            log::info!("{}", AuthError::Fail(cond));
        }
        self.change_status(Status::AuthFail, None, elem);
    }

    /// Handles the stream features seen after the post-SASL restart: note
    /// bind and session support, then bind the resource.
    fn post_auth_features_cb(&mut self, features: &Element) {
        self.features = Some(features.clone());
        self.do_bind = features.children().any(|child| child.name() == "bind");
        self.do_session = features.children().any(|child| child.name() == "session");

        if !self.do_bind {
            log::warn!("stream features after SASL are missing bind");
            self.change_status(Status::AuthFail, None, None);
            return;
        }

        let resource = self
            .jid
            .as_deref()
            .and_then(|jid| jid.parse::<Jid>().ok())
            .and_then(|jid| jid.resource().map(|r| r.to_string()));
        let mut bind = iq(&[("type", "set"), ("id", BIND_ID)]).c("bind", &[("xmlns", ns::BIND)]);
        if let Some(resource) = resource {
            bind = bind.c("resource", &[]).t(&resource);
        }
        self.add_sys_handler(
            Match::any().id(BIND_ID),
            Box::new(|conn, elem| {
                conn.on_resource_bind_iq(elem);
                false
            }),
        );
        self.send(bind);
    }

    fn on_resource_bind_iq(&mut self, elem: &Element) {
        if elem.attr("type") == Some("error") {
            log::warn!("resource binding failed");
            let conflict = elem.children().any(|child| {
                child.name() == "error" && child.children().any(|e| e.name() == "conflict")
            });
            let cond = conflict.then_some(condition::CONFLICT);
            self.change_status(Status::AuthFail, cond, Some(elem));
            return;
        }

        let bound = elem
            .children()
            .find(|child| child.name() == "bind")
            .and_then(|bind| bind.children().find(|child| child.name() == "jid"))
            .map(|jid| jid.text());
        match bound {
            Some(jid) if !jid.is_empty() => {
                log::debug!("bound as {}", jid);
                self.jid = Some(jid);
                if self.do_session {
                    self.add_sys_handler(
                        Match::any().id(SESSION_ID),
                        Box::new(|conn, elem| {
                            conn.on_session_result_iq(elem);
                            false
                        }),
                    );
                    self.send(
                        iq(&[("type", "set"), ("id", SESSION_ID)])
                            .c("session", &[("xmlns", ns::SESSION)]),
                    );
                } else {
                    self.finish_session();
                }
            }
            _ => {
                log::warn!("{}", ProtocolError::InvalidBindResponse);
                self.change_status(Status::AuthFail, None, Some(elem));
            }
        }
    }

    fn on_session_result_iq(&mut self, elem: &Element) {
        if elem.attr("type") == Some("result") {
            self.finish_session();
        } else {
            log::warn!("session establishment failed");
            self.change_status(Status::AuthFail, None, Some(elem));
        }
    }

    fn finish_session(&mut self) {
        self.authenticated = true;
        self.change_status(Status::Connected, None, None);
    }

    /// Pre-SASL jabber:iq:auth. Requires a JID with a node.
    fn attempt_legacy_auth(&mut self) {
        if self.authcid.is_none() {
            log::warn!("legacy authentication requires a JID with a node");
            self.change_status(Status::ConnFail, Some(condition::BAD_NON_ANON_JID), None);
            self.do_disconnect(Some(condition::BAD_NON_ANON_JID));
            return;
        }
        log::debug!("attempting legacy authentication");
        self.change_status(Status::Authenticating, None, None);

        let node = self.authcid.clone().unwrap_or_default();
        let domain = self.domain.clone().unwrap_or_default();
        self.add_sys_handler(
            Match::any().id(LEGACY_GET_ID),
            Box::new(|conn, elem| {
                conn.on_legacy_auth_fields(elem);
                false
            }),
        );
        self.send(
            iq(&[("type", "get"), ("to", domain.as_str()), ("id", LEGACY_GET_ID)])
                .c("query", &[("xmlns", ns::AUTH)])
                .c("username", &[])
                .t(&node),
        );
    }

    fn legacy_resource(&self) -> String {
        self.jid
            .as_deref()
            .and_then(|jid| jid.parse::<Jid>().ok())
            .and_then(|jid| jid.resource().map(|r| r.to_string()))
            .unwrap_or_else(|| DEFAULT_RESOURCE.to_string())
    }

    fn on_legacy_auth_fields(&mut self, _elem: &Element) {
        let node = self.authcid.clone().unwrap_or_default();
        let pass = self.pass.clone().unwrap_or_default();
        let resource = self.legacy_resource();
        self.add_sys_handler(
            Match::any().id(LEGACY_SET_ID),
            Box::new(|conn, elem| {
                conn.on_legacy_auth_result(elem);
                false
            }),
        );
        self.send(
            iq(&[("type", "set"), ("id", LEGACY_SET_ID)])
                .c("query", &[("xmlns", ns::AUTH)])
                .c("username", &[])
                .t(&node)
                .up()
                .c("password", &[])
                .t(&pass)
                .up()
                .c("resource", &[])
                .t(&resource),
        );
    }

    fn on_legacy_auth_result(&mut self, elem: &Element) {
        if elem.attr("type") == Some("result") {
            let bare = self.authzid.clone().unwrap_or_default();
            self.jid = Some(format!("{}/{}", bare, self.legacy_resource()));
            self.finish_session();
        } else {
            log::warn!("legacy authentication failed");
            self.change_status(Status::AuthFail, None, Some(elem));
            self.disconnect(None);
        }
    }
}
