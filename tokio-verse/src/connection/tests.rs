// Copyright (c) 2026 verse contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use core::time::Duration;

use base64::engine::{general_purpose::STANDARD as Base64, Engine as _};
use minidom::Element;

use verse_sasl::client::mechanisms::ScramSha1;
use verse_sasl::{Credentials, Mechanism, MechanismError};

use crate::error::{condition, Error};
use crate::handler::{HandlerCallback, Match};
use crate::ns;
use crate::session::{CachedSession, MemoryStore, SessionStore};
use crate::stanza::{iq, message, serialize};
use crate::transport::{
    Outbound, SessionParams, Transport, TransportAction, TransportCtx, TransportEvent,
};

use super::{Connection, IqCallback, Options, Status, StatusCallback};

// ---- harness -----------------------------------------------------------

/// What the mock transport observed.
#[derive(Default, Clone)]
struct Wire {
    sent: Arc<Mutex<Vec<String>>>,
    restarts: Arc<Mutex<u32>>,
    disconnects: Arc<Mutex<Vec<Option<String>>>>,
}

impl Wire {
    fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    fn last_sent(&self) -> Element {
        self.sent()
            .last()
            .expect("nothing was sent")
            .parse()
            .expect("sent stanza must parse")
    }
}

struct MockTransport {
    wire: Wire,
}

impl Transport for MockTransport {
    fn protocol(&self) -> &'static str {
        "HTTP"
    }

    fn connect(&mut self, _params: &SessionParams, _ctx: TransportCtx<'_>) -> Result<(), Error> {
        Ok(())
    }

    fn handle_event(
        &mut self,
        event: TransportEvent,
        _ctx: TransportCtx<'_>,
    ) -> Vec<TransportAction> {
        match event {
            TransportEvent::Raw(text) => match text.parse::<Element>() {
                Ok(body) => vec![TransportAction::Deliver { body, raw: text }],
                Err(_) => vec![TransportAction::BadFormat],
            },
            _ => Vec::new(),
        }
    }

    fn on_idle(&mut self, queue: &mut VecDeque<Outbound>, _ctx: TransportCtx<'_>) {
        while let Some(item) = queue.pop_front() {
            match item {
                Outbound::Stanza(stanza) => {
                    self.wire.sent.lock().unwrap().push(serialize(&stanza))
                }
                Outbound::Restart => *self.wire.restarts.lock().unwrap() += 1,
            }
        }
    }

    fn disconnect(&mut self, presence: Option<Element>, _ctx: TransportCtx<'_>) {
        self.wire
            .disconnects
            .lock()
            .unwrap()
            .push(presence.as_ref().map(serialize));
    }

    fn on_disconnect_timeout(&mut self) {}

    fn after_disconnect(&mut self) {}

    fn empty_queue(&self) -> bool {
        true
    }
}

type StatusLog = Arc<Mutex<Vec<(Status, Option<String>)>>>;

fn recorder() -> (StatusLog, StatusCallback) {
    let log: StatusLog = StatusLog::default();
    let sink = log.clone();
    let callback: StatusCallback = Box::new(move |_conn, status, cond, _elem| {
        sink.lock().unwrap().push((status, cond.map(str::to_string)));
    });
    (log, callback)
}

fn statuses(log: &StatusLog) -> Vec<Status> {
    log.lock().unwrap().iter().map(|(s, _)| *s).collect()
}

fn connecting_conn() -> (Connection, Wire, StatusLog) {
    let mut conn = Connection::new("https://example.org/http-bind", Options::default());
    let wire = Wire::default();
    conn.set_transport_for_tests(Box::new(MockTransport { wire: wire.clone() }));
    let (log, callback) = recorder();
    conn.connect("user@example.org", "secret", callback)
        .expect("connect");
    (conn, wire, log)
}

const FEATURES_PLAIN: &str = "<body xmlns='http://jabber.org/protocol/httpbind'>\
    <stream:features xmlns:stream='http://etherx.jabber.org/streams'>\
    <mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>\
    <mechanism>PLAIN</mechanism></mechanisms></stream:features></body>";

const FEATURES_SCRAM: &str = "<body xmlns='http://jabber.org/protocol/httpbind'>\
    <stream:features xmlns:stream='http://etherx.jabber.org/streams'>\
    <mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>\
    <mechanism>SCRAM-SHA-1</mechanism></mechanisms></stream:features></body>";

const FEATURES_EMPTY: &str = "<body xmlns='http://jabber.org/protocol/httpbind'>\
    <stream:features xmlns:stream='http://etherx.jabber.org/streams'/></body>";

const SASL_SUCCESS: &str = "<body xmlns='http://jabber.org/protocol/httpbind'>\
    <success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/></body>";

const FEATURES_BIND: &str = "<body xmlns='http://jabber.org/protocol/httpbind'>\
    <stream:features xmlns:stream='http://etherx.jabber.org/streams'>\
    <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/></stream:features></body>";

const BIND_RESULT: &str = "<body xmlns='http://jabber.org/protocol/httpbind'>\
    <iq xmlns='jabber:client' type='result' id='_bind_auth_2'>\
    <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'>\
    <jid>user@example.org/r1</jid></bind></iq></body>";

fn wrap(stanza: &str) -> String {
    format!(
        "<body xmlns='http://jabber.org/protocol/httpbind'>{}</body>",
        stanza
    )
}

/// Drives a connection through the full PLAIN + bind happy path.
fn authenticated_conn() -> (Connection, Wire, StatusLog) {
    let (mut conn, wire, log) = connecting_conn();
    conn.inject(FEATURES_PLAIN);
    conn.inject(SASL_SUCCESS);
    conn.inject(FEATURES_BIND);
    conn.inject(BIND_RESULT);
    assert!(conn.authenticated());
    (conn, wire, log)
}

// ---- connection establishment ------------------------------------------

#[tokio::test(start_paused = true)]
async fn plain_success_status_sequence() {
    let (mut conn, _wire, log) = connecting_conn();
    conn.inject(FEATURES_PLAIN);
    conn.inject(SASL_SUCCESS);
    conn.inject(FEATURES_BIND);
    conn.inject(BIND_RESULT);

    assert_eq!(
        statuses(&log),
        [Status::Connecting, Status::Authenticating, Status::Connected]
    );
    assert_eq!(conn.jid(), Some("user@example.org/r1"));
    assert!(conn.authenticated());
    assert!(conn.connected());
}

#[tokio::test(start_paused = true)]
async fn plain_auth_payload() {
    let (mut conn, wire, _log) = connecting_conn();
    conn.inject(FEATURES_PLAIN);

    let auth = wire.last_sent();
    assert!(auth.is("auth", ns::SASL));
    assert_eq!(auth.attr("mechanism"), Some("PLAIN"));
    let payload = Base64.decode(auth.text()).expect("payload is base64");
    assert_eq!(payload, b"user@example.org\x00user\x00secret".to_vec());
}

#[tokio::test(start_paused = true)]
async fn sasl_restart_and_bind_request() {
    let (mut conn, wire, _log) = connecting_conn();
    conn.inject(FEATURES_PLAIN);
    assert_eq!(*wire.restarts.lock().unwrap(), 0);
    conn.inject(SASL_SUCCESS);
    assert_eq!(*wire.restarts.lock().unwrap(), 1);

    conn.inject(FEATURES_BIND);
    let bind = wire.last_sent();
    assert!(bind.is("iq", ns::CLIENT));
    assert_eq!(bind.attr("id"), Some("_bind_auth_2"));
    assert_eq!(bind.attr("type"), Some("set"));
    assert!(bind.get_child("bind", ns::BIND).is_some());
}

#[tokio::test(start_paused = true)]
async fn no_auth_mech_disconnects() {
    let (mut conn, _wire, log) = connecting_conn();
    conn.inject(FEATURES_EMPTY);

    let log = log.lock().unwrap();
    assert_eq!(
        *log,
        vec![
            (Status::Connecting, None),
            (Status::ConnFail, Some(condition::NO_AUTH_MECH.to_string())),
            (
                Status::Disconnected,
                Some(condition::NO_AUTH_MECH.to_string())
            ),
        ]
    );
    drop(log);
    assert!(!conn.connected());
}

#[tokio::test(start_paused = true)]
async fn missing_features_without_retry_is_no_auth_mech() {
    let (mut conn, _wire, log) = connecting_conn();
    conn.inject("<body xmlns='http://jabber.org/protocol/httpbind'/>");
    assert_eq!(
        statuses(&log),
        [Status::Connecting, Status::ConnFail, Status::Disconnected]
    );
    assert!(!conn.connected());
}

#[tokio::test(start_paused = true)]
async fn terminate_body_is_a_connfail() {
    let (mut conn, _wire, log) = connecting_conn();
    conn.inject(FEATURES_PLAIN);
    conn.inject(
        "<body xmlns='http://jabber.org/protocol/httpbind' type='terminate' \
         condition='remote-stream-error'>\
         <stream:error xmlns:stream='http://etherx.jabber.org/streams'/></body>",
    );
    let recorded = log.lock().unwrap();
    assert!(recorded
        .iter()
        .any(|(s, c)| *s == Status::ConnFail && c.as_deref() == Some("remote-stream-error")));
    assert_eq!(recorded.last().unwrap().0, Status::Disconnected);
    drop(recorded);
    assert!(!conn.connected());
}

#[tokio::test(start_paused = true)]
async fn conflict_stream_error_is_normalized() {
    let body: Element =
        "<body xmlns='http://jabber.org/protocol/httpbind' type='terminate' \
         condition='remote-stream-error'>\
         <error xmlns='http://jabber.org/protocol/httpbind'>\
         <conflict xmlns='urn:ietf:params:xml:ns:xmpp-streams'/></error></body>"
            .parse()
            .unwrap();
    assert_eq!(Connection::terminate_condition(&body), condition::CONFLICT);
}

// ---- SCRAM server signature --------------------------------------------

struct RecordingScram {
    inner: ScramSha1,
    failures: Arc<Mutex<u32>>,
}

impl Mechanism for RecordingScram {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn priority(&self) -> u8 {
        self.inner.priority()
    }

    fn client_first(&self) -> bool {
        self.inner.client_first()
    }

    fn test(&self, creds: &Credentials) -> bool {
        self.inner.test(creds)
    }

    fn initial(&mut self, creds: &Credentials) -> Result<Vec<u8>, MechanismError> {
        self.inner.initial(creds)
    }

    fn response(
        &mut self,
        creds: &Credentials,
        challenge: &[u8],
    ) -> Result<Vec<u8>, MechanismError> {
        self.inner.response(creds, challenge)
    }

    fn success(&mut self, creds: &Credentials, data: &[u8]) -> Result<(), MechanismError> {
        self.inner.success(creds, data)
    }

    fn failure(&mut self) {
        *self.failures.lock().unwrap() += 1;
        self.inner.failure();
    }
}

#[tokio::test(start_paused = true)]
async fn scram_server_signature_mismatch_is_an_authfail() {
    let (mut conn, wire, log) = connecting_conn();
    let failures = Arc::new(Mutex::new(0));
    let counter = failures.clone();
    let factory: verse_sasl::client::MechanismFactory = Box::new(move || {
        Box::new(RecordingScram {
            inner: ScramSha1::new(None),
            failures: counter.clone(),
        })
    });
    conn.set_mechanisms(vec![factory]);

    conn.inject(FEATURES_SCRAM);
    let auth = wire.last_sent();
    assert_eq!(auth.attr("mechanism"), Some("SCRAM-SHA-1"));
    let client_first = String::from_utf8(Base64.decode(auth.text()).unwrap()).unwrap();
    let cnonce = client_first
        .strip_prefix("n,,n=user,r=")
        .expect("client-first shape")
        .to_string();

    let server_first = format!("r={}server-salt,s=QSXCR+Q6sek8bf92,i=4096", cnonce);
    conn.inject(&wrap(&format!(
        "<challenge xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>{}</challenge>",
        Base64.encode(&server_first)
    )));
    let response = wire.last_sent();
    assert!(response.is("response", ns::SASL));

    // A success whose v= does not match the stashed server signature.
    let forged = Base64.encode("v=AAAAAAAAAAAAAAAAAAAAAAAAAAA=");
    conn.inject(&wrap(&format!(
        "<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>{}</success>",
        forged
    )));

    assert_eq!(*failures.lock().unwrap(), 1);
    let seen = statuses(&log);
    assert!(seen.contains(&Status::AuthFail));
    assert!(!seen.contains(&Status::Connected));
    assert!(!conn.authenticated());
}

// ---- sendIQ ------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn iq_timeout_invokes_on_error_once_with_none() {
    let (mut conn, _wire, _log) = authenticated_conn();
    let before = conn.active_handler_count();

    let hits: Arc<Mutex<Vec<bool>>> = Arc::default();
    let on_error: IqCallback = {
        let hits = hits.clone();
        Box::new(move |_conn, reply| {
            hits.lock().unwrap().push(reply.is_none());
        })
    };
    conn.send_iq(
        iq(&[("type", "get")]).tree(),
        Some(Box::new(|_conn, _reply| panic!("must not succeed"))),
        Some(on_error),
        Some(Duration::from_millis(100)),
    );
    assert_eq!(conn.active_handler_count(), before + 1);

    tokio::time::advance(Duration::from_millis(200)).await;
    conn.flush();
    assert_eq!(*hits.lock().unwrap(), vec![true]);
    assert_eq!(conn.active_handler_count(), before);

    // Firing the tick again must not invoke anything a second time.
    tokio::time::advance(Duration::from_millis(200)).await;
    conn.flush();
    assert_eq!(hits.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn iq_reply_wins_over_timeout() {
    let (mut conn, wire, _log) = authenticated_conn();

    let outcomes: Arc<Mutex<Vec<&'static str>>> = Arc::default();
    let ok: IqCallback = {
        let outcomes = outcomes.clone();
        Box::new(move |_conn, reply| {
            assert!(reply.is_some());
            outcomes.lock().unwrap().push("success");
        })
    };
    let err: IqCallback = {
        let outcomes = outcomes.clone();
        Box::new(move |_conn, _reply| {
            outcomes.lock().unwrap().push("error");
        })
    };
    let id = conn.send_iq(
        iq(&[("type", "get")]).tree(),
        Some(ok),
        Some(err),
        Some(Duration::from_millis(100)),
    );
    let sent = wire.last_sent();
    assert_eq!(sent.attr("id"), Some(id.as_str()));

    conn.inject(&wrap(&format!(
        "<iq xmlns='jabber:client' type='result' id='{}'/>",
        id
    )));
    tokio::time::advance(Duration::from_millis(300)).await;
    conn.flush();
    assert_eq!(*outcomes.lock().unwrap(), vec!["success"]);
}

#[tokio::test(start_paused = true)]
async fn iq_error_reply_routes_to_on_error() {
    let (mut conn, _wire, _log) = authenticated_conn();
    let outcomes: Arc<Mutex<Vec<bool>>> = Arc::default();
    let err: IqCallback = {
        let outcomes = outcomes.clone();
        Box::new(move |_conn, reply| {
            outcomes.lock().unwrap().push(reply.is_some());
        })
    };
    let id = conn.send_iq(iq(&[("type", "set")]).tree(), None, Some(err), None);
    conn.inject(&wrap(&format!(
        "<iq xmlns='jabber:client' type='error' id='{}'/>",
        id
    )));
    assert_eq!(*outcomes.lock().unwrap(), vec![true]);
}

#[tokio::test(start_paused = true)]
async fn pending_iq_resolves_with_none_on_forced_disconnect() {
    let (mut conn, _wire, _log) = authenticated_conn();
    let hits: Arc<Mutex<Vec<bool>>> = Arc::default();
    let err: IqCallback = {
        let hits = hits.clone();
        Box::new(move |_conn, reply| {
            hits.lock().unwrap().push(reply.is_none());
        })
    };
    conn.send_iq(iq(&[("type", "get")]).tree(), None, Some(err), None);
    conn.do_disconnect(None);
    assert_eq!(*hits.lock().unwrap(), vec![true]);
}

#[tokio::test(start_paused = true)]
async fn send_iq_injects_missing_id() {
    let (mut conn, wire, _log) = authenticated_conn();
    let id = conn.send_iq(iq(&[("type", "get"), ("id", "")]).tree(), None, None, None);
    assert!(!id.is_empty());
    assert_eq!(wire.last_sent().attr("id"), Some(id.as_str()));
}

// ---- dispatch ordering -------------------------------------------------

#[tokio::test(start_paused = true)]
async fn handler_added_during_dispatch_sees_only_later_stanzas() {
    let (mut conn, _wire, _log) = authenticated_conn();
    let seen: Arc<Mutex<Vec<&'static str>>> = Arc::default();

    let outer_seen = seen.clone();
    let outer: HandlerCallback = Box::new(move |conn, _elem| {
        outer_seen.lock().unwrap().push("outer");
        let inner_seen = outer_seen.clone();
        conn.add_handler(
            Match::any().name("message"),
            Box::new(move |_conn, _elem| {
                inner_seen.lock().unwrap().push("inner");
                true
            }),
        );
        false // one-shot: only the first message spawns the inner handler
    });
    conn.add_handler(Match::any().name("message"), outer);

    conn.inject(&wrap("<message xmlns='jabber:client'><body>1</body></message>"));
    assert_eq!(*seen.lock().unwrap(), vec!["outer"]);

    conn.inject(&wrap("<message xmlns='jabber:client'><body>2</body></message>"));
    assert_eq!(*seen.lock().unwrap(), vec!["outer", "inner"]);
}

#[tokio::test(start_paused = true)]
async fn handler_removed_during_dispatch_does_not_fire() {
    let (mut conn, _wire, _log) = authenticated_conn();
    let seen: Arc<Mutex<Vec<&'static str>>> = Arc::default();

    // Pre-allocate the victim so the killer can capture its ref.
    let victim_seen = seen.clone();
    let victim = conn.add_handler(
        Match::any().name("message"),
        Box::new(move |_conn, _elem| {
            victim_seen.lock().unwrap().push("victim");
            true
        }),
    );
    // Registered after the victim but runs first in this test because the
    // victim is deleted inside the killer before iteration reaches it? No:
    // list order is registration order, so put the killer first instead.
    let killer_seen = seen.clone();
    conn.add_handler(
        Match::any().name("presence"),
        Box::new(move |conn, _elem| {
            killer_seen.lock().unwrap().push("killer");
            conn.delete_handler(victim);
            true
        }),
    );

    // Both stanzas arrive in one body: the killer fires on the presence and
    // removes the victim before the message is delivered.
    conn.inject(&wrap(
        "<presence xmlns='jabber:client'/><message xmlns='jabber:client'/>",
    ));
    assert_eq!(*seen.lock().unwrap(), vec!["killer"]);
}

#[tokio::test(start_paused = true)]
async fn user_handlers_wait_for_authentication() {
    let (mut conn, _wire, _log) = connecting_conn();
    let seen: Arc<Mutex<u32>> = Arc::default();
    let counter = seen.clone();
    conn.add_handler(
        Match::any().name("message"),
        Box::new(move |_conn, _elem| {
            *counter.lock().unwrap() += 1;
            true
        }),
    );
    conn.inject(FEATURES_PLAIN);
    conn.inject(&wrap("<message xmlns='jabber:client'/>"));
    assert_eq!(*seen.lock().unwrap(), 0);

    conn.inject(SASL_SUCCESS);
    conn.inject(FEATURES_BIND);
    conn.inject(BIND_RESULT);
    conn.inject(&wrap("<message xmlns='jabber:client'/>"));
    assert_eq!(*seen.lock().unwrap(), 1);
}

#[tokio::test(start_paused = true)]
async fn pause_buffers_and_resume_replays() {
    let (mut conn, _wire, _log) = authenticated_conn();
    let seen: Arc<Mutex<u32>> = Arc::default();
    let counter = seen.clone();
    conn.add_handler(
        Match::any().name("message"),
        Box::new(move |_conn, _elem| {
            *counter.lock().unwrap() += 1;
            true
        }),
    );
    conn.pause();
    conn.inject(&wrap("<message xmlns='jabber:client'/>"));
    assert_eq!(*seen.lock().unwrap(), 0);
    conn.resume();
    assert_eq!(*seen.lock().unwrap(), 1);
}

// ---- timed handlers ----------------------------------------------------

#[tokio::test(start_paused = true)]
async fn timed_handler_rearms_on_true() {
    let (mut conn, _wire, _log) = authenticated_conn();
    let fired: Arc<Mutex<u32>> = Arc::default();
    let counter = fired.clone();
    conn.add_timed_handler(
        Duration::from_millis(100),
        Box::new(move |_conn| {
            *counter.lock().unwrap() += 1;
            *counter.lock().unwrap() < 2
        }),
    );
    for _ in 0..4 {
        tokio::time::advance(Duration::from_millis(110)).await;
        conn.flush();
    }
    // Fired twice, then removed itself by returning false.
    assert_eq!(*fired.lock().unwrap(), 2);
}

// ---- disconnect --------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn graceful_disconnect_times_out() {
    let (mut conn, wire, log) = authenticated_conn();
    conn.disconnect(Some("bye"));
    assert!(conn.disconnecting());

    // The unavailable presence went to the transport.
    let disconnects = wire.disconnects.lock().unwrap().clone();
    assert_eq!(disconnects.len(), 1);
    let presence: Element = disconnects[0].as_ref().expect("presence").parse().unwrap();
    assert!(presence.is("presence", ns::CLIENT));
    assert_eq!(presence.attr("type"), Some("unavailable"));

    // Idempotent while in progress.
    conn.disconnect(Some("again"));

    tokio::time::advance(Duration::from_millis(3100)).await;
    conn.flush();

    let seen = statuses(&log);
    assert_eq!(
        seen[seen.len() - 3..].to_vec(),
        vec![Status::Disconnecting, Status::ConnTimeout, Status::Disconnected]
    );
    assert_eq!(
        seen.iter().filter(|s| **s == Status::Disconnecting).count(),
        1
    );
    assert_eq!(
        seen.iter().filter(|s| **s == Status::Disconnected).count(),
        1
    );
    assert!(!conn.connected());
    assert!(!conn.authenticated());
}

#[tokio::test(start_paused = true)]
async fn disconnect_completes_when_queue_drains() {
    let (mut conn, _wire, log) = authenticated_conn();
    conn.disconnect(None);
    // The server acknowledges the terminate; the queues are empty, so the
    // next received body completes the teardown.
    conn.inject("<body xmlns='http://jabber.org/protocol/httpbind'/>");
    let seen = statuses(&log);
    assert_eq!(seen.last(), Some(&Status::Disconnected));
    assert!(!seen.contains(&Status::ConnTimeout));
}

// ---- ids, reset, attach ------------------------------------------------

#[test]
fn unique_id_is_monotonic_and_resets() {
    let mut conn = Connection::new("https://example.org/http-bind", Options::default());
    let a = conn.get_unique_id(None);
    let b = conn.get_unique_id(Some("ping"));
    assert_ne!(a, b);
    assert!(b.ends_with(":ping"));
    assert_eq!(conn.unique_id_count(), 2);
    conn.reset();
    assert_eq!(conn.unique_id_count(), 0);
}

#[test]
fn reset_empties_queues_and_handlers() {
    let mut conn = Connection::new("https://example.org/http-bind", Options::default());
    conn.add_handler(Match::any(), Box::new(|_conn, _elem| true));
    conn.add_timed_handler(Duration::from_secs(1), Box::new(|_conn| true));
    conn.send(message(&[]).tree());
    conn.reset();
    assert_eq!(conn.active_handler_count(), 0);
    assert!(conn.data.is_empty());
}

#[tokio::test(start_paused = true)]
async fn attach_is_bosh_only() {
    let mut conn = Connection::new("wss://example.org/xmpp-websocket", Options::default());
    let (_log, callback) = recorder();
    let result = conn.attach("user@example.org/r1", "sid", 42, callback);
    assert!(matches!(result, Err(Error::Unsupported(_))));
}

#[tokio::test(start_paused = true)]
async fn restore_requires_keepalive_and_cache() {
    let mut conn = Connection::new("https://example.org/http-bind", Options::default());
    let (_log, callback) = recorder();
    assert!(matches!(
        conn.restore(None, callback),
        Err(Error::NoRestorableSession)
    ));

    let mut options = Options::default();
    options.keepalive = true;
    let mut conn = Connection::new("https://example.org/http-bind", options);
    let store = MemoryStore::new();
    let mut seeder = store.handle();
    seeder.save(&CachedSession {
        jid: "user@example.org/r1".to_string(),
        sid: "sid-1".to_string(),
        rid: 7000,
    });
    conn.set_session_store(Box::new(store));

    let (log, callback) = recorder();
    conn.restore(Some("user@example.org"), callback).unwrap();
    assert_eq!(statuses(&log), [Status::Attached]);
    assert!(conn.restored());
    assert!(conn.authenticated());
    assert_eq!(conn.jid(), Some("user@example.org/r1"));
}

#[tokio::test(start_paused = true)]
async fn restore_rejects_a_different_jid() {
    let mut options = Options::default();
    options.keepalive = true;
    let mut conn = Connection::new("https://example.org/http-bind", options);
    let store = MemoryStore::new();
    let mut seeder = store.handle();
    seeder.save(&CachedSession {
        jid: "user@example.org/r1".to_string(),
        sid: "sid-1".to_string(),
        rid: 7000,
    });
    conn.set_session_store(Box::new(store));
    let (_log, callback) = recorder();
    assert!(matches!(
        conn.restore(Some("other@example.org"), callback),
        Err(Error::NoRestorableSession)
    ));
}

// ---- bad input ---------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn unparsable_body_is_bad_format() {
    let (mut conn, _wire, log) = connecting_conn();
    conn.inject("this is not xml <");
    let recorded = log.lock().unwrap();
    assert!(recorded
        .iter()
        .any(|(s, c)| *s == Status::ConnFail
            && c.as_deref() == Some(condition::BAD_FORMAT)));
    assert_eq!(recorded.last().unwrap().0, Status::Disconnected);
    drop(recorded);
    assert!(!conn.connected());
}
