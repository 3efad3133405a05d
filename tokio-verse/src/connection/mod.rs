// Copyright (c) 2026 verse contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The connection engine.
//!
//! [`Connection`] owns all state: the transport, the handler lists, the
//! outgoing stanza queue and the SASL machinery. Everything runs on one
//! logical task: transports do their I/O in spawned helpers and report
//! completions through an event channel which the [`Connection::run`] loop
//! drains, interleaved with the 100 ms idle tick that drives timed handlers
//! and transport flushing.
//!
//! Callbacks receive `&mut Connection`, so a handler can send stanzas,
//! register more handlers or disconnect right from its body. Handler list
//! mutations made during a dispatch pass are deferred and take effect before
//! the next pass, never in the middle of one.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use core::mem;
use core::time::Duration;

use jid::Jid;
use minidom::Element;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use verse_sasl::client::{default_mechanisms, MechanismFactory};

use crate::error::{condition, Error};
use crate::handler::{
    HandlerCallback, HandlerRef, HandlerSet, Match, StanzaHandler, TimedCallback, TimedHandler,
    TimedRef,
};
use crate::session::SessionStore;
use crate::stanza::{presence, Builder};
use crate::transport::{
    create_transport, Outbound, SessionParams, Transport, TransportAction, TransportCtx,
    TransportEvent,
};

/// Builds the transport-state view out of the connection's own fields.
/// A macro rather than a method so the borrows stay field-granular.
macro_rules! ctx {
    ($conn:expr) => {
        TransportCtx {
            events: &$conn.event_tx,
            domain: $conn.domain.as_deref(),
            jid: $conn.jid.as_deref(),
            connected: $conn.connected,
            authenticated: $conn.authenticated,
            disconnecting: $conn.disconnecting,
            options: &$conn.options,
            hooks: &mut $conn.hooks,
            store: &mut $conn.session_store,
        }
    };
}

mod auth;
#[cfg(test)]
mod tests;

/// Soft resolution of the timed-handler scheduler and the transport flush.
const IDLE_INTERVAL: Duration = Duration::from_millis(100);

/// How long a graceful disconnect may take before it is forced.
const DISCONNECT_TIMEOUT: Duration = Duration::from_millis(3000);

/// Connection lifecycle statuses, reported through the status callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    /// An unrecoverable engine error occurred.
    Error = 0,
    /// The connection attempt started.
    Connecting = 1,
    /// The connection attempt failed.
    ConnFail = 2,
    /// Authentication is in progress.
    Authenticating = 3,
    /// Authentication failed.
    AuthFail = 4,
    /// The session is up and authenticated.
    Connected = 5,
    /// The connection has ended.
    Disconnected = 6,
    /// A disconnect is in progress.
    Disconnecting = 7,
    /// An externally created session was adopted.
    Attached = 8,
    /// The server redirected the stream elsewhere.
    Redirect = 9,
    /// The graceful disconnect timed out.
    ConnTimeout = 10,
}

/// The user's status callback: `(connection, status, condition, trigger)`.
pub type StatusCallback =
    Box<dyn FnMut(&mut Connection, Status, Option<&str>, Option<&Element>) + Send>;

/// Callback for a protocol-level error code.
pub type ProtocolErrorCallback = Box<dyn FnMut(&mut Connection, u16) + Send>;

/// One-shot callback for an IQ or presence round-trip. `None` means the
/// exchange timed out or the connection went away.
pub type IqCallback = Box<dyn FnOnce(&mut Connection, Option<&Element>) + Send>;

struct IqCallbacks {
    on_success: Option<IqCallback>,
    on_error: Option<IqCallback>,
}

type IqSlot = Arc<Mutex<Option<IqCallbacks>>>;

/// Connection options.
pub struct Options {
    /// Forces the WebSocket transport (`"ws"` or `"wss"`) even when the
    /// service URL has an HTTP scheme.
    pub protocol: Option<String>,
    /// Cookies sent with every BOSH request, as name/value pairs.
    pub cookies: Vec<(String, String)>,
    /// BOSH synchronous mode: never more than one request in flight.
    pub sync: bool,
    /// Extra headers for every BOSH request.
    pub custom_headers: Vec<(String, String)>,
    /// Cache the BOSH session for [`Connection::restore`], and keep the
    /// WebSocket alive with pings.
    pub keepalive: bool,
    /// Overrides the BOSH `Content-Type` (default `text/xml; charset=utf-8`).
    pub content_type: Option<String>,
    /// How often a failed BOSH request is retried before giving up.
    pub max_retries: u32,
}

impl Default for Options {
    /// The defaults: BOSH-or-WebSocket by URL scheme, five retries.
    fn default() -> Options {
        Options {
            protocol: None,
            cookies: Vec::new(),
            sync: false,
            custom_headers: Vec::new(),
            keepalive: false,
            content_type: None,
            max_retries: 5,
        }
    }
}

impl Options {
    /// Alias for [`Options::default`].
    pub fn new() -> Options {
        Options::default()
    }
}

/// Extra parameters for [`Connection::connect_with`] and
/// [`Connection::attach_with`].
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// BOSH `wait`: the longest pause the server may hold a request, in
    /// seconds.
    pub wait: u32,
    /// BOSH `hold`: how many requests the server may hold open.
    pub hold: u32,
    /// A connection-manager routing hint (`xmpp:host:port`).
    pub route: Option<String>,
    /// An authentication identity distinct from the JID's node.
    pub authcid: Option<String>,
}

impl Default for ConnectOptions {
    fn default() -> ConnectOptions {
        ConnectOptions {
            wait: 60,
            hold: 1,
            route: None,
            authcid: None,
        }
    }
}

/// The observability hooks: xml/raw taps in both directions plus the BOSH
/// rid tracker. Each is invoked only when set.
#[derive(Default)]
pub struct Hooks {
    xml_input: Option<Box<dyn FnMut(&Element) + Send>>,
    xml_output: Option<Box<dyn FnMut(&Element) + Send>>,
    raw_input: Option<Box<dyn FnMut(&str) + Send>>,
    raw_output: Option<Box<dyn FnMut(&str) + Send>>,
    next_valid_rid: Option<Box<dyn FnMut(u64) + Send>>,
}

impl Hooks {
    pub(crate) fn xml_input(&mut self, elem: &Element) {
        if let Some(hook) = &mut self.xml_input {
            hook(elem);
        }
    }

    pub(crate) fn xml_output(&mut self, elem: &Element) {
        if let Some(hook) = &mut self.xml_output {
            hook(elem);
        }
    }

    pub(crate) fn raw_input(&mut self, text: &str) {
        if let Some(hook) = &mut self.raw_input {
            hook(text);
        }
    }

    pub(crate) fn raw_output(&mut self, text: &str) {
        if let Some(hook) = &mut self.raw_output {
            hook(text);
        }
    }

    pub(crate) fn next_valid_rid(&mut self, rid: u64) {
        if let Some(hook) = &mut self.next_valid_rid {
            hook(rid);
        }
    }
}

/// Anything [`Connection::send`] accepts: a tree, a builder, or a batch.
pub enum SendItem {
    /// One stanza.
    Tree(Element),
    /// Several stanzas, sent in order.
    Batch(Vec<Element>),
}

impl From<Element> for SendItem {
    fn from(elem: Element) -> SendItem {
        SendItem::Tree(elem)
    }
}

impl From<Builder> for SendItem {
    fn from(builder: Builder) -> SendItem {
        SendItem::Tree(builder.tree())
    }
}

impl From<Vec<Element>> for SendItem {
    fn from(elems: Vec<Element>) -> SendItem {
        SendItem::Batch(elems)
    }
}

/// An XMPP client connection over BOSH or WebSocket.
pub struct Connection {
    service: String,
    options: Options,
    transport: Option<Box<dyn Transport>>,

    // Identity.
    jid: Option<String>,
    authzid: Option<String>,
    authcid: Option<String>,
    pass: Option<String>,
    domain: Option<String>,

    // Stream state.
    status: Status,
    features: Option<Element>,
    connected: bool,
    authenticated: bool,
    disconnecting: bool,
    paused: bool,
    restored: bool,
    terminated: bool,
    do_bind: bool,
    do_session: bool,
    do_authentication: bool,

    // Dispatch.
    handlers: HandlerSet<StanzaHandler>,
    timed: HandlerSet<TimedHandler>,
    next_ref_id: u64,
    pending_iqs: HashMap<u64, IqSlot>,

    // Outgoing.
    data: VecDeque<Outbound>,
    unique_id: u64,

    // Authentication.
    mechanisms: Vec<MechanismFactory>,
    sasl: Option<auth::SaslSession>,

    // Callbacks.
    status_cb: Option<StatusCallback>,
    status_listeners: Vec<StatusCallback>,
    emitting_status: bool,
    queued_statuses: VecDeque<(Status, Option<String>, Option<Element>)>,
    proto_error_handlers: HashMap<(String, u16), ProtocolErrorCallback>,
    hooks: Hooks,

    // Plumbing.
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    event_rx: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    held_events: VecDeque<TransportEvent>,
    disconnect_timer: Option<TimedRef>,
    session_store: Option<Box<dyn SessionStore>>,
}

impl Connection {
    /// Creates a connection for `service`, a BOSH endpoint
    /// (`https://host/http-bind`) or a WebSocket endpoint
    /// (`wss://host/xmpp-websocket`).
    pub fn new(service: impl Into<String>, options: Options) -> Connection {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Connection {
            service: service.into(),
            options,
            transport: None,
            jid: None,
            authzid: None,
            authcid: None,
            pass: None,
            domain: None,
            status: Status::Disconnected,
            features: None,
            connected: false,
            authenticated: false,
            disconnecting: false,
            paused: false,
            restored: false,
            terminated: false,
            do_bind: false,
            do_session: false,
            do_authentication: false,
            handlers: HandlerSet::default(),
            timed: HandlerSet::default(),
            next_ref_id: 0,
            pending_iqs: HashMap::new(),
            data: VecDeque::new(),
            unique_id: 0,
            mechanisms: default_mechanisms(),
            sasl: None,
            status_cb: None,
            status_listeners: Vec::new(),
            emitting_status: false,
            queued_statuses: VecDeque::new(),
            proto_error_handlers: HashMap::new(),
            hooks: Hooks::default(),
            event_tx,
            event_rx: Some(event_rx),
            held_events: VecDeque::new(),
            disconnect_timer: None,
            session_store: None,
        }
    }

    /// The service URL this connection talks to.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// The full JID: as requested until resource binding, as bound after.
    pub fn jid(&self) -> Option<&str> {
        self.jid.as_deref()
    }

    /// The domain part of the JID.
    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    /// The most recently emitted status.
    pub fn status(&self) -> Status {
        self.status
    }

    /// True once the stream is established (pre-authentication included).
    pub fn connected(&self) -> bool {
        self.connected
    }

    /// True once authentication and binding completed.
    pub fn authenticated(&self) -> bool {
        self.authenticated
    }

    /// True while a graceful disconnect is in progress.
    pub fn disconnecting(&self) -> bool {
        self.disconnecting
    }

    /// True when the current session was restored from the session cache.
    pub fn restored(&self) -> bool {
        self.restored
    }

    /// The server's most recent `<stream:features/>`.
    pub fn stream_features(&self) -> Option<&Element> {
        self.features.as_ref()
    }

    /// Replaces the registered SASL mechanism set.
    pub fn set_mechanisms(&mut self, mechanisms: Vec<MechanismFactory>) {
        self.mechanisms = mechanisms;
    }

    /// Adds one SASL mechanism factory to the registry.
    pub fn register_mechanism(&mut self, factory: MechanismFactory) {
        self.mechanisms.push(factory);
    }

    /// Installs the session store used by BOSH keepalive and
    /// [`Connection::restore`].
    pub fn set_session_store(&mut self, store: Box<dyn SessionStore>) {
        self.session_store = Some(store);
    }

    /// Registers an additional status listener. Listeners run before the
    /// status callback given to [`Connection::connect`].
    pub fn add_status_listener(&mut self, listener: StatusCallback) {
        self.status_listeners.push(listener);
    }

    /// Taps every parsed inbound element.
    pub fn set_xml_input(&mut self, hook: impl FnMut(&Element) + Send + 'static) {
        self.hooks.xml_input = Some(Box::new(hook));
    }

    /// Taps every outbound stanza at flush time.
    pub fn set_xml_output(&mut self, hook: impl FnMut(&Element) + Send + 'static) {
        self.hooks.xml_output = Some(Box::new(hook));
    }

    /// Taps the raw inbound wire text.
    pub fn set_raw_input(&mut self, hook: impl FnMut(&str) + Send + 'static) {
        self.hooks.raw_input = Some(Box::new(hook));
    }

    /// Taps the raw outbound wire text.
    pub fn set_raw_output(&mut self, hook: impl FnMut(&str) + Send + 'static) {
        self.hooks.raw_output = Some(Box::new(hook));
    }

    /// Observes every advance of the BOSH request id.
    pub fn set_next_valid_rid(&mut self, hook: impl FnMut(u64) + Send + 'static) {
        self.hooks.next_valid_rid = Some(Box::new(hook));
    }

    /// Registers a callback for a protocol-level error code, e.g.
    /// `("HTTP", 500)`.
    pub fn add_protocol_error_handler(
        &mut self,
        protocol: &str,
        status_code: u16,
        callback: ProtocolErrorCallback,
    ) {
        self.proto_error_handlers
            .insert((protocol.to_string(), status_code), callback);
    }

    // ---- connecting and disconnecting ----------------------------------

    /// Starts connecting and authenticating as `jid`.
    ///
    /// Statuses are reported through `callback`; drive the engine with
    /// [`Connection::run`] afterwards. Must be called within a Tokio
    /// runtime, since transports spawn their I/O tasks from here.
    pub fn connect(
        &mut self,
        jid: &str,
        password: &str,
        callback: StatusCallback,
    ) -> Result<(), Error> {
        self.connect_with(jid, password, callback, ConnectOptions::default())
    }

    /// [`Connection::connect`] with explicit wait/hold/route/authcid.
    pub fn connect_with(
        &mut self,
        jid: &str,
        password: &str,
        callback: StatusCallback,
        params: ConnectOptions,
    ) -> Result<(), Error> {
        let parsed: Jid = jid.parse()?;
        self.jid = Some(jid.to_string());
        self.authzid = Some(parsed.to_bare().to_string());
        self.authcid = params
            .authcid
            .clone()
            .or_else(|| parsed.node().map(|node| node.to_string()));
        self.pass = Some(password.to_string());
        self.domain = Some(parsed.domain().to_string());
        self.status_cb = Some(callback);

        self.connected = false;
        self.authenticated = false;
        self.disconnecting = false;
        self.restored = false;
        self.terminated = false;
        self.do_authentication = true;
        self.features = None;

        log::info!("connecting to {} as {}", self.service, jid);
        self.change_status(Status::Connecting, None, None);

        if self.transport.is_none() {
            self.transport = Some(create_transport(&self.service, &self.options)?);
        }
        let session = SessionParams {
            wait: params.wait,
            hold: params.hold,
            route: params.route.clone(),
        };
        let Some(transport) = self.transport.as_mut() else {
            return Err(Error::InvalidState);
        };
        transport.connect(&session, ctx!(self))
    }

    /// Adopts an externally created BOSH session from its `sid`/`rid`.
    pub fn attach(
        &mut self,
        jid: &str,
        sid: &str,
        rid: u64,
        callback: StatusCallback,
    ) -> Result<(), Error> {
        self.attach_with(jid, sid, rid, callback, ConnectOptions::default())
    }

    /// [`Connection::attach`] with explicit wait/hold.
    pub fn attach_with(
        &mut self,
        jid: &str,
        sid: &str,
        rid: u64,
        callback: StatusCallback,
        params: ConnectOptions,
    ) -> Result<(), Error> {
        let parsed: Jid = jid.parse()?;
        if self.transport.is_none() {
            self.transport = Some(create_transport(&self.service, &self.options)?);
        }
        let session = SessionParams {
            wait: params.wait,
            hold: params.hold,
            route: params.route.clone(),
        };
        let Some(transport) = self.transport.as_mut() else {
            return Err(Error::InvalidState);
        };
        transport.attach(sid, rid, &session)?;

        self.jid = Some(jid.to_string());
        self.authzid = Some(parsed.to_bare().to_string());
        self.authcid = parsed.node().map(|node| node.to_string());
        self.domain = Some(parsed.domain().to_string());
        self.status_cb = Some(callback);
        self.do_authentication = false;
        self.connected = true;
        self.authenticated = true;
        self.disconnecting = false;
        self.terminated = false;

        log::info!("attached to BOSH session {} as {}", sid, jid);
        self.change_status(Status::Attached, None, None);
        Ok(())
    }

    /// Re-attaches to the session cached in the session store. Requires the
    /// `keepalive` option and a configured store.
    pub fn restore(&mut self, jid: Option<&str>, callback: StatusCallback) -> Result<(), Error> {
        if !self.options.keepalive {
            return Err(Error::NoRestorableSession);
        }
        let cached = self
            .session_store
            .as_ref()
            .and_then(|store| store.load())
            .ok_or(Error::NoRestorableSession)?;
        if let Some(want) = jid {
            let want: Jid = want.parse()?;
            let have: Jid = cached.jid.parse().map_err(|_| Error::NoRestorableSession)?;
            if want.to_bare() != have.to_bare() {
                return Err(Error::NoRestorableSession);
            }
        }
        self.attach_with(
            &cached.jid,
            &cached.sid,
            cached.rid,
            callback,
            ConnectOptions::default(),
        )?;
        self.restored = true;
        Ok(())
    }

    /// Starts a graceful disconnect. Idempotent: repeat calls while one is
    /// in progress do nothing.
    pub fn disconnect(&mut self, reason: Option<&str>) {
        if self.disconnecting {
            return;
        }
        if !self.connected && self.status == Status::Disconnected {
            return;
        }
        log::info!("disconnect was called, reason: {:?}", reason);
        self.change_status(Status::Disconnecting, reason, None);
        if self.connected {
            self.disconnecting = true;
            let presence = if self.authenticated {
                Some(presence(&[("type", "unavailable")]).tree())
            } else {
                None
            };
            let timer = self.add_sys_timed_handler(
                DISCONNECT_TIMEOUT,
                Box::new(|conn| {
                    conn.on_disconnect_timeout();
                    false
                }),
            );
            self.disconnect_timer = Some(timer);
            if let Some(transport) = self.transport.as_mut() {
                transport.disconnect(presence, ctx!(self));
            }
        } else {
            log::debug!("disconnect called before the stream was established");
            self.do_disconnect(None);
        }
    }

    fn on_disconnect_timeout(&mut self) {
        log::warn!("disconnect timed out, forcing teardown");
        self.change_status(Status::ConnTimeout, None, None);
        if let Some(transport) = self.transport.as_mut() {
            transport.on_disconnect_timeout();
        }
        self.do_disconnect(None);
    }

    /// Tears the connection down immediately: resolves pending IQs with
    /// `None`, clears every handler list and reports DISCONNECTED.
    pub(crate) fn do_disconnect(&mut self, cond: Option<&str>) {
        if let Some(timer) = self.disconnect_timer.take() {
            self.timed.schedule_remove(timer.0);
        }
        log::debug!("do_disconnect was called");

        // Resolve pending IQ exchanges before their handlers disappear, so
        // every sendIQ caller hears back exactly once.
        let pending: Vec<IqSlot> = self.pending_iqs.drain().map(|(_, slot)| slot).collect();
        for slot in pending {
            let callbacks = slot.lock().unwrap().take();
            if let Some(callbacks) = callbacks {
                if let Some(on_error) = callbacks.on_error {
                    on_error(self, None);
                }
            }
        }

        self.sasl = None;
        self.authenticated = false;
        self.connected = false;
        self.disconnecting = false;
        self.restored = false;
        self.do_bind = false;
        self.do_session = false;
        if let Some(transport) = self.transport.as_mut() {
            transport.after_disconnect();
        }
        if let Some(store) = self.session_store.as_deref_mut() {
            store.clear();
        }
        self.handlers.clear();
        self.timed.clear();
        self.data.clear();
        self.terminated = true;
        self.change_status(Status::Disconnected, cond, None);
    }

    /// Stops processing: transport events are buffered until
    /// [`Connection::resume`].
    pub fn pause(&mut self) {
        self.paused = true;
    }

    /// Resumes processing and replays everything buffered while paused.
    pub fn resume(&mut self) {
        self.paused = false;
        while let Some(event) = self.held_events.pop_front() {
            self.handle_transport_event(event);
            if self.paused {
                return;
            }
        }
        self.run_idle();
    }

    /// Runs the idle body immediately instead of waiting for the next tick.
    pub fn flush(&mut self) {
        self.run_idle();
    }

    /// Returns the engine to its initial state: all handler lists and the
    /// outgoing queue empty, the id counter at zero.
    pub fn reset(&mut self) {
        log::debug!("reset");
        self.handlers.clear();
        self.timed.clear();
        self.pending_iqs.clear();
        self.data.clear();
        self.held_events.clear();
        self.unique_id = 0;
        self.sasl = None;
        self.features = None;
        self.do_bind = false;
        self.do_session = false;
        self.do_authentication = false;
        self.connected = false;
        self.authenticated = false;
        self.disconnecting = false;
        self.restored = false;
        self.paused = false;
    }

    /// Drives the engine until the connection ends. Resolves after
    /// DISCONNECTED has been reported.
    pub async fn run(&mut self) -> Result<(), Error> {
        let mut events = self.event_rx.take().ok_or(Error::InvalidState)?;
        let mut tick = tokio::time::interval(IDLE_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        while !self.terminated {
            tokio::select! {
                _ = tick.tick() => self.run_idle(),
                event = events.recv() => match event {
                    Some(event) => self.handle_transport_event(event),
                    None => break,
                },
            }
        }
        self.event_rx = Some(events);
        Ok(())
    }

    // ---- sending --------------------------------------------------------

    /// Queues one stanza (or a batch) and flushes the transport.
    pub fn send<S: Into<SendItem>>(&mut self, stanzas: S) {
        match stanzas.into() {
            SendItem::Tree(elem) => self.data.push_back(Outbound::Stanza(elem)),
            SendItem::Batch(elems) => {
                for elem in elems {
                    self.data.push_back(Outbound::Stanza(elem));
                }
            }
        }
        self.flush_transport();
    }

    /// Queues a stream restart marker.
    pub(crate) fn send_restart(&mut self) {
        self.data.push_back(Outbound::Restart);
        self.flush_transport();
    }

    /// Sends an IQ and correlates the reply by id.
    ///
    /// Exactly one of `on_success`, `on_error(Some(reply))` or
    /// `on_error(None)` (timeout / teardown) is invoked. Returns the
    /// stanza's id, injecting one if it was missing or empty.
    pub fn send_iq(
        &mut self,
        stanza: impl Into<Element>,
        on_success: Option<IqCallback>,
        on_error: Option<IqCallback>,
        timeout: Option<Duration>,
    ) -> String {
        self.send_correlated(stanza.into(), "iq", on_success, on_error, timeout)
    }

    /// [`Connection::send_iq`] for callers which may not be connected yet;
    /// the stanza stays queued until the session is up.
    pub fn send_iq_queued(
        &mut self,
        stanza: impl Into<Element>,
        on_success: Option<IqCallback>,
        on_error: Option<IqCallback>,
        timeout: Option<Duration>,
    ) -> String {
        if !self.connected {
            log::debug!("send_iq_queued before connection establishment; stanza stays queued");
        }
        self.send_iq(stanza, on_success, on_error, timeout)
    }

    /// Sends a presence and correlates the reply by id, like
    /// [`Connection::send_iq`].
    pub fn send_presence(
        &mut self,
        stanza: impl Into<Element>,
        on_success: Option<IqCallback>,
        on_error: Option<IqCallback>,
        timeout: Option<Duration>,
    ) -> String {
        self.send_correlated(stanza.into(), "presence", on_success, on_error, timeout)
    }

    fn send_correlated(
        &mut self,
        mut stanza: Element,
        name: &str,
        on_success: Option<IqCallback>,
        on_error: Option<IqCallback>,
        timeout: Option<Duration>,
    ) -> String {
        let id = match stanza.attr("id") {
            Some(id) if !id.is_empty() => id.to_string(),
            // Missing or empty: inject one.
            _ => {
                let id = self.get_unique_id(Some(if name == "iq" { "sendIQ" } else { "sendPresence" }));
                stanza.set_attr("id", id.clone());
                id
            }
        };

        let slot: IqSlot = Arc::new(Mutex::new(Some(IqCallbacks {
            on_success,
            on_error,
        })));
        let handler_id = HandlerRef(self.next_ref());

        let timer = timeout.map(|timeout| {
            let slot = slot.clone();
            self.add_sys_timed_handler(
                timeout,
                Box::new(move |conn| {
                    conn.delete_handler(handler_id);
                    conn.pending_iqs.remove(&handler_id.0);
                    if let Some(callbacks) = slot.lock().unwrap().take() {
                        log::debug!("correlated send timed out");
                        if let Some(on_error) = callbacks.on_error {
                            on_error(conn, None);
                        }
                    }
                    false
                }),
            )
        });

        let matcher = if name == "iq" {
            Match::any()
                .name("iq")
                .types(&[Some("error"), Some("result")])
                .id(&id)
        } else {
            Match::any().name(name).id(&id)
        };
        let callback_slot = slot.clone();
        self.handlers.pending_add.push(StanzaHandler {
            id: handler_id,
            matcher,
            user: true,
            callback: Box::new(move |conn, elem| {
                if let Some(timer) = timer {
                    conn.delete_timed_handler(timer);
                }
                conn.pending_iqs.remove(&handler_id.0);
                if let Some(callbacks) = callback_slot.lock().unwrap().take() {
                    if elem.attr("type") == Some("error") {
                        if let Some(on_error) = callbacks.on_error {
                            on_error(conn, Some(elem));
                        }
                    } else if let Some(on_success) = callbacks.on_success {
                        on_success(conn, Some(elem));
                    }
                }
                false
            }),
        });
        self.pending_iqs.insert(handler_id.0, slot);
        self.send(stanza);
        id
    }

    // ---- handler registry -----------------------------------------------

    /// Registers a stanza handler; it becomes active before the next
    /// dispatch pass. User handlers only fire once authenticated.
    pub fn add_handler(&mut self, matcher: Match, callback: HandlerCallback) -> HandlerRef {
        self.add_handler_inner(matcher, callback, true)
    }

    /// Registers a system handler, exempt from the authentication gate.
    pub(crate) fn add_sys_handler(
        &mut self,
        matcher: Match,
        callback: HandlerCallback,
    ) -> HandlerRef {
        self.add_handler_inner(matcher, callback, false)
    }

    fn add_handler_inner(
        &mut self,
        matcher: Match,
        callback: HandlerCallback,
        user: bool,
    ) -> HandlerRef {
        let id = HandlerRef(self.next_ref());
        self.handlers.pending_add.push(StanzaHandler {
            id,
            matcher,
            user,
            callback,
        });
        id
    }

    /// Unregisters a stanza handler. Safe to call from inside any callback;
    /// the handler will not fire on subsequent stanzas.
    pub fn delete_handler(&mut self, handler: HandlerRef) {
        self.handlers.schedule_remove(handler.0);
    }

    /// Registers a timed handler firing every `period` (at the 100 ms tick
    /// resolution). User timed handlers only fire once authenticated.
    pub fn add_timed_handler(&mut self, period: Duration, callback: TimedCallback) -> TimedRef {
        self.add_timed_inner(period, callback, true)
    }

    pub(crate) fn add_sys_timed_handler(
        &mut self,
        period: Duration,
        callback: TimedCallback,
    ) -> TimedRef {
        self.add_timed_inner(period, callback, false)
    }

    fn add_timed_inner(
        &mut self,
        period: Duration,
        callback: TimedCallback,
        user: bool,
    ) -> TimedRef {
        let id = TimedRef(self.next_ref());
        self.timed.pending_add.push(TimedHandler {
            id,
            period,
            last_called: Instant::now(),
            user,
            callback,
        });
        id
    }

    /// Unregisters a timed handler.
    pub fn delete_timed_handler(&mut self, handler: TimedRef) {
        self.timed.schedule_remove(handler.0);
    }

    fn next_ref(&mut self) -> u64 {
        self.next_ref_id += 1;
        self.next_ref_id
    }

    /// A fresh stanza id: a v4 UUID, with `":suffix"` appended when given.
    pub fn get_unique_id(&mut self, suffix: Option<&str>) -> String {
        self.unique_id += 1;
        let uuid = Uuid::new_v4();
        match suffix {
            Some(suffix) => format!("{}:{}", uuid, suffix),
            None => uuid.to_string(),
        }
    }

    /// How many ids have been handed out since the last [`Connection::reset`].
    pub fn unique_id_count(&self) -> u64 {
        self.unique_id
    }

    // ---- dispatch -------------------------------------------------------

    pub(crate) fn handle_transport_event(&mut self, event: TransportEvent) {
        if self.paused {
            self.held_events.push_back(event);
            return;
        }
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        let actions = transport.handle_event(event, ctx!(self));
        for action in actions {
            self.apply_action(action);
        }
    }

    fn apply_action(&mut self, action: TransportAction) {
        match action {
            TransportAction::Deliver { body, raw } => {
                if !self.connected {
                    self.connect_cb(body, Some(&raw));
                } else {
                    self.data_recv(body, Some(&raw));
                }
            }
            TransportAction::BadFormat => {
                log::error!("received a payload that is not well-formed XML");
                self.change_status(Status::ConnFail, Some(condition::BAD_FORMAT), None);
                self.do_disconnect(Some(condition::BAD_FORMAT));
            }
            TransportAction::ConnFail { condition } => {
                self.change_status(Status::ConnFail, Some(&condition), None);
                self.do_disconnect(Some(&condition));
            }
            TransportAction::ProtocolError { protocol, code } => {
                self.run_protocol_error_handler(protocol, code);
            }
            TransportAction::Disconnected => self.do_disconnect(None),
        }
    }

    fn run_protocol_error_handler(&mut self, protocol: &str, code: u16) {
        let key = (protocol.to_string(), code);
        match self.proto_error_handlers.remove(&key) {
            Some(mut callback) => {
                callback(self, code);
                // Put it back unless the callback replaced it.
                self.proto_error_handlers.entry(key).or_insert(callback);
            }
            None => {
                log::warn!("unhandled {} protocol error, code {}", protocol, code);
            }
        }
    }

    pub(crate) fn run_input_hooks(&mut self, body: &Element, raw: Option<&str>) {
        if let Some(raw) = raw {
            self.hooks.raw_input(raw);
        }
        self.hooks.xml_input(body);
    }

    /// Post-establishment receive path; `body`'s children are the stanzas.
    pub(crate) fn data_recv(&mut self, body: Element, raw: Option<&str>) {
        self.run_input_hooks(&body, raw);
        self.handlers.drain_pending();

        if self.disconnecting && self.data.is_empty() && self.transport_queue_empty() {
            self.do_disconnect(None);
            return;
        }

        if body.attr("type") == Some("terminate") {
            let cond = Self::terminate_condition(&body);
            let status = if cond == "see-other-uri" {
                Status::Redirect
            } else {
                Status::ConnFail
            };
            self.change_status(status, Some(&cond), Some(&body));
            self.do_disconnect(Some(&cond));
            return;
        }

        let children: Vec<Element> = body.children().cloned().collect();
        for child in &children {
            self.deliver(child);
            if self.terminated {
                return;
            }
        }
    }

    fn transport_queue_empty(&self) -> bool {
        self.transport.as_ref().map_or(true, |t| t.empty_queue())
    }

    pub(crate) fn terminate_condition(body: &Element) -> String {
        let cond = body.attr("condition").unwrap_or(condition::UNKNOWN);
        if cond == "remote-stream-error"
            && body.children().any(|child| {
                child.name() == "error" && child.children().any(|e| e.name() == "conflict")
            })
        {
            return condition::CONFLICT.to_string();
        }
        cond.to_string()
    }

    /// Runs one stanza through a snapshot of the active handlers. Handlers
    /// added during the pass do not see this stanza; handlers removed during
    /// the pass are skipped for the rest of it.
    fn deliver(&mut self, stanza: &Element) {
        let epoch = self.handlers.epoch;
        let mut snapshot = mem::take(&mut self.handlers.active);
        let mut kept = Vec::with_capacity(snapshot.len());
        for mut handler in snapshot.drain(..) {
            if self.handlers.is_pending_remove(handler.id.0) {
                continue;
            }
            let gated = handler.user && !self.authenticated;
            let keep = if !gated && handler.matcher.matches(stanza) {
                (handler.callback)(self, stanza)
            } else {
                true
            };
            if keep {
                kept.push(handler);
            }
        }
        // A callback may have torn the lists down (disconnect/reset); only
        // restore the snapshot if they are still the same generation.
        if self.handlers.epoch == epoch {
            kept.append(&mut self.handlers.active);
            self.handlers.active = kept;
        }
    }

    /// The idle body: timed handlers, then the transport flush.
    pub(crate) fn run_idle(&mut self) {
        if self.paused {
            return;
        }
        self.timed.drain_pending();
        let now = Instant::now();
        let epoch = self.timed.epoch;
        let mut snapshot = mem::take(&mut self.timed.active);
        let mut kept = Vec::with_capacity(snapshot.len());
        for mut timed in snapshot.drain(..) {
            if self.timed.is_pending_remove(timed.id.0) {
                continue;
            }
            let gated = timed.user && !self.authenticated;
            let due = now.duration_since(timed.last_called) >= timed.period;
            let keep = if !gated && due {
                let keep = (timed.callback)(self);
                if keep {
                    timed.last_called = now;
                }
                keep
            } else {
                true
            };
            if keep {
                kept.push(timed);
            }
        }
        if self.timed.epoch == epoch {
            kept.append(&mut self.timed.active);
            self.timed.active = kept;
        }
        self.flush_transport();
    }

    pub(crate) fn flush_transport(&mut self) {
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        transport.on_idle(&mut self.data, ctx!(self));
    }

    /// Reports a status to the listeners and the user callback. Nested
    /// emissions from inside a callback are queued and delivered in order.
    pub(crate) fn change_status(
        &mut self,
        status: Status,
        cond: Option<&str>,
        elem: Option<&Element>,
    ) {
        self.status = status;
        if self.emitting_status {
            self.queued_statuses
                .push_back((status, cond.map(str::to_string), elem.cloned()));
            return;
        }
        log::debug!("status {:?}, condition {:?}", status, cond);
        self.emitting_status = true;

        let mut listeners = mem::take(&mut self.status_listeners);
        for listener in listeners.iter_mut() {
            listener(self, status, cond, elem);
        }
        let added = mem::take(&mut self.status_listeners);
        listeners.extend(added);
        self.status_listeners = listeners;

        if let Some(mut callback) = self.status_cb.take() {
            callback(self, status, cond, elem);
            if self.status_cb.is_none() {
                self.status_cb = Some(callback);
            }
        }
        self.emitting_status = false;

        while let Some((status, cond, elem)) = self.queued_statuses.pop_front() {
            self.change_status(status, cond.as_deref(), elem.as_ref());
        }
    }

    // ---- test plumbing --------------------------------------------------

    #[cfg(test)]
    pub(crate) fn set_transport_for_tests(&mut self, transport: Box<dyn Transport>) {
        self.transport = Some(transport);
    }

    #[cfg(test)]
    pub(crate) fn inject(&mut self, raw: &str) {
        self.handle_transport_event(TransportEvent::Raw(raw.to_string()));
    }

    #[cfg(test)]
    pub(crate) fn active_handler_count(&mut self) -> usize {
        self.handlers.drain_pending();
        self.handlers.active.len()
    }
}
