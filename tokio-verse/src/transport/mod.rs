// Copyright (c) 2026 verse contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The transport seam between the connection engine and the wire.
//!
//! A transport owns its protocol state (request windows, sockets) and runs
//! its I/O in spawned tasks which report back through the connection's
//! event channel. The connection hands the transport a [`TransportCtx`] view
//! of its own state on every call; transports never hold a reference to the
//! connection.

use std::collections::VecDeque;

use minidom::Element;
use tokio::sync::mpsc;

use crate::connection::{Hooks, Options};
use crate::error::Error;
use crate::session::SessionStore;

mod bosh;
mod websocket;

pub(crate) use bosh::BoshTransport;
pub(crate) use websocket::WebSocketTransport;

/// An entry in the connection's outgoing queue: either a stanza or the
/// stream-restart marker.
#[derive(Debug)]
pub(crate) enum Outbound {
    Stanza(Element),
    Restart,
}

/// Raw I/O completions reported by transport tasks.
#[derive(Debug)]
pub(crate) enum TransportEvent {
    /// A BOSH HTTP exchange finished; `body` is `Err` on a network error.
    HttpResponse {
        rid: u64,
        status: u16,
        body: Result<String, String>,
    },
    /// The WebSocket handshake completed.
    WsConnected,
    /// A WebSocket text frame arrived.
    WsMessage(String),
    /// The WebSocket closed; `error` is set when it was not a clean close.
    WsClosed { error: Option<String> },
    /// Test injection of a pre-framed body.
    #[cfg(test)]
    Raw(String),
}

/// What the connection should do about a transport event.
pub(crate) enum TransportAction {
    /// A `<body/>`-wrapped batch of stanzas to dispatch.
    Deliver { body: Element, raw: String },
    /// The payload was not well-formed XML.
    BadFormat,
    /// The stream is dead; emit CONNFAIL with `condition`.
    ConnFail { condition: String },
    /// Route a protocol-level error code through the handler table.
    ProtocolError { protocol: &'static str, code: u16 },
    /// An expected teardown completed.
    Disconnected,
}

/// The connection-state view passed into every transport call.
pub(crate) struct TransportCtx<'x> {
    pub events: &'x mpsc::UnboundedSender<TransportEvent>,
    pub domain: Option<&'x str>,
    pub jid: Option<&'x str>,
    pub connected: bool,
    pub authenticated: bool,
    pub disconnecting: bool,
    pub options: &'x Options,
    pub hooks: &'x mut Hooks,
    pub store: &'x mut Option<Box<dyn SessionStore>>,
}

/// Session negotiation parameters from `connect`/`attach`.
#[derive(Debug, Clone)]
pub(crate) struct SessionParams {
    pub wait: u32,
    pub hold: u32,
    pub route: Option<String>,
}

impl Default for SessionParams {
    fn default() -> Self {
        SessionParams {
            wait: 60,
            hold: 1,
            route: None,
        }
    }
}

pub(crate) trait Transport: Send {
    /// Protocol key used in the protocol-error-handler table.
    fn protocol(&self) -> &'static str;

    /// Opens the underlying channel and initiates the stream.
    fn connect(&mut self, params: &SessionParams, ctx: TransportCtx<'_>) -> Result<(), Error>;

    /// Classifies the first parsed response; `Some(condition)` means the
    /// connection attempt failed fatally.
    fn connect_fail_condition(&self, body: &Element) -> Option<String> {
        let _ = body;
        None
    }

    /// Digests one raw I/O completion into engine actions.
    fn handle_event(&mut self, event: TransportEvent, ctx: TransportCtx<'_>)
        -> Vec<TransportAction>;

    /// Flushes the outgoing queue as far as the protocol window allows and
    /// performs periodic duties (polling, keepalive). Driven by the 100 ms
    /// idle tick and by [`flush`][`crate::Connection::flush`].
    fn on_idle(&mut self, queue: &mut VecDeque<Outbound>, ctx: TransportCtx<'_>);

    /// Starts a graceful stream teardown, sending `presence` first if given.
    fn disconnect(&mut self, presence: Option<Element>, ctx: TransportCtx<'_>);

    /// The graceful teardown timed out; abort whatever is in flight.
    fn on_disconnect_timeout(&mut self);

    /// Final cleanup once the connection considers itself down.
    fn after_disconnect(&mut self);

    /// True iff nothing is in flight on the wire.
    fn empty_queue(&self) -> bool;

    /// Called when the connect response carried no stream features. A `true`
    /// return means the transport issued another attempt to fetch them.
    fn no_auth_received(&mut self, ctx: TransportCtx<'_>) -> bool {
        let _ = ctx;
        false
    }

    /// Adopts an externally established session (BOSH only).
    fn attach(&mut self, sid: &str, rid: u64, params: &SessionParams) -> Result<(), Error> {
        let _ = (sid, rid, params);
        Err(Error::Unsupported("attach requires the BOSH transport"))
    }
}

/// Picks the transport for a service URL. `ws`/`wss` schemes — or the
/// explicit `protocol` option — select WebSocket, anything else BOSH.
pub(crate) fn create_transport(
    service: &str,
    options: &Options,
) -> Result<Box<dyn Transport>, Error> {
    let url = url::Url::parse(service)?;
    let forced_ws = matches!(options.protocol.as_deref(), Some("ws") | Some("wss"));
    if forced_ws || url.scheme() == "ws" || url.scheme() == "wss" {
        let url = match (forced_ws, url.scheme()) {
            (true, "http") => {
                let mut url = url;
                let _ = url.set_scheme("ws");
                url
            }
            (true, "https") => {
                let mut url = url;
                let _ = url.set_scheme("wss");
                url
            }
            _ => url,
        };
        Ok(Box::new(WebSocketTransport::new(url)))
    } else {
        Ok(Box::new(BoshTransport::new(url, options)))
    }
}
