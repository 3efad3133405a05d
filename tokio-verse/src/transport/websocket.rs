// Copyright (c) 2026 verse contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! WebSocket transport, RFC 7395.
//!
//! One stanza per text frame. The stream is framed by `<open/>`/`<close/>`
//! elements in the `urn:ietf:params:xml:ns:xmpp-framing` namespace; stream
//! restarts are re-opens. A socket closure the engine did not ask for is a
//! connection failure.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use http::header::{HeaderValue, SEC_WEBSOCKET_PROTOCOL};
use minidom::Element;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, Message},
};
use url::Url;

use crate::error::{condition, Error};
use crate::ns;
use crate::stanza::serialize;
use crate::transport::{
    Outbound, SessionParams, Transport, TransportAction, TransportCtx, TransportEvent,
};

/// Idle ticks between keepalive pings (~30 s at the 100 ms tick).
const KEEPALIVE_TICKS: u32 = 300;

enum WsCommand {
    Frame(String),
    Ping,
    Close,
}

pub(crate) struct WebSocketTransport {
    url: Url,
    out_tx: Option<mpsc::UnboundedSender<WsCommand>>,
    // Frames handed to the writer task but not yet written to the socket.
    pending: Arc<AtomicUsize>,
    open: bool,
    task: Option<JoinHandle<()>>,
    idle_ticks: u32,
}

fn open_frame(domain: &str) -> String {
    let open = Element::builder("open", ns::FRAMING)
        .attr("to", domain)
        .attr("version", "1.0")
        .build();
    serialize(&open)
}

fn close_frame() -> String {
    serialize(&Element::bare("close", ns::FRAMING))
}

impl WebSocketTransport {
    pub(crate) fn new(url: Url) -> WebSocketTransport {
        WebSocketTransport {
            url,
            out_tx: None,
            pending: Arc::new(AtomicUsize::new(0)),
            open: false,
            task: None,
            idle_ticks: 0,
        }
    }

    fn queue_frame(&mut self, text: String) {
        let Some(tx) = &self.out_tx else {
            log::warn!("dropping frame, WebSocket writer is gone");
            return;
        };
        self.pending.fetch_add(1, Ordering::SeqCst);
        if tx.send(WsCommand::Frame(text)).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn on_message(&mut self, text: String, ctx: &TransportCtx<'_>) -> Vec<TransportAction> {
        let elem: Element = match text.parse() {
            Ok(elem) => elem,
            Err(e) => {
                log::warn!("WebSocket frame is not parsable XML: {}", e);
                return vec![TransportAction::BadFormat];
            }
        };
        match elem.name() {
            "open" if elem.is("open", ns::FRAMING) => {
                log::debug!("WebSocket stream opened by peer");
                Vec::new()
            }
            "close" if elem.is("close", ns::FRAMING) => {
                if ctx.disconnecting {
                    vec![TransportAction::Disconnected]
                } else {
                    log::warn!("peer closed the stream outside of a disconnect");
                    vec![TransportAction::ConnFail {
                        condition: condition::UNKNOWN.to_string(),
                    }]
                }
            }
            "error" if elem.ns() == ns::STREAM => {
                let cond = elem
                    .children()
                    .find(|child| child.name() != "text")
                    .map(|child| child.name().to_string())
                    .unwrap_or_else(|| condition::UNKNOWN.to_string());
                vec![TransportAction::ConnFail { condition: cond }]
            }
            _ => {
                // Wrap the stanza so dispatch sees the same body shape as
                // with BOSH.
                let mut body = Element::bare("body", ns::HTTPBIND);
                body.append_child(elem);
                vec![TransportAction::Deliver { body, raw: text }]
            }
        }
    }
}

impl Transport for WebSocketTransport {
    fn protocol(&self) -> &'static str {
        "websocket"
    }

    fn connect(&mut self, _params: &SessionParams, ctx: TransportCtx<'_>) -> Result<(), Error> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.out_tx = Some(tx);
        self.open = false;
        self.idle_ticks = 0;
        self.pending = Arc::new(AtomicUsize::new(0));

        let pending = self.pending.clone();
        let events = ctx.events.clone();
        let url = self.url.to_string();
        let domain = ctx.domain.unwrap_or_default().to_string();

        self.task = Some(tokio::spawn(async move {
            let mut request = match url.as_str().into_client_request() {
                Ok(request) => request,
                Err(e) => {
                    let _ = events.send(TransportEvent::WsClosed {
                        error: Some(e.to_string()),
                    });
                    return;
                }
            };
            request
                .headers_mut()
                .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("xmpp"));
            let (stream, _) = match connect_async(request).await {
                Ok(pair) => pair,
                Err(e) => {
                    let _ = events.send(TransportEvent::WsClosed {
                        error: Some(e.to_string()),
                    });
                    return;
                }
            };
            let _ = events.send(TransportEvent::WsConnected);

            let (mut sink, mut source) = stream.split();
            let writer = tokio::spawn(async move {
                while let Some(cmd) = rx.recv().await {
                    match cmd {
                        WsCommand::Frame(text) => {
                            let result = sink.send(Message::Text(text)).await;
                            pending.fetch_sub(1, Ordering::SeqCst);
                            if result.is_err() {
                                break;
                            }
                        }
                        WsCommand::Ping => {
                            if sink.send(Message::Ping(Vec::new())).await.is_err() {
                                break;
                            }
                        }
                        WsCommand::Close => {
                            let _ = sink.send(Message::Close(None)).await;
                            break;
                        }
                    }
                }
            });

            while let Some(message) = source.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        let _ = events.send(TransportEvent::WsMessage(text));
                    }
                    Ok(Message::Close(_)) => {
                        let _ = events.send(TransportEvent::WsClosed { error: None });
                        writer.abort();
                        return;
                    }
                    // Pings are answered by tungstenite itself.
                    Ok(_) => {}
                    Err(e) => {
                        let _ = events.send(TransportEvent::WsClosed {
                            error: Some(e.to_string()),
                        });
                        writer.abort();
                        return;
                    }
                }
            }
            let _ = events.send(TransportEvent::WsClosed { error: None });
            writer.abort();
        }));

        // The stream open travels through the same writer, so it goes out
        // first no matter how early the engine queues stanzas.
        self.queue_frame(open_frame(&domain));
        Ok(())
    }

    fn handle_event(
        &mut self,
        event: TransportEvent,
        ctx: TransportCtx<'_>,
    ) -> Vec<TransportAction> {
        match event {
            TransportEvent::WsConnected => {
                log::debug!("WebSocket connected to {}", self.url);
                self.open = true;
                Vec::new()
            }
            TransportEvent::WsMessage(text) => self.on_message(text, &ctx),
            TransportEvent::WsClosed { error } => {
                self.open = false;
                self.out_tx = None;
                if ctx.disconnecting && error.is_none() {
                    vec![TransportAction::Disconnected]
                } else if !ctx.connected {
                    vec![TransportAction::ConnFail {
                        condition: condition::BAD_SERVICE.to_string(),
                    }]
                } else {
                    log::warn!("WebSocket closed unexpectedly: {:?}", error);
                    vec![TransportAction::ConnFail {
                        condition: condition::UNKNOWN.to_string(),
                    }]
                }
            }
            _ => Vec::new(),
        }
    }

    fn on_idle(&mut self, queue: &mut VecDeque<Outbound>, ctx: TransportCtx<'_>) {
        if self.out_tx.is_none() {
            return;
        }
        while let Some(item) = queue.pop_front() {
            match item {
                Outbound::Stanza(stanza) => {
                    ctx.hooks.xml_output(&stanza);
                    let text = serialize(&stanza);
                    ctx.hooks.raw_output(&text);
                    self.queue_frame(text);
                }
                Outbound::Restart => {
                    let open = open_frame(ctx.domain.unwrap_or_default());
                    ctx.hooks.raw_output(&open);
                    self.queue_frame(open);
                }
            }
        }
        if ctx.options.keepalive && self.open {
            self.idle_ticks += 1;
            if self.idle_ticks >= KEEPALIVE_TICKS {
                self.idle_ticks = 0;
                if let Some(tx) = &self.out_tx {
                    let _ = tx.send(WsCommand::Ping);
                }
            }
        }
    }

    fn disconnect(&mut self, presence: Option<Element>, ctx: TransportCtx<'_>) {
        if let Some(presence) = presence {
            ctx.hooks.xml_output(&presence);
            let text = serialize(&presence);
            ctx.hooks.raw_output(&text);
            self.queue_frame(text);
        }
        self.queue_frame(close_frame());
    }

    fn on_disconnect_timeout(&mut self) {
        if let Some(tx) = &self.out_tx {
            let _ = tx.send(WsCommand::Close);
        }
    }

    fn after_disconnect(&mut self) {
        if let Some(tx) = self.out_tx.take() {
            let _ = tx.send(WsCommand::Close);
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.open = false;
    }

    fn empty_queue(&self) -> bool {
        self.pending.load(Ordering::SeqCst) == 0
    }
}
