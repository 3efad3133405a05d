// Copyright (c) 2026 verse contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! BOSH transport, XEP-0124/0206.
//!
//! XMPP tunneled through HTTP request/response pairs. Every request carries
//! a `<body/>` envelope with a strictly increasing `rid`; the server holds
//! up to `hold` requests open so it always has somewhere to push data. At
//! most `hold + 1` requests are in flight at any time.
//!
//! Each request runs as a spawned task; its outcome comes back through the
//! connection's event channel as an [`TransportEvent::HttpResponse`] and is
//! paired to its request record by rid here.

use std::collections::VecDeque;
use std::time::Duration;

use minidom::Element;
use rand::{thread_rng, Rng};
use url::Url;

use crate::connection::Options;
use crate::error::{condition, Error};
use crate::ns;
use crate::session::CachedSession;
use crate::stanza::{escape_attr, serialize};
use crate::transport::{
    Outbound, SessionParams, Transport, TransportAction, TransportCtx, TransportEvent,
};

/// The engine caps rid growth per XEP-0124 §14.2 recommendations; the
/// initial rid leaves plenty of room below 2^53.
const MAX_INITIAL_RID: u64 = 4294967295;

const DEFAULT_CONTENT_TYPE: &str = "text/xml; charset=utf-8";

/// Gives up on a stream after this many consecutive request failures.
const MAX_CONSECUTIVE_ERRORS: u32 = 4;

struct BoshRequest {
    rid: u64,
    serialized: String,
    sends: u32,
    abort: bool,
}

pub(crate) struct BoshTransport {
    url: Url,
    client: reqwest::Client,
    rid: u64,
    sid: Option<String>,
    wait: u32,
    hold: u32,
    window: usize,
    requests: Vec<BoshRequest>,
    errors: u32,
    max_retries: u32,
    no_auth_retries: u32,
    content_type: String,
}

impl BoshTransport {
    pub(crate) fn new(url: Url, options: &Options) -> BoshTransport {
        BoshTransport {
            url,
            client: reqwest::Client::new(),
            rid: 0,
            sid: None,
            wait: 60,
            hold: 1,
            window: 2,
            requests: Vec::new(),
            errors: 0,
            max_retries: options.max_retries,
            no_auth_retries: 0,
            content_type: options
                .content_type
                .clone()
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
        }
    }

    fn take_rid(&mut self) -> u64 {
        let rid = self.rid;
        self.rid += 1;
        rid
    }

    /// Renders a `<body/>` envelope. The envelope is wire framing, not
    /// stanza content, so it is assembled textually; the prefixed
    /// `xmpp:restart`/`xmpp:version` attributes have no element-tree
    /// representation.
    fn render_body(rid: u64, sid: Option<&str>, extra: &[(&str, &str)], payload: &str) -> String {
        let mut out = String::from("<body");
        let mut push_attr = |name: &str, value: &str| {
            out.push(' ');
            out.push_str(name);
            out.push_str("='");
            out.push_str(&escape_attr(value));
            out.push('\'');
        };
        push_attr("rid", &rid.to_string());
        if let Some(sid) = sid {
            push_attr("sid", sid);
        }
        for (name, value) in extra {
            push_attr(name, value);
        }
        push_attr("xmlns", ns::HTTPBIND);
        if payload.is_empty() {
            out.push_str("/>");
        } else {
            out.push('>');
            out.push_str(payload);
            out.push_str("</body>");
        }
        out
    }

    fn new_request(&mut self, extra: &[(&str, &str)], payload: &str, ctx: &mut TransportCtx<'_>) {
        let rid = self.take_rid();
        let serialized = Self::render_body(rid, self.sid.as_deref(), extra, payload);
        self.requests.push(BoshRequest {
            rid,
            serialized,
            sends: 0,
            abort: false,
        });
        let idx = self.requests.len() - 1;
        self.submit(idx, ctx);
    }

    fn submit(&mut self, idx: usize, ctx: &mut TransportCtx<'_>) {
        let req = &mut self.requests[idx];
        req.sends += 1;
        ctx.hooks.raw_output(&req.serialized);
        log::trace!("BOSH out (rid {} send {}): {}", req.rid, req.sends, req.serialized);

        let client = self.client.clone();
        let url = self.url.clone();
        let body = req.serialized.clone();
        let rid = req.rid;
        let content_type = self.content_type.clone();
        let headers = ctx.options.custom_headers.clone();
        let cookies = ctx.options.cookies.clone();
        let events = ctx.events.clone();
        tokio::spawn(async move {
            let mut request = client
                .post(url)
                .header(http::header::CONTENT_TYPE, content_type)
                .body(body);
            for (name, value) in &headers {
                request = request.header(name.as_str(), value.as_str());
            }
            if !cookies.is_empty() {
                let cookie = cookies
                    .iter()
                    .map(|(name, value)| format!("{}={}", name, value))
                    .collect::<Vec<_>>()
                    .join("; ");
                request = request.header(http::header::COOKIE, cookie);
            }
            let event = match request.send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    match response.text().await {
                        Ok(text) => TransportEvent::HttpResponse {
                            rid,
                            status,
                            body: Ok(text),
                        },
                        Err(e) => TransportEvent::HttpResponse {
                            rid,
                            status,
                            body: Err(e.to_string()),
                        },
                    }
                }
                Err(e) => TransportEvent::HttpResponse {
                    rid,
                    status: 0,
                    body: Err(e.to_string()),
                },
            };
            // The receiver only goes away when the connection is dropped.
            let _ = events.send(event);
        });
    }

    fn send_restart(&mut self, ctx: &mut TransportCtx<'_>) {
        let domain = ctx.domain.unwrap_or_default().to_string();
        self.new_request(
            &[
                ("to", domain.as_str()),
                ("xml:lang", "en"),
                ("xmpp:restart", "true"),
                ("xmlns:xmpp", ns::XBOSH),
            ],
            "",
            ctx,
        );
    }

    fn flush_stanzas(&mut self, queue: &mut VecDeque<Outbound>, ctx: &mut TransportCtx<'_>) {
        while !queue.is_empty() && self.requests.len() < self.window {
            match queue.front() {
                Some(Outbound::Restart) => {
                    queue.pop_front();
                    self.send_restart(ctx);
                }
                Some(Outbound::Stanza(_)) => {
                    let mut payload = String::new();
                    while let Some(Outbound::Stanza(_)) = queue.front() {
                        let Some(Outbound::Stanza(stanza)) = queue.pop_front() else {
                            break;
                        };
                        ctx.hooks.xml_output(&stanza);
                        payload.push_str(&serialize(&stanza));
                    }
                    self.new_request(&[], &payload, ctx);
                }
                None => break,
            }
        }
    }

    fn on_response_body(
        &mut self,
        rid: u64,
        text: String,
        ctx: &mut TransportCtx<'_>,
    ) -> Vec<TransportAction> {
        self.errors = 0;
        let elem: Element = match text.parse() {
            Ok(elem) => elem,
            Err(e) => {
                log::warn!("BOSH response (rid {}) is not parsable XML: {}", rid, e);
                return vec![TransportAction::BadFormat];
            }
        };
        if elem.name() != "body" {
            log::warn!("BOSH response (rid {}) is not a <body/> wrapper", rid);
            return vec![TransportAction::BadFormat];
        }

        if self.sid.is_none() {
            if let Some(sid) = elem.attr("sid") {
                log::debug!("BOSH session established, sid {}", sid);
                self.sid = Some(sid.to_string());
            }
            if let Some(requests) = elem.attr("requests").and_then(|r| r.parse::<usize>().ok()) {
                if requests > 0 {
                    self.window = requests.min(self.hold as usize + 1).max(1);
                }
            }
        }

        ctx.hooks.next_valid_rid(rid + 1);
        if ctx.options.keepalive {
            if let (Some(store), Some(jid), Some(sid)) = (ctx.store.as_deref_mut(), ctx.jid, &self.sid) {
                store.save(&CachedSession {
                    jid: jid.to_string(),
                    sid: sid.clone(),
                    rid: self.rid,
                });
            }
        }

        vec![TransportAction::Deliver {
            body: elem,
            raw: text,
        }]
    }

    fn on_request_failure(
        &mut self,
        pos: usize,
        status: u16,
        detail: Option<String>,
        ctx: &mut TransportCtx<'_>,
    ) -> Vec<TransportAction> {
        let transient = status == 0 || status >= 500;
        if transient && self.requests[pos].sends < self.max_retries {
            log::warn!(
                "BOSH request rid {} failed (status {}, {:?}); retrying",
                self.requests[pos].rid,
                status,
                detail
            );
            self.submit(pos, ctx);
            return Vec::new();
        }

        let req = self.requests.remove(pos);
        self.errors += 1;
        log::error!(
            "BOSH request rid {} failed definitively (status {}, {:?}, {} consecutive errors)",
            req.rid,
            status,
            detail,
            self.errors
        );
        let mut actions = vec![TransportAction::ProtocolError {
            protocol: "HTTP",
            code: status,
        }];
        if !ctx.connected {
            actions.push(TransportAction::ConnFail {
                condition: condition::BAD_SERVICE.to_string(),
            });
        } else if self.errors > MAX_CONSECUTIVE_ERRORS {
            actions.push(TransportAction::Disconnected);
        }
        actions
    }
}

impl Transport for BoshTransport {
    fn protocol(&self) -> &'static str {
        "HTTP"
    }

    fn connect(&mut self, params: &SessionParams, mut ctx: TransportCtx<'_>) -> Result<(), Error> {
        self.wait = params.wait;
        self.hold = params.hold;
        self.window = if ctx.options.sync {
            1
        } else {
            params.hold as usize + 1
        };
        self.rid = thread_rng().gen_range(0..MAX_INITIAL_RID);
        self.sid = None;
        self.errors = 0;
        self.no_auth_retries = 0;
        self.requests.clear();
        // Allow the server the full `wait` long-poll interval plus slack
        // before a request counts as lost.
        self.client = reqwest::Client::builder()
            .timeout(Duration::from_secs(u64::from(params.wait) + 10))
            .build()?;

        let domain = ctx.domain.unwrap_or_default().to_string();
        let wait = self.wait.to_string();
        let hold = self.hold.to_string();
        let content_type = self.content_type.clone();
        let mut extra: Vec<(&str, &str)> = vec![
            ("content", content_type.as_str()),
            ("hold", hold.as_str()),
            ("to", domain.as_str()),
            ("ver", "1.6"),
            ("wait", wait.as_str()),
            ("xml:lang", "en"),
            ("xmlns:xmpp", ns::XBOSH),
            ("xmpp:version", "1.0"),
        ];
        let route = params.route.clone();
        if let Some(route) = &route {
            extra.push(("route", route.as_str()));
        }
        self.new_request(&extra, "", &mut ctx);
        Ok(())
    }

    fn connect_fail_condition(&self, body: &Element) -> Option<String> {
        if body.attr("type") == Some("terminate") {
            let cond = body
                .attr("condition")
                .unwrap_or(condition::UNKNOWN)
                .to_string();
            return Some(cond);
        }
        None
    }

    fn handle_event(
        &mut self,
        event: TransportEvent,
        mut ctx: TransportCtx<'_>,
    ) -> Vec<TransportAction> {
        let TransportEvent::HttpResponse { rid, status, body } = event else {
            log::trace!("ignoring non-HTTP transport event on BOSH");
            return Vec::new();
        };
        let Some(pos) = self.requests.iter().position(|r| r.rid == rid) else {
            log::trace!("dropping response for unknown rid {}", rid);
            return Vec::new();
        };
        if self.requests[pos].abort {
            self.requests.remove(pos);
            return Vec::new();
        }
        match body {
            Ok(text) if (200..300).contains(&status) => {
                self.requests.remove(pos);
                self.on_response_body(rid, text, &mut ctx)
            }
            Ok(_) => self.on_request_failure(pos, status, None, &mut ctx),
            Err(detail) => self.on_request_failure(pos, status, Some(detail), &mut ctx),
        }
    }

    fn on_idle(&mut self, queue: &mut VecDeque<Outbound>, mut ctx: TransportCtx<'_>) {
        if self.sid.is_none() {
            // Still waiting for the session creation response; everything
            // stays queued.
            return;
        }
        self.flush_stanzas(queue, &mut ctx);
        // Keep a request pending so the server can push data at any time.
        if ctx.authenticated
            && !ctx.disconnecting
            && self.requests.is_empty()
            && queue.is_empty()
        {
            self.new_request(&[], "", &mut ctx);
        }
    }

    fn disconnect(&mut self, presence: Option<Element>, mut ctx: TransportCtx<'_>) {
        if self.sid.is_none() {
            return;
        }
        let payload = presence.as_ref().map(serialize).unwrap_or_default();
        self.new_request(&[("type", "terminate")], &payload, &mut ctx);
    }

    fn on_disconnect_timeout(&mut self) {
        for req in &mut self.requests {
            req.abort = true;
        }
    }

    fn after_disconnect(&mut self) {
        self.requests.clear();
        self.sid = None;
        self.no_auth_retries = 0;
        self.errors = 0;
    }

    fn empty_queue(&self) -> bool {
        self.requests.is_empty()
    }

    fn no_auth_received(&mut self, mut ctx: TransportCtx<'_>) -> bool {
        // Some servers only include stream features in the response to a
        // follow-up request; give them one chance.
        if self.no_auth_retries == 0 && self.sid.is_some() {
            self.no_auth_retries = 1;
            self.new_request(&[], "", &mut ctx);
            true
        } else {
            false
        }
    }

    fn attach(&mut self, sid: &str, rid: u64, params: &SessionParams) -> Result<(), Error> {
        self.sid = Some(sid.to_string());
        self.rid = rid;
        self.wait = params.wait;
        self.hold = params.hold;
        self.window = params.hold as usize + 1;
        self.requests.clear();
        self.errors = 0;
        Ok(())
    }
}
