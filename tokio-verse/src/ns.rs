// Copyright (c) 2026 verse contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The XML namespaces the engine needs to know about.

/// BOSH `<body/>` wrapper, XEP-0124.
pub const HTTPBIND: &str = "http://jabber.org/protocol/httpbind";
/// XMPP-over-BOSH additions, XEP-0206.
pub const XBOSH: &str = "urn:xmpp:xbosh";
/// WebSocket framing, RFC 7395.
pub const FRAMING: &str = "urn:ietf:params:xml:ns:xmpp-framing";
/// Client stanzas.
pub const CLIENT: &str = "jabber:client";
/// RFC 6120 stream elements.
pub const STREAM: &str = "http://etherx.jabber.org/streams";
/// SASL negotiation elements.
pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
/// Resource binding.
pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
/// Legacy session establishment.
pub const SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";
/// Pre-SASL jabber:iq:auth authentication, XEP-0078.
pub const AUTH: &str = "jabber:iq:auth";
/// RFC 6120 stanza error conditions.
pub const STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
