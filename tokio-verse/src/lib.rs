// Copyright (c) 2026 verse contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! XMPP client connection engine over [BOSH](https://xmpp.org/extensions/xep-0124.html)
//! and [WebSocket](https://tools.ietf.org/html/rfc7395) with asynchronous
//! I/O using [tokio](https://tokio.rs/).
//!
//! # Getting started
//!
//! Create a [`Connection`] for a BOSH (`https://…/http-bind`) or WebSocket
//! (`wss://…/xmpp-websocket`) endpoint, register handlers for the stanzas
//! you care about, call [`Connection::connect`] with a status callback, and
//! drive the engine with [`Connection::run`]. Everything — authentication,
//! resource binding, dispatch — happens through that loop; your callbacks
//! receive `&mut Connection` and may send stanzas, add handlers or
//! disconnect from inside. You can find a complete example in the
//! [examples/echo_bot.rs](https://gitlab.com/verse-rs/verse/-/blob/main/tokio-verse/examples/echo_bot.rs)
//! file in the repository.
//!
//! # Features
//!
//! Supported transports:
//! - [x] BOSH (XEP-0124/0206), including `attach`/`restore` of external
//!   sessions
//! - [x] WebSocket (RFC 7395)
//! - [ ] Plain TCP/StartTLS
//!
//! Authentication is provided by the [`verse-sasl`](verse_sasl) crate:
//! SCRAM-SHA-1, PLAIN, OAUTHBEARER, DIGEST-MD5, X-OAUTH2, ANONYMOUS and
//! EXTERNAL, plus the pre-SASL jabber:iq:auth fallback for legacy servers.

#![deny(unsafe_code, missing_docs, bare_trait_objects)]

pub use minidom;
pub use verse_sasl as sasl;

mod connection;
/// Detailed error types
pub mod error;
pub mod handler;
pub mod ns;
pub mod session;
pub mod stanza;
mod transport;

#[doc(inline)]
/// Generic tokio_verse Error
pub use crate::error::Error;
pub use connection::{
    ConnectOptions, Connection, Hooks, IqCallback, Options, ProtocolErrorCallback, SendItem,
    Status, StatusCallback,
};
pub use handler::{HandlerCallback, HandlerRef, Match, TimedCallback, TimedRef};

#[cfg(test)]
mod tests {
    #[test]
    fn reexports() {
        #[allow(unused_imports)]
        use crate::minidom;
        #[allow(unused_imports)]
        use crate::sasl;
    }
}
