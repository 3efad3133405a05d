// Copyright (c) 2026 verse contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Detailed error types.

use std::error::Error as StdError;
use std::fmt;

use verse_sasl::MechanismError;

/// Top-level error type
#[derive(Debug)]
pub enum Error {
    /// Error parsing Jabber-Id
    JidParse(jid::Error),
    /// Error parsing the service URL
    Url(url::ParseError),
    /// Protocol-level error
    Protocol(ProtocolError),
    /// Authentication error
    Auth(AuthError),
    /// HTTP client error (BOSH)
    Http(reqwest::Error),
    /// Connection closed
    Disconnected,
    /// Should never happen
    InvalidState,
    /// No cached session is available to restore
    NoRestorableSession,
    /// The operation is not supported by the active transport
    Unsupported(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::JidParse(e) => write!(fmt, "jid parse error: {}", e),
            Error::Url(e) => write!(fmt, "service url error: {}", e),
            Error::Protocol(e) => write!(fmt, "protocol error: {}", e),
            Error::Auth(e) => write!(fmt, "authentication error: {}", e),
            Error::Http(e) => write!(fmt, "HTTP error: {}", e),
            Error::Disconnected => write!(fmt, "disconnected"),
            Error::InvalidState => write!(fmt, "invalid state"),
            Error::NoRestorableSession => write!(fmt, "no restorable session"),
            Error::Unsupported(what) => write!(fmt, "unsupported operation: {}", what),
        }
    }
}

impl StdError for Error {}

impl From<jid::Error> for Error {
    fn from(e: jid::Error) -> Self {
        Error::JidParse(e)
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::Url(e)
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Error::Protocol(e)
    }
}

impl From<AuthError> for Error {
    fn from(e: AuthError) -> Self {
        Error::Auth(e)
    }
}

impl From<minidom::Error> for Error {
    fn from(e: minidom::Error) -> Self {
        ProtocolError::Parser(e).into()
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(e)
    }
}

/// XMPP protocol-level error
#[derive(Debug)]
pub enum ProtocolError {
    /// XML parser error
    Parser(minidom::Error),
    /// A wire payload could not be interpreted as XML
    BadFormat,
    /// Invalid response to resource binding
    InvalidBindResponse,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProtocolError::Parser(e) => write!(fmt, "XML parser error: {}", e),
            ProtocolError::BadFormat => write!(fmt, "payload is not well-formed XML"),
            ProtocolError::InvalidBindResponse => {
                write!(fmt, "invalid response to resource binding")
            }
        }
    }
}

impl StdError for ProtocolError {}

impl From<minidom::Error> for ProtocolError {
    fn from(e: minidom::Error) -> Self {
        ProtocolError::Parser(e)
    }
}

/// Authentication error
#[derive(Debug)]
pub enum AuthError {
    /// No matching SASL mechanism available
    NoMechanism,
    /// Local SASL implementation error
    Sasl(MechanismError),
    /// Failure from server, with the defined condition if one was parsable
    Fail(String),
}

impl fmt::Display for AuthError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AuthError::NoMechanism => write!(fmt, "no matching SASL mechanism available"),
            AuthError::Sasl(e) => write!(fmt, "local SASL implementation error: {}", e),
            AuthError::Fail(c) => write!(fmt, "failure from the server: {}", c),
        }
    }
}

impl StdError for AuthError {}

impl From<MechanismError> for AuthError {
    fn from(e: MechanismError) -> Self {
        AuthError::Sasl(e)
    }
}

/// The condition strings carried through status callbacks.
pub mod condition {
    /// A wire payload could not be parsed as XML.
    pub const BAD_FORMAT: &str = "bad-format";
    /// Bind-time resource conflict, or a remote stream error containing
    /// `<conflict/>`.
    pub const CONFLICT: &str = "conflict";
    /// Legacy authentication was attempted with a JID that has no node.
    pub const BAD_NON_ANON_JID: &str = "x-verse-bad-non-anon-jid";
    /// The server advertised no SASL mechanism we can satisfy.
    pub const NO_AUTH_MECH: &str = "no-auth-mech";
    /// The stream was terminated with no parsable condition.
    pub const UNKNOWN: &str = "unknown";
    /// The service could not be reached at the transport level.
    pub const BAD_SERVICE: &str = "bad-service";
}
