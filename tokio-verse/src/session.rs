// Copyright (c) 2026 verse contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Session caching for BOSH keepalive.
//!
//! With the `keepalive` option enabled, the BOSH transport writes the
//! `{jid, sid, rid}` tuple into the connection's [`SessionStore`] after
//! every completed request, and [`restore`][`crate::Connection::restore`]
//! reads it back to re-attach without authenticating again. A missing or
//! malformed entry simply means there is no session to restore.

use std::sync::{Arc, Mutex};

/// The persisted state of a live BOSH session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedSession {
    /// The full JID bound on the session.
    pub jid: String,
    /// The BOSH session id.
    pub sid: String,
    /// The next request id to use.
    pub rid: u64,
}

/// Storage for one cached session, supplied by the application.
pub trait SessionStore: Send {
    /// Persists `session`, replacing any previous entry.
    fn save(&mut self, session: &CachedSession);
    /// Reads the stored session, if any.
    fn load(&self) -> Option<CachedSession>;
    /// Drops the stored session.
    fn clear(&mut self);
}

/// A [`SessionStore`] backed by shared memory, mainly useful for tests and
/// single-process embedders.
#[derive(Default, Clone)]
pub struct MemoryStore {
    slot: Arc<Mutex<Option<CachedSession>>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    /// A second handle onto the same slot.
    pub fn handle(&self) -> MemoryStore {
        self.clone()
    }
}

impl SessionStore for MemoryStore {
    fn save(&mut self, session: &CachedSession) {
        *self.slot.lock().unwrap() = Some(session.clone());
    }

    fn load(&self) -> Option<CachedSession> {
        self.slot.lock().unwrap().clone()
    }

    fn clear(&mut self) {
        *self.slot.lock().unwrap() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_load_clear() {
        let mut store = MemoryStore::new();
        let other = store.handle();
        assert_eq!(store.load(), None);

        let session = CachedSession {
            jid: "romeo@montague.example/orchard".to_string(),
            sid: "s1".to_string(),
            rid: 1000,
        };
        store.save(&session);
        assert_eq!(other.load(), Some(session));

        store.clear();
        assert_eq!(other.load(), None);
    }
}
