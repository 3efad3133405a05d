// Copyright (c) 2026 verse contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Stanza handlers and timed handlers.
//!
//! A handler couples a [`Match`] predicate with a callback. Handlers are
//! persistent: a callback returning `true` stays registered, `false` drops
//! it. Additions and removals made while a dispatch pass is running are
//! deferred — they take effect at the next [`data_recv`] or idle tick, never
//! in the middle of iterating the active list.
//!
//! [`data_recv`]: crate::Connection

use core::time::Duration;

use jid::Jid;
use minidom::Element;
use tokio::time::Instant;

use crate::Connection;

/// Identifies a registered stanza handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerRef(pub(crate) u64);

/// Identifies a registered timed handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimedRef(pub(crate) u64);

/// Callback invoked for every matching stanza; return `true` to stay
/// registered.
pub type HandlerCallback = Box<dyn FnMut(&mut Connection, &Element) -> bool + Send>;

/// Callback invoked on schedule; return `true` to rearm.
pub type TimedCallback = Box<dyn FnMut(&mut Connection) -> bool + Send>;

/// The match predicates of a stanza handler. All configured predicates must
/// hold for the handler to fire.
#[derive(Debug, Clone, Default)]
pub struct Match {
    pub(crate) ns: Option<String>,
    pub(crate) name: Option<String>,
    // The outer Option distinguishes "no type filter" from a filter set; a
    // None *inside* the set matches stanzas without a type attribute.
    pub(crate) types: Option<Vec<Option<String>>>,
    pub(crate) id: Option<String>,
    pub(crate) from: Option<String>,
    pub(crate) match_bare_from_jid: bool,
    pub(crate) ignore_namespace_fragment: bool,
    pub(crate) starts_with_id: bool,
    pub(crate) ends_with_id: bool,
}

impl Match {
    /// A predicate that matches every stanza.
    pub fn any() -> Match {
        Match::default()
    }

    /// Requires the stanza's namespace — or any immediate child's — to equal
    /// `ns`.
    pub fn ns(mut self, ns: &str) -> Match {
        self.ns = Some(ns.to_string());
        self
    }

    /// Requires the stanza's element name to equal `name`.
    pub fn name(mut self, name: &str) -> Match {
        self.name = Some(name.to_string());
        self
    }

    /// Requires the stanza's `type` attribute to equal `typ`.
    pub fn typ(mut self, typ: &str) -> Match {
        self.types
            .get_or_insert_with(Vec::new)
            .push(Some(typ.to_string()));
        self
    }

    /// Accepts any `type` out of `types`; a `None` entry matches stanzas
    /// without a type attribute.
    pub fn types(mut self, types: &[Option<&str>]) -> Match {
        let set = self.types.get_or_insert_with(Vec::new);
        for typ in types {
            set.push(typ.map(str::to_string));
        }
        self
    }

    /// Requires the stanza's `id` attribute to equal `id`.
    pub fn id(mut self, id: &str) -> Match {
        self.id = Some(id.to_string());
        self
    }

    /// Requires the stanza's `from` attribute to equal `from`.
    pub fn from(mut self, from: &str) -> Match {
        self.from = Some(from.to_string());
        self
    }

    /// Compares `from` values in bare-JID form.
    pub fn match_bare_from_jid(mut self) -> Match {
        self.match_bare_from_jid = true;
        self
    }

    /// Strips `#fragment` suffixes from namespaces before comparing.
    pub fn ignore_namespace_fragment(mut self) -> Match {
        self.ignore_namespace_fragment = true;
        self
    }

    /// Matches ids which merely start with the configured id.
    pub fn starts_with_id(mut self) -> Match {
        self.starts_with_id = true;
        self
    }

    /// Matches ids which merely end with the configured id.
    pub fn ends_with_id(mut self) -> Match {
        self.ends_with_id = true;
        self
    }

    fn strip_fragment<'x>(&self, ns: &'x str) -> &'x str {
        if self.ignore_namespace_fragment {
            ns.split('#').next().unwrap_or(ns)
        } else {
            ns
        }
    }

    fn ns_matches(&self, stanza: &Element) -> bool {
        let Some(want) = &self.ns else {
            return true;
        };
        if self.strip_fragment(&stanza.ns()) == want {
            return true;
        }
        stanza
            .children()
            .any(|child| self.strip_fragment(&child.ns()) == want)
    }

    fn type_matches(&self, stanza: &Element) -> bool {
        let Some(set) = &self.types else {
            return true;
        };
        let typ = stanza.attr("type");
        set.iter().any(|want| want.as_deref() == typ)
    }

    fn id_matches(&self, stanza: &Element) -> bool {
        let Some(want) = &self.id else {
            return true;
        };
        let Some(id) = stanza.attr("id") else {
            return false;
        };
        if self.starts_with_id {
            id.starts_with(want.as_str())
        } else if self.ends_with_id {
            id.ends_with(want.as_str())
        } else {
            id == want
        }
    }

    fn from_matches(&self, stanza: &Element) -> bool {
        let Some(want) = &self.from else {
            return true;
        };
        let Some(from) = stanza.attr("from") else {
            return false;
        };
        if self.match_bare_from_jid {
            bare(from) == bare(want)
        } else {
            from == want
        }
    }

    /// True iff every configured predicate holds for `stanza`.
    pub fn matches(&self, stanza: &Element) -> bool {
        self.ns_matches(stanza)
            && self.name.as_deref().map_or(true, |n| stanza.name() == n)
            && self.type_matches(stanza)
            && self.id_matches(stanza)
            && self.from_matches(stanza)
    }
}

/// The bare form of a JID string; unparsable input is compared verbatim.
fn bare(jid: &str) -> String {
    match jid.parse::<Jid>() {
        Ok(jid) => jid.to_bare().to_string(),
        Err(_) => jid.to_string(),
    }
}

pub(crate) struct StanzaHandler {
    pub(crate) id: HandlerRef,
    pub(crate) matcher: Match,
    pub(crate) user: bool,
    pub(crate) callback: HandlerCallback,
}

pub(crate) struct TimedHandler {
    pub(crate) id: TimedRef,
    pub(crate) period: Duration,
    pub(crate) last_called: Instant,
    pub(crate) user: bool,
    pub(crate) callback: TimedCallback,
}

/// Active list plus the deferred add/remove lists.
pub(crate) struct HandlerSet<H> {
    pub(crate) active: Vec<H>,
    pub(crate) pending_add: Vec<H>,
    pub(crate) pending_remove: Vec<u64>,
    // Bumped on clear() so a dispatch pass can tell that a callback tore
    // the lists down and its snapshot must not be restored.
    pub(crate) epoch: u64,
}

impl<H> Default for HandlerSet<H> {
    fn default() -> Self {
        HandlerSet {
            active: Vec::new(),
            pending_add: Vec::new(),
            pending_remove: Vec::new(),
            epoch: 0,
        }
    }
}

pub(crate) trait HasId {
    fn raw_id(&self) -> u64;
}

impl HasId for StanzaHandler {
    fn raw_id(&self) -> u64 {
        self.id.0
    }
}

impl HasId for TimedHandler {
    fn raw_id(&self) -> u64 {
        self.id.0
    }
}

impl<H: HasId> HandlerSet<H> {
    /// Drains removals against the active list, then promotes pending adds.
    pub(crate) fn drain_pending(&mut self) {
        if !self.pending_remove.is_empty() {
            let remove = core::mem::take(&mut self.pending_remove);
            self.active.retain(|h| !remove.contains(&h.raw_id()));
        }
        self.active.append(&mut self.pending_add);
    }

    /// Schedules a removal. A handler still waiting in pending-add is taken
    /// out of that list directly so it never becomes active.
    pub(crate) fn schedule_remove(&mut self, raw_id: u64) {
        if let Some(pos) = self.pending_add.iter().position(|h| h.raw_id() == raw_id) {
            self.pending_add.remove(pos);
        } else {
            self.pending_remove.push(raw_id);
        }
    }

    pub(crate) fn is_pending_remove(&self, raw_id: u64) -> bool {
        self.pending_remove.contains(&raw_id)
    }

    pub(crate) fn clear(&mut self) {
        self.active.clear();
        self.pending_add.clear();
        self.pending_remove.clear();
        self.epoch += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stanza(xml: &str) -> Element {
        xml.parse().unwrap()
    }

    #[test]
    fn empty_match_accepts_everything() {
        let m = Match::any();
        assert!(m.matches(&stanza("<presence xmlns='jabber:client'/>")));
        assert!(m.matches(&stanza("<iq xmlns='jabber:client' type='get'/>")));
    }

    #[test]
    fn ns_matches_stanza_or_immediate_child() {
        let m = Match::any().ns("jabber:iq:roster");
        assert!(m.matches(&stanza(
            "<iq xmlns='jabber:client'><query xmlns='jabber:iq:roster'/></iq>"
        )));
        assert!(!m.matches(&stanza(
            "<iq xmlns='jabber:client'><query xmlns='jabber:iq:private'/></iq>"
        )));
    }

    #[test]
    fn ns_fragment_ignored_on_request() {
        let strict = Match::any().ns("http://jabber.org/protocol/caps");
        let lax = Match::any()
            .ns("http://jabber.org/protocol/caps")
            .ignore_namespace_fragment();
        let st = stanza(
            "<presence xmlns='jabber:client'><c xmlns='http://jabber.org/protocol/caps#ext'/></presence>",
        );
        assert!(!strict.matches(&st));
        assert!(lax.matches(&st));
    }

    #[test]
    fn name_is_case_sensitive() {
        let m = Match::any().name("iq");
        assert!(m.matches(&stanza("<iq xmlns='jabber:client'/>")));
        assert!(!m.matches(&stanza("<IQ xmlns='jabber:client'/>")));
    }

    #[test]
    fn type_set_with_null_entry() {
        let m = Match::any().types(&[Some("result"), None]);
        assert!(m.matches(&stanza("<iq xmlns='jabber:client' type='result'/>")));
        assert!(m.matches(&stanza("<iq xmlns='jabber:client'/>")));
        assert!(!m.matches(&stanza("<iq xmlns='jabber:client' type='error'/>")));
    }

    #[test]
    fn id_prefix_and_suffix() {
        let prefix = Match::any().id("ping").starts_with_id();
        assert!(prefix.matches(&stanza("<iq xmlns='jabber:client' id='ping-42'/>")));
        assert!(!prefix.matches(&stanza("<iq xmlns='jabber:client' id='x-ping'/>")));

        let suffix = Match::any().id("session").ends_with_id();
        assert!(suffix.matches(&stanza("<iq xmlns='jabber:client' id='init:session'/>")));
        assert!(!suffix.matches(&stanza("<iq xmlns='jabber:client'/>")));
    }

    #[test]
    fn from_exact_and_bare() {
        let exact = Match::any().from("juliet@capulet.example/balcony");
        assert!(exact.matches(&stanza(
            "<message xmlns='jabber:client' from='juliet@capulet.example/balcony'/>"
        )));
        assert!(!exact.matches(&stanza(
            "<message xmlns='jabber:client' from='juliet@capulet.example/garden'/>"
        )));

        let bare = Match::any()
            .from("juliet@capulet.example")
            .match_bare_from_jid();
        assert!(bare.matches(&stanza(
            "<message xmlns='jabber:client' from='juliet@capulet.example/garden'/>"
        )));
        assert!(!bare.matches(&stanza(
            "<message xmlns='jabber:client' from='romeo@montague.example/garden'/>"
        )));
    }

    #[test]
    fn pending_add_then_remove_never_activates() {
        let mut set: HandlerSet<TimedHandler> = HandlerSet::default();
        set.pending_add.push(TimedHandler {
            id: TimedRef(7),
            period: Duration::from_millis(100),
            last_called: Instant::now(),
            user: true,
            callback: Box::new(|_| true),
        });
        set.schedule_remove(7);
        assert!(set.pending_add.is_empty());
        set.drain_pending();
        assert!(set.active.is_empty());
    }
}
