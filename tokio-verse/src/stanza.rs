// Copyright (c) 2026 verse contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Stanza construction.
//!
//! Stanzas are plain [`minidom::Element`] trees. The [`Builder`] adds a
//! cursor on top so that nested stanzas can be written in one expression,
//! in document order:
//!
//! ```
//! use tokio_verse::stanza::iq;
//!
//! let ping = iq(&[("type", "get"), ("id", "ping-1")])
//!     .c("ping", &[("xmlns", "urn:xmpp:ping")])
//!     .tree();
//! assert_eq!(ping.name(), "iq");
//! ```
//!
//! The cursor starts at the root; [`Builder::c`] and [`Builder::cnode`] move
//! it to the new child, [`Builder::t`] leaves it in place, [`Builder::up`]
//! returns towards the root. [`Builder::tree`] consumes the builder, so the
//! finished tree can no longer be mutated through a stale cursor.

use minidom::Element;

use crate::ns;

/// Fluent construction of an XML subtree with a cursor.
#[derive(Debug, Clone)]
pub struct Builder {
    root: Element,
    // Child indices from the root to the cursor.
    path: Vec<usize>,
}

/// Splits an `xmlns` entry out of an attribute list.
fn split_xmlns<'x>(attrs: &'x [(&'x str, &'x str)]) -> (Option<&'x str>, Vec<(&'x str, &'x str)>) {
    let mut xmlns = None;
    let mut rest = Vec::with_capacity(attrs.len());
    for (name, value) in attrs {
        if *name == "xmlns" {
            xmlns = Some(*value);
        } else {
            rest.push((*name, *value));
        }
    }
    (xmlns, rest)
}

fn build_element(name: &str, ns: &str, attrs: &[(&str, &str)]) -> Element {
    let mut builder = Element::builder(name, ns);
    for (name, value) in attrs {
        builder = builder.attr(*name, *value);
    }
    builder.build()
}

impl Builder {
    /// Starts a tree at `name`. An `xmlns` entry in `attrs` sets the
    /// element's namespace; without one the element lives in `jabber:client`.
    pub fn new(name: &str, attrs: &[(&str, &str)]) -> Builder {
        let (xmlns, rest) = split_xmlns(attrs);
        Builder {
            root: build_element(name, xmlns.unwrap_or(ns::CLIENT), &rest),
            path: Vec::new(),
        }
    }

    fn cursor_mut(&mut self) -> &mut Element {
        let mut cur = &mut self.root;
        for &idx in &self.path {
            cur = cur
                .children_mut()
                .nth(idx)
                .expect("builder cursor out of sync");
        }
        cur
    }

    /// Appends a child at the cursor and moves the cursor to it. The child
    /// inherits the cursor's namespace unless `attrs` carries an `xmlns`.
    pub fn c(mut self, name: &str, attrs: &[(&str, &str)]) -> Builder {
        let (xmlns, rest) = split_xmlns(attrs);
        let parent_ns = self.cursor_mut().ns();
        let child = build_element(name, xmlns.unwrap_or(&parent_ns), &rest);
        self.cnode(child)
    }

    /// Attaches a pre-built subtree at the cursor and moves the cursor to it.
    pub fn cnode(mut self, tree: Element) -> Builder {
        let parent = self.cursor_mut();
        let idx = parent.children().count();
        parent.append_child(tree);
        self.path.push(idx);
        self
    }

    /// Adds a text node at the cursor. The cursor does not move.
    pub fn t(mut self, text: &str) -> Builder {
        self.cursor_mut().append_text_node(text);
        self
    }

    /// Moves the cursor to its parent. At the root this is a no-op.
    pub fn up(mut self) -> Builder {
        self.path.pop();
        self
    }

    /// Moves the cursor back to the root.
    pub fn root(mut self) -> Builder {
        self.path.clear();
        self
    }

    /// Merges attributes at the cursor. `xmlns` entries are ignored; the
    /// namespace is fixed at element creation.
    pub fn attrs(mut self, attrs: &[(&str, &str)]) -> Builder {
        let cursor = self.cursor_mut();
        for (name, value) in attrs {
            if *name != "xmlns" {
                cursor.set_attr(*name, *value);
            }
        }
        self
    }

    /// Sets one attribute at the cursor; a `None` value is simply omitted.
    pub fn attr(mut self, name: &str, value: Option<&str>) -> Builder {
        if let Some(value) = value {
            self.cursor_mut().set_attr(name, value);
        }
        self
    }

    /// Returns the finished tree.
    pub fn tree(self) -> Element {
        self.root
    }
}

impl From<Builder> for Element {
    fn from(builder: Builder) -> Element {
        builder.tree()
    }
}

/// Starts an `<iq/>` stanza.
pub fn iq(attrs: &[(&str, &str)]) -> Builder {
    Builder::new("iq", attrs)
}

/// Starts a `<message/>` stanza.
pub fn message(attrs: &[(&str, &str)]) -> Builder {
    Builder::new("message", attrs)
}

/// Starts a `<presence/>` stanza.
pub fn presence(attrs: &[(&str, &str)]) -> Builder {
    Builder::new("presence", attrs)
}

/// Serializes a tree to its wire form.
pub fn serialize(elem: &Element) -> String {
    String::from(elem)
}

/// Parses one element from its wire form.
pub fn parse(text: &str) -> Result<Element, minidom::Error> {
    text.parse()
}

/// Escapes a string for use inside an XML attribute value.
pub(crate) fn escape_attr(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    out
}

/// Escapes a JID node per XEP-0106.
pub fn escape_node(node: &str) -> String {
    let mut out = String::with_capacity(node.len());
    for c in node.chars() {
        match c {
            ' ' => out.push_str("\\20"),
            '"' => out.push_str("\\22"),
            '&' => out.push_str("\\26"),
            '\'' => out.push_str("\\27"),
            '/' => out.push_str("\\2f"),
            ':' => out.push_str("\\3a"),
            '<' => out.push_str("\\3c"),
            '>' => out.push_str("\\3e"),
            '@' => out.push_str("\\40"),
            '\\' => out.push_str("\\5c"),
            c => out.push(c),
        }
    }
    out
}

/// Reverses [`escape_node`].
pub fn unescape_node(escaped: &str) -> String {
    let mut out = String::with_capacity(escaped.len());
    let mut chars = escaped.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let code: String = chars.clone().take(2).collect();
        let replacement = match code.as_str() {
            "20" => Some(' '),
            "22" => Some('"'),
            "26" => Some('&'),
            "27" => Some('\''),
            "2f" => Some('/'),
            "3a" => Some(':'),
            "3c" => Some('<'),
            "3e" => Some('>'),
            "40" => Some('@'),
            "5c" => Some('\\'),
            _ => None,
        };
        match replacement {
            Some(r) => {
                out.push(r);
                chars.next();
                chars.next();
            }
            None => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_walk() {
        let elem = iq(&[("type", "get"), ("id", "42")])
            .c("query", &[("xmlns", "jabber:iq:auth")])
            .c("username", &[])
            .t("romeo")
            .up()
            .c("digest", &[])
            .t("abc")
            .tree();
        assert_eq!(elem.name(), "iq");
        assert_eq!(elem.attr("id"), Some("42"));
        let query = elem.get_child("query", "jabber:iq:auth").unwrap();
        let names: Vec<&str> = query.children().map(|c| c.name()).collect();
        assert_eq!(names, ["username", "digest"]);
        assert_eq!(query.get_child("username", "jabber:iq:auth").unwrap().text(), "romeo");
    }

    #[test]
    fn t_does_not_move_cursor() {
        let elem = message(&[("to", "juliet@capulet.example")])
            .c("body", &[])
            .t("hello")
            .t(" again")
            .tree();
        assert_eq!(elem.get_child("body", ns::CLIENT).unwrap().text(), "hello again");
    }

    #[test]
    fn children_inherit_namespace() {
        let elem = presence(&[]).c("show", &[]).tree();
        assert_eq!(elem.get_child("show", ns::CLIENT).unwrap().ns(), ns::CLIENT);
    }

    #[test]
    fn cnode_attaches_foreign_subtree() {
        let payload: Element = "<x xmlns='jabber:x:data' type='submit'/>".parse().unwrap();
        let elem = message(&[]).cnode(payload).attrs(&[("var", "a")]).tree();
        let x = elem.get_child("x", "jabber:x:data").unwrap();
        assert_eq!(x.attr("type"), Some("submit"));
        assert_eq!(x.attr("var"), Some("a"));
    }

    #[test]
    fn attr_none_is_omitted() {
        let elem = iq(&[]).attr("to", None).attr("from", Some("a@b")).tree();
        assert_eq!(elem.attr("to"), None);
        assert_eq!(elem.attr("from"), Some("a@b"));
    }

    #[test]
    fn roundtrip_builder_subset() {
        let wire = "<message xmlns='jabber:client' type=\"chat\"><body>hi &amp; bye</body></message>";
        let parsed = parse(wire).unwrap();
        assert_eq!(serialize(&parsed), wire);
    }

    #[test]
    fn node_escaping_roundtrip() {
        let node = "d'artagnan w/ space@home";
        let escaped = escape_node(node);
        assert_eq!(escaped, "d\\27artagnan\\20w\\2f\\20space\\40home");
        assert_eq!(unescape_node(&escaped), node);
    }

    #[test]
    fn unknown_escape_sequences_survive() {
        assert_eq!(unescape_node("a\\99b"), "a\\99b");
    }

    #[test]
    fn attr_escaping() {
        assert_eq!(escape_attr("a<b&c'd"), "a&lt;b&amp;c&apos;d");
    }
}
