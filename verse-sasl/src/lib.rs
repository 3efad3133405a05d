// Copyright (c) 2026 verse contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! SASL client mechanisms for XMPP.
//!
//! This crate implements the client side of the SASL mechanisms commonly
//! offered by XMPP servers, behind a uniform [`client::Mechanism`] trait.
//! The connection engine drives a mechanism through at most three steps:
//! an optional client-first payload, zero or more challenge/response
//! round-trips, and a final success step in which challenge-response
//! mechanisms verify the server's proof.
//!
//! Mechanisms are selected by priority, highest first. The defaults mirror
//! the ordering of the classic BOSH/WebSocket clients; they are plain
//! configuration, and every constructor accepts an override.

#![deny(unsafe_code, missing_docs, bare_trait_objects)]

pub mod client;
pub mod common;

pub use client::{Mechanism, MechanismError};
pub use common::Credentials;
