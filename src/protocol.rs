// SPDX-FileCopyrightText: 2025 blinry <mail@blinry.org>
// SPDX-FileCopyrightText: 2025 zormit <nt4u@kpvn.de>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The messages that cross the client/server channel. Every message is
//! tagged with an action `a`; `c` and `d` address a document within a
//! collection. The transport delivers them in order, at most once, while
//! connected.

use crate::error::ErrorEnvelope;
use crate::types::{Op, Snapshot};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "a")]
pub enum ClientMessage {
    #[serde(rename = "s")]
    Subscribe { c: String, d: String },
    #[serde(rename = "us")]
    Unsubscribe { c: String, d: String },
    #[serde(rename = "f")]
    Fetch { c: String, d: String },
    #[serde(rename = "op")]
    Op {
        c: String,
        d: String,
        #[serde(flatten)]
        op: Op,
    },
}

impl ClientMessage {
    /// The `(collection, id)` the message addresses.
    #[must_use]
    pub fn target(&self) -> (&str, &str) {
        match self {
            Self::Subscribe { c, d }
            | Self::Unsubscribe { c, d }
            | Self::Fetch { c, d }
            | Self::Op { c, d, .. } => (c, d),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "a")]
pub enum ServerMessage {
    /// Sent once when the connection is accepted; assigns the client id
    /// that becomes `src` on every op this client submits.
    #[serde(rename = "hs")]
    Handshake { id: String },
    #[serde(rename = "s")]
    Subscribe {
        c: String,
        d: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Snapshot>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorEnvelope>,
    },
    #[serde(rename = "us")]
    Unsubscribe {
        c: String,
        d: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorEnvelope>,
    },
    #[serde(rename = "f")]
    Fetch {
        c: String,
        d: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Snapshot>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorEnvelope>,
    },
    /// Three things travel under this action, told apart by the receiver:
    /// an ack (no body, `v` = committed snapshot version, `src`/`seq`
    /// matching the submitter's inflight op), a broadcast of a committed op
    /// (body present, `v` = its base version as stored in the log), or a
    /// rejection (`error` present).
    #[serde(rename = "op")]
    Op {
        c: String,
        d: String,
        #[serde(flatten)]
        op: Op,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorEnvelope>,
    },
}
