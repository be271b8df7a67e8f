// SPDX-FileCopyrightText: 2025 blinry <mail@blinry.org>
// SPDX-FileCopyrightText: 2025 zormit <nt4u@kpvn.de>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The shared data model: versioned snapshots and the three op shapes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Versioned document state. `kind` is the registered type URI; a document
/// with `kind: None` does not exist (and then `data` is `None` as well).
/// `v = 0` with `kind: None` is a never-created document, which is still a
/// legitimate thing to subscribe to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub v: u64,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Snapshot {
    pub fn empty(id: &str) -> Self {
        Self {
            id: id.to_string(),
            v: 0,
            kind: None,
            data: None,
        }
    }

    #[must_use]
    pub fn exists(&self) -> bool {
        self.kind.is_some()
    }
}

/// Payload of a create op: the type to instantiate and its initial data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatePayload {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Exactly one of the three op shapes. On the wire each shape is its own
/// field: `{"create": …}`, `{"op": …}`, or `{"del": true}`.
#[derive(Debug, Clone, PartialEq)]
pub enum OpBody {
    Create(CreatePayload),
    Edit(Value),
    Del(bool),
}

/// An operation against a base version. `body` is `None` for the no-op
/// shape, which the kernel's transform table tolerates and which the client
/// produces when it neutralizes a remote op (delete wins locally).
///
/// `src` and `seq` are set together; the pair is the globally unique op
/// identity used for ack matching and duplicate detection.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(try_from = "WireOp", into = "WireOp")]
pub struct Op {
    pub body: Option<OpBody>,
    pub v: Option<u64>,
    pub src: Option<String>,
    pub seq: Option<u64>,
}

/// The flat wire shape of an [`Op`]. A message carrying more than one of
/// `create`/`op`/`del` is rejected while deserializing.
#[derive(Serialize, Deserialize)]
struct WireOp {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    create: Option<CreatePayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    op: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    del: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    v: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    src: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    seq: Option<u64>,
}

impl From<Op> for WireOp {
    fn from(op: Op) -> Self {
        let (create, edit, del) = match op.body {
            Some(OpBody::Create(create)) => (Some(create), None, None),
            Some(OpBody::Edit(payload)) => (None, Some(payload), None),
            Some(OpBody::Del(flag)) => (None, None, Some(flag)),
            None => (None, None, None),
        };
        Self {
            create,
            op: edit,
            del,
            v: op.v,
            src: op.src,
            seq: op.seq,
        }
    }
}

impl TryFrom<WireOp> for Op {
    type Error = String;

    fn try_from(wire: WireOp) -> Result<Self, Self::Error> {
        let body = match (wire.create, wire.op, wire.del) {
            (Some(create), None, None) => Some(OpBody::Create(create)),
            (None, Some(payload), None) => Some(OpBody::Edit(payload)),
            (None, None, Some(flag)) => Some(OpBody::Del(flag)),
            (None, None, None) => None,
            _ => return Err("op must have at most one of create, op, del".to_string()),
        };
        Ok(Self {
            body,
            v: wire.v,
            src: wire.src,
            seq: wire.seq,
        })
    }
}

impl Op {
    pub fn create(kind: &str, data: Option<Value>) -> Self {
        Self {
            body: Some(OpBody::Create(CreatePayload {
                kind: kind.to_string(),
                data,
            })),
            ..Self::default()
        }
    }

    pub fn edit(payload: Value) -> Self {
        Self {
            body: Some(OpBody::Edit(payload)),
            ..Self::default()
        }
    }

    pub fn del() -> Self {
        Self {
            body: Some(OpBody::Del(true)),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn at(mut self, v: u64) -> Self {
        self.v = Some(v);
        self
    }

    #[must_use]
    pub fn by(mut self, src: &str, seq: u64) -> Self {
        self.src = Some(src.to_string());
        self.seq = Some(seq);
        self
    }

    /// Whether this op carries the given `(src, seq)` identity. Ops
    /// without an identity are never considered the same submission.
    #[must_use]
    pub fn same_identity(&self, src: Option<&str>, seq: Option<u64>) -> bool {
        self.src.is_some() && self.src.as_deref() == src && self.seq == seq
    }
}

/// Tie-break tag passed to a type's transform for edits at the same
/// position: `Left` keeps its position, `Right` gets shifted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

pub mod factories {
    use super::{Op, Snapshot, Value};

    pub fn counter_create(initial: i64) -> Op {
        Op::create("counter", Some(Value::from(initial)))
    }

    pub fn counter_add(delta: i64) -> Op {
        Op::edit(Value::from(delta))
    }

    pub fn text_create(content: &str) -> Op {
        Op::create("simple-text", Some(Value::from(content)))
    }

    pub fn text_insert(pos: usize, text: &str) -> Op {
        Op::edit(serde_json::json!({ "pos": pos, "text": text }))
    }

    pub fn text_delete(pos: usize, count: usize) -> Op {
        Op::edit(serde_json::json!({ "pos": pos, "count": count }))
    }

    pub fn text_snapshot(id: &str, v: u64, content: &str) -> Snapshot {
        Snapshot {
            id: id.to_string(),
            v,
            kind: Some(crate::simple_text::TYPE_URI.to_string()),
            data: Some(Value::from(content)),
        }
    }
}
