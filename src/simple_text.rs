// SPDX-FileCopyrightText: 2025 blinry <mail@blinry.org>
// SPDX-FileCopyrightText: 2025 zormit <nt4u@kpvn.de>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! A single-component text type: each op is one insert or one delete, no
//! retain vector. Positions count characters, not bytes.

use crate::error::OtError;
use crate::ot_type::OtType;
use crate::types::Side;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const TYPE_NAME: &str = "simple-text";
pub const TYPE_URI: &str = "https://sharedoc.dev/types/simple-text";

pub struct SimpleText;

/// The two op payloads, told apart on the wire by their field shape:
/// `{"pos": n, "text": s}` inserts, `{"pos": n, "count": n}` deletes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TextOp {
    Insert { pos: usize, text: String },
    Delete { pos: usize, count: usize },
}

impl TextOp {
    fn parse(op: &Value) -> Result<Self, OtError> {
        serde_json::from_value(op.clone()).map_err(|_| {
            OtError::BadlyFormed(format!(
                "text op must be {{pos, text}} or {{pos, count}}, got {op}"
            ))
        })
    }

    fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

fn splice(content: &str, pos: usize, delete: usize, insert: &str) -> Result<String, OtError> {
    let total = content.chars().count();
    if pos + delete > total {
        return Err(OtError::BadlyFormed(format!(
            "splice range {}..{} exceeds document length {total}",
            pos,
            pos + delete
        )));
    }
    let mut result = String::with_capacity(content.len() + insert.len());
    result.extend(content.chars().take(pos));
    result.push_str(insert);
    result.extend(content.chars().skip(pos + delete));
    Ok(result)
}

/// Rewrite `op` so it applies after `applied`. Positions stay non-negative
/// and counts stay >= 0 by construction; a delete fully contained in an
/// applied delete collapses to `count = 0`.
fn transform_component(op: TextOp, applied: &TextOp, side: Side) -> TextOp {
    match (op, applied) {
        (
            TextOp::Insert { pos, text },
            TextOp::Insert {
                pos: applied_pos,
                text: applied_text,
            },
        ) => {
            let shifted = *applied_pos < pos || (*applied_pos == pos && side == Side::Right);
            let pos = if shifted {
                pos + applied_text.chars().count()
            } else {
                pos
            };
            TextOp::Insert { pos, text }
        }
        (
            TextOp::Insert { pos, text },
            TextOp::Delete {
                pos: applied_pos,
                count,
            },
        ) => {
            let (start, end) = (*applied_pos, applied_pos + count);
            let pos = if end <= pos {
                pos - count
            } else if start < pos {
                // The insert position fell inside the deleted range.
                start
            } else {
                pos
            };
            TextOp::Insert { pos, text }
        }
        (
            TextOp::Delete { pos, count },
            TextOp::Insert {
                pos: applied_pos,
                text: applied_text,
            },
        ) => {
            let pos = if *applied_pos <= pos {
                pos + applied_text.chars().count()
            } else {
                pos
            };
            TextOp::Delete { pos, count }
        }
        (
            TextOp::Delete { pos, count },
            TextOp::Delete {
                pos: applied_pos,
                count: applied_count,
            },
        ) => {
            let (our_start, our_end) = (pos, pos + count);
            let (applied_start, applied_end) = (*applied_pos, applied_pos + applied_count);
            if applied_end <= our_start {
                TextOp::Delete {
                    pos: our_start - applied_count,
                    count,
                }
            } else if applied_start >= our_end {
                TextOp::Delete { pos, count }
            } else {
                let overlap = our_end.min(applied_end) - our_start.max(applied_start);
                TextOp::Delete {
                    pos: our_start.min(applied_start),
                    count: count - overlap,
                }
            }
        }
    }
}

impl OtType for SimpleText {
    fn name(&self) -> &'static str {
        TYPE_NAME
    }

    fn uri(&self) -> &'static str {
        TYPE_URI
    }

    fn create(&self, data: Option<&Value>) -> Result<Value, OtError> {
        match data {
            Some(Value::String(s)) => Ok(Value::from(s.as_str())),
            Some(other) => Err(OtError::BadlyFormed(format!(
                "text initial data must be a string, got {other}"
            ))),
            None => Ok(Value::from("")),
        }
    }

    fn apply(&self, data: &Value, op: &Value) -> Result<Value, OtError> {
        let content = data
            .as_str()
            .ok_or_else(|| OtError::BadlyFormed("text snapshot must be a string".to_string()))?;
        let result = match TextOp::parse(op)? {
            TextOp::Insert { pos, text } => splice(content, pos, 0, &text)?,
            TextOp::Delete { pos, count } => splice(content, pos, count, "")?,
        };
        Ok(Value::from(result))
    }

    fn transform(&self, op: &Value, applied: &Value, side: Side) -> Result<Value, OtError> {
        let op = TextOp::parse(op)?;
        let applied = TextOp::parse(applied)?;
        Ok(transform_component(op, &applied, side).to_value())
    }

    fn invert(&self, op: &Value) -> Result<Value, OtError> {
        match TextOp::parse(op)? {
            TextOp::Insert { pos, text } => Ok(TextOp::Delete {
                pos,
                count: text.chars().count(),
            }
            .to_value()),
            // A true inverse would need the deleted text carried in the op.
            TextOp::Delete { .. } => Err(OtError::InvertNotSupported(TYPE_NAME)),
        }
    }
}
