// SPDX-FileCopyrightText: 2025 blinry <mail@blinry.org>
// SPDX-FileCopyrightText: 2025 zormit <nt4u@kpvn.de>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! A commutative integer counter. Ops are plain deltas, so transform is the
//! identity and compose is addition.

use crate::error::OtError;
use crate::ot_type::OtType;
use crate::types::Side;
use serde_json::Value;

pub const TYPE_NAME: &str = "counter";
pub const TYPE_URI: &str = "https://sharedoc.dev/types/counter";

pub struct Counter;

fn as_integer(value: &Value, what: &str) -> Result<i64, OtError> {
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|f| f.floor() as i64))
        .ok_or_else(|| OtError::BadlyFormed(format!("counter {what} must be a number")))
}

impl OtType for Counter {
    fn name(&self) -> &'static str {
        TYPE_NAME
    }

    fn uri(&self) -> &'static str {
        TYPE_URI
    }

    fn create(&self, data: Option<&Value>) -> Result<Value, OtError> {
        let initial = match data {
            Some(value) => as_integer(value, "initial data")?,
            None => 0,
        };
        Ok(Value::from(initial))
    }

    fn apply(&self, data: &Value, op: &Value) -> Result<Value, OtError> {
        let current = as_integer(data, "snapshot")?;
        let delta = as_integer(op, "op")?;
        Ok(Value::from(current + delta))
    }

    fn transform(&self, op: &Value, _applied: &Value, _side: Side) -> Result<Value, OtError> {
        // Addition commutes, so concurrent deltas never disturb each other.
        as_integer(op, "op")?;
        Ok(op.clone())
    }

    fn compose(&self, a: &Value, b: &Value) -> Result<Value, OtError> {
        Ok(Value::from(as_integer(a, "op")? + as_integer(b, "op")?))
    }

    fn invert(&self, op: &Value) -> Result<Value, OtError> {
        Ok(Value::from(-as_integer(op, "op")?))
    }
}
