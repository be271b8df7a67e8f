// SPDX-FileCopyrightText: 2025 blinry <mail@blinry.org>
// SPDX-FileCopyrightText: 2025 zormit <nt4u@kpvn.de>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The document-level operation algebra: validate an op, apply it to a
//! snapshot, and transform it over an already-applied op.
//!
//! `apply` and `transform` mutate caller-owned values in place; the caller
//! is responsible for cloning first if it needs to keep the original (the
//! server's commit loop does exactly that so retries start clean).

use crate::error::OtError;
use crate::ot_type::TypeRegistry;
use crate::types::{Op, OpBody, Side, Snapshot};

/// Validate structural well-formedness of an op: it must have one of the
/// three shapes, a create must name a registered type, a delete must be the
/// literal `true`, and `src`/`seq` must be set together.
pub fn check_op(registry: &TypeRegistry, op: &Op) -> Result<(), OtError> {
    match &op.body {
        None => {
            return Err(OtError::BadlyFormed(
                "op needs a create, op, or del field".to_string(),
            ))
        }
        Some(OpBody::Create(create)) => {
            registry.require(&create.kind)?;
        }
        Some(OpBody::Del(flag)) => {
            if !flag {
                return Err(OtError::BadlyFormed(
                    "del must be the literal true".to_string(),
                ));
            }
        }
        Some(OpBody::Edit(_)) => {}
    }

    if op.src.is_some() != op.seq.is_some() {
        return Err(OtError::BadlyFormed(
            "src and seq must be set together".to_string(),
        ));
    }
    Ok(())
}

/// Apply `op` to `snapshot`, bumping its version by exactly 1 on every
/// successful outcome. A no-op shape still bumps the version, which is what
/// keeps a client consistent after it neutralized a remote op.
pub fn apply(registry: &TypeRegistry, snapshot: &mut Snapshot, op: &Op) -> Result<(), OtError> {
    if let Some(op_v) = op.v {
        if op_v != snapshot.v {
            return Err(OtError::VersionMismatchOnApply {
                op: op_v,
                snapshot: snapshot.v,
            });
        }
    }

    match &op.body {
        Some(OpBody::Create(create)) => {
            if snapshot.exists() {
                return Err(OtError::AlreadyCreated);
            }
            let ot_type = registry.require(&create.kind)?;
            snapshot.data = Some(ot_type.create(create.data.as_ref())?);
            snapshot.kind = Some(ot_type.uri().to_string());
        }
        Some(OpBody::Del(_)) => {
            snapshot.kind = None;
            snapshot.data = None;
        }
        Some(OpBody::Edit(payload)) => {
            let Some(kind) = &snapshot.kind else {
                return Err(OtError::DoesNotExist);
            };
            if payload.is_null() {
                return Err(OtError::OpNotProvided);
            }
            let ot_type = registry.require(kind)?;
            let data = snapshot.data.as_ref().ok_or(OtError::DoesNotExist)?;
            snapshot.data = Some(ot_type.apply(data, payload)?);
        }
        None => {}
    }

    snapshot.v += 1;
    Ok(())
}

/// Rewrite `op` to reflect that `applied` was applied first, bumping
/// `op.v` if it carries one. The tie-break side for edit-over-edit is
/// hard-coded to `Left`: the server rebases a submitted op forward over the
/// log with this function, and the submitted op yields to what is already
/// committed.
pub fn transform(
    registry: &TypeRegistry,
    kind: Option<&str>,
    op: &mut Op,
    applied: &Op,
) -> Result<(), OtError> {
    if let (Some(op_v), Some(applied_v)) = (op.v, applied.v) {
        if op_v != applied_v {
            return Err(OtError::VersionMismatchOnTransform {
                op: op_v,
                applied: applied_v,
            });
        }
    }

    match (&mut op.body, &applied.body) {
        // No-op on either side: nothing to reconcile.
        (None, _) | (_, None) => {}
        // A delete survives anything that happened concurrently.
        (Some(OpBody::Del(_)), _) => {}
        (Some(OpBody::Create(_) | OpBody::Edit(_)), Some(OpBody::Del(_))) => {
            return Err(OtError::WasDeleted);
        }
        (Some(OpBody::Create(_)), Some(OpBody::Create(_) | OpBody::Edit(_)))
        | (Some(OpBody::Edit(_)), Some(OpBody::Create(_))) => {
            return Err(OtError::AlreadyCreated);
        }
        (Some(OpBody::Edit(payload)), Some(OpBody::Edit(applied_payload))) => {
            let kind = kind.ok_or(OtError::DoesNotExist)?;
            let ot_type = registry.require(kind)?;
            *payload = ot_type.transform(payload, applied_payload, Side::Left)?;
        }
    }

    if let Some(v) = op.v {
        op.v = Some(v + 1);
    }
    Ok(())
}
