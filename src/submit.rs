// SPDX-FileCopyrightText: 2025 blinry <mail@blinry.org>
// SPDX-FileCopyrightText: 2025 zormit <nt4u@kpvn.de>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The authoritative commit path: fetch the snapshot, rebase the op over
//! whatever committed since its base version, apply, and compare-and-swap
//! into the store. A failed CAS restarts the whole turn from a fresh copy
//! of the input op, bounded by `max_retries`.

use crate::error::OtError;
use crate::kernel;
use crate::ot_type::TypeRegistry;
use crate::store::{DocStore, StoredOp};
use crate::types::{Op, Snapshot};
use tracing::debug;

#[derive(Debug, Clone, Copy)]
pub struct SubmitOptions {
    pub max_retries: u32,
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self { max_retries: 10 }
    }
}

#[derive(Debug)]
pub struct SubmitResult {
    /// The op as committed: rebased to the log head, `v` = its base version.
    pub op: Op,
    /// The snapshot after the commit.
    pub snapshot: Snapshot,
    /// The historical ops the submission was transformed against.
    pub ops: Vec<StoredOp>,
}

pub async fn submit_op<S: DocStore>(
    store: &mut S,
    registry: &TypeRegistry,
    collection: &str,
    id: &str,
    op: &Op,
    options: SubmitOptions,
) -> Result<SubmitResult, OtError> {
    kernel::check_op(registry, op)?;

    for attempt in 0..options.max_retries {
        let snapshot = store.get_snapshot(collection, id).await?;

        // Start from a fresh copy of the input, so a retry after a CAS
        // conflict doesn't see a half-rebased op.
        let mut op = op.clone();
        if op.v.is_none() {
            op.v = Some(snapshot.v);
        }
        let base = op.v.unwrap_or(snapshot.v);

        if base > snapshot.v {
            return Err(OtError::BadlyFormed(format!(
                "op version {base} is newer than snapshot version {}",
                snapshot.v
            )));
        }

        let mut transformed_against = Vec::new();
        if base < snapshot.v {
            let history = store.get_ops(collection, id, base, Some(snapshot.v)).await?;
            if history.len() as u64 != snapshot.v - base {
                return Err(OtError::TransformOpsNotFound {
                    from: base,
                    to: snapshot.v,
                });
            }
            for entry in history {
                if op.same_identity(entry.op.src.as_deref(), entry.op.seq) {
                    return Err(OtError::OpAlreadySubmitted);
                }
                kernel::transform(registry, snapshot.kind.as_deref(), &mut op, &entry.op)?;
                transformed_against.push(entry);
            }
        }

        let mut new_snapshot = snapshot.clone();
        kernel::apply(registry, &mut new_snapshot, &op)?;

        if store.commit(collection, id, &op, &new_snapshot).await? {
            return Ok(SubmitResult {
                op,
                snapshot: new_snapshot,
                ops: transformed_against,
            });
        }
        debug!(collection, id, attempt, "commit conflicted, retrying");
    }

    Err(OtError::MaxSubmitRetriesExceeded(options.max_retries))
}
