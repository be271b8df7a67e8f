// SPDX-FileCopyrightText: 2025 blinry <mail@blinry.org>
// SPDX-FileCopyrightText: 2025 zormit <nt4u@kpvn.de>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Server-side persistence: snapshots plus an append-only op log per
//! document. The in-memory implementation is the reference store; anything
//! that can satisfy the compare-and-swap contract of `commit` can stand in
//! for it.

use crate::error::OtError;
use crate::types::{Op, Snapshot};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// An op as it sits in the log: the op itself plus addressing and metadata.
/// The log entry at index `i` has `v = i`, its base version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredOp {
    pub collection: String,
    pub id: String,
    #[serde(flatten)]
    pub op: Op,
    pub m: OpMeta,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpMeta {
    /// Wall-clock commit time in milliseconds.
    pub ts: u64,
}

#[async_trait]
pub trait DocStore: Send {
    /// A defensive copy of the current snapshot; a never-created document
    /// yields the empty snapshot with `v = 0`.
    async fn get_snapshot(&self, collection: &str, id: &str) -> Result<Snapshot, OtError>;

    /// Log entries with versions in `[from, to)`; `to: None` means the log
    /// tail. Order is preserved and versions are contiguous.
    async fn get_ops(
        &self,
        collection: &str,
        id: &str,
        from: u64,
        to: Option<u64>,
    ) -> Result<Vec<StoredOp>, OtError>;

    /// Atomically append `op` and replace the snapshot, iff the currently
    /// stored version still equals `op.v`. Returns `false` on conflict,
    /// never a partial write.
    async fn commit(
        &mut self,
        collection: &str,
        id: &str,
        op: &Op,
        snapshot: &Snapshot,
    ) -> Result<bool, OtError>;
}

#[derive(Debug)]
struct DocRecord {
    snapshot: Snapshot,
    ops: Vec<StoredOp>,
}

/// The reference store. Atomicity of `commit` comes from the single task
/// that owns it; there is no interior locking.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: HashMap<String, HashMap<String, DocRecord>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, collection: &str, id: &str) -> Option<&DocRecord> {
        self.collections.get(collection).and_then(|c| c.get(id))
    }

    fn now_millis() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default()
    }
}

#[async_trait]
impl DocStore for MemoryStore {
    async fn get_snapshot(&self, collection: &str, id: &str) -> Result<Snapshot, OtError> {
        Ok(self
            .record(collection, id)
            .map_or_else(|| Snapshot::empty(id), |record| record.snapshot.clone()))
    }

    async fn get_ops(
        &self,
        collection: &str,
        id: &str,
        from: u64,
        to: Option<u64>,
    ) -> Result<Vec<StoredOp>, OtError> {
        let Some(record) = self.record(collection, id) else {
            return Ok(vec![]);
        };
        let from = (from as usize).min(record.ops.len());
        let to = to.map_or(record.ops.len(), |to| (to as usize).min(record.ops.len()));
        Ok(record.ops[from..to.max(from)].to_vec())
    }

    async fn commit(
        &mut self,
        collection: &str,
        id: &str,
        op: &Op,
        snapshot: &Snapshot,
    ) -> Result<bool, OtError> {
        let record = self
            .collections
            .entry(collection.to_string())
            .or_default()
            .entry(id.to_string())
            .or_insert_with(|| DocRecord {
                snapshot: Snapshot::empty(id),
                ops: Vec::new(),
            });

        if op.v != Some(record.snapshot.v) {
            return Ok(false);
        }

        record.ops.push(StoredOp {
            collection: collection.to_string(),
            id: id.to_string(),
            op: op.clone(),
            m: OpMeta {
                ts: Self::now_millis(),
            },
        });
        record.snapshot = snapshot.clone();
        Ok(true)
    }
}
