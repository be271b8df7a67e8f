// SPDX-FileCopyrightText: 2025 blinry <mail@blinry.org>
// SPDX-FileCopyrightText: 2025 zormit <nt4u@kpvn.de>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The pluggable type interface and the registry that resolves type names.
//!
//! A type is the warrantor of convergence: for any two concurrent edits `a`
//! and `b` on the same base, it must satisfy
//!
//! ```text
//! apply(apply(s, a), transform(b, a, Right)) == apply(apply(s, b), transform(a, b, Left))
//! ```
//!
//! The kernel and the client replica build everything else on top of that.

use crate::error::OtError;
use crate::types::Side;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

pub trait OtType: Send + Sync {
    /// Short name, e.g. `counter`.
    fn name(&self) -> &'static str;

    /// Canonical URI. Snapshots record this as their `type`.
    fn uri(&self) -> &'static str;

    /// Build the initial snapshot payload from the create op's data.
    fn create(&self, data: Option<&Value>) -> Result<Value, OtError>;

    /// Apply an edit payload to a snapshot payload, returning the new
    /// payload. Must not mutate its inputs.
    fn apply(&self, data: &Value, op: &Value) -> Result<Value, OtError>;

    /// Rewrite `op` to account for `applied` having been applied first.
    /// `side` breaks ties between edits at the same position.
    fn transform(&self, op: &Value, applied: &Value, side: Side) -> Result<Value, OtError>;

    fn compose(&self, _a: &Value, _b: &Value) -> Result<Value, OtError> {
        Err(OtError::ComposeNotSupported(self.name()))
    }

    fn invert(&self, _op: &Value) -> Result<Value, OtError> {
        Err(OtError::InvertNotSupported(self.name()))
    }
}

/// Resolves type identifiers to handlers. Each type is reachable under both
/// its short name and its URI. The registry is plain data that gets passed
/// to whoever needs it; there is no process-wide singleton.
#[derive(Clone, Default)]
pub struct TypeRegistry {
    types: HashMap<String, Arc<dyn OtType>>,
}

impl TypeRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry seeded with the two reference types.
    #[must_use]
    pub fn with_default_types() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(crate::counter::Counter));
        registry.register(Arc::new(crate::simple_text::SimpleText));
        registry
    }

    pub fn register(&mut self, ot_type: Arc<dyn OtType>) {
        self.types
            .insert(ot_type.name().to_string(), Arc::clone(&ot_type));
        self.types.insert(ot_type.uri().to_string(), ot_type);
    }

    #[must_use]
    pub fn resolve(&self, key: &str) -> Option<Arc<dyn OtType>> {
        self.types.get(key).cloned()
    }

    pub fn require(&self, key: &str) -> Result<Arc<dyn OtType>, OtError> {
        self.resolve(key)
            .ok_or_else(|| OtError::TypeNotRecognized(key.to_string()))
    }
}

impl std::fmt::Debug for dyn OtType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_tuple("OtType").field(&self.name()).finish()
    }
}

impl std::fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mut names: Vec<&str> = self.types.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("TypeRegistry").field("types", &names).finish()
    }
}
