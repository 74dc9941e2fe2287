//! Identity cache scoped to one operation.
//!
//! Maps the logical identity of a row to the request acting on it, so every
//! path that reaches the same row converges on one request. Persisted rows
//! are keyed by (type, identity value); rows without an identity yet are
//! keyed by their arena handle.

use std::collections::HashMap;

use entgraph_core::{EntityType, ValueKey};

use crate::graph::{EntityGraph, EntityRef};
use crate::request::RequestId;

/// Logical identity of a row within one operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityKey {
    Persisted(EntityType, ValueKey),
    Transient(EntityType, EntityRef),
}

impl EntityKey {
    /// Key for `e` as it currently stands.
    pub fn of(graph: &EntityGraph, e: EntityRef) -> Self {
        let ty = graph.entity_type(e);
        match graph.identity_key(e) {
            Some(key) if graph.is_persisted(e) => EntityKey::Persisted(ty, key),
            _ => EntityKey::Transient(ty, e),
        }
    }
}

#[derive(Debug, Default)]
pub struct IdentityCache {
    entries: HashMap<EntityKey, RequestId>,
}

impl IdentityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &EntityKey) -> Option<RequestId> {
        self.entries.get(key).copied()
    }

    pub fn insert(&mut self, key: EntityKey, request: RequestId) {
        self.entries.insert(key, request);
    }

    /// Move a request to a new key, e.g. after an insert assigned the identity.
    pub fn rekey(&mut self, old: &EntityKey, new: EntityKey) {
        if let Some(request) = self.entries.remove(old) {
            self.entries.insert(new, request);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
