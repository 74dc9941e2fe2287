//! Requests and the dependency graph between them.
//!
//! A [`Request`] is one pending action (save or delete) on one entity. An
//! edge A -> B means A cannot be sent to the database before B has executed.
//! Edges are checked when added: an edge that closes a cycle is a modeling
//! error, reported with the path that forms the cycle.

use std::collections::{BTreeSet, HashSet};
use std::fmt;

use entgraph_core::error::ModelingErrorKind;
use entgraph_core::{EntityType, Error, Result, Value};

use crate::graph::EntityRef;

/// Handle of a request within one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(usize);

impl RequestId {
    pub const fn index(self) -> usize {
        self.0
    }

    #[cfg(test)]
    pub(crate) const fn for_testing(index: usize) -> Self {
        Self(index)
    }
}

/// What a request does to its entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Action {
    Save,
    Delete,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Save => write!(f, "SAVE"),
            Action::Delete => write!(f, "DELETE"),
        }
    }
}

/// One pending action on one entity.
#[derive(Debug, Clone)]
pub struct Request {
    pub entity: EntityRef,
    pub ty: EntityType,
    pub type_name: &'static str,
    pub action: Action,
    /// Requests that must execute first.
    pub depends_on: BTreeSet<RequestId>,
    /// Outstanding loads or bulk statements this request waits for.
    pub gates: usize,
    pub processed: bool,
    pub executed: bool,
    /// Column values matching the row to delete, for types without a single identity.
    pub delete_key: Option<Vec<(usize, Value)>>,
}

impl Request {
    fn describe(&self) -> String {
        format!("{} {} ({})", self.type_name, self.entity, self.action)
    }
}

/// All requests of one operation.
#[derive(Debug, Default)]
pub struct RequestGraph {
    requests: Vec<Request>,
}

impl RequestGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn push(
        &mut self,
        entity: EntityRef,
        ty: EntityType,
        type_name: &'static str,
        action: Action,
    ) -> RequestId {
        self.requests.push(Request {
            entity,
            ty,
            type_name,
            action,
            depends_on: BTreeSet::new(),
            gates: 0,
            processed: false,
            executed: false,
            delete_key: None,
        });
        RequestId(self.requests.len() - 1)
    }

    pub fn get(&self, id: RequestId) -> &Request {
        &self.requests[id.0]
    }

    pub fn get_mut(&mut self, id: RequestId) -> &mut Request {
        &mut self.requests[id.0]
    }

    pub fn ids(&self) -> impl Iterator<Item = RequestId> {
        (0..self.requests.len()).map(RequestId)
    }

    /// Record that `from` must wait for `on`.
    ///
    /// Self edges and edges to executed requests are no-ops.
    pub fn depends_on(&mut self, from: RequestId, on: RequestId) -> Result<()> {
        if from == on || self.requests[on.0].executed {
            return Ok(());
        }
        if self.requests[from.0].depends_on.contains(&on) {
            return Ok(());
        }
        if let Some(path) = self.path(on, from) {
            let names: Vec<String> = std::iter::once(from)
                .chain(path)
                .map(|id| self.requests[id.0].describe())
                .collect();
            return Err(Error::modeling(
                ModelingErrorKind::DependencyCycle,
                format!("dependency cycle: {}", names.join(" -> ")),
            ));
        }
        self.requests[from.0].depends_on.insert(on);
        Ok(())
    }

    /// Path of unexecuted edges from `start` to `goal`, both included.
    fn path(&self, start: RequestId, goal: RequestId) -> Option<Vec<RequestId>> {
        let mut visited = HashSet::new();
        let mut path = Vec::new();
        self.path_dfs(start, goal, &mut visited, &mut path)
            .then_some(path)
    }

    fn path_dfs(
        &self,
        node: RequestId,
        goal: RequestId,
        visited: &mut HashSet<RequestId>,
        path: &mut Vec<RequestId>,
    ) -> bool {
        path.push(node);
        if node == goal {
            return true;
        }
        if visited.insert(node) {
            for &next in &self.requests[node.0].depends_on {
                if self.requests[next.0].executed {
                    continue;
                }
                if self.path_dfs(next, goal, visited, path) {
                    return true;
                }
            }
        }
        path.pop();
        false
    }

    /// Turn a save request into a delete that has to be expanded again.
    pub fn convert_to_delete(&mut self, id: RequestId) {
        let request = &mut self.requests[id.0];
        request.action = Action::Delete;
        request.depends_on.clear();
        request.processed = false;
        request.delete_key = None;
    }

    /// Requests waiting for expansion.
    pub fn unprocessed(&self) -> Vec<RequestId> {
        self.ids()
            .filter(|id| !self.requests[id.0].processed)
            .collect()
    }

    /// Requests that can be sent to the database now.
    pub fn ready(&self) -> Vec<RequestId> {
        self.ids()
            .filter(|id| {
                let r = &self.requests[id.0];
                r.processed
                    && !r.executed
                    && r.gates == 0
                    && r.depends_on.iter().all(|d| self.requests[d.0].executed)
            })
            .collect()
    }

    pub fn mark_executed(&mut self, id: RequestId) {
        self.requests[id.0].executed = true;
    }

    /// Hold the request back until a matching [`release`](Self::release).
    pub fn gate(&mut self, id: RequestId) {
        self.requests[id.0].gates += 1;
    }

    pub fn release(&mut self, id: RequestId) {
        let request = &mut self.requests[id.0];
        request.gates = request.gates.saturating_sub(1);
    }

    /// Requests not executed yet.
    pub fn pending(&self) -> Vec<RequestId> {
        self.ids()
            .filter(|id| !self.requests[id.0].executed)
            .collect()
    }
}
