//! Batched loading for cascade decisions.
//!
//! The processors never read from storage directly. When a decision needs
//! data that is not in memory they queue one of two kinds of work here:
//!
//! - **load**: read a known stub fully. Loads of the same instance coalesce
//!   through its in-flight [`LoadTicket`].
//! - **retrieve**: read every row of a type whose owning reference holds one
//!   of a set of values.
//!
//! One cycle issues at most one SELECT per type for loads and one per
//! (type, property) pair for retrievals, split only by the `IN` list limit.
//! Every SELECT of a cycle runs concurrently. The results come back to the
//! operation as deferred consumers; the loader itself decides nothing.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use asupersync::{Cx, Outcome};
use entgraph_core::{
    Criteria, EntityType, Error, Select, StatementExecutor, Value, ValueKey,
};
use futures::future::join_all;

use crate::graph::{EntityGraph, EntityRef};
use crate::operation::OperationReport;
use crate::request::RequestId;
use crate::state::LoadTicket;

/// What to do once loaded data is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Consumer {
    /// Expand the request again now that its entity is loaded.
    Reprocess(RequestId),
    /// Cascade from `parent` to the rows referencing it through `property`.
    Children {
        request: RequestId,
        parent: EntityRef,
        property: usize,
        delete: bool,
    },
}

impl Consumer {
    pub(crate) fn request(self) -> RequestId {
        match self {
            Consumer::Reprocess(request) | Consumer::Children { request, .. } => request,
        }
    }
}

/// A consumer together with the entities it was waiting for.
///
/// For [`Consumer::Reprocess`] these are the loaded entities whose row was
/// not found; the consumer decides what that means.
pub(crate) type Deferred = (Consumer, Vec<EntityRef>);

#[derive(Debug, Clone, Copy)]
enum Batch {
    Load(EntityType),
    Retrieve(EntityType, usize),
}

#[derive(Debug, Default)]
pub(crate) struct EntityLoader {
    next_ticket: u64,
    loads: Vec<(EntityRef, LoadTicket)>,
    waiting: Vec<(LoadTicket, Consumer)>,
    retrievals: BTreeMap<(EntityType, usize), Vec<(Value, Consumer)>>,
}

impl EntityLoader {
    /// Queue a full load of `e`, joining one already in flight.
    pub(crate) fn load(&mut self, graph: &mut EntityGraph, e: EntityRef, consumer: Consumer) {
        let next = &mut self.next_ticket;
        let (ticket, started) = graph.state_mut(e).loading(|| {
            *next += 1;
            LoadTicket::new(*next)
        });
        if started || !self.loads.iter().any(|(_, t)| *t == ticket) {
            self.loads.push((e, ticket));
        }
        self.waiting.push((ticket, consumer));
    }

    /// Queue retrieval of the `ty` rows whose `property` equals `value`.
    pub(crate) fn retrieve(&mut self, ty: EntityType, property: usize, value: Value, consumer: Consumer) {
        self.retrievals
            .entry((ty, property))
            .or_default()
            .push((value, consumer));
    }

    pub(crate) fn has_pending(&self) -> bool {
        !self.loads.is_empty() || !self.retrievals.is_empty()
    }

    /// Run every queued load and retrieval.
    #[tracing::instrument(level = "debug", skip_all, fields(loads = self.loads.len(), retrievals = self.retrievals.len()))]
    pub(crate) async fn execute<E: StatementExecutor>(
        &mut self,
        cx: &Cx,
        executor: &E,
        graph: &mut EntityGraph,
        max_in_values: usize,
        report: &mut OperationReport,
    ) -> Outcome<Vec<Deferred>, Error> {
        let loads = std::mem::take(&mut self.loads);
        let waiting = std::mem::take(&mut self.waiting);
        let retrievals = std::mem::take(&mut self.retrievals);
        let registry = Arc::clone(graph.registry());

        let mut by_type: BTreeMap<EntityType, Vec<Value>> = BTreeMap::new();
        for &(e, _) in &loads {
            if let Some(id) = graph.id(e) {
                push_unique(by_type.entry(graph.entity_type(e)).or_default(), id.clone());
            }
        }

        let mut selects: Vec<(Select, Batch)> = Vec::new();
        for (ty, ids) in by_type {
            let meta = registry.entity(ty);
            let Some(column) = meta.single_identity().and_then(|idx| meta.column(idx)) else {
                continue;
            };
            for chunk in ids.chunks(max_in_values) {
                selects.push((
                    Select {
                        table: meta.table(),
                        columns: meta.stored().filter_map(|idx| meta.column(idx)).collect(),
                        filter: Criteria::in_list(column, chunk.to_vec()),
                    },
                    Batch::Load(ty),
                ));
            }
        }
        for (&(ty, property), items) in &retrievals {
            let meta = registry.entity(ty);
            let Some(column) = meta.column(property) else {
                continue;
            };
            let mut values = Vec::new();
            for (value, _) in items {
                push_unique(&mut values, value.clone());
            }
            for chunk in values.chunks(max_in_values) {
                selects.push((
                    Select {
                        table: meta.table(),
                        columns: meta.stored().filter_map(|idx| meta.column(idx)).collect(),
                        filter: Criteria::in_list(column, chunk.to_vec()),
                    },
                    Batch::Retrieve(ty, property),
                ));
            }
        }

        tracing::debug!(selects = selects.len(), "Loading for cascade decisions");
        let outcomes = join_all(selects.iter().map(|(select, _)| executor.select(cx, select))).await;
        report.selects += selects.len();

        let mut results = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            match outcome {
                Outcome::Ok(rows) => results.push(rows),
                Outcome::Err(e) => {
                    abandon(graph, &loads);
                    return Outcome::Err(e);
                }
                Outcome::Cancelled(r) => {
                    abandon(graph, &loads);
                    return Outcome::Cancelled(r);
                }
                Outcome::Panicked(p) => {
                    abandon(graph, &loads);
                    return Outcome::Panicked(p);
                }
            }
        }

        let mut matched: HashMap<(EntityType, usize, ValueKey), Vec<EntityRef>> = HashMap::new();
        for ((_, batch), rows) in selects.iter().zip(results) {
            match *batch {
                Batch::Load(ty) => {
                    for row in &rows {
                        graph.materialize(ty, row);
                    }
                }
                Batch::Retrieve(ty, property) => {
                    let column = registry.entity(ty).column(property);
                    for row in &rows {
                        let e = graph.materialize(ty, row);
                        let Some(value) = column.and_then(|c| row.get_by_name(c)) else {
                            continue;
                        };
                        let found = matched
                            .entry((ty, property, ValueKey::single(value.clone())))
                            .or_default();
                        if !found.contains(&e) {
                            found.push(e);
                        }
                    }
                }
            }
        }

        let mut missing: Vec<(EntityRef, LoadTicket)> = Vec::new();
        for &(e, ticket) in &loads {
            if !graph.state(e).is_loaded() {
                tracing::warn!(
                    entity = graph.type_name(e),
                    id = ?graph.id(e),
                    "Row to load no longer exists"
                );
                graph.state_mut(e).load_failed();
                missing.push((e, ticket));
            }
        }

        let mut deferred: Vec<Deferred> = waiting
            .into_iter()
            .map(|(ticket, consumer)| {
                let gone = missing
                    .iter()
                    .filter(|(_, t)| *t == ticket)
                    .map(|&(e, _)| e)
                    .collect();
                (consumer, gone)
            })
            .collect();
        for ((ty, property), items) in retrievals {
            for (value, consumer) in items {
                let found = matched
                    .get(&(ty, property, ValueKey::single(value)))
                    .cloned()
                    .unwrap_or_default();
                deferred.push((consumer, found));
            }
        }
        Outcome::Ok(deferred)
    }
}

fn push_unique(values: &mut Vec<Value>, value: Value) {
    if !values.iter().any(|v| v.key_eq(&value)) {
        values.push(value);
    }
}

fn abandon(graph: &mut EntityGraph, loads: &[(EntityRef, LoadTicket)]) {
    for &(e, _) in loads {
        graph.state_mut(e).load_failed();
    }
}
