//! Set-based statements that never load the rows they touch.
//!
//! - [`PropertyUpdater`] nulls (or repoints) an owning reference column with
//!   `UPDATE t SET col = new WHERE col IN (old...)`, one statement per
//!   distinct new value.
//! - [`DeleteWithoutLoading`] removes referencing rows with
//!   `DELETE FROM t WHERE col IN (values...)`, one statement per
//!   (type, property).
//!
//! Each queued item holds a gate on the request that asked for it; the gate
//! is released once the statement has executed. Instances already in memory
//! are brought in line with what the statement did to their rows.

use asupersync::{Cx, Outcome};
use entgraph_core::{
    Criteria, Delete, EntityType, Error, Link, Statement, StatementExecutor, Update, Value,
    ValueKey,
};

use crate::flush::run_concurrent;
use crate::graph::{EntityGraph, EntityRef, Slot};
use crate::operation::OperationReport;
use crate::request::{RequestGraph, RequestId};

fn push_unique(values: &mut Vec<Value>, value: Value) {
    if !values.iter().any(|v| v.key_eq(&value)) {
        values.push(value);
    }
}

/// Entities of `ty` whose stored `property` points at a row identified by one of `values`.
fn referencing(graph: &EntityGraph, ty: EntityType, property: usize, values: &[Value]) -> Vec<EntityRef> {
    graph
        .instances_of(ty)
        .into_iter()
        .filter(|&e| {
            graph
                .persisted_target(e, property)
                .flatten()
                .and_then(|t| graph.id(t))
                .is_some_and(|id| values.iter().any(|v| v.key_eq(id)))
        })
        .collect()
}

#[derive(Debug)]
struct UpdateGroup {
    ty: EntityType,
    property: usize,
    new: Value,
    old: Vec<Value>,
    requests: Vec<RequestId>,
}

/// Batches `UPDATE ... SET col = new WHERE col IN (...)` statements.
#[derive(Debug, Default)]
pub(crate) struct PropertyUpdater {
    groups: Vec<UpdateGroup>,
}

impl PropertyUpdater {
    /// Queue setting `property` of every `ty` row holding `old` to `new`,
    /// on behalf of `request`.
    pub(crate) fn add(
        &mut self,
        ty: EntityType,
        property: usize,
        old: Value,
        new: Value,
        request: RequestId,
    ) {
        let same_new = |g: &UpdateGroup| g.new.key_eq(&new) || (g.new.is_null() && new.is_null());
        let position = self
            .groups
            .iter()
            .position(|g| g.ty == ty && g.property == property && same_new(g));
        let group = match position {
            Some(i) => &mut self.groups[i],
            None => {
                self.groups.push(UpdateGroup {
                    ty,
                    property,
                    new,
                    old: Vec::new(),
                    requests: Vec::new(),
                });
                let last = self.groups.len() - 1;
                &mut self.groups[last]
            }
        };
        push_unique(&mut group.old, old);
        group.requests.push(request);
    }

    pub(crate) fn has_pending(&self) -> bool {
        !self.groups.is_empty()
    }

    #[tracing::instrument(level = "debug", skip_all, fields(groups = self.groups.len()))]
    pub(crate) async fn execute<E: StatementExecutor>(
        &mut self,
        cx: &Cx,
        executor: &E,
        graph: &mut EntityGraph,
        requests: &mut RequestGraph,
        max_in_values: usize,
        report: &mut OperationReport,
    ) -> Outcome<(), Error> {
        let groups = std::mem::take(&mut self.groups);
        let registry = std::sync::Arc::clone(graph.registry());

        let mut statements = Vec::new();
        for group in &groups {
            let meta = registry.entity(group.ty);
            let Some(column) = meta.column(group.property) else {
                continue;
            };
            for chunk in group.old.chunks(max_in_values) {
                statements.push(Statement::Update(Update {
                    table: meta.table(),
                    set: vec![(column, group.new.clone())],
                    filter: Criteria::in_list(column, chunk.to_vec()),
                }));
            }
        }

        let results = match run_concurrent(cx, executor, &statements).await {
            Outcome::Ok(results) => results,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let rows: u64 = results.iter().map(|r| r.rows_affected).sum();
        report.statements += statements.len();
        report.bulk_updated += rows;
        tracing::debug!(statements = statements.len(), rows, "Bulk updates executed");

        for group in groups {
            let target = match registry.entity(group.ty).link(group.property) {
                Link::Owning { target, .. } => target,
                _ => continue,
            };
            let new_slot = if group.new.is_null() {
                Slot::Ref(None)
            } else {
                Slot::Ref(Some(graph.reference_key(target, ValueKey::single(group.new.clone()))))
            };
            for e in referencing(graph, group.ty, group.property, &group.old) {
                let current = graph.slot(e, group.property).clone();
                let untouched = graph.state(e).persisted_value(group.property) == Some(&current);
                graph.sync_slot(e, group.property, new_slot.clone());
                if !untouched {
                    graph.set_slot(e, group.property, current);
                }
            }
            for request in group.requests {
                requests.release(request);
            }
        }
        Outcome::Ok(())
    }
}

#[derive(Debug)]
struct DeleteGroup {
    ty: EntityType,
    property: usize,
    values: Vec<Value>,
    requests: Vec<RequestId>,
}

/// Batches `DELETE ... WHERE col IN (...)` statements for rows nobody loads.
#[derive(Debug, Default)]
pub(crate) struct DeleteWithoutLoading {
    groups: Vec<DeleteGroup>,
}

impl DeleteWithoutLoading {
    /// Queue deleting every `ty` row whose `property` holds `value`.
    pub(crate) fn add(&mut self, ty: EntityType, property: usize, value: Value, request: RequestId) {
        let position = self
            .groups
            .iter()
            .position(|g| g.ty == ty && g.property == property);
        let group = match position {
            Some(i) => &mut self.groups[i],
            None => {
                self.groups.push(DeleteGroup {
                    ty,
                    property,
                    values: Vec::new(),
                    requests: Vec::new(),
                });
                let last = self.groups.len() - 1;
                &mut self.groups[last]
            }
        };
        push_unique(&mut group.values, value);
        group.requests.push(request);
    }

    pub(crate) fn has_pending(&self) -> bool {
        !self.groups.is_empty()
    }

    #[tracing::instrument(level = "debug", skip_all, fields(groups = self.groups.len()))]
    pub(crate) async fn execute<E: StatementExecutor>(
        &mut self,
        cx: &Cx,
        executor: &E,
        graph: &mut EntityGraph,
        requests: &mut RequestGraph,
        max_in_values: usize,
        report: &mut OperationReport,
    ) -> Outcome<(), Error> {
        let groups = std::mem::take(&mut self.groups);
        let registry = std::sync::Arc::clone(graph.registry());

        let mut statements = Vec::new();
        for group in &groups {
            let meta = registry.entity(group.ty);
            let Some(column) = meta.column(group.property) else {
                continue;
            };
            for chunk in group.values.chunks(max_in_values) {
                statements.push(Statement::Delete(Delete {
                    table: meta.table(),
                    filter: Criteria::in_list(column, chunk.to_vec()),
                }));
            }
        }

        let results = match run_concurrent(cx, executor, &statements).await {
            Outcome::Ok(results) => results,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let rows: u64 = results.iter().map(|r| r.rows_affected).sum();
        report.statements += statements.len();
        report.bulk_deleted += rows;
        tracing::debug!(statements = statements.len(), rows, "Bulk deletes executed");

        for group in groups {
            for e in referencing(graph, group.ty, group.property, &group.values) {
                graph.mark_deleted(e);
            }
            for request in group.requests {
                requests.release(request);
            }
        }
        Outcome::Ok(())
    }
}
