//! Reading rows into the graph outside of an operation.
//!
//! [`load_relation`] fills an unloaded inverse or association collection so it
//! can be read and changed. [`fetch`] and [`find`] materialise rows matching a
//! filter or an identity. All of them merge rows through the graph's identity
//! index, so a row already held in memory keeps its handle and its local
//! changes.

use asupersync::{Cx, Outcome};
use entgraph_core::error::{InvalidStateErrorKind, ModelingErrorKind};
use entgraph_core::{
    Criteria, EntityMeta, EntityType, Error, Link, Select, StatementExecutor, Value,
};

use crate::graph::{EntityGraph, EntityRef, Slot};

fn select_all(meta: &EntityMeta, filter: Criteria) -> Select {
    Select {
        table: meta.table(),
        columns: meta.stored().filter_map(|idx| meta.column(idx)).collect(),
        filter,
    }
}

async fn rows_into<E: StatementExecutor>(
    cx: &Cx,
    executor: &E,
    graph: &mut EntityGraph,
    ty: EntityType,
    select: &Select,
) -> Outcome<Vec<EntityRef>, Error> {
    let rows = match executor.select(cx, select).await {
        Outcome::Ok(rows) => rows,
        Outcome::Err(e) => return Outcome::Err(e),
        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
        Outcome::Panicked(p) => return Outcome::Panicked(p),
    };
    tracing::trace!(table = select.table, rows = rows.len(), "Materialising rows");
    Outcome::Ok(rows.iter().map(|row| graph.materialize(ty, row)).collect())
}

/// Materialise every row of `type_name` matching `filter`.
#[tracing::instrument(level = "debug", skip(cx, executor, graph, filter))]
pub async fn fetch<E: StatementExecutor>(
    cx: &Cx,
    executor: &E,
    graph: &mut EntityGraph,
    type_name: &str,
    filter: Criteria,
) -> Outcome<Vec<EntityRef>, Error> {
    let registry = std::sync::Arc::clone(graph.registry());
    let ty = match registry.resolve(type_name) {
        Ok(ty) => ty,
        Err(e) => return Outcome::Err(e),
    };
    let select = select_all(registry.entity(ty), filter);
    rows_into(cx, executor, graph, ty, &select).await
}

/// The instance with identity `id`, loaded from storage unless it already is.
///
/// Returns `None` when no such row exists.
#[tracing::instrument(level = "debug", skip(cx, executor, graph, id))]
pub async fn find<E: StatementExecutor>(
    cx: &Cx,
    executor: &E,
    graph: &mut EntityGraph,
    type_name: &str,
    id: impl Into<Value>,
) -> Outcome<Option<EntityRef>, Error> {
    let id = id.into();
    let registry = std::sync::Arc::clone(graph.registry());
    let meta = match registry.get(type_name) {
        Some(meta) => meta,
        None => {
            return Outcome::Err(Error::modeling(
                ModelingErrorKind::UnknownEntity,
                format!("unknown entity type {type_name}"),
            ));
        }
    };
    let Some(column) = meta.single_identity().and_then(|idx| meta.column(idx)) else {
        return Outcome::Err(Error::modeling(
            ModelingErrorKind::UnsupportedCompositeKey,
            format!("{type_name} has no single identity column"),
        ));
    };

    if let Some(e) = graph.lookup(type_name, id.clone()) {
        if graph.is_loaded(e) {
            return Outcome::Ok(Some(e));
        }
    }

    let select = select_all(meta, Criteria::eq(column, id));
    match rows_into(cx, executor, graph, meta.ty(), &select).await {
        Outcome::Ok(found) => Outcome::Ok(found.into_iter().next()),
        Outcome::Err(e) => Outcome::Err(e),
        Outcome::Cancelled(r) => Outcome::Cancelled(r),
        Outcome::Panicked(p) => Outcome::Panicked(p),
    }
}

/// Load the collection `name` of `e` and return its members.
///
/// A collection that is already loaded is returned as is. For an inverse,
/// the referencing rows are read with one SELECT; entities moved in or out
/// locally keep their local reference. For an association, the join rows are
/// read first, then the targets not loaded yet.
#[tracing::instrument(level = "debug", skip(cx, executor, graph), fields(handle = %e))]
pub async fn load_relation<E: StatementExecutor>(
    cx: &Cx,
    executor: &E,
    graph: &mut EntityGraph,
    e: EntityRef,
    name: &str,
) -> Outcome<Vec<EntityRef>, Error> {
    let registry = std::sync::Arc::clone(graph.registry());
    let meta = registry.entity(graph.entity_type(e));
    let idx = match meta.require_property(name) {
        Ok(idx) => idx,
        Err(err) => return Outcome::Err(err),
    };
    if matches!(meta.link(idx), Link::Column | Link::Owning { .. }) {
        return Outcome::Err(Error::invalid_state(
            InvalidStateErrorKind::WrongPropertyKind,
            format!("{}.{} is not a collection", meta.name(), name),
        ));
    }
    if let Some(links) = graph.slot(e, idx).as_links() {
        return Outcome::Ok(links.to_vec());
    }
    if !graph.is_persisted(e) {
        graph.sync_slot(e, idx, Slot::Links(Some(Vec::new())));
        return Outcome::Ok(Vec::new());
    }
    let id = match graph.identity_value(e) {
        Ok(id) => id,
        Err(err) => return Outcome::Err(err),
    };

    match meta.link(idx) {
        Link::Inverse { target, owning } => {
            let target_meta = registry.entity(target);
            let Some(column) = target_meta.column(owning) else {
                return Outcome::Ok(Vec::new());
            };
            let select = select_all(target_meta, Criteria::eq(column, id));
            let rows = match rows_into(cx, executor, graph, target, &select).await {
                Outcome::Ok(rows) => rows,
                Outcome::Err(err) => return Outcome::Err(err),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };

            let stored: Vec<EntityRef> = rows
                .iter()
                .copied()
                .filter(|&child| graph.persisted_target(child, owning) == Some(Some(e)))
                .collect();
            let mut current: Vec<EntityRef> = stored
                .iter()
                .copied()
                .filter(|&child| graph.current_target(child, owning) == Some(e))
                .collect();
            for child in graph.instances_of(target) {
                if !current.contains(&child)
                    && graph.state(child).is_modified(owning)
                    && graph.current_target(child, owning) == Some(e)
                {
                    current.push(child);
                }
            }
            graph.sync_slot(e, idx, Slot::Links(Some(stored)));
            graph.set_slot(e, idx, Slot::Links(Some(current.clone())));
            Outcome::Ok(current)
        }
        Link::Association {
            join,
            join_key,
            other_key,
            target,
            ..
        } => {
            let join_meta = registry.entity(join);
            let Some(column) = join_meta.column(join_key) else {
                return Outcome::Ok(Vec::new());
            };
            let select = select_all(join_meta, Criteria::eq(column, id));
            let records = match rows_into(cx, executor, graph, join, &select).await {
                Outcome::Ok(records) => records,
                Outcome::Err(err) => return Outcome::Err(err),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            let mut members = Vec::with_capacity(records.len());
            for record in records {
                if let Some(other) = graph.current_target(record, other_key) {
                    if !members.contains(&other) {
                        members.push(other);
                    }
                }
            }

            let target_meta = registry.entity(target);
            let unloaded: Vec<Value> = members
                .iter()
                .filter(|&&m| !graph.is_loaded(m))
                .filter_map(|&m| graph.id(m).cloned())
                .collect();
            if let Some(id_column) = target_meta.single_identity().and_then(|i| target_meta.column(i)) {
                if !unloaded.is_empty() {
                    let select = select_all(target_meta, Criteria::in_list(id_column, unloaded));
                    match rows_into(cx, executor, graph, target, &select).await {
                        Outcome::Ok(_) => {}
                        Outcome::Err(err) => return Outcome::Err(err),
                        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                        Outcome::Panicked(p) => return Outcome::Panicked(p),
                    }
                }
            }

            graph.sync_slot(e, idx, Slot::Links(Some(members.clone())));
            Outcome::Ok(members)
        }
        Link::Column | Link::Owning { .. } => Outcome::Ok(Vec::new()),
    }
}
