//! Statement generation and execution for one wave.
//!
//! A wave takes every request that is ready (expanded, no open gates, all
//! dependencies executed) and turns it into statements grouped by
//! (type, action):
//!
//! - SAVE of a new row: INSERT. Types with a generated identity insert row by
//!   row and read the key back; other types use one multi-row INSERT.
//! - SAVE of a persisted row: UPDATE of the modified columns only, guarded by
//!   the version column when the type has one. No modified columns, no
//!   statement.
//! - DELETE: `WHERE id IN (...)`, or an OR of per-row conjunctions for types
//!   without a single identity column.
//!
//! Groups are independent of each other within a wave and run concurrently;
//! statements inside a group run in order. Every result is checked before
//! any of them is applied to the in-memory state.

use asupersync::{Cx, Outcome};
use entgraph_core::error::ConflictError;
use entgraph_core::{
    Criteria, Delete, EntityType, Error, Insert, Result, Statement, StatementExecutor,
    StatementResult, Update, Value,
};
use futures::future::join_all;

use crate::graph::{EntityRef, Slot};
use crate::identity_map::EntityKey;
use crate::operation::Planner;
use crate::request::{Action, RequestId};

/// Execute independent statements concurrently, failing on the first error.
pub(crate) async fn run_concurrent<E: StatementExecutor>(
    cx: &Cx,
    executor: &E,
    statements: &[Statement],
) -> Outcome<Vec<StatementResult>, Error> {
    for statement in statements {
        tracing::trace!(kind = %statement.kind(), table = statement.table(), "Queueing statement");
    }
    let outcomes = join_all(statements.iter().map(|s| executor.execute(cx, s))).await;
    let mut results = Vec::with_capacity(outcomes.len());
    for outcome in outcomes {
        match outcome {
            Outcome::Ok(result) => results.push(result),
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
    }
    Outcome::Ok(results)
}

/// What a statement does to the requests it was generated from.
#[derive(Debug)]
enum Effect {
    Insert(Vec<RequestId>),
    Update {
        request: RequestId,
        expected_version: Option<i64>,
    },
    Delete(Vec<RequestId>),
}

#[derive(Debug)]
struct Planned {
    statement: Statement,
    effect: Effect,
}

#[derive(Debug)]
struct Group {
    ty: EntityType,
    action: Action,
    statements: Vec<Planned>,
}

#[derive(Debug, Default)]
struct Wave {
    groups: Vec<Group>,
    /// Persisted saves with nothing to write.
    unchanged: Vec<RequestId>,
    /// Deletes whose row is already gone.
    skipped: Vec<RequestId>,
}

async fn run_group<E: StatementExecutor>(
    cx: &Cx,
    executor: &E,
    group: &Group,
) -> Outcome<Vec<StatementResult>, Error> {
    let mut results = Vec::with_capacity(group.statements.len());
    for planned in &group.statements {
        tracing::trace!(
            kind = %planned.statement.kind(),
            table = planned.statement.table(),
            "Executing statement"
        );
        match executor.execute(cx, &planned.statement).await {
            Outcome::Ok(result) => results.push(result),
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
    }
    Outcome::Ok(results)
}

impl Planner<'_> {
    /// Send every ready request to the database and record the results.
    #[tracing::instrument(level = "debug", skip_all, fields(requests = ready.len()))]
    pub(crate) async fn flush_wave<E: StatementExecutor>(
        &mut self,
        cx: &Cx,
        executor: &E,
        ready: Vec<RequestId>,
    ) -> Outcome<(), Error> {
        let wave = match self.plan_wave(&ready) {
            Ok(wave) => wave,
            Err(e) => return Outcome::Err(e),
        };
        let count: usize = wave.groups.iter().map(|g| g.statements.len()).sum();
        tracing::debug!(
            groups = wave.groups.len(),
            statements = count,
            unchanged = wave.unchanged.len(),
            "Executing wave"
        );

        let outcomes = if self.config.concurrent_groups {
            join_all(wave.groups.iter().map(|g| run_group(cx, executor, g))).await
        } else {
            let mut outcomes = Vec::with_capacity(wave.groups.len());
            for group in &wave.groups {
                let outcome = run_group(cx, executor, group).await;
                let failed = !matches!(outcome, Outcome::Ok(_));
                outcomes.push(outcome);
                if failed {
                    break;
                }
            }
            outcomes
        };

        let mut results = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            match outcome {
                Outcome::Ok(r) => results.push(r),
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        self.report.statements += count;
        self.report.waves += 1;

        for (group, group_results) in wave.groups.iter().zip(&results) {
            for (planned, result) in group.statements.iter().zip(group_results) {
                if let Effect::Update {
                    request,
                    expected_version: Some(version),
                } = planned.effect
                {
                    if result.rows_affected == 0 {
                        return Outcome::Err(self.conflict(request, version));
                    }
                }
            }
        }

        for (group, group_results) in wave.groups.into_iter().zip(results) {
            tracing::trace!(ty = group.ty.index(), action = %group.action, "Applying group results");
            for (planned, result) in group.statements.into_iter().zip(group_results) {
                self.apply(planned.effect, result);
            }
        }
        for id in wave.unchanged {
            let e = self.requests.get(id).entity;
            let (snapshot, complete) = self.graph.save_snapshot(e);
            self.graph.state_mut(e).saved(snapshot, complete);
            self.requests.mark_executed(id);
        }
        for id in wave.skipped {
            self.requests.mark_executed(id);
        }
        Outcome::Ok(())
    }

    pub(crate) fn conflict(&self, request: RequestId, expected_version: i64) -> Error {
        let e = self.requests.get(request).entity;
        let meta = self.graph.meta(e);
        let identity = self
            .graph
            .identity_key(e)
            .map_or_else(|| e.to_string(), |key| key.to_string());
        Error::Conflict(ConflictError {
            entity: meta.name(),
            table: meta.table(),
            identity,
            expected_version,
        })
    }

    fn plan_wave(&self, ready: &[RequestId]) -> Result<Wave> {
        let mut order: Vec<(EntityType, Action)> = Vec::new();
        let mut buckets: Vec<Vec<RequestId>> = Vec::new();
        for &id in ready {
            let request = self.requests.get(id);
            let key = (request.ty, request.action);
            match order.iter().position(|k| *k == key) {
                Some(i) => buckets[i].push(id),
                None => {
                    order.push(key);
                    buckets.push(vec![id]);
                }
            }
        }

        let mut wave = Wave::default();
        for ((ty, action), ids) in order.into_iter().zip(buckets) {
            let mut statements = Vec::new();
            match action {
                Action::Save => {
                    let (new, existing): (Vec<RequestId>, Vec<RequestId>) = ids
                        .into_iter()
                        .partition(|&id| !self.graph.is_persisted(self.requests.get(id).entity));
                    self.plan_inserts(ty, &new, &mut statements)?;
                    for id in existing {
                        match self.plan_update(id)? {
                            Some(planned) => statements.push(planned),
                            None => wave.unchanged.push(id),
                        }
                    }
                }
                Action::Delete => {
                    let (gone, present): (Vec<RequestId>, Vec<RequestId>) = ids
                        .into_iter()
                        .partition(|&id| !self.graph.is_persisted(self.requests.get(id).entity));
                    wave.skipped.extend(gone);
                    self.plan_deletes(ty, &present, &mut statements)?;
                }
            }
            if !statements.is_empty() {
                wave.groups.push(Group {
                    ty,
                    action,
                    statements,
                });
            }
        }
        Ok(wave)
    }

    fn plan_inserts(&self, ty: EntityType, ids: &[RequestId], out: &mut Vec<Planned>) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let meta = self.registry.entity(ty);
        let generated = meta.generated_identity();
        let version = meta.version();

        let row_of = |e: EntityRef, skip: Option<usize>| -> Result<(Vec<&'static str>, Vec<Value>)> {
            let mut columns = Vec::new();
            let mut values = Vec::new();
            for idx in meta.stored() {
                if Some(idx) == skip {
                    continue;
                }
                let Some(column) = meta.column(idx) else {
                    continue;
                };
                let value = if Some(idx) == version {
                    Value::BigInt(1)
                } else {
                    self.graph.column_value(e, idx)?
                };
                columns.push(column);
                values.push(value);
            }
            Ok((columns, values))
        };

        if let Some(id_idx) = generated {
            for &id in ids {
                let e = self.requests.get(id).entity;
                let omit = self.graph.id(e).is_none();
                let (columns, values) = row_of(e, omit.then_some(id_idx))?;
                out.push(Planned {
                    statement: Statement::Insert(Insert {
                        table: meta.table(),
                        columns,
                        rows: vec![values],
                        returning: if omit { meta.column(id_idx) } else { None },
                    }),
                    effect: Effect::Insert(vec![id]),
                });
            }
            return Ok(());
        }

        for chunk in ids.chunks(self.config.in_list_limit()) {
            let mut columns = Vec::new();
            let mut rows = Vec::with_capacity(chunk.len());
            for &id in chunk {
                let (cols, values) = row_of(self.requests.get(id).entity, None)?;
                columns = cols;
                rows.push(values);
            }
            out.push(Planned {
                statement: Statement::Insert(Insert {
                    table: meta.table(),
                    columns,
                    rows,
                    returning: None,
                }),
                effect: Effect::Insert(chunk.to_vec()),
            });
        }
        Ok(())
    }

    /// Criteria matching the stored row of `e`.
    fn row_filter(&self, e: EntityRef) -> Result<Criteria> {
        let meta = self.graph.meta(e);
        let properties: Vec<usize> = if meta.identity().is_empty() {
            meta.stored().collect()
        } else {
            meta.identity().to_vec()
        };
        let mut terms = Vec::with_capacity(properties.len());
        for idx in properties {
            let Some(column) = meta.column(idx) else {
                continue;
            };
            let value = match self.graph.persisted_column_value(e, idx) {
                Ok(value) => value,
                Err(_) => self.graph.column_value(e, idx)?,
            };
            terms.push(Criteria::Eq(column, value));
        }
        Ok(Criteria::and(terms))
    }

    fn plan_update(&self, id: RequestId) -> Result<Option<Planned>> {
        let e = self.requests.get(id).entity;
        let meta = self.graph.meta(e);
        let state = self.graph.state(e);
        let version = meta.version();

        let mut set = Vec::new();
        for idx in meta.stored() {
            if Some(idx) == version || !state.is_modified(idx) {
                continue;
            }
            if let Some(column) = meta.column(idx) {
                set.push((column, self.graph.column_value(e, idx)?));
            }
        }
        if set.is_empty() {
            return Ok(None);
        }

        let mut filter = self.row_filter(e)?;
        let mut expected_version = None;
        if let Some(v_idx) = version {
            let column = meta.column(v_idx).unwrap_or_default();
            let current = self
                .graph
                .persisted_column_value(e, v_idx)
                .unwrap_or(Value::Null);
            let next = current.as_i64().map_or(1, |v| v + 1);
            set.push((column, Value::BigInt(next)));
            filter = Criteria::and(vec![filter, Criteria::Eq(column, current.clone())]);
            expected_version = Some(current.as_i64().unwrap_or(0));
        }

        Ok(Some(Planned {
            statement: Statement::Update(Update {
                table: meta.table(),
                set,
                filter,
            }),
            effect: Effect::Update {
                request: id,
                expected_version,
            },
        }))
    }

    fn plan_deletes(&self, ty: EntityType, ids: &[RequestId], out: &mut Vec<Planned>) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let meta = self.registry.entity(ty);

        if let Some(id_idx) = meta.single_identity() {
            let column = meta.column(id_idx).unwrap_or_default();
            for chunk in ids.chunks(self.config.in_list_limit()) {
                let mut values = Vec::with_capacity(chunk.len());
                for &id in chunk {
                    let e = self.requests.get(id).entity;
                    let value = match self.graph.persisted_column_value(e, id_idx) {
                        Ok(value) => value,
                        Err(_) => self.graph.identity_value(e)?,
                    };
                    values.push(value);
                }
                out.push(Planned {
                    statement: Statement::Delete(Delete {
                        table: meta.table(),
                        filter: Criteria::in_list(column, values),
                    }),
                    effect: Effect::Delete(chunk.to_vec()),
                });
            }
            return Ok(());
        }

        for chunk in ids.chunks(self.config.in_list_limit()) {
            let mut rows = Vec::with_capacity(chunk.len());
            for &id in chunk {
                let request = self.requests.get(id);
                let row = match &request.delete_key {
                    Some(key) => Criteria::and(
                        key.iter()
                            .filter_map(|(idx, v)| meta.column(*idx).map(|c| Criteria::Eq(c, v.clone())))
                            .collect(),
                    ),
                    None => self.row_filter(request.entity)?,
                };
                rows.push(row);
            }
            out.push(Planned {
                statement: Statement::Delete(Delete {
                    table: meta.table(),
                    filter: Criteria::or(rows),
                }),
                effect: Effect::Delete(chunk.to_vec()),
            });
        }
        Ok(())
    }

    fn apply(&mut self, effect: Effect, result: StatementResult) {
        match effect {
            Effect::Insert(ids) => {
                self.report.inserted += result.rows_affected;
                let mut keys = result.generated_keys.into_iter();
                for id in ids {
                    let e = self.requests.get(id).entity;
                    let meta = self.graph.meta(e);
                    let generated = meta.generated_identity();
                    let version = meta.version();
                    let old_key = EntityKey::of(self.graph, e);

                    if let Some(idx) = generated {
                        if self.graph.id(e).is_none() {
                            if let Some(key) = keys.next() {
                                self.graph.sync_slot(e, idx, Slot::Value(key));
                            }
                        }
                    }
                    if let Some(idx) = version {
                        self.graph.sync_slot(e, idx, Slot::Value(Value::BigInt(1)));
                    }
                    let (snapshot, _) = self.graph.save_snapshot(e);
                    self.graph.state_mut(e).saved(snapshot, true);
                    self.graph.register(e);
                    self.cache.rekey(&old_key, EntityKey::of(self.graph, e));
                    self.requests.mark_executed(id);
                }
            }
            Effect::Update { request, .. } => {
                self.report.updated += result.rows_affected;
                let e = self.requests.get(request).entity;
                if result.rows_affected == 0 {
                    tracing::warn!(
                        entity = self.graph.type_name(e),
                        handle = %e,
                        "UPDATE matched no row"
                    );
                }
                let old_key = EntityKey::of(self.graph, e);
                if let Some(idx) = self.graph.meta(e).version() {
                    let next = self
                        .graph
                        .persisted_column_value(e, idx)
                        .ok()
                        .and_then(|v| v.as_i64())
                        .map_or(1, |v| v + 1);
                    self.graph.sync_slot(e, idx, Slot::Value(Value::BigInt(next)));
                }
                let (snapshot, complete) = self.graph.save_snapshot(e);
                self.graph.state_mut(e).saved(snapshot, complete);
                let new_key = EntityKey::of(self.graph, e);
                if new_key != old_key {
                    self.graph.forget(e);
                    self.graph.register(e);
                    self.cache.rekey(&old_key, new_key);
                }
                self.requests.mark_executed(request);
            }
            Effect::Delete(ids) => {
                self.report.deleted += result.rows_affected;
                for id in ids {
                    let e = self.requests.get(id).entity;
                    self.graph.mark_deleted(e);
                    self.requests.mark_executed(id);
                }
            }
        }
    }
}
