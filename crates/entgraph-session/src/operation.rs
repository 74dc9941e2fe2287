//! The operation: one save or delete call carried through to the database.
//!
//! An [`Operation`] owns everything that lives only for one call: the
//! request graph, the identity cache, the loader and bulk batches. It drives
//! them in cycles:
//!
//! 1. run the consumers of the previous cycle's loads
//! 2. expand every unprocessed request (save or delete rules)
//! 3. run queued loads and retrievals
//! 4. run queued bulk updates and deletes
//! 5. execute every ready request as one wave
//!
//! Each step that does something starts a new cycle. The operation is done
//! when a whole cycle does nothing. Any error aborts it at once; statements
//! of earlier waves are not undone.

use std::sync::Arc;

use asupersync::{Cx, Outcome};
use entgraph_core::error::InvalidStateErrorKind;
use entgraph_core::{Error, Link, PropertyKind, Registry, Result, StatementExecutor, Value};

use crate::bulk::{DeleteWithoutLoading, PropertyUpdater};
use crate::config::OperationConfig;
use crate::graph::{EntityGraph, EntityRef, Slot};
use crate::identity_map::{EntityKey, IdentityCache};
use crate::loader::{Consumer, Deferred, EntityLoader};
use crate::request::{Action, RequestGraph, RequestId};

/// What an operation did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationReport {
    /// Rows inserted.
    pub inserted: u64,
    /// Rows updated through per-entity statements.
    pub updated: u64,
    /// Rows deleted through per-entity statements.
    pub deleted: u64,
    /// Rows changed by bulk property updates.
    pub bulk_updated: u64,
    /// Rows removed by deletes that did not load them.
    pub bulk_deleted: u64,
    /// INSERT, UPDATE and DELETE statements executed.
    pub statements: usize,
    /// SELECTs issued to decide cascades.
    pub selects: usize,
    /// Waves of statements.
    pub waves: usize,
    /// Cycles of the operation loop.
    pub cycles: usize,
    /// Entities the caller handed in, in order.
    pub entities: Vec<EntityRef>,
}

/// Request bookkeeping shared by the save and delete rules.
pub(crate) struct Planner<'g> {
    pub(crate) graph: &'g mut EntityGraph,
    pub(crate) registry: Arc<Registry>,
    pub(crate) config: OperationConfig,
    pub(crate) requests: RequestGraph,
    pub(crate) cache: IdentityCache,
    pub(crate) loader: EntityLoader,
    pub(crate) updater: PropertyUpdater,
    pub(crate) bulk: DeleteWithoutLoading,
    pub(crate) deferred: Vec<Deferred>,
    pub(crate) report: OperationReport,
}

impl<'g> Planner<'g> {
    pub(crate) fn new(graph: &'g mut EntityGraph, config: OperationConfig) -> Self {
        let registry = Arc::clone(graph.registry());
        Self {
            graph,
            registry,
            config,
            requests: RequestGraph::new(),
            cache: IdentityCache::new(),
            loader: EntityLoader::default(),
            updater: PropertyUpdater::default(),
            bulk: DeleteWithoutLoading::default(),
            deferred: Vec::new(),
            report: OperationReport::default(),
        }
    }

    /// The request acting on `e`, created if the row has none yet.
    ///
    /// A save request asked to delete becomes a delete request; a delete
    /// request asked to save stays a delete.
    pub(crate) fn add(&mut self, e: EntityRef, action: Action) -> RequestId {
        let key = EntityKey::of(self.graph, e);
        if let Some(id) = self.cache.get(&key) {
            let request = self.requests.get(id);
            if action == Action::Delete && request.action == Action::Save && !request.executed {
                tracing::trace!(entity = request.type_name, handle = %e, "Converting save to delete");
                self.requests.convert_to_delete(id);
            }
            return id;
        }
        let id = self
            .requests
            .push(e, self.graph.entity_type(e), self.graph.type_name(e), action);
        self.cache.insert(key, id);
        id
    }

    /// Expand the save again once the entity's references changed under it.
    pub(crate) fn reexpand(&mut self, id: RequestId) {
        let request = self.requests.get_mut(id);
        if request.action == Action::Save && !request.executed {
            request.processed = false;
        }
    }

    /// Queue a load of `e`; `request` waits for it and is expanded again.
    pub(crate) fn load_first(&mut self, id: RequestId, e: EntityRef) {
        self.requests.gate(id);
        self.loader.load(self.graph, e, Consumer::Reprocess(id));
    }

    /// `source` no longer references `target` through `property`.
    ///
    /// The target loses its inverse link. It is deleted when the reference
    /// cascades or when it cannot exist without `source`; otherwise it is
    /// saved again.
    pub(crate) fn release_target(
        &mut self,
        request: RequestId,
        source: EntityRef,
        property: usize,
        target: EntityRef,
    ) -> Result<()> {
        let meta = Arc::clone(&self.registry);
        let source_meta = meta.entity(self.graph.entity_type(source));
        let Link::Owning {
            inverse,
            association,
            ..
        } = source_meta.link(property)
        else {
            return Ok(());
        };

        if let Some(assoc) = association {
            let other = source_meta
                .stored()
                .filter(|&idx| idx != property && source_meta.owning(idx).is_some())
                .find_map(|idx| {
                    self.graph
                        .persisted_target(source, idx)
                        .flatten()
                        .or_else(|| self.graph.current_target(source, idx))
                });
            if let Some(other) = other {
                self.graph.sync_link_remove(target, assoc, other);
            }
            return Ok(());
        }

        let cascade = source_meta
            .owning(property)
            .is_some_and(|r| r.cascade_delete);
        let mut required = false;
        if let Some(inv) = inverse {
            self.graph.sync_link_remove(target, inv, source);
            if let PropertyKind::Inverse(r) = &self.graph.meta(target).property(inv).kind {
                required = !r.multi && !r.optional;
            }
        }

        if cascade || required {
            let target_request = self.add(target, Action::Delete);
            self.requests.depends_on(target_request, request)?;
        } else if inverse.is_some() {
            self.add(target, Action::Save);
        }
        Ok(())
    }

    /// Point `child`'s owning reference at `parent` (or clear it) and save it.
    pub(crate) fn relink(&mut self, child: EntityRef, property: usize, parent: Option<EntityRef>) -> RequestId {
        let changed = self.graph.current_target(child, property) != parent;
        if changed {
            self.graph.set_slot(child, property, Slot::Ref(parent));
        }
        let id = self.add(child, Action::Save);
        if changed {
            self.reexpand(id);
        }
        id
    }

    /// Hand loaded data to the requests that asked for it.
    pub(crate) fn run_deferred(&mut self) -> Result<usize> {
        let deferred = std::mem::take(&mut self.deferred);
        let count = deferred.len();
        for (consumer, found) in deferred {
            match consumer {
                Consumer::Reprocess(id) => {
                    for gone in found {
                        if self.requests.get(id).action == Action::Save {
                            return Err(self.vanished(id, gone));
                        }
                        self.graph.mark_deleted(gone);
                    }
                    self.requests.get_mut(id).processed = false;
                }
                Consumer::Children {
                    request,
                    parent,
                    property,
                    delete,
                } => {
                    for child in found {
                        if self.graph.current_target(child, property) != Some(parent) {
                            // Moved away locally; its own save must land first.
                            let moved = self.add(child, Action::Save);
                            self.requests.depends_on(request, moved)?;
                            continue;
                        }
                        let child_request = if delete {
                            self.add(child, Action::Delete)
                        } else {
                            self.relink(child, property, None)
                        };
                        self.requests.depends_on(request, child_request)?;
                    }
                }
            }
            self.requests.release(consumer.request());
        }
        Ok(count)
    }

    /// The row a save was about to update is gone.
    fn vanished(&self, request: RequestId, e: EntityRef) -> Error {
        let expected = self
            .graph
            .meta(e)
            .version()
            .and_then(|idx| self.graph.slot(e, idx).as_value())
            .and_then(Value::as_i64)
            .unwrap_or(0);
        tracing::debug!(entity = self.graph.type_name(e), handle = %e, "Row to save no longer exists");
        self.conflict(request, expected)
    }

    /// Apply the save or delete rules to one request.
    pub(crate) fn expand(&mut self, id: RequestId) -> Result<()> {
        self.requests.get_mut(id).processed = true;
        match self.requests.get(id).action {
            Action::Save => self.expand_save(id),
            Action::Delete => self.expand_delete(id),
        }
    }
}

/// One save or delete call against an executor.
pub struct Operation<'a, E> {
    planner: Planner<'a>,
    executor: &'a E,
}

impl<'a, E: StatementExecutor> Operation<'a, E> {
    pub fn new(graph: &'a mut EntityGraph, executor: &'a E, config: OperationConfig) -> Self {
        Self {
            planner: Planner::new(graph, config),
            executor,
        }
    }

    /// Queue `e` to be saved.
    pub fn save(&mut self, e: EntityRef) {
        self.planner.report.entities.push(e);
        self.planner.add(e, Action::Save);
    }

    /// Queue `e` to be deleted.
    pub fn delete(&mut self, e: EntityRef) {
        self.planner.report.entities.push(e);
        self.planner.add(e, Action::Delete);
    }

    /// Run until no work is left.
    #[tracing::instrument(level = "debug", skip_all, fields(roots = self.planner.report.entities.len()))]
    pub async fn execute(mut self, cx: &Cx) -> Outcome<OperationReport, Error> {
        let max_cycles = self.planner.config.max_cycles;
        let max_in_values = self.planner.config.in_list_limit();
        let executor = self.executor;
        let planner = &mut self.planner;

        loop {
            planner.report.cycles += 1;
            if planner.report.cycles > max_cycles {
                return Outcome::Err(Error::invalid_state(
                    InvalidStateErrorKind::NotConverged,
                    format!("operation did not converge within {} cycles", max_cycles),
                ));
            }

            if let Err(e) = planner.run_deferred() {
                return Outcome::Err(e);
            }

            let unprocessed = planner.requests.unprocessed();
            if !unprocessed.is_empty() {
                tracing::trace!(requests = unprocessed.len(), "Expanding requests");
                for id in unprocessed {
                    if let Err(e) = planner.expand(id) {
                        return Outcome::Err(e);
                    }
                }
                continue;
            }

            if planner.loader.has_pending() {
                let loaded = planner
                    .loader
                    .execute(cx, executor, planner.graph, max_in_values, &mut planner.report)
                    .await;
                match loaded {
                    Outcome::Ok(deferred) => planner.deferred.extend(deferred),
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
                continue;
            }

            if planner.updater.has_pending() || planner.bulk.has_pending() {
                let updated = planner
                    .updater
                    .execute(
                        cx,
                        executor,
                        planner.graph,
                        &mut planner.requests,
                        max_in_values,
                        &mut planner.report,
                    )
                    .await;
                match updated {
                    Outcome::Ok(()) => {}
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
                let deleted = planner
                    .bulk
                    .execute(
                        cx,
                        executor,
                        planner.graph,
                        &mut planner.requests,
                        max_in_values,
                        &mut planner.report,
                    )
                    .await;
                match deleted {
                    Outcome::Ok(()) => {}
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
                continue;
            }

            let ready = planner.requests.ready();
            if ready.is_empty() {
                break;
            }
            match planner.flush_wave(cx, executor, ready).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        let pending = planner.requests.pending();
        if !pending.is_empty() {
            let names: Vec<String> = pending
                .iter()
                .map(|&id| {
                    let r = planner.requests.get(id);
                    format!("{} {} ({})", r.type_name, r.entity, r.action)
                })
                .collect();
            return Outcome::Err(Error::invalid_state(
                InvalidStateErrorKind::NotConverged,
                format!("requests left unexecuted: {}", names.join(", ")),
            ));
        }

        let report = std::mem::take(&mut planner.report);
        tracing::info!(
            inserted = report.inserted,
            updated = report.updated,
            deleted = report.deleted,
            bulk_updated = report.bulk_updated,
            bulk_deleted = report.bulk_deleted,
            statements = report.statements,
            selects = report.selects,
            waves = report.waves,
            "Operation complete"
        );
        Outcome::Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asupersync::runtime::RuntimeBuilder;
    use entgraph_core::{
        EntityInfo, ForeignDeleted, InverseRef, MemoryExecutor, OwningRef, StatementKind, Value,
    };

    fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            Outcome::Err(e) => panic!("unexpected error: {e}"),
            Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
            Outcome::Panicked(p) => panic!("panicked: {p:?}"),
        }
    }

    fn registry() -> Arc<Registry> {
        Arc::new(
            Registry::builder()
                .entity(
                    EntityInfo::new("Team", "teams")
                        .generated_id("id")
                        .column("name")
                        .inverse("heroes", InverseRef::many("Hero", "team")),
                )
                .entity(
                    EntityInfo::new("Hero", "heroes")
                        .generated_id("id")
                        .column("name")
                        .owning(
                            "team",
                            OwningRef::new("team_id", "Team")
                                .on_foreign_deleted(ForeignDeleted::SetNull),
                        ),
                )
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn add_converges_on_one_request() {
        let mut graph = EntityGraph::new(registry());
        let team = graph.create("Team").unwrap();
        let mut planner = Planner::new(&mut graph, OperationConfig::default());

        let first = planner.add(team, Action::Save);
        let second = planner.add(team, Action::Save);
        assert_eq!(first, second);

        let third = planner.add(team, Action::Delete);
        assert_eq!(first, third);
        assert_eq!(planner.requests.get(first).action, Action::Delete);

        let fourth = planner.add(team, Action::Save);
        assert_eq!(planner.requests.get(fourth).action, Action::Delete);
        assert_eq!(planner.requests.len(), 1);
    }

    #[test]
    fn parent_is_inserted_before_child() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let registry = registry();
        let db = MemoryExecutor::new(&registry);
        let mut graph = EntityGraph::new(registry);

        let team = graph.create("Team").unwrap();
        graph.set(team, "name", "Avengers").unwrap();
        let hero = graph.create("Hero").unwrap();
        graph.set(hero, "name", "Thor").unwrap();
        graph.set_target(hero, "team", Some(team)).unwrap();

        let report = rt.block_on(async {
            let mut op = Operation::new(&mut graph, &db, OperationConfig::default());
            op.save(hero);
            unwrap_outcome(op.execute(&cx).await)
        });

        assert_eq!(report.inserted, 2);
        assert_eq!(report.waves, 2);
        assert_eq!(report.entities, vec![hero]);
        let log = db.statements();
        assert_eq!(log[0].table, "teams");
        assert_eq!(log[1].table, "heroes");

        let team_id = graph.id(team).cloned().unwrap();
        let row = db.find("heroes", "name", &Value::from("Thor")).unwrap();
        assert_eq!(row.get_by_name("team_id"), Some(&team_id));
        assert!(!graph.state(hero).has_modifications());
        assert_eq!(graph.links(team, "heroes").unwrap(), &[hero]);
    }

    #[test]
    fn cycle_limit_reports_non_convergence() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let registry = registry();
        let db = MemoryExecutor::new(&registry);
        let mut graph = EntityGraph::new(registry);
        let team = graph.create("Team").unwrap();

        let outcome = rt.block_on(async {
            let mut op = Operation::new(&mut graph, &db, OperationConfig::new().max_cycles(1));
            op.save(team);
            op.execute(&cx).await
        });
        match outcome {
            Outcome::Err(e) => assert_eq!(
                e.invalid_state_kind(),
                Some(InvalidStateErrorKind::NotConverged)
            ),
            _ => panic!("expected NotConverged"),
        }
        assert_eq!(db.count_kind(StatementKind::Insert), 0);
    }

    fn seating() -> Arc<Registry> {
        Arc::new(
            Registry::builder()
                .entity(
                    EntityInfo::new("Seat", "seats")
                        .generated_id("id")
                        .column("label")
                        .inverse("ticket", InverseRef::one("Ticket", "seat").optional(false)),
                )
                .entity(
                    EntityInfo::new("Ticket", "tickets")
                        .generated_id("id")
                        .column("holder")
                        .owning("seat", OwningRef::new("seat_id", "Seat")),
                )
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn released_required_target_is_deleted_after_the_move() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let registry = seating();
        let db = MemoryExecutor::new(&registry);
        let mut graph = EntityGraph::new(registry);

        let old_seat = graph.create("Seat").unwrap();
        graph.set(old_seat, "label", "12A").unwrap();
        let ticket = graph.create("Ticket").unwrap();
        graph.set(ticket, "holder", "Ada").unwrap();
        graph.set_target(ticket, "seat", Some(old_seat)).unwrap();
        rt.block_on(async {
            let mut op = Operation::new(&mut graph, &db, OperationConfig::default());
            op.save(ticket);
            unwrap_outcome(op.execute(&cx).await)
        });
        db.clear_log();

        let new_seat = graph.create("Seat").unwrap();
        graph.set(new_seat, "label", "3C").unwrap();
        graph.set_target(ticket, "seat", Some(new_seat)).unwrap();
        let report = rt.block_on(async {
            let mut op = Operation::new(&mut graph, &db, OperationConfig::default());
            op.save(ticket);
            unwrap_outcome(op.execute(&cx).await)
        });

        assert_eq!((report.inserted, report.updated, report.deleted), (1, 1, 1));
        let kinds: Vec<(StatementKind, &str)> =
            db.statements().iter().map(|s| (s.kind, s.table)).collect();
        assert_eq!(
            kinds,
            vec![
                (StatementKind::Insert, "seats"),
                (StatementKind::Update, "tickets"),
                (StatementKind::Delete, "seats"),
            ]
        );
        assert!(!graph.is_persisted(old_seat));
        assert_eq!(graph.links(new_seat, "ticket").unwrap(), &[ticket]);
        assert_eq!(db.row_count("seats"), 1);
    }

    #[test]
    fn missing_row_fails_a_save_but_not_a_delete() {
        let registry = registry();
        let mut graph = EntityGraph::new(registry);
        let saved = graph.reference("Team", 41_i64).unwrap();
        let deleted = graph.reference("Hero", 42_i64).unwrap();

        let mut planner = Planner::new(&mut graph, OperationConfig::default());
        let save = planner.add(saved, Action::Save);
        let delete = planner.add(deleted, Action::Delete);
        planner.requests.get_mut(delete).processed = true;

        planner.deferred = vec![(Consumer::Reprocess(delete), vec![deleted])];
        planner.run_deferred().unwrap();
        assert!(!planner.graph.is_persisted(deleted));
        assert!(!planner.requests.get(delete).processed);

        planner.deferred = vec![(Consumer::Reprocess(save), vec![saved])];
        let err = planner.run_deferred().unwrap_err();
        assert!(err.is_conflict());
        assert!(planner.graph.state(saved).is_stub());
    }
}
