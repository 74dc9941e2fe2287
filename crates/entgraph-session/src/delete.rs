//! Delete rules.
//!
//! Before an entity's row can go, every row referencing it has to be dealt
//! with: deleted, or detached when its reference nulls on delete. Rows held
//! in a loaded, unmodified collection that must be deleted or were moved
//! elsewhere get requests of their own. Everything else is handled in bulk:
//! nulled by the property updater, removed by a delete-without-loading when
//! the referencing type qualifies, or retrieved and then cascaded to one by
//! one.
//!
//! The owning references of the deleted entity release their targets, which
//! may cascade further.

use std::sync::Arc;

use entgraph_core::{EntityType, Link, PropertyKind, Result, Value};

use crate::graph::EntityRef;
use crate::loader::Consumer;
use crate::operation::Planner;
use crate::request::{Action, RequestId};

impl Planner<'_> {
    pub(crate) fn expand_delete(&mut self, id: RequestId) -> Result<()> {
        let e = self.requests.get(id).entity;
        if !self.graph.is_persisted(e) {
            tracing::warn!(entity = self.graph.type_name(e), handle = %e, "Nothing stored to delete");
            self.requests.mark_executed(id);
            return Ok(());
        }

        let registry = Arc::clone(&self.registry);
        let meta = registry.entity(self.graph.entity_type(e));
        if self.graph.state(e).is_stub() {
            let has_references = meta.stored().any(|idx| meta.owning(idx).is_some());
            if has_references || meta.single_identity().is_none() {
                tracing::trace!(entity = meta.name(), handle = %e, "Loading before delete");
                self.load_first(id, e);
                return Ok(());
            }
        }

        for incoming in meta.incoming().iter().filter(|r| !r.tracked) {
            let delete = !registry
                .entity(incoming.source)
                .owning(incoming.property)
                .is_some_and(|r| r.nulls_on_delete());
            let value = self.stored_identity(e)?;
            self.cascade_unloaded(id, e, incoming.source, incoming.property, value, delete);
        }

        for idx in meta.indices() {
            match meta.link(idx) {
                Link::Column => {}
                Link::Owning { .. } => {
                    if let Some(target) = self.graph.persisted_target(e, idx).flatten() {
                        self.release_target(id, e, idx, target)?;
                    }
                }
                Link::Inverse { target, owning } => {
                    let optional = match &meta.property(idx).kind {
                        PropertyKind::Inverse(r) => r.optional,
                        _ => true,
                    };
                    let nulls = registry
                        .entity(target)
                        .owning(owning)
                        .is_some_and(|r| r.nulls_on_delete());
                    self.delete_inverse(id, e, idx, target, owning, !optional || !nulls)?;
                }
                Link::Association {
                    join,
                    join_key,
                    mirror,
                    ..
                } => self.delete_association(id, e, idx, join, join_key, mirror)?,
            }
        }

        if meta.single_identity().is_none() {
            let properties: Vec<usize> = if meta.identity().is_empty() {
                meta.stored().collect()
            } else {
                meta.identity().to_vec()
            };
            let mut key = Vec::with_capacity(properties.len());
            for idx in properties {
                key.push((idx, self.graph.persisted_column_value(e, idx)?));
            }
            self.requests.get_mut(id).delete_key = Some(key);
        }
        Ok(())
    }

    /// Identity as last stored, falling back to the in-memory value.
    fn stored_identity(&self, e: EntityRef) -> Result<Value> {
        match self.graph.meta(e).single_identity() {
            Some(idx) => self
                .graph
                .persisted_column_value(e, idx)
                .or_else(|_| self.graph.identity_value(e)),
            None => self.graph.identity_value(e),
        }
    }

    /// Loaded collection whose members are all known: cascade to each one.
    fn loaded_members(&self, e: EntityRef, property: usize) -> Option<Vec<EntityRef>> {
        if self.graph.state(e).is_modified(property) {
            return None;
        }
        self.graph
            .slot(e, property)
            .as_links()
            .map(<[EntityRef]>::to_vec)
    }

    fn delete_inverse(
        &mut self,
        id: RequestId,
        e: EntityRef,
        property: usize,
        child_ty: EntityType,
        owning: usize,
        delete: bool,
    ) -> Result<()> {
        let Some(children) = self.loaded_members(e, property) else {
            let value = self.stored_identity(e)?;
            self.cascade_unloaded(id, e, child_ty, owning, value, delete);
            return Ok(());
        };
        let mut detach = false;
        for child in children {
            let child_request = if self.graph.current_target(child, owning) != Some(e) {
                self.add(child, Action::Save)
            } else if delete {
                self.add(child, Action::Delete)
            } else {
                detach = true;
                continue;
            };
            self.requests.depends_on(id, child_request)?;
        }
        if detach {
            // Children still pointing here are nulled with one statement.
            let value = self.stored_identity(e)?;
            self.cascade_unloaded(id, e, child_ty, owning, value, false);
        }
        Ok(())
    }

    fn delete_association(
        &mut self,
        id: RequestId,
        e: EntityRef,
        property: usize,
        join: EntityType,
        join_key: usize,
        mirror: Option<usize>,
    ) -> Result<()> {
        let Some(members) = self.loaded_members(e, property) else {
            let value = self.stored_identity(e)?;
            self.cascade_unloaded(id, e, join, join_key, value, true);
            return Ok(());
        };
        for other in members {
            let record = match self.graph.join_between(e, property, other) {
                Some(record) => Some(record),
                None => self.graph.new_join(e, property, other, true),
            };
            if let Some(record) = record {
                let record_request = self.add(record, Action::Delete);
                self.requests.depends_on(id, record_request)?;
            }
            if let Some(mirror) = mirror {
                self.graph.sync_link_remove(other, mirror, e);
            }
        }
        Ok(())
    }

    /// Deal with `source` rows referencing `parent` through `property`
    /// without a request per row; `request` waits until that is done.
    fn cascade_unloaded(
        &mut self,
        request: RequestId,
        parent: EntityRef,
        source: EntityType,
        property: usize,
        value: Value,
        delete: bool,
    ) {
        self.requests.gate(request);
        let source_name = self.registry.entity(source).name();
        if !delete {
            tracing::trace!(source = source_name, "Nulling references in bulk");
            self.updater.add(source, property, value, Value::Null, request);
        } else if self.config.bulk_delete && self.registry.fast_delete_via(source, property) {
            tracing::trace!(source = source_name, "Deleting referencing rows without loading");
            self.bulk.add(source, property, value, request);
        } else {
            tracing::trace!(source = source_name, "Retrieving referencing rows");
            self.loader.retrieve(
                source,
                property,
                value,
                Consumer::Children {
                    request,
                    parent,
                    property,
                    delete: true,
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OperationConfig;
    use crate::graph::{EntityGraph, Slot};
    use entgraph_core::{
        AssociationSide, EntityInfo, ForeignDeleted, InverseRef, ManyToMany, OwningRef, Registry,
        Row,
    };

    fn registry(policy: ForeignDeleted) -> Arc<Registry> {
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
                            OwningRef::new("team_id", "Team").on_foreign_deleted(policy),
                        ),
                )
                .entity(
                    EntityInfo::new("Log", "logs")
                        .generated_id("id")
                        .column("line")
                        .owning("team", OwningRef::new("team_id", "Team")),
                )
                .entity(EntityInfo::new("Power", "powers").generated_id("id").column("name"))
                .many_to_many(ManyToMany::new(
                    "HeroPower",
                    "hero_powers",
                    AssociationSide::new("Hero", "powers", "hero_id"),
                    AssociationSide::new("Power", "heroes", "power_id"),
                ))
                .build()
                .unwrap(),
        )
    }

    fn row(columns: &[&str], values: Vec<Value>) -> Row {
        Row::new(columns.iter().map(|c| (*c).to_string()).collect(), values)
    }

    fn loaded_team(graph: &mut EntityGraph, id: i64, with_heroes: bool) -> EntityRef {
        let ty = graph.registry().resolve("Team").unwrap();
        let team = graph.materialize(ty, &row(&["id", "name"], vec![Value::BigInt(id), Value::from("A")]));
        if with_heroes {
            let heroes = graph.meta(team).require_property("heroes").unwrap();
            graph.sync_slot(team, heroes, Slot::Links(Some(Vec::new())));
        }
        team
    }

    fn loaded_hero(graph: &mut EntityGraph, id: i64, team: i64) -> EntityRef {
        let ty = graph.registry().resolve("Hero").unwrap();
        graph.materialize(
            ty,
            &row(
                &["id", "name", "team_id"],
                vec![Value::BigInt(id), Value::from("Thor"), Value::BigInt(team)],
            ),
        )
    }

    fn expand_pending(planner: &mut Planner<'_>) {
        loop {
            let pending = planner.requests.unprocessed();
            if pending.is_empty() {
                break;
            }
            for id in pending {
                planner.expand(id).unwrap();
            }
        }
    }

    #[test]
    fn transient_entities_need_no_statement() {
        let mut graph = EntityGraph::new(registry(ForeignDeleted::Delete));
        let team = graph.create("Team").unwrap();

        let mut planner = Planner::new(&mut graph, OperationConfig::default());
        let id = planner.add(team, Action::Delete);
        expand_pending(&mut planner);

        assert!(planner.requests.get(id).executed);
        assert!(!planner.loader.has_pending());
    }

    #[test]
    fn loaded_children_are_deleted_first() {
        let mut graph = EntityGraph::new(registry(ForeignDeleted::Delete));
        let team = loaded_team(&mut graph, 1, true);
        let hero = loaded_hero(&mut graph, 7, 1);

        let mut planner = Planner::new(&mut graph, OperationConfig::default());
        let team_request = planner.add(team, Action::Delete);
        expand_pending(&mut planner);

        let hero_request = planner.add(hero, Action::Delete);
        assert_eq!(planner.requests.get(hero_request).action, Action::Delete);
        assert!(planner.requests.get(team_request).depends_on.contains(&hero_request));
    }

    #[test]
    fn loaded_children_are_detached_under_set_null() {
        let mut graph = EntityGraph::new(registry(ForeignDeleted::SetNull));
        let team = loaded_team(&mut graph, 1, true);
        let hero = loaded_hero(&mut graph, 7, 1);

        let mut planner = Planner::new(&mut graph, OperationConfig::default());
        let team_request = planner.add(team, Action::Delete);
        expand_pending(&mut planner);

        let hero_ty = planner.registry.resolve("Hero").unwrap();
        assert!(planner.requests.ids().all(|id| planner.requests.get(id).ty != hero_ty));
        assert!(planner.updater.has_pending());
        assert_eq!(planner.requests.get(team_request).gates, 2);
        assert!(planner.requests.get(team_request).depends_on.is_empty());
        assert_eq!(planner.graph.target(hero, "team").unwrap(), Some(team));
        assert!(!planner.graph.state(hero).has_modifications());
    }

    #[test]
    fn moved_children_are_saved_before_the_parent_goes() {
        let mut graph = EntityGraph::new(registry(ForeignDeleted::SetNull));
        let team = loaded_team(&mut graph, 1, true);
        let stays = loaded_hero(&mut graph, 7, 1);
        let moves = loaded_hero(&mut graph, 8, 1);
        let other = loaded_team(&mut graph, 2, false);
        graph.set_target(moves, "team", Some(other)).unwrap();

        let mut planner = Planner::new(&mut graph, OperationConfig::default());
        let team_request = planner.add(team, Action::Delete);
        expand_pending(&mut planner);

        let moved_request = planner.add(moves, Action::Save);
        assert!(planner.requests.get(team_request).depends_on.contains(&moved_request));
        assert!(planner.updater.has_pending());
        assert_eq!(planner.requests.get(team_request).gates, 2);
        assert_eq!(planner.graph.target(stays, "team").unwrap(), Some(team));
    }

    #[test]
    fn unloaded_children_are_nulled_in_bulk() {
        let mut graph = EntityGraph::new(registry(ForeignDeleted::SetNull));
        let team = loaded_team(&mut graph, 1, false);

        let mut planner = Planner::new(&mut graph, OperationConfig::default());
        let team_request = planner.add(team, Action::Delete);
        expand_pending(&mut planner);

        assert!(planner.updater.has_pending());
        assert!(planner.bulk.has_pending());
        assert!(!planner.loader.has_pending());
        assert_eq!(planner.requests.get(team_request).gates, 2);
    }

    #[test]
    fn unloaded_children_are_retrieved_when_they_cascade() {
        let mut graph = EntityGraph::new(registry(ForeignDeleted::Delete));
        let team = loaded_team(&mut graph, 1, false);

        let mut planner =
            Planner::new(&mut graph, OperationConfig::default().bulk_delete(false));
        let team_request = planner.add(team, Action::Delete);
        expand_pending(&mut planner);

        assert!(planner.loader.has_pending());
        assert!(!planner.bulk.has_pending());
        assert!(!planner.updater.has_pending());
        assert_eq!(planner.requests.get(team_request).gates, 2);
    }

    #[test]
    fn stubs_with_references_are_loaded_first() {
        let mut graph = EntityGraph::new(registry(ForeignDeleted::Delete));
        let hero = graph.reference("Hero", 7).unwrap();

        let mut planner = Planner::new(&mut graph, OperationConfig::default());
        let id = planner.add(hero, Action::Delete);
        expand_pending(&mut planner);

        assert!(planner.loader.has_pending());
        assert_eq!(planner.requests.get(id).gates, 1);
    }

    #[test]
    fn loaded_association_deletes_join_records() {
        let mut graph = EntityGraph::new(registry(ForeignDeleted::Delete));
        let hero = loaded_hero(&mut graph, 7, 1);
        let powers = graph.meta(hero).require_property("powers").unwrap();
        let power_ty = graph.registry().resolve("Power").unwrap();
        let power = graph.materialize(power_ty, &row(&["id", "name"], vec![Value::BigInt(3), Value::from("Thunder")]));
        graph.sync_slot(hero, powers, Slot::Links(Some(vec![power])));

        let mut planner = Planner::new(&mut graph, OperationConfig::default());
        let hero_request = planner.add(hero, Action::Delete);
        expand_pending(&mut planner);

        let join_ty = planner.registry.resolve("HeroPower").unwrap();
        let joins: Vec<RequestId> = planner
            .requests
            .ids()
            .filter(|&id| planner.requests.get(id).ty == join_ty)
            .collect();
        assert_eq!(joins.len(), 1);
        assert_eq!(planner.requests.get(joins[0]).action, Action::Delete);
        assert!(planner.requests.get(hero_request).depends_on.contains(&joins[0]));
        let key = planner.requests.get(joins[0]).delete_key.clone().unwrap();
        assert_eq!(key.len(), 2);
    }
}
