//! Save rules.
//!
//! Saving an entity follows its relationships:
//!
//! - **owning references**: a changed reference releases the old target; the
//!   new target is saved, and inserted first when it has no row yet.
//! - **inverse references** (loaded only): entities removed since the last
//!   load are deleted or detached according to the reference's policy;
//!   entities present are pointed at this one and saved.
//! - **associations** (loaded only): added members get a join row, removed
//!   members lose theirs.
//!
//! Unloaded collections are skipped: they cannot have changed.

use entgraph_core::{Link, PropertyKind, Result};

use crate::graph::EntityRef;
use crate::operation::Planner;
use crate::request::{Action, RequestId};

impl Planner<'_> {
    pub(crate) fn expand_save(&mut self, id: RequestId) -> Result<()> {
        let e = self.requests.get(id).entity;
        let registry = std::sync::Arc::clone(&self.registry);
        let meta = registry.entity(self.graph.entity_type(e));
        let state = self.graph.state(e);

        if state.is_stub() {
            let references_changed = meta
                .stored()
                .any(|idx| meta.owning(idx).is_some() && state.is_modified(idx));
            let versioned_update = meta.version().is_some() && state.has_modifications();
            if references_changed || versioned_update {
                tracing::trace!(entity = meta.name(), handle = %e, "Loading before save");
                self.load_first(id, e);
                return Ok(());
            }
        }

        for idx in meta.indices() {
            match meta.link(idx) {
                Link::Column => {}
                Link::Owning { inverse, .. } => self.save_owning(id, e, idx, inverse)?,
                Link::Inverse { owning, .. } => self.save_inverse(id, e, idx, owning)?,
                Link::Association { mirror, .. } => self.save_association(e, idx, mirror),
            }
        }
        Ok(())
    }

    fn save_owning(
        &mut self,
        id: RequestId,
        e: EntityRef,
        property: usize,
        inverse: Option<usize>,
    ) -> Result<()> {
        let current = self.graph.current_target(e, property);
        if let Some(Some(old)) = self.graph.persisted_target(e, property) {
            if Some(old) != current {
                self.release_target(id, e, property, old)?;
            }
        }

        let Some(target) = current else {
            return Ok(());
        };
        let target_request = self.add(target, Action::Save);
        if !self.graph.is_persisted(target) {
            self.requests.depends_on(id, target_request)?;
        }
        if let Some(inv) = inverse {
            let multi = matches!(
                &self.graph.meta(target).property(inv).kind,
                PropertyKind::Inverse(r) if r.multi
            );
            if let Some(links) = self.graph.slot(target, inv).as_links() {
                if !links.contains(&e) {
                    if !multi {
                        // A single inverse holds one entity; the previous one is detached by its own save.
                        for previous in links.to_vec() {
                            self.graph.sync_link_remove(target, inv, previous);
                        }
                    }
                    self.graph.sync_link_add(target, inv, e);
                }
            }
        }
        Ok(())
    }

    fn save_inverse(&mut self, id: RequestId, e: EntityRef, property: usize, owning: usize) -> Result<()> {
        let Some(current) = self.graph.slot(e, property).as_links().map(<[EntityRef]>::to_vec) else {
            return Ok(());
        };
        let stored = self.graph.persisted_links(e, property);

        let optional = match &self.graph.meta(e).property(property).kind {
            PropertyKind::Inverse(r) => r.optional,
            _ => true,
        };

        for &removed in stored.iter().filter(|r| !current.contains(r)) {
            let still_linked = self.graph.current_target(removed, owning) == Some(e)
                && self.graph.persisted_target(removed, owning) == Some(Some(e));
            if !still_linked {
                continue;
            }
            let nulls = self
                .graph
                .meta(removed)
                .owning(owning)
                .is_some_and(|r| r.nulls_on_delete());
            if !optional || !nulls {
                tracing::trace!(handle = %removed, "Deleting entity removed from collection");
                self.add(removed, Action::Delete);
            } else {
                self.relink(removed, owning, None);
            }
        }

        let persisted = self.graph.is_persisted(e);
        for child in current {
            let child_request = self.relink(child, owning, Some(e));
            if !persisted {
                self.requests.depends_on(child_request, id)?;
            }
        }
        Ok(())
    }

    fn save_association(&mut self, e: EntityRef, property: usize, mirror: Option<usize>) {
        let Some(current) = self.graph.slot(e, property).as_links().map(<[EntityRef]>::to_vec) else {
            return;
        };
        let stored = self.graph.persisted_links(e, property);

        for &added in current.iter().filter(|x| !stored.contains(x)) {
            let join = match self.graph.join_between(e, property, added) {
                Some(join) => Some(join),
                None => self.graph.new_join(e, property, added, false),
            };
            if let Some(join) = join {
                self.add(join, Action::Save);
            }
            if let Some(mirror) = mirror {
                self.graph.sync_link_add(added, mirror, e);
            }
        }

        for &removed in stored.iter().filter(|x| !current.contains(x)) {
            let join = match self.graph.join_between(e, property, removed) {
                Some(join) => Some(join),
                None => self.graph.new_join(e, property, removed, true),
            };
            if let Some(join) = join {
                self.add(join, Action::Delete);
            }
            if let Some(mirror) = mirror {
                self.graph.sync_link_remove(removed, mirror, e);
            }
        }
    }
}
