//! The entity graph.
//!
//! Entities live in an arena owned by [`EntityGraph`] and are addressed by
//! [`EntityRef`] handles, so a parent and its children can point at each
//! other without owning each other. Each entity stores one [`Slot`] per
//! property of its type plus its [`EntityState`].
//!
//! All mutation goes through the graph. Every setter reports the new value to
//! `EntityState::field_set`, which is how the write path learns what changed.
//!
//! The graph keeps an identity index from (type, identity value) to handle.
//! Rows read from storage, stubs created from foreign keys, and client
//! references all converge on one instance per row.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use entgraph_core::error::{InvalidStateErrorKind, ModelingErrorKind};
use entgraph_core::{
    EntityMeta, EntityType, Error, Link, PropertyKind, Registry, Result, Row, Value, ValueKey,
};

use crate::state::EntityState;

/// Handle of an entity in an [`EntityGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityRef(usize);

impl EntityRef {
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The value held by one property of an entity.
#[derive(Debug, Clone, PartialEq)]
pub enum Slot {
    /// A plain column.
    Value(Value),
    /// An owning reference.
    Ref(Option<EntityRef>),
    /// An inverse or association collection; `None` until loaded.
    Links(Option<Vec<EntityRef>>),
}

impl Slot {
    /// Equality as far as change tracking is concerned.
    ///
    /// Values compare as identity keys, collections compare as sets.
    pub fn same_as(&self, other: &Slot) -> bool {
        match (self, other) {
            (Slot::Value(a), Slot::Value(b)) => {
                a.key_eq(b) || (a.is_null() && b.is_null()) || a == b
            }
            (Slot::Ref(a), Slot::Ref(b)) => a == b,
            (Slot::Links(Some(a)), Slot::Links(Some(b))) => {
                a.len() == b.len() && a.iter().all(|e| b.contains(e))
            }
            (Slot::Links(None), Slot::Links(None)) => true,
            _ => false,
        }
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Slot::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_target(&self) -> Option<Option<EntityRef>> {
        match self {
            Slot::Ref(r) => Some(*r),
            _ => None,
        }
    }

    pub fn as_links(&self) -> Option<&[EntityRef]> {
        match self {
            Slot::Links(Some(links)) => Some(links),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct Entity {
    ty: EntityType,
    slots: Vec<Slot>,
    state: EntityState,
}

/// Arena of entities sharing one metadata registry.
#[derive(Debug, Clone)]
pub struct EntityGraph {
    registry: Arc<Registry>,
    entities: Vec<Entity>,
    identities: HashMap<(EntityType, ValueKey), EntityRef>,
    joins: HashMap<(EntityType, EntityRef, EntityRef), EntityRef>,
}

fn wrong_kind(meta: &EntityMeta, property: usize, expected: &str) -> Error {
    Error::invalid_state(
        InvalidStateErrorKind::WrongPropertyKind,
        format!(
            "{}.{} is not {}",
            meta.name(),
            meta.property(property).name,
            expected
        ),
    )
}

impl EntityGraph {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            entities: Vec::new(),
            identities: HashMap::new(),
            joins: HashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// All handles, in creation order.
    pub fn handles(&self) -> impl Iterator<Item = EntityRef> + '_ {
        (0..self.entities.len()).map(EntityRef)
    }

    /// Create a new transient entity. Its collections are loaded and empty.
    pub fn create(&mut self, type_name: &str) -> Result<EntityRef> {
        let ty = self.registry.resolve(type_name)?;
        Ok(self.push(ty, EntityState::transient(), true))
    }

    /// The instance for the row of `type_name` with identity `id`.
    ///
    /// Returns the known instance, or a stub holding only the identity.
    pub fn reference(&mut self, type_name: &str, id: impl Into<Value>) -> Result<EntityRef> {
        let ty = self.registry.resolve(type_name)?;
        if self.registry.entity(ty).single_identity().is_none() {
            return Err(Error::modeling(
                ModelingErrorKind::UnsupportedCompositeKey,
                format!("{} has no single identity column", type_name),
            ));
        }
        Ok(self.reference_key(ty, ValueKey::single(id.into())))
    }

    /// Look up a known instance by identity without creating a stub.
    pub fn lookup(&self, type_name: &str, id: impl Into<Value>) -> Option<EntityRef> {
        let ty = self.registry.get(type_name)?.ty();
        self.identities
            .get(&(ty, ValueKey::single(id.into())))
            .copied()
    }

    pub fn entity_type(&self, e: EntityRef) -> EntityType {
        self.entities[e.0].ty
    }

    pub fn meta(&self, e: EntityRef) -> &EntityMeta {
        self.registry.entity(self.entities[e.0].ty)
    }

    pub fn type_name(&self, e: EntityRef) -> &'static str {
        self.meta(e).name()
    }

    pub fn state(&self, e: EntityRef) -> &EntityState {
        &self.entities[e.0].state
    }

    pub(crate) fn state_mut(&mut self, e: EntityRef) -> &mut EntityState {
        &mut self.entities[e.0].state
    }

    pub fn is_persisted(&self, e: EntityRef) -> bool {
        self.state(e).is_persisted()
    }

    pub fn is_loaded(&self, e: EntityRef) -> bool {
        self.state(e).is_loaded()
    }

    fn property(&self, e: EntityRef, name: &str) -> Result<usize> {
        self.meta(e).require_property(name)
    }

    /// Value of a column property.
    pub fn get(&self, e: EntityRef, name: &str) -> Result<&Value> {
        let idx = self.property(e, name)?;
        self.slot(e, idx)
            .as_value()
            .ok_or_else(|| wrong_kind(self.meta(e), idx, "a column"))
    }

    /// Set a column property.
    pub fn set(&mut self, e: EntityRef, name: &str, value: impl Into<Value>) -> Result<()> {
        let idx = self.property(e, name)?;
        if !matches!(self.meta(e).property(idx).kind, PropertyKind::Column { .. }) {
            return Err(wrong_kind(self.meta(e), idx, "a column"));
        }
        self.set_slot(e, idx, Slot::Value(value.into()));
        Ok(())
    }

    /// The single identity value, if assigned.
    pub fn id(&self, e: EntityRef) -> Option<&Value> {
        let idx = self.meta(e).single_identity()?;
        self.slot(e, idx).as_value().filter(|v| !v.is_null())
    }

    /// Target of an owning reference.
    pub fn target(&self, e: EntityRef, name: &str) -> Result<Option<EntityRef>> {
        let idx = self.property(e, name)?;
        self.slot(e, idx)
            .as_target()
            .ok_or_else(|| wrong_kind(self.meta(e), idx, "an owning reference"))
    }

    /// Point an owning reference at `target` (or clear it).
    pub fn set_target(&mut self, e: EntityRef, name: &str, target: Option<EntityRef>) -> Result<()> {
        let idx = self.property(e, name)?;
        let Link::Owning {
            target: target_ty, ..
        } = self.meta(e).link(idx)
        else {
            return Err(wrong_kind(self.meta(e), idx, "an owning reference"));
        };
        if let Some(t) = target {
            self.check_type(e, idx, t, target_ty)?;
        }
        self.set_slot(e, idx, Slot::Ref(target));
        Ok(())
    }

    fn check_type(&self, e: EntityRef, idx: usize, other: EntityRef, expected: EntityType) -> Result<()> {
        if self.entity_type(other) == expected {
            return Ok(());
        }
        Err(Error::modeling(
            ModelingErrorKind::InvalidRelationship,
            format!(
                "{}.{} cannot hold a {}",
                self.type_name(e),
                self.meta(e).property(idx).name,
                self.type_name(other)
            ),
        ))
    }

    /// Whether a relation can be trusted: owning references always can once
    /// the instance is loaded, collections only after they were loaded.
    pub fn is_relation_loaded(&self, e: EntityRef, name: &str) -> Result<bool> {
        let idx = self.property(e, name)?;
        Ok(match self.slot(e, idx) {
            Slot::Links(links) => links.is_some(),
            Slot::Ref(_) | Slot::Value(_) => {
                self.state(e).is_loaded() || !self.state(e).is_persisted()
            }
        })
    }

    fn collection(&self, e: EntityRef, name: &str) -> Result<usize> {
        let idx = self.property(e, name)?;
        match self.slot(e, idx) {
            Slot::Links(Some(_)) => Ok(idx),
            Slot::Links(None) => Err(Error::invalid_state(
                InvalidStateErrorKind::RelationNotLoaded,
                format!(
                    "{}.{} of {} is not loaded",
                    self.type_name(e),
                    name,
                    e
                ),
            )),
            _ => Err(wrong_kind(self.meta(e), idx, "a collection")),
        }
    }

    /// Members of a loaded inverse or association collection.
    pub fn links(&self, e: EntityRef, name: &str) -> Result<&[EntityRef]> {
        let idx = self.collection(e, name)?;
        Ok(self.slot(e, idx).as_links().unwrap_or(&[]))
    }

    fn collection_target(&self, e: EntityRef, idx: usize) -> Option<(EntityType, bool)> {
        let meta = self.meta(e);
        match (&meta.property(idx).kind, meta.link(idx)) {
            (PropertyKind::Inverse(inverse), Link::Inverse { target, .. }) => {
                Some((target, inverse.multi))
            }
            (_, Link::Association { target, .. }) => Some((target, true)),
            _ => None,
        }
    }

    /// Add `other` to a loaded collection. A single inverse is replaced.
    pub fn add_link(&mut self, e: EntityRef, name: &str, other: EntityRef) -> Result<()> {
        let idx = self.collection(e, name)?;
        let Some((target_ty, multi)) = self.collection_target(e, idx) else {
            return Err(wrong_kind(self.meta(e), idx, "a collection"));
        };
        self.check_type(e, idx, other, target_ty)?;
        let mut links = self.slot(e, idx).as_links().unwrap_or(&[]).to_vec();
        if links.contains(&other) {
            return Ok(());
        }
        if !multi {
            links.clear();
        }
        links.push(other);
        self.set_slot(e, idx, Slot::Links(Some(links)));
        Ok(())
    }

    /// Remove `other` from a loaded collection. Returns whether it was present.
    pub fn remove_link(&mut self, e: EntityRef, name: &str, other: EntityRef) -> Result<bool> {
        let idx = self.collection(e, name)?;
        let mut links = self.slot(e, idx).as_links().unwrap_or(&[]).to_vec();
        let before = links.len();
        links.retain(|l| *l != other);
        if links.len() == before {
            return Ok(false);
        }
        self.set_slot(e, idx, Slot::Links(Some(links)));
        Ok(true)
    }

    /// Replace the members of a loaded collection.
    pub fn set_links(&mut self, e: EntityRef, name: &str, members: Vec<EntityRef>) -> Result<()> {
        let idx = self.collection(e, name)?;
        let Some((target_ty, _)) = self.collection_target(e, idx) else {
            return Err(wrong_kind(self.meta(e), idx, "a collection"));
        };
        for &m in &members {
            self.check_type(e, idx, m, target_ty)?;
        }
        let mut unique = Vec::with_capacity(members.len());
        for m in members {
            if !unique.contains(&m) {
                unique.push(m);
            }
        }
        self.set_slot(e, idx, Slot::Links(Some(unique)));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Crate-internal slot access
    // ------------------------------------------------------------------

    pub(crate) fn slot(&self, e: EntityRef, idx: usize) -> &Slot {
        &self.entities[e.0].slots[idx]
    }

    /// Change a slot and report it to the change tracker.
    pub(crate) fn set_slot(&mut self, e: EntityRef, idx: usize, slot: Slot) {
        let entity = &mut self.entities[e.0];
        entity.state.field_set(idx, &slot);
        entity.slots[idx] = slot;
    }

    /// Change a slot and its stored value together (bookkeeping, not a change).
    pub(crate) fn sync_slot(&mut self, e: EntityRef, idx: usize, slot: Slot) {
        let entity = &mut self.entities[e.0];
        entity.state.sync(idx, slot.clone());
        entity.slots[idx] = slot;
    }

    pub(crate) fn current_target(&self, e: EntityRef, idx: usize) -> Option<EntityRef> {
        self.slot(e, idx).as_target().flatten()
    }

    /// Stored target of an owning reference: `None` when unknown.
    pub(crate) fn persisted_target(&self, e: EntityRef, idx: usize) -> Option<Option<EntityRef>> {
        self.state(e)
            .persisted_value(idx)
            .and_then(Slot::as_target)
    }

    /// Stored members of a collection; empty when never stored.
    pub(crate) fn persisted_links(&self, e: EntityRef, idx: usize) -> Vec<EntityRef> {
        self.state(e)
            .persisted_value(idx)
            .and_then(Slot::as_links)
            .map(<[EntityRef]>::to_vec)
            .unwrap_or_default()
    }

    /// Add `other` to a collection's current and stored members, where known.
    pub(crate) fn sync_link_add(&mut self, e: EntityRef, idx: usize, other: EntityRef) {
        let entity = &mut self.entities[e.0];
        if let Slot::Links(Some(links)) = &mut entity.slots[idx] {
            if !links.contains(&other) {
                links.push(other);
            }
            let mut stored = entity
                .state
                .persisted_value(idx)
                .and_then(Slot::as_links)
                .map(<[EntityRef]>::to_vec)
                .unwrap_or_default();
            if !stored.contains(&other) {
                stored.push(other);
            }
            let current = entity.slots[idx].clone();
            entity.state.sync(idx, Slot::Links(Some(stored)));
            entity.state.field_set(idx, &current);
        }
    }

    /// Remove `other` from a collection's current and stored members.
    pub(crate) fn sync_link_remove(&mut self, e: EntityRef, idx: usize, other: EntityRef) {
        let entity = &mut self.entities[e.0];
        if let Slot::Links(Some(links)) = &mut entity.slots[idx] {
            links.retain(|l| *l != other);
        }
        if let Some(Slot::Links(Some(stored))) = entity.state.persisted_value(idx) {
            let stored: Vec<EntityRef> = stored.iter().copied().filter(|l| *l != other).collect();
            let current = entity.slots[idx].clone();
            entity.state.sync(idx, Slot::Links(Some(stored)));
            entity.state.field_set(idx, &current);
        }
    }

    /// Identity of the instance as currently held in memory.
    pub(crate) fn identity_key(&self, e: EntityRef) -> Option<ValueKey> {
        let meta = self.meta(e);
        if meta.identity().is_empty() {
            return None;
        }
        let values = meta
            .identity()
            .iter()
            .map(|&idx| self.slot(e, idx).as_value().cloned().unwrap_or(Value::Null))
            .collect();
        let key = ValueKey::new(values);
        (!key.has_null()).then_some(key)
    }

    /// The single identity value, or a `MissingIdentity` error.
    pub(crate) fn identity_value(&self, e: EntityRef) -> Result<Value> {
        self.id(e).cloned().ok_or_else(|| {
            Error::invalid_state(
                InvalidStateErrorKind::MissingIdentity,
                format!("{} {} has no identity value", self.type_name(e), e),
            )
        })
    }

    /// Value to write for a stored property.
    pub(crate) fn column_value(&self, e: EntityRef, idx: usize) -> Result<Value> {
        match self.slot(e, idx) {
            Slot::Value(v) => Ok(v.clone()),
            Slot::Ref(Some(target)) => self.identity_value(*target),
            Slot::Ref(None) => Ok(Value::Null),
            Slot::Links(_) => Err(wrong_kind(self.meta(e), idx, "a stored property")),
        }
    }

    /// Last stored value of a stored property.
    pub(crate) fn persisted_column_value(&self, e: EntityRef, idx: usize) -> Result<Value> {
        match self.state(e).persisted_value(idx) {
            Some(Slot::Value(v)) => Ok(v.clone()),
            Some(Slot::Ref(Some(target))) => self.identity_value(*target),
            Some(Slot::Ref(None)) => Ok(Value::Null),
            _ => Err(Error::invalid_state(
                InvalidStateErrorKind::MissingIdentity,
                format!(
                    "stored value of {}.{} for {} is unknown",
                    self.type_name(e),
                    self.meta(e).property(idx).name,
                    e
                ),
            )),
        }
    }

    /// Snapshot to record after a successful write, and whether it is complete.
    pub(crate) fn save_snapshot(&self, e: EntityRef) -> (Vec<(usize, Slot)>, bool) {
        let state = self.state(e);
        let complete = state.is_loaded() || !state.is_persisted();
        let snapshot = self.entities[e.0]
            .slots
            .iter()
            .enumerate()
            .filter(|(idx, slot)| match slot {
                Slot::Links(links) => links.is_some(),
                Slot::Value(_) | Slot::Ref(_) => complete || state.is_modified(*idx),
            })
            .map(|(idx, slot)| (idx, slot.clone()))
            .collect();
        (snapshot, complete)
    }

    /// All instances of a type.
    pub(crate) fn instances_of(&self, ty: EntityType) -> Vec<EntityRef> {
        self.entities
            .iter()
            .enumerate()
            .filter(|(_, entity)| entity.ty == ty)
            .map(|(i, _)| EntityRef(i))
            .collect()
    }

    // ------------------------------------------------------------------
    // Identity index
    // ------------------------------------------------------------------

    fn push(&mut self, ty: EntityType, state: EntityState, collections_loaded: bool) -> EntityRef {
        let meta = self.registry.entity(ty);
        let slots = meta
            .indices()
            .map(|idx| match meta.link(idx) {
                Link::Column => Slot::Value(Value::Null),
                Link::Owning { .. } => Slot::Ref(None),
                Link::Inverse { .. } | Link::Association { .. } => {
                    Slot::Links(collections_loaded.then(Vec::new))
                }
            })
            .collect();
        self.entities.push(Entity { ty, slots, state });
        EntityRef(self.entities.len() - 1)
    }

    /// The instance for `key`, creating a stub if the row is not known yet.
    pub(crate) fn reference_key(&mut self, ty: EntityType, key: ValueKey) -> EntityRef {
        if let Some(&e) = self.identities.get(&(ty, key.clone())) {
            return e;
        }
        let identity: Vec<usize> = self.registry.entity(ty).identity().to_vec();
        let snapshot: Vec<(usize, Slot)> = identity
            .iter()
            .zip(key.values())
            .map(|(&idx, v)| (idx, Slot::Value(v.clone())))
            .collect();
        let e = self.push(ty, EntityState::stub(snapshot.clone()), false);
        for (idx, slot) in snapshot {
            self.entities[e.0].slots[idx] = slot;
        }
        self.identities.insert((ty, key), e);
        e
    }

    /// Record the instance under its current identity.
    pub(crate) fn register(&mut self, e: EntityRef) {
        let ty = self.entity_type(e);
        if self.meta(e).is_join() {
            if let Some(key) = self.join_key_of(e) {
                self.joins.insert(key, e);
            }
        } else if let Some(key) = self.identity_key(e) {
            self.identities.insert((ty, key), e);
        }
    }

    /// Drop the instance from the identity index.
    pub(crate) fn forget(&mut self, e: EntityRef) {
        let ty = self.entity_type(e);
        self.identities.retain(|(t, _), handle| !(*t == ty && *handle == e));
        self.joins.retain(|_, handle| *handle != e);
    }

    /// The row is gone: reset the state, drop it from the identity index and
    /// clear a database-generated identity.
    pub(crate) fn mark_deleted(&mut self, e: EntityRef) {
        self.forget(e);
        let generated = self.meta(e).generated_identity();
        let entity = &mut self.entities[e.0];
        entity.state.deleted();
        if let Some(idx) = generated {
            entity.slots[idx] = Slot::Value(Value::Null);
        }
    }

    fn join_key_of(&self, e: EntityRef) -> Option<(EntityType, EntityRef, EntityRef)> {
        let meta = self.meta(e);
        let mut refs = meta.stored().filter(|&idx| meta.owning(idx).is_some());
        let (first, second) = (refs.next()?, refs.next()?);
        Some((
            meta.ty(),
            self.current_target(e, first)?,
            self.current_target(e, second)?,
        ))
    }

    /// Join record linking `e` and `x` through the association `assoc` on `e`.
    pub(crate) fn join_between(&self, e: EntityRef, assoc: usize, x: EntityRef) -> Option<EntityRef> {
        let Link::Association {
            join,
            join_key,
            other_key,
            ..
        } = self.meta(e).link(assoc)
        else {
            return None;
        };
        let key = if join_key < other_key {
            (join, e, x)
        } else {
            (join, x, e)
        };
        self.joins.get(&key).copied()
    }

    /// Create a join record for `e` and `x`.
    ///
    /// A transient record is new; a persisted one stands for an existing row
    /// known only through the association and is created fully loaded.
    pub(crate) fn new_join(&mut self, e: EntityRef, assoc: usize, x: EntityRef, persisted: bool) -> Option<EntityRef> {
        let Link::Association {
            join,
            join_key,
            other_key,
            ..
        } = self.meta(e).link(assoc)
        else {
            return None;
        };
        let j = self.push(join, EntityState::transient(), true);
        self.entities[j.0].slots[join_key] = Slot::Ref(Some(e));
        self.entities[j.0].slots[other_key] = Slot::Ref(Some(x));
        if persisted {
            let snapshot = vec![
                (join_key, Slot::Ref(Some(e))),
                (other_key, Slot::Ref(Some(x))),
            ];
            self.entities[j.0].state.loaded(snapshot);
        } else {
            self.entities[j.0].state.field_set(join_key, &Slot::Ref(Some(e)));
            self.entities[j.0].state.field_set(other_key, &Slot::Ref(Some(x)));
        }
        self.register(j);
        Some(j)
    }

    /// Merge a row read from storage into the graph.
    ///
    /// Local modifications survive; everything else takes the stored value.
    /// A row seen for the first time joins any loaded collection of the
    /// entities it references.
    pub(crate) fn materialize(&mut self, ty: EntityType, row: &Row) -> EntityRef {
        let registry = Arc::clone(&self.registry);
        let meta = registry.entity(ty);

        let mut stored = Vec::new();
        for idx in meta.stored() {
            let Some(value) = meta.column(idx).and_then(|c| row.get_by_name(c)) else {
                continue;
            };
            let slot = match meta.link(idx) {
                Link::Owning { target, .. } => {
                    if value.is_null() {
                        Slot::Ref(None)
                    } else {
                        Slot::Ref(Some(self.reference_key(target, ValueKey::single(value.clone()))))
                    }
                }
                _ => Slot::Value(value.clone()),
            };
            stored.push((idx, slot));
        }

        let slot_of = |idx: usize| stored.iter().find(|(i, _)| *i == idx).map(|(_, s)| s);
        let existing = if meta.is_join() {
            let mut refs = meta.stored().filter(|&idx| meta.owning(idx).is_some());
            match (refs.next(), refs.next()) {
                (Some(a), Some(b)) => match (
                    slot_of(a).and_then(|s| s.as_target()).flatten(),
                    slot_of(b).and_then(|s| s.as_target()).flatten(),
                ) {
                    (Some(ra), Some(rb)) => self.joins.get(&(ty, ra, rb)).copied(),
                    _ => None,
                },
                _ => None,
            }
        } else if meta.identity().is_empty() {
            None
        } else {
            let values: Vec<Value> = meta
                .identity()
                .iter()
                .map(|&idx| {
                    slot_of(idx)
                        .and_then(Slot::as_value)
                        .cloned()
                        .unwrap_or(Value::Null)
                })
                .collect();
            self.identities.get(&(ty, ValueKey::new(values))).copied()
        };

        let (e, fresh) = match existing {
            Some(e) => (e, false),
            None => (self.push(ty, EntityState::transient(), false), true),
        };

        let entity = &mut self.entities[e.0];
        for (idx, slot) in &stored {
            if !entity.state.is_modified(*idx) {
                entity.slots[*idx] = slot.clone();
            }
        }
        entity.state.loaded(stored.iter().cloned());
        for (idx, _) in &stored {
            let current = entity.slots[*idx].clone();
            entity.state.field_set(*idx, &current);
        }

        if fresh {
            self.register(e);
            self.attach(e);
        }
        e
    }

    /// Add a freshly read row to the loaded collections that should contain it.
    fn attach(&mut self, e: EntityRef) {
        let registry = Arc::clone(&self.registry);
        let meta = registry.entity(self.entity_type(e));
        let owning: Vec<usize> = meta.stored().filter(|&idx| meta.owning(idx).is_some()).collect();
        for &idx in &owning {
            let Some(target) = self.current_target(e, idx) else {
                continue;
            };
            match meta.link(idx) {
                Link::Owning {
                    inverse: Some(inverse),
                    ..
                } => self.sync_link_add(target, inverse, e),
                Link::Owning {
                    association: Some(association),
                    ..
                } => {
                    let other = owning
                        .iter()
                        .find(|&&o| o != idx)
                        .and_then(|&o| self.current_target(e, o));
                    if let Some(other) = other {
                        self.sync_link_add(target, association, other);
                    }
                }
                _ => {}
            }
        }
    }
}
