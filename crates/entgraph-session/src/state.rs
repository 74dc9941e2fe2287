//! Per-instance persistence state.
//!
//! Every entity in the graph carries an [`EntityState`]. It outlives any one
//! operation: it records whether the row exists, whether the instance was
//! fully read from storage, the last known stored value of each property, and
//! which properties currently differ from it.

use std::collections::{BTreeSet, HashMap};

use crate::graph::Slot;

/// Handle for a load in flight, shared by everyone waiting on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LoadTicket(u64);

impl LoadTicket {
    pub(crate) const fn new(id: u64) -> Self {
        Self(id)
    }
}

#[derive(Debug, Clone, Default)]
pub struct EntityState {
    persisted: bool,
    loaded: bool,
    persisted_values: HashMap<usize, Slot>,
    modified: BTreeSet<usize>,
    in_flight_load: Option<LoadTicket>,
}

impl EntityState {
    /// State of an instance that has never been stored.
    pub fn transient() -> Self {
        Self::default()
    }

    /// State of a row known only by its identity.
    pub(crate) fn stub(identity: impl IntoIterator<Item = (usize, Slot)>) -> Self {
        Self {
            persisted: true,
            persisted_values: identity.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn is_persisted(&self) -> bool {
        self.persisted
    }

    /// True once every stored property has been read from or written to storage.
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// A persisted row whose properties have not been read yet.
    pub fn is_stub(&self) -> bool {
        self.persisted && !self.loaded
    }

    pub fn is_modified(&self, property: usize) -> bool {
        self.modified.contains(&property)
    }

    pub fn modified(&self) -> &BTreeSet<usize> {
        &self.modified
    }

    pub fn has_modifications(&self) -> bool {
        !self.modified.is_empty()
    }

    /// Last value known to be stored for `property`, if it is known at all.
    pub fn persisted_value(&self, property: usize) -> Option<&Slot> {
        self.persisted_values.get(&property)
    }

    pub fn in_flight_load(&self) -> Option<LoadTicket> {
        self.in_flight_load
    }

    /// Record that `property` now holds `value`.
    ///
    /// A property set back to its stored value is no longer modified.
    pub fn field_set(&mut self, property: usize, value: &Slot) {
        match self.persisted_values.get(&property) {
            Some(stored) if stored.same_as(value) => {
                self.modified.remove(&property);
            }
            _ => {
                self.modified.insert(property);
            }
        }
    }

    /// Join the load in flight, or start one with a ticket from `start`.
    ///
    /// Returns the ticket and whether this call started the load.
    pub fn loading(&mut self, start: impl FnOnce() -> LoadTicket) -> (LoadTicket, bool) {
        if let Some(ticket) = self.in_flight_load {
            return (ticket, false);
        }
        let ticket = start();
        self.in_flight_load = Some(ticket);
        (ticket, true)
    }

    /// Finish a load with the values read from storage.
    ///
    /// The modified set is left alone; the owner re-applies local values.
    pub fn loaded(&mut self, snapshot: impl IntoIterator<Item = (usize, Slot)>) {
        self.persisted_values.extend(snapshot);
        self.persisted = true;
        self.loaded = true;
        self.in_flight_load = None;
    }

    /// Abandon the load in flight without changing anything else.
    pub fn load_failed(&mut self) {
        self.in_flight_load = None;
    }

    /// Record a successful write of `snapshot`.
    ///
    /// `complete` marks every stored property as known (after an INSERT, or
    /// when the instance was already loaded).
    pub fn saved(&mut self, snapshot: impl IntoIterator<Item = (usize, Slot)>, complete: bool) {
        self.persisted_values.extend(snapshot);
        self.modified.clear();
        self.persisted = true;
        self.loaded = self.loaded || complete;
    }

    /// The row is gone: the instance becomes transient again.
    pub fn deleted(&mut self) {
        *self = Self::default();
    }

    /// Set the stored value of `property` without it counting as a change.
    pub(crate) fn sync(&mut self, property: usize, value: Slot) {
        self.persisted_values.insert(property, value);
        self.modified.remove(&property);
    }
}
