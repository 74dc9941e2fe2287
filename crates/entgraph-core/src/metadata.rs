//! Entity metadata.
//!
//! Each entity type is described once by an [`EntityInfo`]: its table, its
//! ordered properties, how it is identified and which column carries the
//! optimistic-lock version. Relationship properties are plain tagged data
//! ([`PropertyKind`]) so the write path can decide cascades with a `match`
//! instead of looking anything up at runtime.
//!
//! Declarations name their targets by entity name; the
//! [`RegistryBuilder`](crate::RegistryBuilder) resolves and validates them.

/// What happens to a referencing row when the row it points at is deleted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ForeignDeleted {
    /// Delete the referencing row as well.
    #[default]
    Delete,
    /// Keep the referencing row and null its reference column.
    SetNull,
}

/// A stored reference to another entity (a foreign-key column).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwningRef {
    /// Column holding the target's identity value.
    pub column: &'static str,
    /// Name of the referenced entity type.
    pub target: &'static str,
    /// Whether the column may be NULL.
    pub optional: bool,
    /// Deleting this entity deletes the target.
    pub cascade_delete: bool,
    /// Policy applied to this entity when its target is deleted.
    pub on_foreign_deleted: ForeignDeleted,
}

impl OwningRef {
    /// An optional reference with no cascade that deletes this entity with its target.
    pub const fn new(column: &'static str, target: &'static str) -> Self {
        Self {
            column,
            target,
            optional: true,
            cascade_delete: false,
            on_foreign_deleted: ForeignDeleted::Delete,
        }
    }

    /// Set whether the column may be NULL.
    pub const fn optional(mut self, value: bool) -> Self {
        self.optional = value;
        self
    }

    /// Set whether deleting this entity deletes the target.
    pub const fn cascade_delete(mut self, value: bool) -> Self {
        self.cascade_delete = value;
        self
    }

    /// Set the policy applied when the target is deleted.
    pub const fn on_foreign_deleted(mut self, policy: ForeignDeleted) -> Self {
        self.on_foreign_deleted = policy;
        self
    }

    /// True if deleting the target must null this reference instead of deleting the row.
    pub const fn nulls_on_delete(&self) -> bool {
        self.optional && matches!(self.on_foreign_deleted, ForeignDeleted::SetNull)
    }
}

/// The non-stored reverse side of an [`OwningRef`] declared on another type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InverseRef {
    /// Entity type declaring the owning reference.
    pub target: &'static str,
    /// Name of the owning-reference property on `target` that points back here.
    pub join_key: &'static str,
    /// Whether this side may be empty.
    pub optional: bool,
    /// Collection (`true`) or single reference (`false`).
    pub multi: bool,
}

impl InverseRef {
    /// A collection of referencing entities.
    pub const fn many(target: &'static str, join_key: &'static str) -> Self {
        Self {
            target,
            join_key,
            optional: true,
            multi: true,
        }
    }

    /// A single referencing entity.
    pub const fn one(target: &'static str, join_key: &'static str) -> Self {
        Self {
            target,
            join_key,
            optional: true,
            multi: false,
        }
    }

    /// Set whether this side may be empty.
    pub const fn optional(mut self, value: bool) -> Self {
        self.optional = value;
        self
    }
}

/// One side of a many-to-many association, projected through a join entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinAssociation {
    /// Generated join entity type.
    pub join_type: &'static str,
    /// Owning-reference property on the join type that points at this side.
    pub join_key: &'static str,
    /// Owning-reference property on the join type that points at `target`.
    pub other_key: &'static str,
    /// Entity type on the other side.
    pub target: &'static str,
}

/// The kind of a property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyKind {
    /// A plain stored column.
    Column {
        column: &'static str,
        /// Value assigned by the database on insert (omitted from INSERT, read back).
        generated: bool,
    },
    /// A stored reference to another entity.
    Owning(OwningRef),
    /// The reverse side of an owning reference.
    Inverse(InverseRef),
    /// A many-to-many association.
    Association(JoinAssociation),
}

/// A named property of an entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyInfo {
    pub name: &'static str,
    pub kind: PropertyKind,
}

impl PropertyInfo {
    /// A plain column property.
    pub const fn column(name: &'static str, column: &'static str) -> Self {
        Self {
            name,
            kind: PropertyKind::Column {
                column,
                generated: false,
            },
        }
    }

    /// A column whose value the database generates on insert.
    pub const fn generated(name: &'static str, column: &'static str) -> Self {
        Self {
            name,
            kind: PropertyKind::Column {
                column,
                generated: true,
            },
        }
    }

    /// An owning-reference property.
    pub const fn owning(name: &'static str, reference: OwningRef) -> Self {
        Self {
            name,
            kind: PropertyKind::Owning(reference),
        }
    }

    /// An inverse-reference property.
    pub const fn inverse(name: &'static str, reference: InverseRef) -> Self {
        Self {
            name,
            kind: PropertyKind::Inverse(reference),
        }
    }

    /// An association property.
    pub const fn association(name: &'static str, association: JoinAssociation) -> Self {
        Self {
            name,
            kind: PropertyKind::Association(association),
        }
    }

    /// The column this property is stored in, if it is stored.
    pub const fn column_name(&self) -> Option<&'static str> {
        match &self.kind {
            PropertyKind::Column { column, .. } => Some(*column),
            PropertyKind::Owning(r) => Some(r.column),
            PropertyKind::Inverse(_) | PropertyKind::Association(_) => None,
        }
    }

    /// True for columns and owning references.
    pub const fn is_stored(&self) -> bool {
        self.column_name().is_some()
    }

    /// True for columns generated by the database.
    pub const fn is_generated(&self) -> bool {
        matches!(self.kind, PropertyKind::Column { generated: true, .. })
    }

    /// The owning reference, if this property is one.
    pub const fn as_owning(&self) -> Option<&OwningRef> {
        match &self.kind {
            PropertyKind::Owning(r) => Some(r),
            _ => None,
        }
    }
}

/// How rows of an entity type are identified.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Identity {
    /// A single identity column.
    Single(&'static str),
    /// Several columns together.
    Composite(Vec<&'static str>),
    /// No identity; rows are matched on all their stored values.
    #[default]
    None,
}

/// Static description of an entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityInfo {
    pub name: &'static str,
    pub table: &'static str,
    pub properties: Vec<PropertyInfo>,
    pub identity: Identity,
    /// Property holding the optimistic-lock version.
    pub version: Option<&'static str>,
}

impl EntityInfo {
    pub fn new(name: &'static str, table: &'static str) -> Self {
        Self {
            name,
            table,
            properties: Vec::new(),
            identity: Identity::None,
            version: None,
        }
    }

    /// Add a property.
    #[must_use]
    pub fn property(mut self, property: PropertyInfo) -> Self {
        self.properties.push(property);
        self
    }

    /// Add a database-generated identity column named `name`.
    #[must_use]
    pub fn generated_id(self, name: &'static str) -> Self {
        self.property(PropertyInfo::generated(name, name))
            .identity(Identity::Single(name))
    }

    /// Add a client-assigned identity column named `name`.
    #[must_use]
    pub fn assigned_id(self, name: &'static str) -> Self {
        self.property(PropertyInfo::column(name, name))
            .identity(Identity::Single(name))
    }

    /// Add a plain column whose property and column names match.
    #[must_use]
    pub fn column(self, name: &'static str) -> Self {
        self.property(PropertyInfo::column(name, name))
    }

    /// Add an owning reference.
    #[must_use]
    pub fn owning(self, name: &'static str, reference: OwningRef) -> Self {
        self.property(PropertyInfo::owning(name, reference))
    }

    /// Add an inverse reference.
    #[must_use]
    pub fn inverse(self, name: &'static str, reference: InverseRef) -> Self {
        self.property(PropertyInfo::inverse(name, reference))
    }

    /// Set the identity.
    #[must_use]
    pub fn identity(mut self, identity: Identity) -> Self {
        self.identity = identity;
        self
    }

    /// Add a version column named `name` and use it for optimistic locking.
    #[must_use]
    pub fn versioned(mut self, name: &'static str) -> Self {
        self.properties.push(PropertyInfo::column(name, name));
        self.version = Some(name);
        self
    }
}

/// One side of a [`ManyToMany`] declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssociationSide {
    /// Entity type on this side.
    pub entity: &'static str,
    /// Association property generated on `entity`.
    pub property: &'static str,
    /// Join-table column referencing `entity`.
    pub column: &'static str,
}

impl AssociationSide {
    pub const fn new(entity: &'static str, property: &'static str, column: &'static str) -> Self {
        Self {
            entity,
            property,
            column,
        }
    }
}

/// A many-to-many association between two entity types.
///
/// The registry expands it into a join entity type with two owning
/// references and no identity, plus one association property on each side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManyToMany {
    pub join_type: &'static str,
    pub join_table: &'static str,
    pub left: AssociationSide,
    pub right: AssociationSide,
}

impl ManyToMany {
    pub const fn new(
        join_type: &'static str,
        join_table: &'static str,
        left: AssociationSide,
        right: AssociationSide,
    ) -> Self {
        Self {
            join_type,
            join_table,
            left,
            right,
        }
    }

    /// The generated join entity.
    pub fn join_entity(&self) -> EntityInfo {
        EntityInfo::new(self.join_type, self.join_table)
            .owning(
                self.left.column,
                OwningRef::new(self.left.column, self.left.entity).optional(false),
            )
            .owning(
                self.right.column,
                OwningRef::new(self.right.column, self.right.entity).optional(false),
            )
    }

    /// The association property generated on the left entity.
    pub const fn left_property(&self) -> PropertyInfo {
        PropertyInfo::association(
            self.left.property,
            JoinAssociation {
                join_type: self.join_type,
                join_key: self.left.column,
                other_key: self.right.column,
                target: self.right.entity,
            },
        )
    }

    /// The association property generated on the right entity.
    pub const fn right_property(&self) -> PropertyInfo {
        PropertyInfo::association(
            self.right.property,
            JoinAssociation {
                join_type: self.join_type,
                join_key: self.right.column,
                other_key: self.left.column,
                target: self.left.entity,
            },
        )
    }
}
