//! The metadata registry.
//!
//! A [`Registry`] is built once from [`EntityInfo`] declarations, validated,
//! and then shared immutably (`Arc<Registry>`). Building resolves every
//! relationship into index-based [`Link`]s and precomputes, per type, the
//! owning references pointing at it from elsewhere.

use std::collections::HashMap;

use crate::error::{Error, ModelingErrorKind, Result};
use crate::metadata::{EntityInfo, Identity, ManyToMany, OwningRef, PropertyInfo, PropertyKind};

/// Handle of a registered entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityType(usize);

impl EntityType {
    /// Position of this type in the registry.
    pub const fn index(self) -> usize {
        self.0
    }
}

/// A property's relationship, resolved to registry handles and property indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Link {
    /// Plain column.
    Column,
    /// Stored reference to `target`.
    Owning {
        target: EntityType,
        /// Inverse property on `target` mirroring this reference.
        inverse: Option<usize>,
        /// Association property on `target` projecting through this join reference.
        association: Option<usize>,
    },
    /// Reverse side of the owning reference `owning` declared on `target`.
    Inverse { target: EntityType, owning: usize },
    /// Many-to-many through `join`.
    Association {
        join: EntityType,
        /// Owning property on `join` pointing at this side.
        join_key: usize,
        /// Owning property on `join` pointing at `target`.
        other_key: usize,
        target: EntityType,
        /// Association property on `target` for the same join type.
        mirror: Option<usize>,
    },
}

/// An owning reference declared on another type that points at this one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncomingRef {
    pub source: EntityType,
    pub property: usize,
    /// This type declares an inverse or association property for the reference.
    pub tracked: bool,
}

/// A registered entity type.
#[derive(Debug, Clone)]
pub struct EntityMeta {
    ty: EntityType,
    info: EntityInfo,
    by_name: HashMap<&'static str, usize>,
    links: Vec<Link>,
    identity: Vec<usize>,
    version: Option<usize>,
    incoming: Vec<IncomingRef>,
    join: bool,
}

impl EntityMeta {
    pub fn ty(&self) -> EntityType {
        self.ty
    }

    pub fn name(&self) -> &'static str {
        self.info.name
    }

    pub fn table(&self) -> &'static str {
        self.info.table
    }

    pub fn info(&self) -> &EntityInfo {
        &self.info
    }

    pub fn properties(&self) -> &[PropertyInfo] {
        &self.info.properties
    }

    /// Property by index. Indices come from this registry and are always valid.
    pub fn property(&self, index: usize) -> &PropertyInfo {
        &self.info.properties[index]
    }

    pub fn property_index(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    /// Property index by name, or an `UnknownProperty` modeling error.
    pub fn require_property(&self, name: &str) -> Result<usize> {
        self.property_index(name).ok_or_else(|| {
            Error::modeling(
                ModelingErrorKind::UnknownProperty,
                format!("{} has no property '{}'", self.info.name, name),
            )
        })
    }

    pub fn link(&self, index: usize) -> Link {
        self.links[index]
    }

    /// Owning reference declared by the property, if it is one.
    pub fn owning(&self, index: usize) -> Option<&OwningRef> {
        self.property(index).as_owning()
    }

    /// Column of a stored property.
    pub fn column(&self, index: usize) -> Option<&'static str> {
        self.property(index).column_name()
    }

    /// Identity property indices, empty when the type has no identity.
    pub fn identity(&self) -> &[usize] {
        &self.identity
    }

    /// The identity property when the identity is a single column.
    pub fn single_identity(&self) -> Option<usize> {
        match self.identity.as_slice() {
            [single] => Some(*single),
            _ => None,
        }
    }

    /// The identity property when it is a single database-generated column.
    pub fn generated_identity(&self) -> Option<usize> {
        self.single_identity()
            .filter(|&idx| self.property(idx).is_generated())
    }

    pub fn version(&self) -> Option<usize> {
        self.version
    }

    /// Owning references on other types pointing at this one.
    pub fn incoming(&self) -> &[IncomingRef] {
        &self.incoming
    }

    /// True for join types generated from a many-to-many declaration.
    pub fn is_join(&self) -> bool {
        self.join
    }

    /// Indices of stored properties (columns and owning references), in order.
    pub fn stored(&self) -> impl Iterator<Item = usize> + '_ {
        self.info
            .properties
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_stored())
            .map(|(i, _)| i)
    }

    /// Indices of all properties.
    pub fn indices(&self) -> std::ops::Range<usize> {
        0..self.info.properties.len()
    }
}

/// Validated, immutable set of entity types.
#[derive(Debug, Clone)]
pub struct Registry {
    types: Vec<EntityMeta>,
    by_name: HashMap<&'static str, EntityType>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn get(&self, name: &str) -> Option<&EntityMeta> {
        self.by_name.get(name).map(|ty| &self.types[ty.0])
    }

    /// Entity type by name, or an `UnknownEntity` modeling error.
    pub fn resolve(&self, name: &str) -> Result<EntityType> {
        self.by_name.get(name).copied().ok_or_else(|| {
            Error::modeling(
                ModelingErrorKind::UnknownEntity,
                format!("entity type '{}' is not registered", name),
            )
        })
    }

    /// Metadata for a type handle issued by this registry.
    pub fn entity(&self, ty: EntityType) -> &EntityMeta {
        &self.types[ty.0]
    }

    pub fn types(&self) -> impl Iterator<Item = &EntityMeta> {
        self.types.iter()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Can rows of `source` referencing a deleted row through `property` be
    /// removed with one `DELETE ... WHERE column IN (...)` without loading them?
    ///
    /// Only the immediate foreign type is inspected: it must not declare any
    /// inverse or association property, nothing may reference it, and its other
    /// owning references must neither cascade nor be mirrored on their target.
    pub fn fast_delete_via(&self, source: EntityType, property: usize) -> bool {
        let meta = self.entity(source);
        if !meta.incoming.is_empty() {
            return false;
        }
        meta.indices().all(|idx| match meta.link(idx) {
            Link::Column => true,
            Link::Inverse { .. } | Link::Association { .. } => false,
            Link::Owning {
                inverse,
                association,
                ..
            } => {
                idx == property
                    || (inverse.is_none()
                        && association.is_none()
                        && !meta.owning(idx).is_some_and(|r| r.cascade_delete))
            }
        })
    }
}

/// Collects declarations and validates them into a [`Registry`].
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    entities: Vec<EntityInfo>,
    associations: Vec<ManyToMany>,
}

impl RegistryBuilder {
    /// Register an entity type.
    #[must_use]
    pub fn entity(mut self, info: EntityInfo) -> Self {
        self.entities.push(info);
        self
    }

    /// Register a many-to-many association; the join type and both
    /// association properties are generated at build time.
    #[must_use]
    pub fn many_to_many(mut self, association: ManyToMany) -> Self {
        self.associations.push(association);
        self
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub fn build(self) -> Result<Registry> {
        let mut entities = self.entities;

        for m2m in &self.associations {
            for (side, property) in [
                (m2m.left, m2m.left_property()),
                (m2m.right, m2m.right_property()),
            ] {
                let info = entities
                    .iter_mut()
                    .find(|e| e.name == side.entity)
                    .ok_or_else(|| unknown_entity(side.entity, m2m.join_type))?;
                info.properties.push(property);
            }
            entities.push(m2m.join_entity());
        }

        let mut by_name = HashMap::new();
        for (i, info) in entities.iter().enumerate() {
            if by_name.insert(info.name, EntityType(i)).is_some() {
                return Err(Error::modeling(
                    ModelingErrorKind::InvalidRelationship,
                    format!("entity type '{}' is registered twice", info.name),
                ));
            }
        }
        let joins: Vec<&'static str> = self.associations.iter().map(|m| m.join_type).collect();

        let mut types = Vec::with_capacity(entities.len());
        for (i, info) in entities.into_iter().enumerate() {
            let join = joins.contains(&info.name);
            types.push(index_entity(EntityType(i), info, join)?);
        }

        // Resolve targets and relationship keys.
        for i in 0..types.len() {
            let mut links = Vec::with_capacity(types[i].info.properties.len());
            for property in &types[i].info.properties {
                links.push(resolve_link(&types, &by_name, &types[i], property)?);
            }
            types[i].links = links;
        }

        // Mirror inverse and association properties onto the owning side.
        for i in 0..types.len() {
            for idx in types[i].indices() {
                let link = types[i].links[idx];
                match link {
                    Link::Inverse { target, owning } => {
                        if let Link::Owning { inverse, .. } = &mut types[target.0].links[owning] {
                            *inverse = Some(idx);
                        }
                    }
                    Link::Association { join, join_key, .. } => {
                        if let Link::Owning { association, .. } = &mut types[join.0].links[join_key]
                        {
                            *association = Some(idx);
                        }
                    }
                    Link::Column | Link::Owning { .. } => {}
                }
            }
        }

        for i in 0..types.len() {
            for idx in types[i].indices() {
                let link = types[i].links[idx];
                if let Link::Owning {
                    target,
                    inverse,
                    association,
                } = link
                {
                    types[target.0].incoming.push(IncomingRef {
                        source: EntityType(i),
                        property: idx,
                        tracked: inverse.is_some() || association.is_some(),
                    });
                }
            }
        }

        tracing::debug!(types = types.len(), "Entity registry built");
        Ok(Registry { types, by_name })
    }
}

fn unknown_entity(name: &str, referenced_from: &str) -> Error {
    Error::modeling(
        ModelingErrorKind::UnknownEntity,
        format!("'{}' references unregistered entity type '{}'", referenced_from, name),
    )
}

fn invalid(message: String) -> Error {
    Error::modeling(ModelingErrorKind::InvalidRelationship, message)
}

fn index_entity(ty: EntityType, info: EntityInfo, join: bool) -> Result<EntityMeta> {
    let mut by_name = HashMap::new();
    for (i, property) in info.properties.iter().enumerate() {
        if by_name.insert(property.name, i).is_some() {
            return Err(invalid(format!(
                "{} declares property '{}' twice",
                info.name, property.name
            )));
        }
    }

    let column_index = |name: &str| -> Result<usize> {
        let idx = by_name.get(name).copied().ok_or_else(|| {
            Error::modeling(
                ModelingErrorKind::UnknownProperty,
                format!("{} has no property '{}'", info.name, name),
            )
        })?;
        match info.properties[idx].kind {
            PropertyKind::Column { .. } => Ok(idx),
            _ => Err(invalid(format!(
                "{}.{} must be a plain column to serve as identity or version",
                info.name, name
            ))),
        }
    };

    let identity = match &info.identity {
        Identity::Single(name) => vec![column_index(*name)?],
        Identity::Composite(names) => names
            .iter()
            .map(|name| column_index(*name))
            .collect::<Result<Vec<_>>>()?,
        Identity::None => Vec::new(),
    };
    let version = info.version.map(column_index).transpose()?;

    Ok(EntityMeta {
        ty,
        links: Vec::new(),
        by_name,
        identity,
        version,
        incoming: Vec::new(),
        join,
        info,
    })
}

fn resolve_link(
    types: &[EntityMeta],
    by_name: &HashMap<&'static str, EntityType>,
    owner: &EntityMeta,
    property: &PropertyInfo,
) -> Result<Link> {
    let lookup = |name: &'static str| {
        by_name
            .get(name)
            .copied()
            .ok_or_else(|| unknown_entity(name, owner.info.name))
    };

    match &property.kind {
        PropertyKind::Column { .. } => Ok(Link::Column),
        PropertyKind::Owning(reference) => {
            let target = lookup(reference.target)?;
            if types[target.0].single_identity().is_none() {
                return Err(Error::modeling(
                    ModelingErrorKind::UnsupportedCompositeKey,
                    format!(
                        "{}.{} references {}, which has no single identity column",
                        owner.info.name, property.name, reference.target
                    ),
                ));
            }
            Ok(Link::Owning {
                target,
                inverse: None,
                association: None,
            })
        }
        PropertyKind::Inverse(inverse) => {
            let target = lookup(inverse.target)?;
            let meta = &types[target.0];
            let owning = meta.require_property(inverse.join_key)?;
            match meta.property(owning).as_owning() {
                Some(r) if r.target == owner.info.name => Ok(Link::Inverse { target, owning }),
                _ => Err(invalid(format!(
                    "{}.{} names {}.{}, which is not an owning reference to {}",
                    owner.info.name,
                    property.name,
                    inverse.target,
                    inverse.join_key,
                    owner.info.name
                ))),
            }
        }
        PropertyKind::Association(association) => {
            let join = lookup(association.join_type)?;
            let target = lookup(association.target)?;
            let join_meta = &types[join.0];
            let join_key = join_meta.require_property(association.join_key)?;
            let other_key = join_meta.require_property(association.other_key)?;
            let points_at = |idx: usize, name: &str| {
                join_meta
                    .property(idx)
                    .as_owning()
                    .is_some_and(|r| r.target == name)
            };
            if !points_at(join_key, owner.info.name) || !points_at(other_key, association.target) {
                return Err(invalid(format!(
                    "{}.{} does not match the owning references of {}",
                    owner.info.name, property.name, association.join_type
                )));
            }
            let target_meta = &types[target.0];
            let mirror = target_meta.indices().find(|&idx| {
                matches!(
                    &target_meta.property(idx).kind,
                    PropertyKind::Association(a)
                        if a.join_type == association.join_type
                            && a.join_key == association.other_key
                )
            });
            Ok(Link::Association {
                join,
                join_key,
                other_key,
                target,
                mirror,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{AssociationSide, ForeignDeleted, InverseRef};

    fn registry() -> Registry {
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
            .entity(
                EntityInfo::new("Power", "powers")
                    .generated_id("id")
                    .column("name"),
            )
            .entity(
                EntityInfo::new("Sidekick", "sidekicks")
                    .generated_id("id")
                    .owning("hero", OwningRef::new("hero_id", "Hero")),
            )
            .many_to_many(ManyToMany::new(
                "HeroPower",
                "hero_powers",
                AssociationSide::new("Hero", "powers", "hero_id"),
                AssociationSide::new("Power", "heroes", "power_id"),
            ))
            .build()
            .unwrap()
    }

    #[test]
    fn resolves_inverse_and_incoming() {
        let reg = registry();
        let team = reg.get("Team").unwrap();
        let hero = reg.get("Hero").unwrap();
        let heroes = team.require_property("heroes").unwrap();
        let team_ref = hero.require_property("team").unwrap();

        assert_eq!(
            team.link(heroes),
            Link::Inverse {
                target: hero.ty(),
                owning: team_ref
            }
        );
        assert!(matches!(
            hero.link(team_ref),
            Link::Owning { inverse: Some(i), .. } if i == heroes
        ));
        assert_eq!(team.incoming().len(), 1);
        assert!(team.incoming()[0].tracked);

        // Sidekick.hero is not mirrored on Hero.
        let untracked: Vec<_> = hero.incoming().iter().filter(|r| !r.tracked).collect();
        assert_eq!(untracked.len(), 1);
        assert_eq!(untracked[0].source, reg.resolve("Sidekick").unwrap());
    }

    #[test]
    fn many_to_many_generates_join_type() {
        let reg = registry();
        let join = reg.get("HeroPower").unwrap();
        assert!(join.is_join());
        assert!(join.identity().is_empty());

        let hero = reg.get("Hero").unwrap();
        let power = reg.get("Power").unwrap();
        let powers = hero.require_property("powers").unwrap();
        let heroes = power.require_property("heroes").unwrap();
        match hero.link(powers) {
            Link::Association {
                join: j,
                target,
                mirror,
                ..
            } => {
                assert_eq!(j, join.ty());
                assert_eq!(target, power.ty());
                assert_eq!(mirror, Some(heroes));
            }
            other => panic!("unexpected link {other:?}"),
        }
        assert!(power.incoming().iter().all(|r| r.tracked));
    }

    #[test]
    fn fast_delete_qualification() {
        let reg = registry();
        let sidekick = reg.get("Sidekick").unwrap();
        let hero = reg.get("Hero").unwrap();
        let join = reg.get("HeroPower").unwrap();

        assert!(reg.fast_delete_via(sidekick.ty(), sidekick.require_property("hero").unwrap()));
        // Hero is itself referenced and has an association.
        assert!(!reg.fast_delete_via(hero.ty(), hero.require_property("team").unwrap()));
        // The other join reference is mirrored on Power.
        assert!(!reg.fast_delete_via(join.ty(), join.require_property("hero_id").unwrap()));
    }

    #[test]
    fn rejects_unknown_target() {
        let err = Registry::builder()
            .entity(
                EntityInfo::new("Hero", "heroes")
                    .generated_id("id")
                    .owning("team", OwningRef::new("team_id", "Team")),
            )
            .build()
            .unwrap_err();
        assert_eq!(err.modeling_kind(), Some(ModelingErrorKind::UnknownEntity));
    }

    #[test]
    fn rejects_inverse_without_matching_owner() {
        let err = Registry::builder()
            .entity(
                EntityInfo::new("Team", "teams")
                    .generated_id("id")
                    .inverse("heroes", InverseRef::many("Hero", "name")),
            )
            .entity(EntityInfo::new("Hero", "heroes").generated_id("id").column("name"))
            .build()
            .unwrap_err();
        assert_eq!(
            err.modeling_kind(),
            Some(ModelingErrorKind::InvalidRelationship)
        );
    }

    #[test]
    fn rejects_reference_to_composite_identity() {
        let err = Registry::builder()
            .entity(
                EntityInfo::new("Seat", "seats")
                    .column("row")
                    .column("number")
                    .identity(Identity::Composite(vec!["row", "number"])),
            )
            .entity(
                EntityInfo::new("Ticket", "tickets")
                    .generated_id("id")
                    .owning("seat", OwningRef::new("seat_id", "Seat")),
            )
            .build()
            .unwrap_err();
        assert_eq!(
            err.modeling_kind(),
            Some(ModelingErrorKind::UnsupportedCompositeKey)
        );
    }

    #[test]
    fn rejects_non_column_version() {
        let err = Registry::builder()
            .entity(
                EntityInfo::new("Team", "teams")
                    .generated_id("id")
                    .owning("parent", OwningRef::new("parent_id", "Team"))
                    .identity(Identity::Single("id")),
            )
            .entity({
                let mut info = EntityInfo::new("Hero", "heroes").generated_id("id");
                info.version = Some("missing");
                info
            })
            .build()
            .unwrap_err();
        assert_eq!(err.modeling_kind(), Some(ModelingErrorKind::UnknownProperty));
    }
}
