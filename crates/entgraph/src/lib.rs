//! entgraph - persist entity graphs to relational storage.
//!
//! entgraph takes a graph of entities held in memory and writes it to a
//! database as one operation:
//!
//! - Saves cascade along owning, inverse and many-to-many relationships
//! - Deletes cascade or null referencing rows according to their metadata
//! - Statements are ordered by a dependency graph and batched per type
//! - Bulk `UPDATE`/`DELETE ... IN (...)` statements replace loading where possible
//! - Versioned entities are checked with optimistic locking
//!
//! # Quick Start
//!
//! ```ignore
//! use entgraph::prelude::*;
//!
//! let registry = Arc::new(
//!     Registry::builder()
//!         .entity(
//!             EntityInfo::new("Team", "teams")
//!                 .generated_id("id")
//!                 .column("name")
//!                 .inverse("heroes", InverseRef::many("Hero", "team")),
//!         )
//!         .entity(
//!             EntityInfo::new("Hero", "heroes")
//!                 .generated_id("id")
//!                 .column("name")
//!                 .owning("team", OwningRef::new("team_id", "Team")),
//!         )
//!         .build()?,
//! );
//!
//! let mut session = Session::new(Arc::clone(&registry), MemoryExecutor::new(&registry));
//! let team = session.graph_mut().create("Team")?;
//! let hero = session.graph_mut().create("Hero")?;
//! session.graph_mut().add_link(team, "heroes", hero)?;
//!
//! // INSERT the team, then the hero with its team_id
//! let report = session.save(&cx, team).await;
//!
//! // DELETE the hero, then the team
//! let report = session.delete(&cx, team).await;
//! ```

pub use entgraph_core::{
    AssociationSide, ConflictError, Connection, Criteria, Cx, EntityInfo, EntityMeta, EntityType,
    Error, ForeignDeleted, Identity, InverseRef, InvalidStateErrorKind, LoggedStatement,
    ManyToMany, MemoryExecutor, ModelingErrorKind, Outcome, OwningRef, PropertyInfo, Registry,
    Result, Row, SqlExecutor, Statement, StatementExecutor, StatementKind, StatementResult, Value,
};
pub use entgraph_session::{
    Action, EntityGraph, EntityRef, EntityState, Operation, OperationConfig, OperationReport,
    Session, lazy,
};

/// Re-exports for `use entgraph::prelude::*`.
pub mod prelude {
    pub use crate::{
        Criteria, Cx, EntityGraph, EntityInfo, EntityRef, Error, ForeignDeleted, InverseRef,
        ManyToMany, AssociationSide, MemoryExecutor, OperationConfig, OperationReport, Outcome,
        OwningRef, Registry, Result, Session, StatementExecutor, Value,
    };
    pub use std::sync::Arc;
}
