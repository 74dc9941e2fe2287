//! Core types for entgraph.
//!
//! This crate provides the foundations the write path is built on:
//!
//! - `Value`, `ValueKey` and `Row` for data moving to and from storage
//! - `EntityInfo` metadata and the validated `Registry`
//! - Structured `Statement`s and their SQL rendering
//! - The `StatementExecutor` seam, a SQL `Connection` adapter and an
//!   in-memory executor
//! - `Outcome` re-export from asupersync for cancel-correct operations
//! - `Cx` context for structured concurrency

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod connection;
pub mod error;
pub mod memory;
pub mod metadata;
pub mod registry;
pub mod row;
pub mod statement;
pub mod value;

pub use connection::{Connection, SqlExecutor, StatementExecutor};
pub use error::{
    ConflictError, ConnectionError, ConnectionErrorKind, Error, InvalidStateError,
    InvalidStateErrorKind, ModelingError, ModelingErrorKind, QueryError, QueryErrorKind, Result,
};
pub use memory::{LoggedStatement, MemoryExecutor};
pub use metadata::{
    AssociationSide, EntityInfo, ForeignDeleted, Identity, InverseRef, JoinAssociation,
    ManyToMany, OwningRef, PropertyInfo, PropertyKind,
};
pub use registry::{EntityMeta, EntityType, IncomingRef, Link, Registry, RegistryBuilder};
pub use row::{ColumnInfo, Row};
pub use statement::{
    Criteria, Delete, Insert, Select, Statement, StatementKind, StatementResult, Update,
};
pub use value::{Value, ValueKey};
