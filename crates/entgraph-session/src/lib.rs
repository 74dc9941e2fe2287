//! Operation engine for entgraph.
//!
//! `entgraph-session` is the **write path**. It takes entities held in an
//! [`EntityGraph`] and carries a save or delete through to storage,
//! following relationships the way their metadata says:
//!
//! - **Saves** insert or update every changed entity reachable from the
//!   roots, parents before children.
//! - **Deletes** remove or detach every row that references a deleted one,
//!   loading only what is needed to decide and using bulk statements where
//!   nothing has to be loaded.
//! - **Ordering** is a dependency graph between requests; ready requests are
//!   executed in waves, grouped per entity type and action.
//! - **Optimistic locking** checks the version column on every versioned
//!   update and reports a conflict when the row moved on.
//!
//! # Example
//!
//! ```ignore
//! let mut session = Session::new(registry, MemoryExecutor::new(&registry));
//!
//! let team = session.graph_mut().create("Team")?;
//! session.graph_mut().set(team, "name", "Avengers")?;
//! let hero = session.graph_mut().create("Hero")?;
//! session.graph_mut().set_target(hero, "team", Some(team))?;
//!
//! // Inserts the team, then the hero
//! let report = session.save(&cx, hero).await;
//! ```

mod bulk;
pub mod config;
mod delete;
mod flush;
pub mod graph;
pub mod identity_map;
pub mod lazy;
mod loader;
pub mod operation;
pub mod request;
mod save;
pub mod session;
pub mod state;

pub use config::OperationConfig;
pub use graph::{EntityGraph, EntityRef, Slot};
pub use identity_map::{EntityKey, IdentityCache};
pub use operation::{Operation, OperationReport};
pub use request::{Action, Request, RequestGraph, RequestId};
pub use session::Session;
pub use state::{EntityState, LoadTicket};
