//! The caller-facing session.
//!
//! A [`Session`] owns an entity graph, a statement executor and the
//! operation settings. Each `save*` or `delete*` call runs one
//! [`Operation`] over the handles it is given and reports what it did.

use std::sync::Arc;

use asupersync::{Cx, Outcome};
use entgraph_core::{Criteria, Error, Registry, StatementExecutor, Value};
use futures::stream::{Stream, StreamExt};

use crate::config::OperationConfig;
use crate::graph::{EntityGraph, EntityRef};
use crate::lazy;
use crate::operation::{Operation, OperationReport};

/// Entity graph plus the executor that persists it.
#[derive(Debug)]
pub struct Session<E> {
    graph: EntityGraph,
    executor: E,
    config: OperationConfig,
}

impl<E: StatementExecutor> Session<E> {
    /// Create a session with the default configuration.
    pub fn new(registry: Arc<Registry>, executor: E) -> Self {
        Self::with_config(registry, executor, OperationConfig::default())
    }

    pub fn with_config(registry: Arc<Registry>, executor: E, config: OperationConfig) -> Self {
        Self {
            graph: EntityGraph::new(registry),
            executor,
            config,
        }
    }

    pub fn graph(&self) -> &EntityGraph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut EntityGraph {
        &mut self.graph
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn config(&self) -> &OperationConfig {
        &self.config
    }

    /// Save `e` and everything reachable from it that changed.
    pub async fn save(&mut self, cx: &Cx, e: EntityRef) -> Outcome<OperationReport, Error> {
        self.save_all(cx, [e]).await
    }

    /// Save several entities in one operation.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn save_all(
        &mut self,
        cx: &Cx,
        entities: impl IntoIterator<Item = EntityRef>,
    ) -> Outcome<OperationReport, Error> {
        let mut op = Operation::new(&mut self.graph, &self.executor, self.config);
        for e in entities {
            op.save(e);
        }
        op.execute(cx).await
    }

    /// Save every entity the stream yields, in one operation once it ends.
    pub async fn save_stream<S>(&mut self, cx: &Cx, entities: S) -> Outcome<OperationReport, Error>
    where
        S: Stream<Item = EntityRef>,
    {
        let entities: Vec<EntityRef> = entities.collect().await;
        self.save_all(cx, entities).await
    }

    /// Delete `e` with everything that cannot exist without it.
    pub async fn delete(&mut self, cx: &Cx, e: EntityRef) -> Outcome<OperationReport, Error> {
        self.delete_all(cx, [e]).await
    }

    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn delete_all(
        &mut self,
        cx: &Cx,
        entities: impl IntoIterator<Item = EntityRef>,
    ) -> Outcome<OperationReport, Error> {
        let mut op = Operation::new(&mut self.graph, &self.executor, self.config);
        for e in entities {
            op.delete(e);
        }
        op.execute(cx).await
    }

    pub async fn delete_stream<S>(&mut self, cx: &Cx, entities: S) -> Outcome<OperationReport, Error>
    where
        S: Stream<Item = EntityRef>,
    {
        let entities: Vec<EntityRef> = entities.collect().await;
        self.delete_all(cx, entities).await
    }

    /// Materialise the rows of `type_name` matching `filter`.
    pub async fn fetch(
        &mut self,
        cx: &Cx,
        type_name: &str,
        filter: Criteria,
    ) -> Outcome<Vec<EntityRef>, Error> {
        lazy::fetch(cx, &self.executor, &mut self.graph, type_name, filter).await
    }

    /// The instance of `type_name` with identity `id`, if the row exists.
    pub async fn find(
        &mut self,
        cx: &Cx,
        type_name: &str,
        id: impl Into<Value>,
    ) -> Outcome<Option<EntityRef>, Error> {
        lazy::find(cx, &self.executor, &mut self.graph, type_name, id).await
    }

    /// Load the collection `name` of `e`.
    pub async fn load_relation(
        &mut self,
        cx: &Cx,
        e: EntityRef,
        name: &str,
    ) -> Outcome<Vec<EntityRef>, Error> {
        lazy::load_relation(cx, &self.executor, &mut self.graph, e, name).await
    }
}
