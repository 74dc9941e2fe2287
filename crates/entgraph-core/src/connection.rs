//! Storage seams.
//!
//! - [`StatementExecutor`] is what the write path talks to: it executes
//!   structured [`Statement`]s and [`Select`]s.
//! - [`Connection`] is the narrower driver-level interface (SQL text plus
//!   parameters). [`SqlExecutor`] adapts any connection into an executor by
//!   rendering statements.
//!
//! All operations integrate with asupersync's structured concurrency via `Cx`
//! for cancellation.

use asupersync::{Cx, Outcome};

use crate::error::Error;
use crate::row::Row;
use crate::statement::{Insert, Select, Statement, StatementResult};
use crate::value::Value;

/// Executes structured statements against a relational backend.
pub trait StatementExecutor: Send + Sync {
    /// Execute an INSERT, UPDATE or DELETE.
    ///
    /// Inserts with `returning` report one generated key per row, in row order.
    fn execute(
        &self,
        cx: &Cx,
        statement: &Statement,
    ) -> impl Future<Output = Outcome<StatementResult, Error>> + Send;

    /// Load all rows matching a select.
    fn select(
        &self,
        cx: &Cx,
        select: &Select,
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send;
}

/// A driver-level database connection.
pub trait Connection: Send + Sync {
    /// Execute a query and return all rows.
    fn query(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send;

    /// Execute a statement (INSERT, UPDATE, DELETE) and return rows affected.
    fn execute(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send;

    /// Execute a single-row INSERT and return the generated id.
    fn insert(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<i64, Error>> + Send;
}

/// Runs structured statements over a SQL [`Connection`].
#[derive(Debug, Clone)]
pub struct SqlExecutor<C> {
    conn: C,
}

impl<C: Connection> SqlExecutor<C> {
    pub fn new(conn: C) -> Self {
        Self { conn }
    }

    pub fn connection(&self) -> &C {
        &self.conn
    }

    pub fn into_inner(self) -> C {
        self.conn
    }

    async fn insert_returning(
        &self,
        cx: &Cx,
        insert: &Insert,
    ) -> Outcome<StatementResult, Error> {
        let mut result = StatementResult::default();
        for row in &insert.rows {
            let single = Statement::Insert(Insert {
                table: insert.table,
                columns: insert.columns.clone(),
                rows: vec![row.clone()],
                returning: insert.returning,
            });
            let (sql, params) = single.to_sql();
            tracing::trace!(sql = %sql, "Executing insert with generated key");
            match self.conn.insert(cx, &sql, &params).await {
                Outcome::Ok(id) => {
                    result.rows_affected += 1;
                    result.generated_keys.push(Value::BigInt(id));
                }
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        Outcome::Ok(result)
    }
}

impl<C: Connection> StatementExecutor for SqlExecutor<C> {
    async fn execute(&self, cx: &Cx, statement: &Statement) -> Outcome<StatementResult, Error> {
        if let Statement::Insert(insert) = statement {
            if insert.returning.is_some() {
                return self.insert_returning(cx, insert).await;
            }
        }

        let (sql, params) = statement.to_sql();
        tracing::trace!(kind = %statement.kind(), sql = %sql, "Executing statement");
        match self.conn.execute(cx, &sql, &params).await {
            Outcome::Ok(rows_affected) => Outcome::Ok(StatementResult {
                rows_affected,
                generated_keys: Vec::new(),
            }),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    async fn select(&self, cx: &Cx, select: &Select) -> Outcome<Vec<Row>, Error> {
        let (sql, params) = select.to_sql();
        tracing::trace!(sql = %sql, "Executing select");
        self.conn.query(cx, &sql, &params).await
    }
}
