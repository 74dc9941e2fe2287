//! An in-process [`StatementExecutor`].
//!
//! `MemoryExecutor` keeps one table per registered entity type, assigns
//! generated `BIGINT` keys, and enforces every declared owning reference as a
//! foreign key, so a statement issued in the wrong order fails the same way
//! it would against a real database. Every statement is logged for
//! inspection, and a failure can be injected for the next statement of a
//! given kind on a given table.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use asupersync::{Cx, Outcome};

use crate::connection::StatementExecutor;
use crate::error::{Error, QueryError, QueryErrorKind};
use crate::registry::Registry;
use crate::row::{ColumnInfo, Row};
use crate::statement::{Criteria, Select, Statement, StatementKind, StatementResult};
use crate::value::Value;

/// A statement as the executor received it.
#[derive(Debug, Clone, PartialEq)]
pub struct LoggedStatement {
    pub kind: StatementKind,
    pub table: &'static str,
    pub sql: String,
    pub params: Vec<Value>,
}

#[derive(Debug, Clone)]
struct MemoryTable {
    columns: Vec<&'static str>,
    generated: Option<&'static str>,
    rows: Vec<Vec<Value>>,
    next_id: i64,
}

impl MemoryTable {
    fn position(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| *c == column)
    }

    fn matches(&self, row: &[Value], filter: &Criteria) -> bool {
        let lookup = |name: &str| self.position(name).map(|i| &row[i]);
        filter.matches(&lookup)
    }

    fn contains(&self, column: &str, value: &Value) -> bool {
        self.position(column)
            .is_some_and(|i| self.rows.iter().any(|row| row[i].key_eq(value)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ForeignKey {
    table: &'static str,
    column: &'static str,
    references: &'static str,
    referenced_column: &'static str,
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: HashMap<&'static str, MemoryTable>,
    foreign_keys: Vec<ForeignKey>,
    log: Vec<LoggedStatement>,
    failures: Vec<(StatementKind, &'static str)>,
}

/// In-memory tables behind the [`StatementExecutor`] interface.
#[derive(Debug, Clone, Default)]
pub struct MemoryExecutor {
    state: Arc<Mutex<MemoryState>>,
}

fn query_error(kind: QueryErrorKind, sqlstate: Option<&str>, message: String, sql: &str) -> Error {
    Error::Query(QueryError {
        kind,
        sql: Some(sql.to_string()),
        sqlstate: sqlstate.map(str::to_string),
        message,
        source: None,
    })
}

impl MemoryExecutor {
    /// Create empty tables and foreign keys for every registered entity type.
    pub fn new(registry: &Registry) -> Self {
        let mut state = MemoryState::default();
        for meta in registry.types() {
            let columns = meta.stored().filter_map(|idx| meta.column(idx)).collect();
            let generated = meta
                .generated_identity()
                .and_then(|idx| meta.column(idx));
            state.tables.insert(
                meta.table(),
                MemoryTable {
                    columns,
                    generated,
                    rows: Vec::new(),
                    next_id: 0,
                },
            );
            for idx in meta.stored() {
                let Some(reference) = meta.owning(idx) else {
                    continue;
                };
                let Some(target) = registry.get(reference.target) else {
                    continue;
                };
                let Some(referenced_column) = target.single_identity().and_then(|i| target.column(i))
                else {
                    continue;
                };
                state.foreign_keys.push(ForeignKey {
                    table: meta.table(),
                    column: reference.column,
                    references: target.table(),
                    referenced_column,
                });
            }
        }
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seed a row without logging it or checking foreign keys.
    ///
    /// Returns the row's generated key, or NULL if the table has none.
    pub fn insert_row(&self, table: &'static str, values: &[(&'static str, Value)]) -> Value {
        let mut state = self.lock();
        let Some(t) = state.tables.get_mut(table) else {
            return Value::Null;
        };
        let mut row = vec![Value::Null; t.columns.len()];
        for (column, value) in values {
            if let Some(i) = t.position(column) {
                row[i] = value.clone();
            }
        }
        let key = assign_key(t, &mut row);
        t.rows.push(row);
        key
    }

    /// Overwrite a column on rows matching `filter`, bypassing the log.
    ///
    /// Useful for simulating a concurrent writer.
    pub fn update_rows(&self, table: &'static str, filter: &Criteria, column: &str, value: Value) {
        let mut state = self.lock();
        if let Some(t) = state.tables.get_mut(table) {
            if let Some(i) = t.position(column) {
                let matching: Vec<usize> = (0..t.rows.len())
                    .filter(|&r| t.matches(&t.rows[r], filter))
                    .collect();
                for r in matching {
                    t.rows[r][i] = value.clone();
                }
            }
        }
    }

    /// All rows of a table, in insertion order.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        let state = self.lock();
        let Some(t) = state.tables.get(table) else {
            return Vec::new();
        };
        let columns = Arc::new(ColumnInfo::new(
            t.columns.iter().map(|c| (*c).to_string()).collect(),
        ));
        t.rows
            .iter()
            .map(|row| Row::with_columns(Arc::clone(&columns), row.clone()))
            .collect()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.lock().tables.get(table).map_or(0, |t| t.rows.len())
    }

    /// First row of `table` whose `column` equals `value`.
    pub fn find(&self, table: &str, column: &str, value: &Value) -> Option<Row> {
        self.rows(table)
            .into_iter()
            .find(|row| row.get_by_name(column).is_some_and(|v| v.key_eq(value)))
    }

    /// Every statement executed so far, selects included.
    pub fn statements(&self) -> Vec<LoggedStatement> {
        self.lock().log.clone()
    }

    /// Number of logged statements of `kind` against `table`.
    pub fn count(&self, kind: StatementKind, table: &str) -> usize {
        self.lock()
            .log
            .iter()
            .filter(|s| s.kind == kind && s.table == table)
            .count()
    }

    /// Number of logged statements of `kind` against any table.
    pub fn count_kind(&self, kind: StatementKind) -> usize {
        self.lock().log.iter().filter(|s| s.kind == kind).count()
    }

    pub fn clear_log(&self) {
        self.lock().log.clear();
    }

    /// Fail the next statement of `kind` against `table`.
    pub fn fail_next(&self, kind: StatementKind, table: &'static str) {
        self.lock().failures.push((kind, table));
    }

    fn run(&self, statement: &Statement) -> Result<StatementResult, Error> {
        let (sql, params) = statement.to_sql();
        let mut state = self.lock();
        state.log.push(LoggedStatement {
            kind: statement.kind(),
            table: statement.table(),
            sql: sql.clone(),
            params,
        });
        state.take_failure(statement.kind(), statement.table(), &sql)?;

        match statement {
            Statement::Insert(insert) => {
                let mut result = StatementResult::default();
                for values in &insert.rows {
                    let table = state.table(insert.table, &sql)?;
                    let mut row = vec![Value::Null; table.columns.len()];
                    for (column, value) in insert.columns.iter().zip(values) {
                        let i = table.position(column).ok_or_else(|| {
                            unknown_column(insert.table, column, &sql)
                        })?;
                        row[i] = value.clone();
                    }
                    state.check_references(insert.table, &row, &sql)?;
                    let table = state.table_mut(insert.table, &sql)?;
                    let key = assign_key(table, &mut row);
                    table.rows.push(row);
                    result.rows_affected += 1;
                    if insert.returning.is_some() {
                        result.generated_keys.push(key);
                    }
                }
                Ok(result)
            }
            Statement::Update(update) => {
                let table = state.table(update.table, &sql)?;
                let mut assignments = Vec::with_capacity(update.set.len());
                for (column, value) in &update.set {
                    let i = table
                        .position(column)
                        .ok_or_else(|| unknown_column(update.table, column, &sql))?;
                    assignments.push((i, value.clone()));
                }
                let matching: Vec<usize> = (0..table.rows.len())
                    .filter(|&r| table.matches(&table.rows[r], &update.filter))
                    .collect();

                let mut updated = Vec::with_capacity(matching.len());
                for &r in &matching {
                    let mut row = table.rows[r].clone();
                    for (i, value) in &assignments {
                        row[*i] = value.clone();
                    }
                    updated.push(row);
                }
                for row in &updated {
                    state.check_references(update.table, row, &sql)?;
                }
                let table = state.table_mut(update.table, &sql)?;
                for (r, row) in matching.iter().zip(updated) {
                    table.rows[*r] = row;
                }
                Ok(StatementResult {
                    rows_affected: matching.len() as u64,
                    generated_keys: Vec::new(),
                })
            }
            Statement::Delete(delete) => {
                let table = state.table(delete.table, &sql)?;
                let (removed, kept): (Vec<Vec<Value>>, Vec<Vec<Value>>) = table
                    .rows
                    .iter()
                    .cloned()
                    .partition(|row| table.matches(row, &delete.filter));
                state.check_referenced(delete.table, &removed, &kept, &sql)?;
                let table = state.table_mut(delete.table, &sql)?;
                table.rows = kept;
                Ok(StatementResult {
                    rows_affected: removed.len() as u64,
                    generated_keys: Vec::new(),
                })
            }
        }
    }

    fn run_select(&self, select: &Select) -> Result<Vec<Row>, Error> {
        let (sql, params) = select.to_sql();
        let mut state = self.lock();
        state.log.push(LoggedStatement {
            kind: StatementKind::Select,
            table: select.table,
            sql: sql.clone(),
            params,
        });
        state.take_failure(StatementKind::Select, select.table, &sql)?;

        let table = state.table(select.table, &sql)?;
        let positions = select
            .columns
            .iter()
            .map(|c| table.position(c).ok_or_else(|| unknown_column(select.table, c, &sql)))
            .collect::<Result<Vec<_>, Error>>()?;
        let columns = Arc::new(ColumnInfo::new(
            select.columns.iter().map(|c| (*c).to_string()).collect(),
        ));
        Ok(table
            .rows
            .iter()
            .filter(|row| table.matches(row, &select.filter))
            .map(|row| {
                let values = positions.iter().map(|&i| row[i].clone()).collect();
                Row::with_columns(Arc::clone(&columns), values)
            })
            .collect())
    }
}

fn assign_key(table: &mut MemoryTable, row: &mut [Value]) -> Value {
    let Some(i) = table.generated.and_then(|c| table.position(c)) else {
        return Value::Null;
    };
    match row[i].as_i64() {
        Some(assigned) => table.next_id = table.next_id.max(assigned),
        None => {
            table.next_id += 1;
            row[i] = Value::BigInt(table.next_id);
        }
    }
    row[i].clone()
}

fn unknown_column(table: &str, column: &str, sql: &str) -> Error {
    query_error(
        QueryErrorKind::NotFound,
        Some("42703"),
        format!("column \"{}\" of relation \"{}\" does not exist", column, table),
        sql,
    )
}

impl MemoryState {
    fn table(&self, name: &str, sql: &str) -> Result<&MemoryTable, Error> {
        self.tables.get(name).ok_or_else(|| {
            query_error(
                QueryErrorKind::NotFound,
                Some("42P01"),
                format!("relation \"{}\" does not exist", name),
                sql,
            )
        })
    }

    fn table_mut(&mut self, name: &str, sql: &str) -> Result<&mut MemoryTable, Error> {
        self.tables.get_mut(name).ok_or_else(|| {
            query_error(
                QueryErrorKind::NotFound,
                Some("42P01"),
                format!("relation \"{}\" does not exist", name),
                sql,
            )
        })
    }

    fn take_failure(&mut self, kind: StatementKind, table: &str, sql: &str) -> Result<(), Error> {
        if let Some(pos) = self
            .failures
            .iter()
            .position(|(k, t)| *k == kind && *t == table)
        {
            self.failures.remove(pos);
            return Err(query_error(
                QueryErrorKind::Database,
                None,
                format!("injected {} failure on \"{}\"", kind, table),
                sql,
            ));
        }
        Ok(())
    }

    /// Every non-null reference in `row` must point at an existing row.
    fn check_references(&self, table: &str, row: &[Value], sql: &str) -> Result<(), Error> {
        let Some(t) = self.tables.get(table) else {
            return Ok(());
        };
        for fk in self.foreign_keys.iter().filter(|fk| fk.table == table) {
            let Some(i) = t.position(fk.column) else {
                continue;
            };
            let value = &row[i];
            if value.is_null() {
                continue;
            }
            let exists = self
                .tables
                .get(fk.references)
                .is_some_and(|target| target.contains(fk.referenced_column, value));
            if !exists {
                return Err(query_error(
                    QueryErrorKind::Constraint,
                    Some("23503"),
                    format!(
                        "insert or update on \"{}\" violates foreign key \"{}\": {} is not present in \"{}\"",
                        table, fk.column, value, fk.references
                    ),
                    sql,
                ));
            }
        }
        Ok(())
    }

    /// No remaining row may reference a removed row.
    fn check_referenced(
        &self,
        table: &str,
        removed: &[Vec<Value>],
        kept: &[Vec<Value>],
        sql: &str,
    ) -> Result<(), Error> {
        let Some(t) = self.tables.get(table) else {
            return Ok(());
        };
        for fk in self.foreign_keys.iter().filter(|fk| fk.references == table) {
            let Some(key) = t.position(fk.referenced_column) else {
                continue;
            };
            let Some(referencing) = self.tables.get(fk.table) else {
                continue;
            };
            let Some(column) = referencing.position(fk.column) else {
                continue;
            };
            // A self-referencing table only keeps the rows not deleted here.
            let remaining: &[Vec<Value>] = if fk.table == table {
                kept
            } else {
                &referencing.rows
            };
            for row in removed {
                if remaining.iter().any(|r| r[column].key_eq(&row[key])) {
                    return Err(query_error(
                        QueryErrorKind::Constraint,
                        Some("23503"),
                        format!(
                            "delete on \"{}\" violates foreign key \"{}\" on \"{}\": {} is still referenced",
                            table, fk.column, fk.table, row[key]
                        ),
                        sql,
                    ));
                }
            }
        }
        Ok(())
    }
}

impl StatementExecutor for MemoryExecutor {
    fn execute(
        &self,
        _cx: &Cx,
        statement: &Statement,
    ) -> impl Future<Output = Outcome<StatementResult, Error>> + Send {
        let outcome = match self.run(statement) {
            Ok(result) => {
                tracing::trace!(
                    kind = %statement.kind(),
                    table = statement.table(),
                    rows = result.rows_affected,
                    "Memory statement executed"
                );
                Outcome::Ok(result)
            }
            Err(e) => Outcome::Err(e),
        };
        std::future::ready(outcome)
    }

    fn select(
        &self,
        _cx: &Cx,
        select: &Select,
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let outcome = match self.run_select(select) {
            Ok(rows) => Outcome::Ok(rows),
            Err(e) => Outcome::Err(e),
        };
        std::future::ready(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{EntityInfo, OwningRef};
    use crate::statement::{Delete, Insert, Update};
    use asupersync::runtime::RuntimeBuilder;

    fn registry() -> Registry {
        Registry::builder()
            .entity(EntityInfo::new("Team", "teams").generated_id("id").column("name"))
            .entity(
                EntityInfo::new("Hero", "heroes")
                    .generated_id("id")
                    .column("name")
                    .owning("team", OwningRef::new("team_id", "Team")),
            )
            .build()
            .unwrap()
    }

    fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            Outcome::Err(e) => panic!("unexpected error: {e}"),
            Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
            Outcome::Panicked(p) => panic!("panicked: {p:?}"),
        }
    }

    fn expect_err<T>(outcome: Outcome<T, Error>) -> Error {
        match outcome {
            Outcome::Err(e) => e,
            _ => panic!("expected an error"),
        }
    }

    #[test]
    fn generated_keys_and_foreign_keys() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let exec = MemoryExecutor::new(&registry());

        rt.block_on(async {
            let teams = Statement::Insert(Insert {
                table: "teams",
                columns: vec!["name"],
                rows: vec![vec![Value::from("Avengers")]],
                returning: Some("id"),
            });
            let result = unwrap_outcome(exec.execute(&cx, &teams).await);
            assert_eq!(result.generated_keys, vec![Value::BigInt(1)]);

            let orphan = Statement::Insert(Insert {
                table: "heroes",
                columns: vec!["name", "team_id"],
                rows: vec![vec![Value::from("Thor"), Value::BigInt(99)]],
                returning: Some("id"),
            });
            let err = expect_err(exec.execute(&cx, &orphan).await);
            assert_eq!(err.sqlstate(), Some("23503"));

            let hero = Statement::Insert(Insert {
                table: "heroes",
                columns: vec!["name", "team_id"],
                rows: vec![vec![Value::from("Thor"), Value::BigInt(1)]],
                returning: Some("id"),
            });
            unwrap_outcome(exec.execute(&cx, &hero).await);

            let delete_team = Statement::Delete(Delete {
                table: "teams",
                filter: Criteria::in_list("id", vec![Value::BigInt(1)]),
            });
            let err = expect_err(exec.execute(&cx, &delete_team).await);
            assert_eq!(err.sqlstate(), Some("23503"));
        });

        assert_eq!(exec.row_count("heroes"), 1);
        assert_eq!(exec.count(StatementKind::Insert, "heroes"), 2);
        assert_eq!(exec.count(StatementKind::Delete, "teams"), 1);
    }

    #[test]
    fn update_filters_and_counts() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let exec = MemoryExecutor::new(&registry());
        let team = exec.insert_row("teams", &[("name", Value::from("Avengers"))]);
        exec.insert_row("heroes", &[("name", Value::from("Thor")), ("team_id", team.clone())]);
        exec.insert_row("heroes", &[("name", Value::from("Loki")), ("team_id", team.clone())]);

        rt.block_on(async {
            let stmt = Statement::Update(Update {
                table: "heroes",
                set: vec![("team_id", Value::Null)],
                filter: Criteria::in_list("team_id", vec![team.clone()]),
            });
            let result = unwrap_outcome(exec.execute(&cx, &stmt).await);
            assert_eq!(result.rows_affected, 2);

            let select = Select {
                table: "heroes",
                columns: vec!["id", "team_id"],
                filter: Criteria::IsNull("team_id"),
            };
            let rows = unwrap_outcome(exec.select(&cx, &select).await);
            assert_eq!(rows.len(), 2);
        });

        assert_eq!(exec.count_kind(StatementKind::Select), 1);
    }

    #[test]
    fn injected_failure_fires_once() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let exec = MemoryExecutor::new(&registry());
        exec.fail_next(StatementKind::Insert, "teams");

        let stmt = Statement::Insert(Insert {
            table: "teams",
            columns: vec!["name"],
            rows: vec![vec![Value::from("Avengers")]],
            returning: None,
        });
        rt.block_on(async {
            let err = expect_err(exec.execute(&cx, &stmt).await);
            assert!(err.to_string().contains("injected"));
            unwrap_outcome(exec.execute(&cx, &stmt).await);
        });
        assert_eq!(exec.row_count("teams"), 1);
        assert_eq!(exec.statements().len(), 2);
    }
}
