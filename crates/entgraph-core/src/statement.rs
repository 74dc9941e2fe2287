//! Structured statements.
//!
//! The write path never builds SQL text itself. It produces [`Statement`]s
//! and [`Select`]s over tables and columns; an executor either interprets
//! them directly or renders them with [`Statement::to_sql`] (`"quoted"`
//! identifiers, `$n` placeholders).

use std::fmt;

use crate::value::Value;

/// A row predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum Criteria {
    /// Every row.
    All,
    /// `column = value`; a NULL value renders as `IS NULL`.
    Eq(&'static str, Value),
    /// `column IN (values)`; an empty list matches nothing.
    In(&'static str, Vec<Value>),
    /// `column IS NULL`.
    IsNull(&'static str),
    And(Vec<Criteria>),
    Or(Vec<Criteria>),
}

impl Criteria {
    pub fn eq(column: &'static str, value: impl Into<Value>) -> Self {
        Criteria::Eq(column, value.into())
    }

    pub fn in_list(column: &'static str, values: Vec<Value>) -> Self {
        Criteria::In(column, values)
    }

    /// Conjunction, collapsing the single-term case.
    pub fn and(mut terms: Vec<Criteria>) -> Self {
        if terms.len() == 1 {
            terms.remove(0)
        } else {
            Criteria::And(terms)
        }
    }

    /// Disjunction, collapsing the single-term case.
    pub fn or(mut terms: Vec<Criteria>) -> Self {
        if terms.len() == 1 {
            terms.remove(0)
        } else {
            Criteria::Or(terms)
        }
    }

    /// Evaluate against a row, looking columns up by name.
    ///
    /// Comparisons use [`Value::key_eq`], so NULL never equals anything.
    pub fn matches<'a>(&self, lookup: &impl Fn(&str) -> Option<&'a Value>) -> bool {
        match self {
            Criteria::All => true,
            Criteria::Eq(column, value) => {
                if value.is_null() {
                    lookup(column).is_none_or(Value::is_null)
                } else {
                    lookup(column).is_some_and(|v| v.key_eq(value))
                }
            }
            Criteria::In(column, values) => lookup(column)
                .is_some_and(|v| values.iter().any(|candidate| v.key_eq(candidate))),
            Criteria::IsNull(column) => lookup(column).is_none_or(Value::is_null),
            Criteria::And(terms) => terms.iter().all(|t| t.matches(lookup)),
            Criteria::Or(terms) => terms.iter().any(|t| t.matches(lookup)),
        }
    }

    fn render(&self, params: &mut Vec<Value>) -> String {
        match self {
            Criteria::All => "1 = 1".to_string(),
            Criteria::Eq(column, Value::Null) | Criteria::IsNull(column) => {
                format!("{} IS NULL", quote_ident(column))
            }
            Criteria::Eq(column, value) => {
                params.push(value.clone());
                format!("{} = ${}", quote_ident(column), params.len())
            }
            Criteria::In(_, values) if values.is_empty() => "1 = 0".to_string(),
            Criteria::In(column, values) => {
                let placeholders: Vec<String> = values
                    .iter()
                    .map(|v| {
                        params.push(v.clone());
                        format!("${}", params.len())
                    })
                    .collect();
                format!("{} IN ({})", quote_ident(column), placeholders.join(", "))
            }
            Criteria::And(terms) if terms.is_empty() => "1 = 1".to_string(),
            Criteria::Or(terms) if terms.is_empty() => "1 = 0".to_string(),
            Criteria::And(terms) => join_terms(terms, " AND ", params),
            Criteria::Or(terms) => join_terms(terms, " OR ", params),
        }
    }
}

fn join_terms(terms: &[Criteria], separator: &str, params: &mut Vec<Value>) -> String {
    let parts: Vec<String> = terms
        .iter()
        .map(|t| match t {
            Criteria::And(_) | Criteria::Or(_) => format!("({})", t.render(params)),
            _ => t.render(params),
        })
        .collect();
    parts.join(separator)
}

/// Quote an identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn where_clause(filter: &Criteria, params: &mut Vec<Value>) -> String {
    match filter {
        Criteria::All => String::new(),
        other => format!(" WHERE {}", other.render(params)),
    }
}

/// Multi-row INSERT.
#[derive(Debug, Clone, PartialEq)]
pub struct Insert {
    pub table: &'static str,
    pub columns: Vec<&'static str>,
    pub rows: Vec<Vec<Value>>,
    /// Generated column to read back, one key per row.
    pub returning: Option<&'static str>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub table: &'static str,
    pub set: Vec<(&'static str, Value)>,
    pub filter: Criteria,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Delete {
    pub table: &'static str,
    pub filter: Criteria,
}

/// A write statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Insert(Insert),
    Update(Update),
    Delete(Delete),
}

/// Statement category, used for logging and statement accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementKind {
    Insert,
    Update,
    Delete,
    Select,
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatementKind::Insert => "INSERT",
            StatementKind::Update => "UPDATE",
            StatementKind::Delete => "DELETE",
            StatementKind::Select => "SELECT",
        };
        f.write_str(name)
    }
}

impl Statement {
    pub fn kind(&self) -> StatementKind {
        match self {
            Statement::Insert(_) => StatementKind::Insert,
            Statement::Update(_) => StatementKind::Update,
            Statement::Delete(_) => StatementKind::Delete,
        }
    }

    pub fn table(&self) -> &'static str {
        match self {
            Statement::Insert(i) => i.table,
            Statement::Update(u) => u.table,
            Statement::Delete(d) => d.table,
        }
    }

    /// Render as parameterised SQL.
    pub fn to_sql(&self) -> (String, Vec<Value>) {
        let mut params = Vec::new();
        let sql = match self {
            Statement::Insert(insert) => {
                let columns: Vec<String> = insert.columns.iter().map(|c| quote_ident(c)).collect();
                let rows: Vec<String> = insert
                    .rows
                    .iter()
                    .map(|row| {
                        let placeholders: Vec<String> = row
                            .iter()
                            .map(|v| {
                                params.push(v.clone());
                                format!("${}", params.len())
                            })
                            .collect();
                        format!("({})", placeholders.join(", "))
                    })
                    .collect();
                let mut sql = if columns.is_empty() {
                    format!("INSERT INTO {} DEFAULT VALUES", quote_ident(insert.table))
                } else {
                    format!(
                        "INSERT INTO {} ({}) VALUES {}",
                        quote_ident(insert.table),
                        columns.join(", "),
                        rows.join(", ")
                    )
                };
                if let Some(returning) = insert.returning {
                    sql.push_str(&format!(" RETURNING {}", quote_ident(returning)));
                }
                sql
            }
            Statement::Update(update) => {
                let set: Vec<String> = update
                    .set
                    .iter()
                    .map(|(column, value)| {
                        params.push(value.clone());
                        format!("{} = ${}", quote_ident(column), params.len())
                    })
                    .collect();
                let filter = where_clause(&update.filter, &mut params);
                format!(
                    "UPDATE {} SET {}{}",
                    quote_ident(update.table),
                    set.join(", "),
                    filter
                )
            }
            Statement::Delete(delete) => {
                let filter = where_clause(&delete.filter, &mut params);
                format!("DELETE FROM {}{}", quote_ident(delete.table), filter)
            }
        };
        (sql, params)
    }
}

/// A SELECT of named columns from one table.
#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    pub table: &'static str,
    pub columns: Vec<&'static str>,
    pub filter: Criteria,
}

impl Select {
    pub fn to_sql(&self) -> (String, Vec<Value>) {
        let mut params = Vec::new();
        let columns: Vec<String> = self.columns.iter().map(|c| quote_ident(c)).collect();
        let filter = where_clause(&self.filter, &mut params);
        let sql = format!(
            "SELECT {} FROM {}{}",
            columns.join(", "),
            quote_ident(self.table),
            filter
        );
        (sql, params)
    }
}

/// Outcome of one write statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatementResult {
    pub rows_affected: u64,
    /// Generated keys in row order, for inserts with `returning`.
    pub generated_keys: Vec<Value>,
}
