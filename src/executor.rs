//! Single statement execution against a borrowed connection.

use crate::cursor::ResultCursor;
use crate::error::EngineError;
use crate::value::Value;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};
use std::fmt;
use std::rc::Rc;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Execute,
    Insert,
    Update,
    Query,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Execute => "execute",
            OperationKind::Insert => "insert",
            OperationKind::Update => "update",
            OperationKind::Query => "query",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = ();

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "execute" => Ok(OperationKind::Execute),
            "insert" => Ok(OperationKind::Insert),
            "update" => Ok(OperationKind::Update),
            "query" => Ok(OperationKind::Query),
            _ => Err(()),
        }
    }
}

/// Result of one statement run to completion.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Executed,
    /// Row id of the inserted row, or `None` when nothing was inserted.
    Inserted(Option<i64>),
    Updated(u64),
}

/// Prepare and bind a query, returning the unstepped result.
pub fn query(
    conn: &Rc<Connection>,
    sql: &str,
    values: Option<&[SqlValue]>,
) -> Result<ResultCursor, EngineError> {
    ResultCursor::open(Rc::clone(conn), sql, values)
}

/// Run `sql` with `values` bound positionally, stepping it to completion.
///
/// Any rows the statement yields (a `PRAGMA`, or a query whose result is not
/// wanted) are stepped through and discarded.
pub fn execute(
    conn: &Connection,
    sql: &str,
    values: Option<&[SqlValue]>,
    kind: OperationKind,
) -> Result<Outcome, EngineError> {
    run(conn, sql, values.unwrap_or(&[]), kind).map_err(|err| {
        EngineError::from(err).with_statement(
            sql,
            values.map(|vs| vs.iter().cloned().map(Value::from).collect()),
        )
    })
}

fn run(
    conn: &Connection,
    sql: &str,
    values: &[SqlValue],
    kind: OperationKind,
) -> rusqlite::Result<Outcome> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params_from_iter(values.iter()))?;
    while rows.next()?.is_some() {}
    drop(rows);

    let changes = conn.changes() as u64;
    Ok(match kind {
        OperationKind::Insert if changes == 0 => Outcome::Inserted(None),
        OperationKind::Insert => Outcome::Inserted(Some(conn.last_insert_rowid())),
        OperationKind::Update => Outcome::Updated(changes),
        _ => Outcome::Executed,
    })
}
