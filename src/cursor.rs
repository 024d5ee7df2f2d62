//! Result materialization and cursor paging.
//!
//! A query yields a [`ResultCursor`]: a prepared statement that has been bound
//! but not yet stepped. [`CursorRegistry::materialize`] steps it for the first
//! [`Page`]; when rows remain, the live statement is parked under a freshly
//! minted cursor id until [`CursorRegistry::next`] drains it, the caller
//! closes it, or it sits idle past the reclaim timeout. Rows are read from the
//! engine only as pages ask for them.

use crate::error::{BridgeError, EngineError, Result};
use crate::value::Value;
use ouroboros::self_referencing;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, Rows, Statement};
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::time::{Duration, Instant};

pub type CursorId = i64;

#[self_referencing]
struct StmtRows<'c> {
    stmt: Statement<'c>,
    #[borrows(mut stmt)]
    #[not_covariant]
    rows: Rows<'this>,
}

#[self_referencing]
struct LiveRows {
    conn: Rc<Connection>,
    #[borrows(conn)]
    #[not_covariant]
    inner: StmtRows<'this>,
}

/// Engine-side position within a query result.
///
/// Holds one row of lookahead so a page knows whether anything follows it. A
/// failure met while looking ahead is kept and reported by the next fetch, so
/// rows already stepped are still delivered.
pub struct ResultCursor {
    columns: Vec<String>,
    live: LiveRows,
    pending: Option<std::result::Result<Vec<Value>, EngineError>>,
    sql: String,
    arguments: Option<Vec<Value>>,
}

impl ResultCursor {
    /// Prepare `sql` on `conn` and bind `values`. No row is stepped yet.
    pub fn open(
        conn: Rc<Connection>,
        sql: &str,
        values: Option<&[SqlValue]>,
    ) -> std::result::Result<Self, EngineError> {
        let arguments = values.map(|vs| vs.iter().cloned().map(Value::from).collect::<Vec<_>>());
        let mut columns = Vec::new();
        let live = LiveRows::try_new(
            conn,
            |conn| {
                let stmt = conn.prepare(sql)?;
                columns = stmt.column_names().into_iter().map(String::from).collect();
                StmtRows::try_new(stmt, |stmt| {
                    stmt.query(params_from_iter(values.unwrap_or(&[]).iter()))
                })
            },
        )
        .map_err(|err| EngineError::from(err).with_statement(sql, arguments.clone()))?;

        Ok(Self {
            columns,
            live,
            pending: None,
            sql: sql.to_string(),
            arguments,
        })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Step up to `limit` rows, or every remaining row when `limit` is `None`.
    /// The flag is true while rows may remain.
    pub fn fetch(
        &mut self,
        limit: Option<usize>,
    ) -> std::result::Result<(Vec<Vec<Value>>, bool), EngineError> {
        let mut rows = Vec::new();
        match self.pending.take() {
            Some(Ok(row)) => rows.push(row),
            Some(Err(err)) => return Err(err),
            None => {}
        }

        while limit.map_or(true, |limit| rows.len() < limit) {
            match self.step() {
                Ok(Some(row)) => rows.push(row),
                Ok(None) => return Ok((rows, false)),
                Err(err) if limit.is_some() && !rows.is_empty() => {
                    self.pending = Some(Err(err));
                    return Ok((rows, true));
                }
                Err(err) => return Err(err),
            }
        }

        match self.step() {
            Ok(Some(row)) => self.pending = Some(Ok(row)),
            Ok(None) => return Ok((rows, false)),
            Err(err) => self.pending = Some(Err(err)),
        }
        Ok((rows, true))
    }

    fn step(&mut self) -> std::result::Result<Option<Vec<Value>>, EngineError> {
        let width = self.columns.len();
        self.live
            .with_inner_mut(|inner| inner.with_rows_mut(|rows| read_row(rows, width)))
            .map_err(|err| EngineError::from(err).with_statement(&self.sql, self.arguments.clone()))
    }
}

impl fmt::Debug for ResultCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultCursor")
            .field("sql", &self.sql)
            .field("columns", &self.columns)
            .finish_non_exhaustive()
    }
}

fn read_row(rows: &mut Rows<'_>, width: usize) -> rusqlite::Result<Option<Vec<Value>>> {
    let Some(row) = rows.next()? else {
        return Ok(None);
    };
    let mut cells = Vec::with_capacity(width);
    for i in 0..width {
        cells.push(Value::from(row.get_ref(i)?));
    }
    Ok(Some(cells))
}

/// One bounded slice of a result set. `cursor_id` is present only while more
/// rows remain.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub cursor_id: Option<CursorId>,
}

impl Page {
    pub fn is_last(&self) -> bool {
        self.cursor_id.is_none()
    }

    /// Name-keyed view of one row.
    pub fn row_map(&self, index: usize) -> Option<Vec<(&str, &Value)>> {
        self.rows.get(index).map(|row| {
            self.columns
                .iter()
                .map(String::as_str)
                .zip(row.iter())
                .collect()
        })
    }

    pub fn to_json(&self) -> JsonValue {
        let rows: Vec<JsonValue> = self
            .rows
            .iter()
            .map(|row| JsonValue::Array(row.iter().map(Value::to_json).collect()))
            .collect();
        let mut page = json!({
            "columns": self.columns,
            "rows": rows,
        });
        if let Some(id) = self.cursor_id {
            page["cursorId"] = json!(id);
        }
        page
    }
}

struct OpenCursor {
    cursor: ResultCursor,
    page_size: usize,
    last_used: Instant,
}

/// Cursors retained for one database handle. Dropping an entry finalizes its
/// statement.
#[derive(Default)]
pub struct CursorRegistry {
    next_id: CursorId,
    cursors: HashMap<CursorId, OpenCursor>,
}

impl CursorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver the first page of `cursor`. A missing or non-positive page size
    /// delivers everything at once.
    pub fn materialize(&mut self, mut cursor: ResultCursor, page_size: Option<i64>) -> Result<Page> {
        let page_size = match page_size {
            Some(size) if size > 0 => size as usize,
            _ => {
                let (rows, _) = cursor.fetch(None)?;
                return Ok(Page {
                    columns: cursor.columns,
                    rows,
                    cursor_id: None,
                });
            }
        };

        let (rows, more) = cursor.fetch(Some(page_size))?;
        if !more {
            return Ok(Page {
                columns: cursor.columns,
                rows,
                cursor_id: None,
            });
        }

        self.next_id += 1;
        let id = self.next_id;
        let columns = cursor.columns.clone();
        self.cursors.insert(
            id,
            OpenCursor {
                cursor,
                page_size,
                last_used: Instant::now(),
            },
        );
        Ok(Page {
            columns,
            rows,
            cursor_id: Some(id),
        })
    }

    /// Resume a paged result. The cursor is released once it is drained or
    /// its statement fails.
    pub fn next(&mut self, id: CursorId) -> Result<Page> {
        let mut open = self
            .cursors
            .remove(&id)
            .ok_or(BridgeError::InvalidCursor(id))?;
        let (rows, more) = open.cursor.fetch(Some(open.page_size))?;
        let columns = open.cursor.columns.clone();
        if !more {
            return Ok(Page {
                columns,
                rows,
                cursor_id: None,
            });
        }
        open.last_used = Instant::now();
        self.cursors.insert(id, open);
        Ok(Page {
            columns,
            rows,
            cursor_id: Some(id),
        })
    }

    /// Release a cursor early. Returns false if it was not open.
    pub fn close(&mut self, id: CursorId) -> bool {
        self.cursors.remove(&id).is_some()
    }

    /// Release cursors idle for at least `timeout`, returning their ids.
    pub fn reclaim_idle(&mut self, timeout: Duration) -> Vec<CursorId> {
        let now = Instant::now();
        let expired: Vec<CursorId> = self
            .cursors
            .iter()
            .filter(|(_, open)| now.duration_since(open.last_used) >= timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.cursors.remove(id);
        }
        expired
    }

    pub fn clear(&mut self) {
        self.cursors.clear();
    }

    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }
}
