//! One open SQLite handle: connection, transaction state and cursors.

use crate::command::Command;
use crate::config::{BridgeConfig, LogLevel};
use crate::cursor::{CursorId, CursorRegistry, Page};
use crate::error::{BridgeError, Result};
use crate::executor::{self, OperationKind, Outcome};
use crate::sanitize::sanitize_optional;
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OpenFlags};
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub type DatabaseId = i64;

pub const IN_MEMORY_PATH: &str = ":memory:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Idle,
    InTransaction,
}

/// How a transaction scope ended. The handle is back to `Idle` either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionEnd {
    Committed,
    RolledBack,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpenOptions {
    pub path: String,
    pub read_only: bool,
    pub single_instance: bool,
    pub log_level: Option<LogLevel>,
}

impl OpenOptions {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            read_only: false,
            single_instance: true,
            log_level: None,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(IN_MEMORY_PATH)
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn single_instance(mut self, single_instance: bool) -> Self {
        self.single_instance = single_instance;
        self
    }

    pub fn is_in_memory(&self) -> bool {
        self.path == IN_MEMORY_PATH
    }
}

pub struct Database {
    id: DatabaseId,
    path: String,
    conn: Rc<Connection>,
    state: TransactionState,
    cursors: CursorRegistry,
    log_level: LogLevel,
}

// Safety: the only other owners of `conn` are the open statements in
// `cursors`, and both live inside this struct, so they always move between
// threads together. Connections are opened with `SQLITE_OPEN_NO_MUTEX`, which
// allows use from one thread at a time, and every access goes through `&mut`.
unsafe impl Send for Database {}

impl Database {
    /// Open a connection. `options.path` must already be resolved.
    pub fn open(id: DatabaseId, options: &OpenOptions, config: &BridgeConfig) -> Result<Self> {
        let open_failed = |message: String| BridgeError::OpenFailed {
            path: options.path.clone(),
            message,
        };

        let opened = if options.is_in_memory() {
            Connection::open_in_memory()
        } else if options.read_only {
            Connection::open_with_flags(
                &options.path,
                OpenFlags::SQLITE_OPEN_READ_ONLY
                    | OpenFlags::SQLITE_OPEN_URI
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
        } else {
            if let Some(parent) = Path::new(&options.path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| open_failed(e.to_string()))?;
                }
            }
            Connection::open(&options.path)
        };
        let conn = opened.map_err(|e| open_failed(e.to_string()))?;

        conn.busy_timeout(config.busy_timeout())
            .map_err(|e| open_failed(e.to_string()))?;

        let log_level = options.log_level.unwrap_or(config.log_level);
        if log_level.is_verbose() {
            debug!(db = id, path = %options.path, read_only = options.read_only, "opened database");
        }
        Ok(Self {
            id,
            path: options.path.clone(),
            conn: Rc::new(conn),
            state: TransactionState::Idle,
            cursors: CursorRegistry::new(),
            log_level,
        })
    }

    pub fn id(&self) -> DatabaseId {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn in_transaction(&self) -> bool {
        self.state == TransactionState::InTransaction
    }

    pub fn log_level(&self) -> LogLevel {
        self.log_level
    }

    pub fn set_log_level(&mut self, level: LogLevel) {
        self.log_level = level;
    }

    pub fn open_cursors(&self) -> usize {
        self.cursors.len()
    }

    /// Sanitize and run one statement to completion. Query rows, if any, are
    /// discarded.
    pub fn run(&mut self, command: &Command) -> Result<Outcome> {
        let values = self.admit(command)?;
        let result = executor::execute(&self.conn, &command.sql, values.as_deref(), command.kind);
        self.sync_state();
        Ok(result?)
    }

    /// Run a query and deliver its first page, paged by the command's
    /// `cursor_page_size`.
    pub fn query(&mut self, command: &Command) -> Result<Page> {
        self.open_page(command, command.options.cursor_page_size)
    }

    /// Run a query and deliver every row in one page.
    pub fn query_all(&mut self, command: &Command) -> Result<Page> {
        self.open_page(command, None)
    }

    fn open_page(&mut self, command: &Command, page_size: Option<i64>) -> Result<Page> {
        let values = self.admit(command)?;
        let page = executor::query(&self.conn, &command.sql, values.as_deref())
            .map_err(BridgeError::from)
            .and_then(|cursor| self.cursors.materialize(cursor, page_size));
        self.sync_state();
        let page = page?;
        if let Some(cursor) = page.cursor_id {
            if self.log_level.is_verbose() {
                debug!(db = self.id, cursor, "cursor opened");
            }
        }
        Ok(page)
    }

    /// Sanitize arguments, reject a nested transaction and log the statement.
    fn admit(&self, command: &Command) -> Result<Option<Vec<SqlValue>>> {
        let values = sanitize_optional(command.arguments.as_deref())?;
        if command.options.in_transaction_change == Some(true)
            && (self.in_transaction() || !self.conn.is_autocommit())
        {
            return Err(BridgeError::IllegalState(format!(
                "database {} already has a transaction in progress",
                self.id
            )));
        }

        if self.log_level.logs_sql() {
            info!(db = self.id, kind = %command.kind, sql = %command.sql, arguments = ?command.arguments, "sql");
        }
        Ok(values)
    }

    pub fn next_page(&mut self, cursor: CursorId) -> Result<Page> {
        let page = self.cursors.next(cursor)?;
        if page.is_last() && self.log_level.is_verbose() {
            debug!(db = self.id, cursor, "cursor exhausted");
        }
        Ok(page)
    }

    pub fn close_cursor(&mut self, cursor: CursorId) -> bool {
        let closed = self.cursors.close(cursor);
        if closed && self.log_level.is_verbose() {
            debug!(db = self.id, cursor, "cursor closed");
        }
        closed
    }

    pub fn reclaim_idle_cursors(&mut self, timeout: Duration) {
        let reclaimed = self.cursors.reclaim_idle(timeout);
        if !reclaimed.is_empty() && self.log_level.is_verbose() {
            debug!(db = self.id, cursors = ?reclaimed, "reclaimed idle cursors");
        }
    }

    pub fn begin(&mut self) -> Result<()> {
        self.run(&Command::execute("BEGIN").with_transaction_change(true))
            .map(|_| ())
    }

    pub fn commit(&mut self) -> Result<TransactionEnd> {
        self.end("COMMIT", TransactionEnd::Committed)
    }

    pub fn rollback(&mut self) -> Result<TransactionEnd> {
        self.end("ROLLBACK", TransactionEnd::RolledBack)
    }

    fn end(&mut self, sql: &str, end: TransactionEnd) -> Result<TransactionEnd> {
        if !self.in_transaction() {
            return Err(BridgeError::IllegalState(format!(
                "database {} has no transaction in progress",
                self.id
            )));
        }
        self.run(&Command::execute(sql).with_transaction_change(false))?;
        Ok(end)
    }

    /// Mirror the engine's autocommit flag, whatever statement changed it.
    fn sync_state(&mut self) {
        let state = if self.conn.is_autocommit() {
            TransactionState::Idle
        } else {
            TransactionState::InTransaction
        };
        self.set_state(state);
    }

    fn set_state(&mut self, state: TransactionState) {
        if state != self.state && self.log_level.is_verbose() {
            debug!(db = self.id, from = ?self.state, to = ?state, "transaction state");
        }
        self.state = state;
    }

    pub(crate) fn log_statement_kind(&self, kind: OperationKind, index: usize) {
        if self.log_level.is_verbose() {
            debug!(db = self.id, index, kind = %kind, "batch operation");
        }
    }

    /// Drop cursors and roll back anything left open.
    pub fn close(mut self) {
        self.cursors.clear();
        if !self.conn.is_autocommit() {
            if let Err(err) = self.conn.execute_batch("ROLLBACK") {
                warn!(db = self.id, error = %err, "rollback on close failed");
            }
        }
        if self.log_level.is_verbose() {
            debug!(db = self.id, path = %self.path, "closed database");
        }
    }
}
