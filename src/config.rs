use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Diagnostic verbosity. Never changes command semantics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum LogLevel {
    #[default]
    None,
    /// Log every statement with its arguments.
    Sql,
    /// Statements plus handle, cursor and transaction lifecycle events.
    Verbose,
}

impl LogLevel {
    pub fn logs_sql(self) -> bool {
        self >= LogLevel::Sql
    }

    pub fn is_verbose(self) -> bool {
        self >= LogLevel::Verbose
    }
}

impl TryFrom<i64> for LogLevel {
    type Error = String;

    fn try_from(level: i64) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(LogLevel::None),
            1 => Ok(LogLevel::Sql),
            2 => Ok(LogLevel::Verbose),
            other => Err(format!("unknown log level {other}")),
        }
    }
}

impl From<LogLevel> for i64 {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::None => 0,
            LogLevel::Sql => 1,
            LogLevel::Verbose => 2,
        }
    }
}

const fn default_cursor_idle_timeout_ms() -> u64 {
    60_000
}

const fn default_busy_timeout_ms() -> u64 {
    5_000
}

/// Bridge configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Base directory for relative database paths.
    pub databases_path: Option<PathBuf>,
    /// Default verbosity for newly opened handles.
    pub log_level: LogLevel,
    /// Cursors untouched for this long are released. 0 disables reclaim.
    pub cursor_idle_timeout_ms: u64,
    /// SQLite busy handler timeout applied to every connection.
    pub busy_timeout_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            databases_path: None,
            log_level: LogLevel::None,
            cursor_idle_timeout_ms: default_cursor_idle_timeout_ms(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl BridgeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_databases_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.databases_path = Some(path.into());
        self
    }

    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    pub fn with_cursor_idle_timeout(mut self, timeout: Duration) -> Self {
        self.cursor_idle_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn cursor_idle_timeout(&self) -> Option<Duration> {
        match self.cursor_idle_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}
