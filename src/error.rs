//! Error taxonomy and the wire error envelope.
//!
//! Every failure produced by the bridge, whether it was detected while
//! validating a command or reported by SQLite, ends up as one
//! [`ErrorEnvelope`]. Callers tell the categories apart by `code` only.

use crate::value::Value;
use rusqlite::ErrorCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};
use thiserror::Error;

/// Error codes produced by the bridge itself.
pub mod codes {
    pub const BAD_PARAM: &str = "BadParam";
    pub const UNSUPPORTED_METHOD: &str = "UnsupportedMethod";
    pub const ILLEGAL_STATE: &str = "IllegalState";
    pub const INVALID_CURSOR: &str = "InvalidCursor";
    pub const DATABASE_CLOSED: &str = "DatabaseClosed";
    pub const OPEN_FAILED: &str = "OpenFailed";
    pub const IO_ERROR: &str = "IoError";
}

pub type Result<T> = std::result::Result<T, BridgeError>;

/// Failure reported by SQLite (or by rusqlite's binding layer on its behalf).
///
/// `code` is the engine's primary result code name, e.g. `SQLITE_CONSTRAINT`.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct EngineError {
    pub code: String,
    pub extended_code: Option<i32>,
    pub message: String,
    pub sql: Option<String>,
    pub arguments: Option<Vec<Value>>,
}

impl EngineError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            extended_code: None,
            message: message.into(),
            sql: None,
            arguments: None,
        }
    }

    /// Attach the statement that failed so it travels in the envelope `data`.
    pub fn with_statement(mut self, sql: &str, arguments: Option<Vec<Value>>) -> Self {
        self.sql = Some(sql.to_string());
        self.arguments = arguments;
        self
    }

    fn data(&self) -> Option<JsonValue> {
        let mut data = Map::new();
        if let Some(extended) = self.extended_code {
            data.insert("extendedCode".to_string(), json!(extended));
        }
        if let Some(sql) = &self.sql {
            data.insert("sql".to_string(), json!(sql));
        }
        if let Some(arguments) = &self.arguments {
            data.insert(
                "arguments".to_string(),
                JsonValue::Array(arguments.iter().map(Value::to_json).collect()),
            );
        }
        if data.is_empty() {
            None
        } else {
            Some(JsonValue::Object(data))
        }
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(failure, message) => Self {
                code: primary_code_name(failure.code).to_string(),
                extended_code: Some(failure.extended_code),
                message: message.clone().unwrap_or_else(|| failure.to_string()),
                sql: None,
                arguments: None,
            },
            rusqlite::Error::InvalidParameterCount(..) | rusqlite::Error::InvalidParameterName(_) => {
                Self::new("SQLITE_RANGE", err.to_string())
            }
            _ => Self::new("SQLITE_ERROR", err.to_string()),
        }
    }
}

/// Maps a rusqlite error code back to SQLite's native result code name.
fn primary_code_name(code: ErrorCode) -> &'static str {
    match code {
        ErrorCode::InternalMalfunction => "SQLITE_INTERNAL",
        ErrorCode::PermissionDenied => "SQLITE_PERM",
        ErrorCode::OperationAborted => "SQLITE_ABORT",
        ErrorCode::DatabaseBusy => "SQLITE_BUSY",
        ErrorCode::DatabaseLocked => "SQLITE_LOCKED",
        ErrorCode::OutOfMemory => "SQLITE_NOMEM",
        ErrorCode::ReadOnly => "SQLITE_READONLY",
        ErrorCode::OperationInterrupted => "SQLITE_INTERRUPT",
        ErrorCode::SystemIoFailure => "SQLITE_IOERR",
        ErrorCode::DatabaseCorrupt => "SQLITE_CORRUPT",
        ErrorCode::NotFound => "SQLITE_NOTFOUND",
        ErrorCode::DiskFull => "SQLITE_FULL",
        ErrorCode::CannotOpen => "SQLITE_CANTOPEN",
        ErrorCode::FileLockingProtocolFailed => "SQLITE_PROTOCOL",
        ErrorCode::SchemaChanged => "SQLITE_SCHEMA",
        ErrorCode::TooBig => "SQLITE_TOOBIG",
        ErrorCode::ConstraintViolation => "SQLITE_CONSTRAINT",
        ErrorCode::TypeMismatch => "SQLITE_MISMATCH",
        ErrorCode::ApiMisuse => "SQLITE_MISUSE",
        ErrorCode::NoLargeFileSupport => "SQLITE_NOLFS",
        ErrorCode::AuthorizationForStatementDenied => "SQLITE_AUTH",
        ErrorCode::ParameterOutOfRange => "SQLITE_RANGE",
        ErrorCode::NotADatabase => "SQLITE_NOTADB",
        _ => "SQLITE_ERROR",
    }
}

/// Bridge errors.
///
/// Protocol errors (`BadParam`, `UnsupportedMethod`) are raised before the
/// engine is touched. Usage errors (`IllegalState`, `InvalidCursor`,
/// `DatabaseClosed`) signal caller misuse. `Engine` carries SQLite's own code.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BridgeError {
    #[error("{0}")]
    BadParam(String),
    #[error("method not supported: {0}")]
    UnsupportedMethod(String),
    #[error("{0}")]
    IllegalState(String),
    #[error("cursor {0} is unknown or already exhausted")]
    InvalidCursor(i64),
    #[error("database {0} is closed")]
    DatabaseClosed(i64),
    #[error("open of {path} failed: {message}")]
    OpenFailed { path: String, message: String },
    #[error("{path}: {message}")]
    Io { path: String, message: String },
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("batch operation {index} failed: {source}")]
    BatchAborted {
        index: usize,
        source: Box<BridgeError>,
    },
}

impl From<rusqlite::Error> for BridgeError {
    fn from(err: rusqlite::Error) -> Self {
        BridgeError::Engine(err.into())
    }
}

impl BridgeError {
    pub fn bad_param(message: impl Into<String>) -> Self {
        BridgeError::BadParam(message.into())
    }

    pub fn code(&self) -> &str {
        match self {
            BridgeError::BadParam(_) => codes::BAD_PARAM,
            BridgeError::UnsupportedMethod(_) => codes::UNSUPPORTED_METHOD,
            BridgeError::IllegalState(_) => codes::ILLEGAL_STATE,
            BridgeError::InvalidCursor(_) => codes::INVALID_CURSOR,
            BridgeError::DatabaseClosed(_) => codes::DATABASE_CLOSED,
            BridgeError::OpenFailed { .. } => codes::OPEN_FAILED,
            BridgeError::Io { .. } => codes::IO_ERROR,
            BridgeError::Engine(engine) => engine.code.as_str(),
            BridgeError::BatchAborted { source, .. } => source.code(),
        }
    }

    pub fn is_engine_error(&self) -> bool {
        match self {
            BridgeError::Engine(_) => true,
            BridgeError::BatchAborted { source, .. } => source.is_engine_error(),
            _ => false,
        }
    }

    fn data(&self) -> Option<JsonValue> {
        match self {
            BridgeError::InvalidCursor(id) => Some(json!({ "cursorId": id })),
            BridgeError::DatabaseClosed(id) => Some(json!({ "id": id })),
            BridgeError::OpenFailed { path, .. } | BridgeError::Io { path, .. } => {
                Some(json!({ "path": path }))
            }
            BridgeError::Engine(engine) => engine.data(),
            BridgeError::BatchAborted { index, source } => {
                let mut data = match source.data() {
                    Some(JsonValue::Object(map)) => map,
                    _ => Map::new(),
                };
                data.insert("index".to_string(), json!(index));
                Some(JsonValue::Object(data))
            }
            _ => None,
        }
    }

    fn message(&self) -> String {
        match self {
            BridgeError::BatchAborted { source, .. } => source.message(),
            other => other.to_string(),
        }
    }
}

/// Transport-level error shape: `{code, message, data?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
}

impl From<&BridgeError> for ErrorEnvelope {
    fn from(err: &BridgeError) -> Self {
        let code = err.code().to_string();
        let mut message = err.message();
        if message.is_empty() {
            message = code.clone();
        }
        ErrorEnvelope {
            code,
            message,
            data: err.data(),
        }
    }
}

impl From<BridgeError> for ErrorEnvelope {
    fn from(err: BridgeError) -> Self {
        ErrorEnvelope::from(&err)
    }
}
