//! Incoming method calls, their typed commands, and outgoing envelopes.

use crate::batch::BatchResult;
use crate::cursor::Page;
use crate::database::DatabaseId;
use crate::error::{BridgeError, ErrorEnvelope, Result};
use crate::executor::OperationKind;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};
use std::str::FromStr;

/// Parameter names understood on the wire.
pub mod param {
    pub const ID: &str = "id";
    pub const PATH: &str = "path";
    pub const READ_ONLY: &str = "readOnly";
    pub const SINGLE_INSTANCE: &str = "singleInstance";
    pub const LOG_LEVEL: &str = "logLevel";
    pub const METHOD: &str = "method";
    pub const SQL: &str = "sql";
    pub const ARGUMENTS: &str = "arguments";
    pub const OPERATIONS: &str = "operations";
    pub const NO_RESULT: &str = "noResult";
    pub const CONTINUE_ON_ERROR: &str = "continueOnError";
    pub const IN_TRANSACTION_CHANGE: &str = "inTransactionChange";
    pub const CURSOR_PAGE_SIZE: &str = "cursorPageSize";
    pub const CURSOR_ID: &str = "cursorId";
    pub const CANCEL: &str = "cancel";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    OpenDatabase,
    CloseDatabase,
    DeleteDatabase,
    DatabaseExists,
    GetDatabasesPath,
    Options,
    Execute,
    Insert,
    Update,
    Query,
    QueryCursorNext,
    Batch,
    BeginTransaction,
    CommitTransaction,
    RollbackTransaction,
}

impl FromStr for Method {
    type Err = BridgeError;

    fn from_str(name: &str) -> Result<Self> {
        Ok(match name {
            "openDatabase" => Method::OpenDatabase,
            "closeDatabase" => Method::CloseDatabase,
            "deleteDatabase" => Method::DeleteDatabase,
            "databaseExists" => Method::DatabaseExists,
            "getDatabasesPath" => Method::GetDatabasesPath,
            "options" => Method::Options,
            "execute" => Method::Execute,
            "insert" => Method::Insert,
            "update" => Method::Update,
            "query" => Method::Query,
            "queryCursorNext" => Method::QueryCursorNext,
            "batch" => Method::Batch,
            "beginTransaction" => Method::BeginTransaction,
            "commitTransaction" => Method::CommitTransaction,
            "rollbackTransaction" => Method::RollbackTransaction,
            other => return Err(BridgeError::UnsupportedMethod(other.to_string())),
        })
    }
}

/// A method invocation as delivered by the host transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodCall {
    pub method: String,
    #[serde(default)]
    pub arguments: JsonValue,
}

impl MethodCall {
    pub fn new(method: impl Into<String>, arguments: JsonValue) -> Self {
        Self {
            method: method.into(),
            arguments,
        }
    }
}

/// Named parameters of one call, with typed accessors that fail as `BadParam`.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Params {
    pub values: Map<String, JsonValue>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(mut self, name: &str, value: impl Into<JsonValue>) -> Self {
        self.values.insert(name.to_string(), value.into());
        self
    }

    pub fn from_json(arguments: &JsonValue) -> Result<Self> {
        match arguments {
            JsonValue::Null => Ok(Self::new()),
            JsonValue::Object(values) => Ok(Self {
                values: values.clone(),
            }),
            other => Err(BridgeError::bad_param(format!(
                "call arguments must be a map, got {other}"
            ))),
        }
    }

    /// Absent and explicit `null` both read as `None`.
    fn get(&self, name: &str) -> Option<&JsonValue> {
        self.values.get(name).filter(|v| !v.is_null())
    }

    pub fn str(&self, name: &str) -> Result<Option<&str>> {
        match self.get(name) {
            None => Ok(None),
            Some(v) => v
                .as_str()
                .map(Some)
                .ok_or_else(|| BridgeError::bad_param(format!("{name} must be a string"))),
        }
    }

    pub fn required_str(&self, name: &str) -> Result<&str> {
        self.str(name)?
            .ok_or_else(|| BridgeError::bad_param(format!("missing {name}")))
    }

    pub fn bool(&self, name: &str) -> Result<Option<bool>> {
        match self.get(name) {
            None => Ok(None),
            Some(v) => v
                .as_bool()
                .map(Some)
                .ok_or_else(|| BridgeError::bad_param(format!("{name} must be a boolean"))),
        }
    }

    pub fn i64(&self, name: &str) -> Result<Option<i64>> {
        match self.get(name) {
            None => Ok(None),
            Some(v) => v
                .as_i64()
                .map(Some)
                .ok_or_else(|| BridgeError::bad_param(format!("{name} must be an integer"))),
        }
    }

    pub fn required_i64(&self, name: &str) -> Result<i64> {
        self.i64(name)?
            .ok_or_else(|| BridgeError::bad_param(format!("missing {name}")))
    }

    pub fn database_id(&self) -> Result<DatabaseId> {
        self.required_i64(param::ID)
    }

    /// `None` when no argument list was supplied, `Some(vec![])` for `[]`.
    pub fn arguments(&self) -> Result<Option<Vec<Value>>> {
        match self.get(param::ARGUMENTS) {
            None => Ok(None),
            Some(JsonValue::Array(items)) => items
                .iter()
                .map(Value::from_json)
                .collect::<Result<Vec<_>>>()
                .map(Some),
            Some(_) => Err(BridgeError::bad_param(format!(
                "{} must be a list",
                param::ARGUMENTS
            ))),
        }
    }

    pub fn list(&self, name: &str) -> Result<&[JsonValue]> {
        match self.get(name) {
            Some(JsonValue::Array(items)) => Ok(items),
            Some(_) => Err(BridgeError::bad_param(format!("{name} must be a list"))),
            None => Err(BridgeError::bad_param(format!("missing {name}"))),
        }
    }
}

/// Per-command flags. Batch flags are read from the batch call itself.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CommandOptions {
    pub no_result: bool,
    pub continue_on_error: bool,
    /// `Some(true)` opens a transaction scope, `Some(false)` leaves it.
    pub in_transaction_change: Option<bool>,
    pub cursor_page_size: Option<i64>,
}

impl CommandOptions {
    pub fn from_params(params: &Params) -> Result<Self> {
        let cursor_page_size = params.i64(param::CURSOR_PAGE_SIZE)?;
        if let Some(size) = cursor_page_size {
            if size < 0 {
                return Err(BridgeError::bad_param(format!(
                    "{} must not be negative, got {size}",
                    param::CURSOR_PAGE_SIZE
                )));
            }
        }
        Ok(Self {
            no_result: params.bool(param::NO_RESULT)?.unwrap_or(false),
            continue_on_error: params.bool(param::CONTINUE_ON_ERROR)?.unwrap_or(false),
            in_transaction_change: params.bool(param::IN_TRANSACTION_CHANGE)?,
            cursor_page_size,
        })
    }
}

/// One SQL statement to run.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub kind: OperationKind,
    pub sql: String,
    pub arguments: Option<Vec<Value>>,
    pub options: CommandOptions,
}

impl Command {
    pub fn new(kind: OperationKind, sql: &str) -> Self {
        Self {
            kind,
            sql: sql.to_string(),
            arguments: None,
            options: CommandOptions::default(),
        }
    }

    pub fn execute(sql: &str) -> Self {
        Self::new(OperationKind::Execute, sql)
    }

    pub fn insert(sql: &str) -> Self {
        Self::new(OperationKind::Insert, sql)
    }

    pub fn update(sql: &str) -> Self {
        Self::new(OperationKind::Update, sql)
    }

    pub fn query(sql: &str) -> Self {
        Self::new(OperationKind::Query, sql)
    }

    pub fn with_arguments(mut self, arguments: Vec<Value>) -> Self {
        self.arguments = Some(arguments);
        self
    }

    pub fn with_page_size(mut self, page_size: i64) -> Self {
        self.options.cursor_page_size = Some(page_size);
        self
    }

    pub fn with_transaction_change(mut self, enter: bool) -> Self {
        self.options.in_transaction_change = Some(enter);
        self
    }

    /// Parse and validate. `sql` must be present and non-blank.
    pub fn from_params(kind: OperationKind, params: &Params) -> Result<Self> {
        let sql = params.required_str(param::SQL)?;
        if sql.trim().is_empty() {
            return Err(BridgeError::bad_param(format!("{} must not be empty", param::SQL)));
        }
        Ok(Self {
            kind,
            sql: sql.to_string(),
            arguments: params.arguments()?,
            options: CommandOptions::from_params(params)?,
        })
    }
}

/// Typed success payload of a call.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Done,
    Inserted(Option<i64>),
    Updated(u64),
    Page(Page),
    Batch(Vec<BatchResult>),
    Opened { id: DatabaseId, recovered: bool },
    Exists(bool),
    Path(Option<String>),
}

impl Response {
    pub fn to_json(&self) -> JsonValue {
        match self {
            Response::Done => JsonValue::Null,
            Response::Inserted(id) => json!(id),
            Response::Updated(count) => json!(count),
            Response::Page(page) => page.to_json(),
            Response::Batch(results) => {
                JsonValue::Array(results.iter().map(BatchResult::to_json).collect())
            }
            Response::Opened { id, recovered } => {
                let mut opened = json!({ "id": id });
                if *recovered {
                    opened["recovered"] = json!(true);
                }
                opened
            }
            Response::Exists(exists) => json!(exists),
            Response::Path(path) => json!(path),
        }
    }
}

/// What goes back over the transport: `{"result": ..}` or `{"error": ..}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Envelope {
    Result(JsonValue),
    Error(ErrorEnvelope),
}

impl Envelope {
    pub fn from_result(result: Result<Response>) -> Self {
        match result {
            Ok(response) => Envelope::Result(response.to_json()),
            Err(err) => Envelope::Error(err.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Envelope::Error(_))
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            Envelope::Result(result) => json!({ "result": result }),
            Envelope::Error(error) => json!({ "error": error }),
        }
    }
}
